//! 测试用传输层

use std::{
    collections::VecDeque,
    io,
    net::SocketAddr,
    pin::Pin,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    task::{Context, Poll},
};

use async_trait::async_trait;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
    sync::Notify,
};

use crate::transport::Transport;

/// 对端的一次读事件
#[derive(Debug, Clone)]
pub(crate) enum Read {
    Data(Vec<u8>),
    Error(io::ErrorKind),
    /// 永远没有数据
    Pending,
}

#[derive(Debug, Clone)]
enum Behavior {
    Refuse,
    Hang,
    Script(Vec<Read>),
}

/// 记录传输层上发生的调用
#[derive(Debug, Default)]
pub(crate) struct Probe {
    connects: AtomicUsize,
    shutdowns: AtomicUsize,
    drops: AtomicUsize,
    written: Mutex<Vec<u8>>,
    reading: Notify,
}

impl Probe {
    pub(crate) fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub(crate) fn closed(&self) -> bool {
        self.shutdowns.load(Ordering::SeqCst) > 0 && self.drops.load(Ordering::SeqCst) > 0
    }

    pub(crate) fn drops(&self) -> usize {
        self.drops.load(Ordering::SeqCst)
    }

    pub(crate) fn written(&self) -> Vec<u8> {
        self.written.lock().unwrap().clone()
    }

    /// 等待 operation 开始读取
    pub(crate) async fn wait_reading(&self) {
        self.reading.notified().await
    }
}

#[derive(Debug, Clone)]
pub(crate) struct MockTransport {
    behavior: Behavior,
    hang_shutdown: bool,
    probe: Arc<Probe>,
}

impl MockTransport {
    pub(crate) fn refuse() -> Self {
        Self::new(Behavior::Refuse)
    }

    pub(crate) fn hang() -> Self {
        Self::new(Behavior::Hang)
    }

    pub(crate) fn script(reads: Vec<Read>) -> Self {
        Self::new(Behavior::Script(reads))
    }

    fn new(behavior: Behavior) -> Self {
        Self {
            behavior,
            hang_shutdown: false,
            probe: Arc::new(Probe::default()),
        }
    }

    /// 关闭连接永远不返回
    pub(crate) fn hang_shutdown(mut self) -> Self {
        self.hang_shutdown = true;
        self
    }

    pub(crate) fn probe(&self) -> Arc<Probe> {
        self.probe.clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Stream = MockStream;

    async fn connect(&self, _host: &str, _port: u16) -> io::Result<MockStream> {
        self.probe.connects.fetch_add(1, Ordering::SeqCst);
        match self.behavior {
            Behavior::Refuse => Err(io::ErrorKind::ConnectionRefused.into()),
            Behavior::Hang => std::future::pending().await,
            Behavior::Script(ref reads) => Ok(MockStream {
                reads: reads.iter().cloned().collect(),
                hang_shutdown: self.hang_shutdown,
                probe: self.probe.clone(),
            }),
        }
    }
}

pub(crate) struct MockStream {
    reads: VecDeque<Read>,
    hang_shutdown: bool,
    probe: Arc<Probe>,
}

impl AsyncRead for MockStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.probe.reading.notify_one();
        match self.reads.pop_front() {
            // 读完即 EOF
            None => Poll::Ready(Ok(())),
            Some(Read::Data(mut data)) => {
                let n = data.len().min(buf.remaining());
                buf.put_slice(&data[..n]);
                if n < data.len() {
                    let rest = data.split_off(n);
                    self.reads.push_front(Read::Data(rest));
                }
                Poll::Ready(Ok(()))
            }
            Some(Read::Error(kind)) => Poll::Ready(Err(kind.into())),
            Some(Read::Pending) => {
                self.reads.push_front(Read::Pending);
                Poll::Pending
            }
        }
    }
}

impl AsyncWrite for MockStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.probe.written.lock().unwrap().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.probe.shutdowns.fetch_add(1, Ordering::SeqCst);
        if self.hang_shutdown {
            return Poll::Pending;
        }
        Poll::Ready(Ok(()))
    }
}

impl Drop for MockStream {
    fn drop(&mut self) {
        self.probe.drops.fetch_add(1, Ordering::SeqCst);
    }
}

/// 忽略主机和端口，连接到本地监听地址
pub(crate) struct Loopback(pub(crate) SocketAddr);

#[async_trait]
impl Transport for Loopback {
    type Stream = TcpStream;

    async fn connect(&self, _host: &str, _port: u16) -> io::Result<TcpStream> {
        TcpStream::connect(self.0).await
    }
}
