//! 一次完整的命令交互：连接、写请求、读到对端关闭、回调结果
//!
//! operation 由外部调度器启动（见 [`crate::queue`]），生命周期：
//! * `Ready` --start--> `Executing` --> `Finished`
//! * `Ready` | `Executing` --cancel--> `Cancelled`
//!
//! 完成回调在任何路径下都只会被调用一次，调用时连接已经关闭。
//! 取消不是静默的：回调会收到 [`Error::Cancelled`]。

use std::{
    fmt,
    ops::Deref,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use log::{debug, info, trace, warn};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    select,
    sync::{oneshot, watch},
    time,
};

use crate::{
    config,
    error::Error,
    queue::Scheduler,
    request::Request,
    transport::{TcpTransport, Transport},
};

/// 每次从 socket 读取时预留的缓冲区大小
const READ_CHUNK: usize = 4096;

/// 关闭连接的最长等待时间，超时后直接丢弃连接
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// 结果通道的接收端
pub type Completion = oneshot::Receiver<Result<Bytes, Error>>;

/// 完成回调，`Ok` 为对端返回的全部字节，`Err` 为失败原因，二者互斥
pub type Handler = Box<dyn FnOnce(Result<Bytes, Error>) + Send + 'static>;

/// 单次发送的结果通道，接收端可以当作 future 等待
pub fn channel() -> (Handler, Completion) {
    let (tx, rx) = oneshot::channel();
    let handler: Handler = Box::new(move |res: Result<Bytes, Error>| {
        // 接收端已丢弃，说明调用方不再关心结果
        let _ = tx.send(res);
    });
    (handler, rx)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Ready,
    Executing,
    Finished,
    Cancelled,
}

impl State {
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Finished | State::Cancelled)
    }
}

struct Lifecycle {
    state: State,
    /// 取走回调的一方负责完成流程
    handler: Option<Handler>,
}

/// operation 与调度器之间共享的状态
/// 状态迁移全部在 `lifecycle` 锁内完成
struct Shared {
    lifecycle: Mutex<Lifecycle>,
    state_tx: watch::Sender<State>,
    cancel_tx: watch::Sender<bool>,
}

impl Shared {
    fn new(handler: Handler) -> Self {
        let (state_tx, _) = watch::channel(State::Ready);
        let (cancel_tx, _) = watch::channel(false);
        Self {
            lifecycle: Mutex::new(Lifecycle {
                state: State::Ready,
                handler: Some(handler),
            }),
            state_tx,
            cancel_tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, lc: &mut Lifecycle, state: State) {
        debug!("operation state {:?} -> {:?}", lc.state, state);
        lc.state = state;
        self.state_tx.send_replace(state);
    }

    fn cancel_requested(&self) -> bool {
        *self.cancel_tx.borrow()
    }

    /// Ready -> Executing，已取消或已启动过则返回 false
    fn begin(&self) -> bool {
        let mut lc = self.lock();
        if lc.state != State::Ready || lc.handler.is_none() {
            return false;
        }
        self.transition(&mut lc, State::Executing);
        true
    }

    fn cancel(&self) -> bool {
        let handler = {
            let mut lc = self.lock();
            if lc.state.is_terminal() || lc.handler.is_none() {
                return false;
            }
            self.cancel_tx.send_replace(true);
            match lc.state {
                // 还没开始，直接在这里完成
                State::Ready => lc.handler.take(),
                // 进行中，由 I/O 所在的任务完成，取消仅作为请求记录
                _ => return true,
            }
        };

        if let Some(handler) = handler {
            self.complete(handler, Err(Error::Cancelled));
        }
        true
    }

    /// operation 未走完流程就被丢弃（未启动、future 被 abort、runtime 关闭），按取消完成
    fn abandon(&self) {
        let handler = {
            let mut lc = self.lock();
            let Some(handler) = lc.handler.take() else {
                return;
            };
            self.cancel_tx.send_replace(true);
            handler
        };
        debug!("operation dropped before finish");
        self.complete(handler, Err(Error::Cancelled));
    }

    /// I/O 结束后调用，只有第一个取走回调的路径会生效
    fn finish(&self, outcome: Result<Bytes, Error>) {
        let (handler, outcome) = {
            let mut lc = self.lock();
            let Some(handler) = lc.handler.take() else {
                return;
            };
            // 已请求取消的 operation 不会以成功结束
            match outcome {
                Ok(_) if self.cancel_requested() => (handler, Err(Error::Cancelled)),
                outcome => (handler, outcome),
            }
        };
        self.complete(handler, outcome);
    }

    /// 回调在锁外执行，回调结束后才发布终止状态
    fn complete(&self, handler: Handler, outcome: Result<Bytes, Error>) {
        let terminal = match outcome {
            Ok(ref data) => {
                info!("operation finished, {} bytes received", data.len());
                State::Finished
            }
            Err(Error::Cancelled) => {
                info!("operation cancelled");
                State::Cancelled
            }
            Err(ref e) => {
                warn!("operation failed: {}", e);
                State::Finished
            }
        };

        // 回调 panic 时也要发布终止状态
        let _publish = Publish {
            shared: self,
            terminal,
        };
        handler(outcome);
    }
}

struct Publish<'a> {
    shared: &'a Shared,
    terminal: State,
}

impl Drop for Publish<'_> {
    fn drop(&mut self) {
        let mut lc = self.shared.lock();
        self.shared.transition(&mut lc, self.terminal);
    }
}

/// 由 `CommandOperation` 独占，随 operation 一起丢弃
/// 回调仍未被取走时以 `Cancelled` 完成
struct FinishGuard {
    shared: Arc<Shared>,
}

impl Deref for FinishGuard {
    type Target = Arc<Shared>;

    fn deref(&self) -> &Arc<Shared> {
        &self.shared
    }
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        self.shared.abandon();
    }
}

/// 调度器持有的句柄，可以多次克隆
#[derive(Clone)]
pub struct OperationHandle {
    shared: Arc<Shared>,
}

impl OperationHandle {
    /// 请求取消，返回 true 表示请求已记录
    /// 进行中的 operation 若已拿到连接错误或传输错误，仍以该错误结束（`Finished`）
    /// operation 已结束或回调已被取走时返回 false
    pub fn cancel(&self) -> bool {
        self.shared.cancel()
    }

    pub fn state(&self) -> State {
        *self.shared.state_tx.borrow()
    }

    pub fn is_executing(&self) -> bool {
        self.state() == State::Executing
    }

    pub fn is_finished(&self) -> bool {
        self.state() == State::Finished
    }

    pub fn is_cancelled(&self) -> bool {
        self.state() == State::Cancelled
    }

    /// 订阅状态变化
    pub fn subscribe(&self) -> watch::Receiver<State> {
        self.shared.state_tx.subscribe()
    }

    /// 等待进入终止状态
    pub async fn wait(&self) -> State {
        let mut rx = self.subscribe();
        let state = match rx.wait_for(|state| state.is_terminal()).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        };
        state
    }
}

impl fmt::Debug for OperationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationHandle")
            .field("state", &self.state())
            .finish()
    }
}

pub struct CommandOperation<T: Transport = TcpTransport> {
    host: String,
    port: u16,
    request: Request,
    transport: T,
    shared: FinishGuard,
}

impl CommandOperation {
    /// 使用全局配置中的默认主机
    pub fn new<F>(command: &str, argument: Option<&str>, handler: F) -> Result<Self, Error>
    where
        F: FnOnce(Result<Bytes, Error>) + Send + 'static,
    {
        let host = config::global().command.host.clone();
        Self::with_host(&host, command, argument, handler)
    }

    pub fn with_host<F>(
        host: &str,
        command: &str,
        argument: Option<&str>,
        handler: F,
    ) -> Result<Self, Error>
    where
        F: FnOnce(Result<Bytes, Error>) + Send + 'static,
    {
        let cfg = &config::global().command;
        Ok(Self {
            host: host.to_owned(),
            port: cfg.port,
            request: Request::new(command, argument)?,
            transport: TcpTransport::with_timeout(cfg.connect_timeout()),
            shared: FinishGuard {
                shared: Arc::new(Shared::new(Box::new(handler))),
            },
        })
    }

    /// 结果通过返回的接收端交付，使用默认主机
    pub fn oneshot(command: &str, argument: Option<&str>) -> Result<(Self, Completion), Error> {
        let (handler, rx) = channel();
        Ok((Self::new(command, argument, handler)?, rx))
    }

    /// 结果通过返回的接收端交付，指定主机
    pub fn oneshot_with_host(
        host: &str,
        command: &str,
        argument: Option<&str>,
    ) -> Result<(Self, Completion), Error> {
        let (handler, rx) = channel();
        Ok((Self::with_host(host, command, argument, handler)?, rx))
    }

    /// 构造并提交到调度器，使用默认主机
    pub fn send<S, F>(
        command: &str,
        argument: Option<&str>,
        scheduler: &S,
        handler: F,
    ) -> Result<OperationHandle, Error>
    where
        S: Scheduler,
        F: FnOnce(Result<Bytes, Error>) + Send + 'static,
    {
        Ok(scheduler.submit(Self::new(command, argument, handler)?))
    }

    /// 构造并提交到调度器，指定主机
    pub fn send_to<S, F>(
        host: &str,
        command: &str,
        argument: Option<&str>,
        scheduler: &S,
        handler: F,
    ) -> Result<OperationHandle, Error>
    where
        S: Scheduler,
        F: FnOnce(Result<Bytes, Error>) + Send + 'static,
    {
        Ok(scheduler.submit(Self::with_host(host, command, argument, handler)?))
    }
}

impl<T: Transport> CommandOperation<T> {
    /// 替换传输层，必须在启动前调用
    pub fn with_transport<U: Transport>(self, transport: U) -> CommandOperation<U> {
        CommandOperation {
            host: self.host,
            port: self.port,
            request: self.request,
            transport,
            shared: self.shared,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn command(&self) -> &str {
        self.request.command()
    }

    pub fn argument(&self) -> Option<&str> {
        self.request.argument()
    }

    pub fn handle(&self) -> OperationHandle {
        OperationHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// 由调度器调用一次，运行到终止状态后返回
    /// 已被取消或已经启动过的 operation 直接返回
    pub async fn start(self) {
        if !self.shared.begin() {
            debug!("operation {} not ready, skip", self.request.command());
            return;
        }

        let outcome = self.exchange().await;
        self.shared.finish(outcome);
    }

    /// 连接的生命周期限定在这个方法内，返回前一定已关闭
    async fn exchange(&self) -> Result<Bytes, Error> {
        let mut cancel_rx = self.shared.cancel_tx.subscribe();

        // 连接前检查取消，已取消则不发起连接
        if *cancel_rx.borrow_and_update() {
            return Err(Error::Cancelled);
        }

        let mut stream = select! {
            biased;
            _ = cancelled(&mut cancel_rx) => return Err(Error::Cancelled),
            res = self.transport.connect(&self.host, self.port) => res.map_err(Error::Connection)?,
        };
        debug!("connected to {}:{}", self.host, self.port);

        let res = self.round_trip(&mut stream, &mut cancel_rx).await;

        // 关闭是幂等的，出错路径上对端可能已经关闭
        match time::timeout(SHUTDOWN_TIMEOUT, stream.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => trace!("shutdown connection error: {}", e),
            Err(_) => debug!("shutdown connection timed out, drop it"),
        }
        drop(stream);

        res
    }

    async fn round_trip(
        &self,
        stream: &mut T::Stream,
        cancel_rx: &mut watch::Receiver<bool>,
    ) -> Result<Bytes, Error> {
        let payload = self.request.to_bytes();
        select! {
            biased;
            _ = cancelled(cancel_rx) => return Err(Error::Cancelled),
            res = async {
                stream.write_all(&payload).await?;
                stream.flush().await
            } => res.map_err(Error::Transport)?,
        }
        trace!("request sent: {} bytes", payload.len());

        // 读到对端关闭，出错时丢弃已读到的数据
        let mut data = BytesMut::with_capacity(READ_CHUNK);
        loop {
            data.reserve(READ_CHUNK);
            let read = select! {
                biased;
                _ = cancelled(cancel_rx) => return Err(Error::Cancelled),
                res = stream.read_buf(&mut data) => res.map_err(Error::Transport)?,
            };
            if read == 0 {
                return Ok(data.freeze());
            }
            trace!("read {} bytes, total {}", read, data.len());
        }
    }
}

impl<T: Transport> fmt::Debug for CommandOperation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandOperation")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("request", &self.request)
            .field("state", &self.handle().state())
            .finish()
    }
}

async fn cancelled(rx: &mut watch::Receiver<bool>) {
    // 发送端随 operation 存活，不会提前关闭
    let _ = rx.wait_for(|cancelled| *cancelled).await;
}
