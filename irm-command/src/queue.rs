//! 调度层
//! operation 只依赖 `Scheduler`，由调度器决定在哪里、以什么并发度运行

use std::{
    mem,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use futures::future::join_all;
use log::{debug, error};
use tokio::{runtime, select, sync::Semaphore, task::JoinSet};

use crate::{
    operation::{CommandOperation, OperationHandle},
    transport::Transport,
};

pub trait Scheduler {
    /// 提交一个 operation，返回可以观察和取消它的句柄
    fn submit<T: Transport>(&self, op: CommandOperation<T>) -> OperationHandle;
}

/// 不限并发，直接在 runtime 上启动
/// runtime 关闭时未结束的 operation 以 `Cancelled` 完成
impl Scheduler for runtime::Handle {
    fn submit<T: Transport>(&self, op: CommandOperation<T>) -> OperationHandle {
        let handle = op.handle();
        self.spawn(op.start());
        handle
    }
}

#[derive(Default)]
struct Tracked {
    handles: Vec<OperationHandle>,
    tasks: JoinSet<()>,
}

impl Tracked {
    /// 清理已结束的 operation 和任务
    fn reap(&mut self) {
        self.handles.retain(|h| !h.state().is_terminal());
        while let Some(res) = self.tasks.try_join_next() {
            log_join(res);
        }
    }
}

fn log_join(res: Result<(), tokio::task::JoinError>) {
    if let Err(e) = res {
        if e.is_panic() {
            error!("operation task panicked: {}", e);
        }
    }
}

/// 限制并发数的 operation 队列
/// 排队中的 operation 保持 `Ready`，取消后不会发起连接
/// 必须在 tokio runtime 内调用 `submit`，队列丢弃时会中止所有任务
pub struct OperationQueue {
    permits: Arc<Semaphore>,
    max_concurrent: usize,
    tracked: Mutex<Tracked>,
}

impl OperationQueue {
    pub fn new(max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            tracked: Mutex::new(Tracked::default()),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// 尚未结束的 operation 数量
    pub fn len(&self) -> usize {
        let mut tracked = self.tracked();
        tracked.reap();
        tracked.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn cancel_all(&self) {
        let handles = self.tracked().handles.clone();
        debug!("cancel {} operations", handles.len());
        for handle in handles {
            handle.cancel();
        }
    }

    /// 等待当前所有 operation 结束，并回收它们的任务
    pub async fn wait_all(&self) {
        let handles = self.tracked().handles.clone();
        join_all(handles.iter().map(|h| h.wait())).await;

        // operation 都已结束，剩下的任务只会很快退出
        let mut tasks = {
            let mut tracked = self.tracked();
            tracked.reap();
            mem::take(&mut tracked.tasks)
        };
        while let Some(res) = tasks.join_next().await {
            log_join(res);
        }
    }

    fn tracked(&self) -> MutexGuard<'_, Tracked> {
        self.tracked.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Scheduler for OperationQueue {
    fn submit<T: Transport>(&self, op: CommandOperation<T>) -> OperationHandle {
        let handle = op.handle();
        let permits = self.permits.clone();
        let waiting = handle.clone();

        let mut tracked = self.tracked();
        tracked.reap();
        tracked.handles.push(handle.clone());
        tracked.tasks.spawn(async move {
            let _permit = select! {
                biased;
                // 排队期间被取消
                _ = waiting.wait() => return,
                permit = permits.acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        waiting.cancel();
                        return;
                    }
                },
            };
            op.start().await;
        });

        handle
    }
}
