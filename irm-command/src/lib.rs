//! 一个异步命令客户端库
//! 每个 `CommandOperation` 负责一次 tcp 往返：发送一行命令，读取对端关闭前的全部字节，
//! 结果通过完成回调交付且只交付一次。operation 交给 `Scheduler` 调度运行。

pub mod config;
pub mod error;
pub mod operation;
pub mod queue;
pub mod request;
pub mod transport;

#[cfg(test)]
mod mock;

pub use config::{Config, DEFAULT_PORT};
pub use error::Error;
pub use operation::{channel, CommandOperation, Completion, Handler, OperationHandle, State};
pub use queue::{OperationQueue, Scheduler};
pub use transport::{TcpTransport, Transport};
