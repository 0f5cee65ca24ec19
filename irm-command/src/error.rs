use std::io;

/// 一次命令交互可能出现的错误，全部通过完成回调交付
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// 无法建立 tcp 连接（拒绝、不可达、DNS 失败、连接超时）
    #[error("Connection error: {0}")]
    Connection(#[source] io::Error),
    /// 连接建立后读写失败
    #[error("Transport error: {0}")]
    Transport(#[source] io::Error),
    #[error("Operation cancelled")]
    Cancelled,
    #[error("Command must not be empty")]
    EmptyCommand,
    #[error("Line break not allowed in request: {0:?}")]
    InvalidCommand(String),
}

impl Error {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}
