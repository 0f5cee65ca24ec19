//! 请求编码
//! 线上格式：`COMMAND` 或 `COMMAND ARGUMENT`，以 `\n` 结尾

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::Error;

/// 命令与参数之间的分隔符
pub const SEPARATOR: u8 = b' ';
/// 请求结束符
pub const TERMINATOR: u8 = b'\n';

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    command: String,
    argument: Option<String>,
}

impl Request {
    /// 空参数视为无参数
    pub fn new(command: &str, argument: Option<&str>) -> Result<Self, Error> {
        if command.is_empty() {
            return Err(Error::EmptyCommand);
        }
        check_line(command)?;

        let argument = match argument {
            Some(arg) if !arg.is_empty() => {
                check_line(arg)?;
                Some(arg.to_owned())
            }
            _ => None,
        };

        Ok(Self {
            command: command.to_owned(),
            argument,
        })
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn argument(&self) -> Option<&str> {
        self.argument.as_deref()
    }

    pub fn encoded_len(&self) -> usize {
        self.command.len() + self.argument.as_ref().map_or(0, |arg| 1 + arg.len()) + 1
    }

    pub fn write(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_len());
        buf.put_slice(self.command.as_bytes());
        if let Some(ref arg) = self.argument {
            buf.put_u8(SEPARATOR);
            buf.put_slice(arg.as_bytes());
        }
        buf.put_u8(TERMINATOR);
    }

    /// 整个请求作为一次写出的负载
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.write(&mut buf);
        buf.freeze()
    }
}

fn check_line(s: &str) -> Result<(), Error> {
    if s.contains(['\n', '\r']) {
        return Err(Error::InvalidCommand(s.to_owned()));
    }
    Ok(())
}
