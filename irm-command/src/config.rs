//! 进程级共享配置
//! 进程启动时通过 `init` 设置一次，此后只读

use std::{sync::OnceLock, time::Duration};

use tokio::{fs, io::AsyncReadExt};

/// 对端服务的默认端口，所有 operation 共用
pub const DEFAULT_PORT: u16 = 51013;

/// 未配置时使用的默认主机
pub const DEFAULT_HOST: &str = "localhost";

static GLOBAL: OnceLock<Config> = OnceLock::new();

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Read config file error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse config file error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Config already initialized")]
    AlreadyInitialized,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Deserialize)]
pub struct Config {
    #[serde(default)]
    pub command: CommandConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct CommandConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// 建立连接的超时时间（毫秒），不设置则不限制
    #[serde(default)]
    pub connect_timeout_ms: Option<u64>,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            connect_timeout_ms: None,
        }
    }
}

impl CommandConfig {
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }
}

fn default_host() -> String {
    DEFAULT_HOST.into()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl Config {
    pub async fn from_path(path: &str) -> Result<Self, Error> {
        let mut file = fs::File::open(path).await?;
        let mut s = String::new();
        file.read_to_string(&mut s).await?;

        Self::from_toml(&s)
    }

    pub fn from_toml(s: &str) -> Result<Self, Error> {
        Ok(toml::from_str::<Config>(s)?)
    }
}

/// 安装全局配置，只能成功一次
/// 在 `global` 被读取之后再调用也会失败（此时默认配置已生效）
pub fn init(cfg: Config) -> Result<(), Error> {
    GLOBAL.set(cfg).map_err(|_| Error::AlreadyInitialized)
}

/// 读取全局配置，未安装时使用默认值
pub fn global() -> &'static Config {
    GLOBAL.get_or_init(Config::default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_parsing_works() {
        let cfg = Config::from_toml(
            r#"
            [command]
            host = "10.0.0.8"
            connect_timeout_ms = 1500
            "#,
        )
        .unwrap();

        assert_eq!(cfg.command.host, "10.0.0.8");
        assert_eq!(cfg.command.port, DEFAULT_PORT);
        assert_eq!(
            cfg.command.connect_timeout(),
            Some(Duration::from_millis(1500))
        );
    }

    #[test]
    fn empty_config_uses_defaults() {
        let cfg = Config::from_toml("").unwrap();
        assert_eq!(cfg, Config::default());
        assert_eq!(cfg.command.host, DEFAULT_HOST);
        assert_eq!(cfg.command.connect_timeout(), None);
    }

    #[test]
    fn bad_port_is_rejected() {
        let err = Config::from_toml("[command]\nport = 70000\n").unwrap_err();
        assert!(matches!(err, Error::Toml(_)));
    }

    #[test]
    fn global_is_set_once() {
        let _ = global();
        assert!(matches!(
            init(Config::default()),
            Err(Error::AlreadyInitialized)
        ));
    }
}
