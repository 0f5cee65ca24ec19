use flexi_logger::{FlexiLoggerError, Logger, LoggerHandle};
use irm_command::Config;

/// 环境变量覆盖，例如 `IRM_HOST=10.0.0.8`
#[derive(Debug, Default, serde::Deserialize)]
pub struct Env {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub connect_timeout_ms: Option<u64>,
    pub log: Option<String>,
}

impl Env {
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::prefixed("IRM_").from_env::<Env>()
    }

    pub fn apply(&self, cfg: &mut Config) {
        if let Some(ref host) = self.host {
            cfg.command.host = host.clone();
        }
        if let Some(port) = self.port {
            cfg.command.port = port;
        }
        if self.connect_timeout_ms.is_some() {
            cfg.command.connect_timeout_ms = self.connect_timeout_ms;
        }
    }
}

/// 日志默认输出到 stderr，stdout 留给回复内容
pub fn init_logger(spec: &str) -> Result<LoggerHandle, FlexiLoggerError> {
    Logger::try_with_env_or_str(spec)?.start()
}
