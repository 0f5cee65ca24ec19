use std::{io::Write, path::Path, process::ExitCode};

use clap::Parser;
use demos::{init_logger, Env};
use irm_command::{channel, config, CommandOperation, Config, OperationQueue, Scheduler};
use log::{error, info};

/// 向 irm 服务发送一条命令并打印回复
#[derive(Debug, Parser)]
#[clap(version, about)]
struct Args {
    /// 配置文件，不存在时使用默认配置
    #[clap(short, long, default_value = "./send.toml")]
    config: String,
    /// 覆盖配置中的主机
    #[clap(long)]
    host: Option<String>,
    command: String,
    argument: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let env = match Env::from_env() {
        Ok(env) => env,
        Err(e) => {
            eprintln!("read env error: {}", e);
            return ExitCode::FAILURE;
        }
    };
    // 日志句柄需要存活到进程结束
    let _logger = match init_logger(env.log.as_deref().unwrap_or("info")) {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("init logger error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    // 获取配置
    let mut cfg = if Path::new(&args.config).exists() {
        match Config::from_path(&args.config).await {
            Ok(cfg) => cfg,
            Err(e) => {
                error!("load config {} error: {}", args.config, e);
                return ExitCode::FAILURE;
            }
        }
    } else {
        Config::default()
    };
    env.apply(&mut cfg);
    if let Err(e) = config::init(cfg) {
        error!("{}", e);
        return ExitCode::FAILURE;
    }

    let (handler, rx) = channel();
    let op = match args.host {
        Some(ref host) => {
            CommandOperation::with_host(host, &args.command, args.argument.as_deref(), handler)
        }
        None => CommandOperation::new(&args.command, args.argument.as_deref(), handler),
    };
    let op = match op {
        Ok(op) => op,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    info!("send {} to {}:{}", op.command(), op.host(), op.port());

    let queue = OperationQueue::new(1);
    queue.submit(op);

    match rx.await {
        Ok(Ok(data)) => {
            let mut stdout = std::io::stdout();
            if let Err(e) = stdout.write_all(&data).and_then(|_| stdout.flush()) {
                error!("write reply error: {}", e);
                return ExitCode::FAILURE;
            }
            ExitCode::SUCCESS
        }
        Ok(Err(e)) => {
            error!("command failed: {}", e);
            ExitCode::FAILURE
        }
        Err(_) => {
            error!("operation dropped without result");
            ExitCode::FAILURE
        }
    }
}
