use std::process::ExitCode;

use clap::{error::ErrorKind, Parser};
use donna_trigger::{client, logger, Cli, Config, Env, ReturnCode};
use log::warn;
use tokio::task::LocalSet;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ReturnCode::ParseCmdline.into(),
            };
        }
    };

    // 日志初始化失败不影响触发
    let _logger = match logger::init(cli.log_level()) {
        Ok(handle) => Some(handle),
        Err(e) => {
            eprintln!("Failed to initialize logger: {}", e);
            None
        }
    };

    let env = Env::from_env().unwrap_or_else(|e| {
        warn!("ignoring environment: {}", e);
        Env::default()
    });
    let config = match Config::resolve(cli, env) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            return e.return_code().into();
        }
    };

    LocalSet::new().run_until(client::run(&config)).await.into()
}
