use std::path::PathBuf;

use clap::{ArgAction, Parser, ValueEnum};
use log::debug;

use crate::trigger::ReturnCode;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("No socket specified, use --socket or set DONNATELLA_SOCKET")]
    NoSocket,
    #[error("Missing FULL LOCATION to trigger")]
    NoFullLocation,
}

impl Error {
    pub fn return_code(&self) -> ReturnCode {
        match self {
            Error::NoSocket => ReturnCode::NoSocket,
            Error::NoFullLocation => ReturnCode::NoFullLocation,
        }
    }
}

/// 日志级别，由低到高
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub enum LogLevel {
    Error,
    Critical,
    Warning,
    Message,
    Info,
    Debug,
    #[clap(name = "debug2")]
    Debug2,
    #[clap(name = "debug3")]
    Debug3,
    #[clap(name = "debug4")]
    Debug4,
}

impl LogLevel {
    const SCALE: [LogLevel; 9] = [
        LogLevel::Error,
        LogLevel::Critical,
        LogLevel::Warning,
        LogLevel::Message,
        LogLevel::Info,
        LogLevel::Debug,
        LogLevel::Debug2,
        LogLevel::Debug3,
        LogLevel::Debug4,
    ];

    /// 提高 steps 级，最高为 debug4
    pub fn raise(self, steps: u8) -> Self {
        let index = (self as usize + steps as usize).min(Self::SCALE.len() - 1);
        Self::SCALE[index]
    }
}

/// Trigger full locations in a running donnatella
#[derive(Debug, Parser)]
#[clap(name = "donna-trigger", version)]
pub struct Cli {
    /// Set LEVEL as the log level
    #[clap(short = 'L', long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,
    /// Increase verbosity, can be repeated
    #[clap(short, long, action = ArgAction::Count)]
    pub verbose: u8,
    /// Quiet mode, same as --log-level=error
    #[clap(short, long, action)]
    pub quiet: bool,
    /// Use SOCKET to communicate with donnatella
    #[clap(short, long, value_parser, value_name = "SOCKET")]
    pub socket: Option<PathBuf>,
    /// Don't wait for triggered tasks to finish
    #[clap(short, long, action)]
    pub no_wait: bool,
    /// Print messages of failed tasks on stderr
    #[clap(short = 'e', long, action)]
    pub failed_on_err: bool,
    /// Debug mode, same as --log-level=debug
    // 只在 debug 构建中生效
    #[clap(short, long, action, hide = !cfg!(debug_assertions))]
    pub debug: bool,
    #[clap(value_parser, value_name = "FULL LOCATION")]
    pub locations: Vec<String>,
}

impl Cli {
    pub fn log_level(&self) -> LogLevel {
        let mut level = self.log_level.unwrap_or(LogLevel::Warning);
        if self.quiet {
            level = LogLevel::Error;
        }
        if cfg!(debug_assertions) && self.debug {
            level = LogLevel::Debug;
        }
        level.raise(self.verbose)
    }
}

/// 环境变量
#[derive(Debug, Default, serde::Deserialize)]
pub struct Env {
    pub donnatella_socket: Option<PathBuf>,
}

impl Env {
    /// 忽略名称或值不是 UTF-8 的环境变量
    pub fn from_env() -> Result<Self, envy::Error> {
        let vars = std::env::vars_os()
            .filter_map(|(key, value)| Some((key.into_string().ok()?, value.into_string().ok()?)));
        envy::from_iter::<_, Env>(vars)
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub socket: PathBuf,
    pub locations: Vec<String>,
    pub no_wait: bool,
    pub failed_on_err: bool,
}

impl Config {
    /// 命令行参数优先于环境变量
    pub fn resolve(cli: Cli, env: Env) -> Result<Self, Error> {
        let socket = cli
            .socket
            .or(env.donnatella_socket)
            .ok_or(Error::NoSocket)?;

        if cli.locations.is_empty() {
            return Err(Error::NoFullLocation);
        }

        // 多个 location 时无法确定中断应该取消哪个任务，强制不等待
        let no_wait = cli.no_wait || cli.locations.len() > 1;
        if no_wait && !cli.no_wait {
            debug!("multiple full locations, no-wait forced");
        }

        Ok(Self {
            socket,
            locations: cli.locations,
            no_wait,
            failed_on_err: cli.failed_on_err,
        })
    }
}
