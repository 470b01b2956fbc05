use flexi_logger::{FlexiLoggerError, Logger, LoggerHandle};
use log::LevelFilter;

use crate::config::LogLevel;

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error | LogLevel::Critical => LevelFilter::Error,
            LogLevel::Warning => LevelFilter::Warn,
            LogLevel::Message | LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Debug2 | LogLevel::Debug3 | LogLevel::Debug4 => LevelFilter::Trace,
        }
    }
}

/// 日志输出到 stderr，返回的 handle 需要一直持有
pub fn init(level: LogLevel) -> Result<LoggerHandle, FlexiLoggerError> {
    let spec = LevelFilter::from(level).to_string().to_lowercase();
    Logger::try_with_str(spec)?
        .format(flexi_logger::default_format)
        .start()
}
