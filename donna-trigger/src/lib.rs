//! donna-trigger
//!
//! 通过 socket 让正在运行的 donnatella 触发一个或多个 full location，
//! 等待（可选）后台任务结束，并以退出码汇报结果。

pub mod client;
pub mod config;
pub mod logger;
pub mod protocol;
pub mod trigger;

pub use config::{Cli, Config, Env};
pub use trigger::{ReturnCode, Trigger};
