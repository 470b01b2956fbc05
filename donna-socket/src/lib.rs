//! donna 进程间通信使用的 socket 库
//!
//! 消息以长度前缀帧 `<长度>:<负载>` 在 unix socket 上传输，
//! 连接由单线程事件循环驱动，通过回调把收到的消息交给上层。

pub mod error;
pub mod network;

pub use error::Error;
pub use network::{FrameBuffer, Socket};
