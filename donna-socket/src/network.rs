//! 网络层
//! 本层只关心帧的读写与缓冲，不包含任何 donna 协议相关逻辑

pub use conn::{Handler, Socket};
pub use frame::FrameBuffer;

pub mod conn;
pub mod frame;
