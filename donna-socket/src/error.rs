use std::io;

use crate::network::frame;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Socket closed")]
    Closed,
    #[error("Frame error: {0}")]
    Frame(#[from] frame::Error),
    #[error("I/O: {0}")]
    IO(#[from] io::Error),
}
