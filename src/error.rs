use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("Invalid packet: {0}")]
    InvalidPacket(&'static str),
    #[error("Buffer too small: {needed} needed, {available} available")]
    BufferTooSmall { needed: usize, available: usize },
    #[error("Decoded {consumed} bits out of {available} available")]
    InternalInconsistency { consumed: usize, available: usize },
}

pub type Result<T> = std::result::Result<T, Error>;
