use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Communicator error: {0}")]
    Comm(String),

    #[error("Rank {rank} is out of range for a communicator of size {size}")]
    InvalidRank { rank: usize, size: usize },

    #[error("Message from rank {source_rank} (tag {tag}) has {len} bytes, not a multiple of {elem_size}")]
    MalformedMessage {
        source_rank: usize,
        tag: u32,
        len: usize,
        elem_size: usize,
    },

    #[error("Device inventory error: {0}")]
    Inventory(String),

    #[error("Device error on device {ordinal}: {message}")]
    Device { ordinal: usize, message: String },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid matrix dimensions: {0}")]
    InvalidDimensions(String),
}

pub type Result<T> = core::result::Result<T, CoreError>;
