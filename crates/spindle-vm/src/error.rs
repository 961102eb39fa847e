#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("block {block} out of range (device has {count} blocks)")]
    OutOfRange { block: u32, count: u32 },

    #[error("buffer size mismatch: expected {expected} bytes, got {actual}")]
    BufferSize { expected: usize, actual: usize },

    #[error("invalid block size {0}")]
    BlockSize(usize),

    #[error("device reported failure on block {block}")]
    Failed { block: u32 },

    #[error("device disconnected")]
    Disconnected,
}
