use spindle_vm::DeviceError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("allocation error: {0}")]
    Allocation(String),

    #[error("invalid block {block} (device has {count} blocks)")]
    InvalidBlock { block: u32, count: u32 },

    #[error("no buffer block available")]
    NoBuffer,

    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    #[error("deadlock: {blocked} thread(s) blocked and {unstarted} never started, with nothing left to wake them")]
    Deadlock { blocked: usize, unstarted: usize },

    #[error("kernel already booted")]
    AlreadyBooted,
}
