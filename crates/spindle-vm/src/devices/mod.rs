pub mod block;

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

pub use block::{
    BlockStore, Disk, DiskConfig, DiskStats, FileStore, MemStore, DEFAULT_BLOCK_SIZE,
};

/// Unique identity of an attached device.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct DiskId(u32);

impl DiskId {
    pub(crate) fn next() -> Self {
        static NEXT_ID: AtomicU32 = AtomicU32::new(1);
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn val(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for DiskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "disk{}", self.0)
    }
}

/// A single block transfer handed to a device.
#[derive(Debug)]
pub enum Request {
    Read { block: u32 },
    Write { block: u32, data: Box<[u8]> },
}

impl Request {
    pub fn block(&self) -> u32 {
        match self {
            Request::Read { block } | Request::Write { block, .. } => *block,
        }
    }
}

/// Device reply code.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Reply {
    Ok,
    Error,
}

/// Reported by a device once a request has finished.
#[derive(Debug)]
pub struct Completion {
    pub block: u32,
    pub reply: Reply,
    /// Block contents for a successful read.
    pub data: Option<Box<[u8]>>,
}

impl Completion {
    pub fn is_ok(&self) -> bool {
        self.reply == Reply::Ok
    }
}

/// Callback invoked from the device side when a request completes.
pub type CompletionFn = Box<dyn FnOnce(Completion) + Send>;
