#![allow(dead_code)]

use spindle_kernel::{Kernel, KernelConfig};
use spindle_vm::{BlockStore, DeviceError, Disk, DiskConfig, MemStore};
use std::collections::HashSet;
use std::sync::{mpsc, Arc, Mutex};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Boot a fresh kernel, run `body` as its main thread and hand back what it
/// returned. Panics if the kernel reports an error or the body panicked.
pub fn within<T, F>(config: KernelConfig, body: F) -> T
where
    T: Send + 'static,
    F: FnOnce(&Kernel) -> T + Send + 'static,
{
    init_logging();
    let kernel = Kernel::new(config);
    let (tx, rx) = mpsc::channel();
    kernel
        .run(move |k| {
            let _ = tx.send(body(k));
        })
        .unwrap();
    rx.recv().expect("main thread did not finish")
}

pub type Log = Arc<Mutex<Vec<String>>>;

pub fn log() -> Log {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn note(log: &Log, entry: impl Into<String>) {
    log.lock().unwrap().push(entry.into());
}

pub fn entries(log: &Log) -> Vec<String> {
    log.lock().unwrap().clone()
}

pub fn position(log: &[String], entry: &str) -> usize {
    log.iter()
        .position(|e| e == entry)
        .unwrap_or_else(|| panic!("{:?} missing from {:?}", entry, log))
}

/// In-memory store that records every operation and fails reads of chosen
/// blocks.
pub struct ScriptedStore {
    inner: MemStore,
    ops: Log,
    failing: Arc<Mutex<HashSet<u32>>>,
}

impl BlockStore for ScriptedStore {
    fn block_size(&self) -> usize {
        self.inner.block_size()
    }

    fn block_count(&self) -> u32 {
        self.inner.block_count()
    }

    fn read_block(&mut self, block: u32, buffer: &mut [u8]) -> Result<(), DeviceError> {
        note(&self.ops, format!("R{}", block));
        if self.failing.lock().unwrap().contains(&block) {
            return Err(DeviceError::Failed { block });
        }
        self.inner.read_block(block, buffer)
    }

    fn write_block(&mut self, block: u32, buffer: &[u8]) -> Result<(), DeviceError> {
        note(&self.ops, format!("W{}", block));
        if self.failing.lock().unwrap().contains(&block) {
            return Err(DeviceError::Failed { block });
        }
        self.inner.write_block(block, buffer)
    }
}

pub struct Scripted {
    pub disk: Arc<Disk>,
    pub ops: Log,
    pub failing: Arc<Mutex<HashSet<u32>>>,
}

pub const BLOCK_SIZE: usize = 64;

pub fn scripted_disk(blocks: u32) -> Scripted {
    let ops = log();
    let failing = Arc::new(Mutex::new(HashSet::new()));
    let store = ScriptedStore {
        inner: MemStore::new(blocks, BLOCK_SIZE),
        ops: Arc::clone(&ops),
        failing: Arc::clone(&failing),
    };
    let disk = Disk::new("scripted", Box::new(store), DiskConfig::default()).unwrap();
    Scripted {
        disk: Arc::new(disk),
        ops,
        failing,
    }
}

pub fn mem_disk(blocks: u32) -> Arc<Disk> {
    let store = MemStore::new(blocks, BLOCK_SIZE);
    Arc::new(Disk::new("mem", Box::new(store), DiskConfig::default()).unwrap())
}
