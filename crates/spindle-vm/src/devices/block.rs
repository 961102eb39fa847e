use crate::devices::{Completion, CompletionFn, DiskId, Reply, Request};
use crate::error::DeviceError;
use log::{debug, info, warn};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub const DEFAULT_BLOCK_SIZE: usize = 512;

/// Synchronous backing storage behind a [`Disk`].
pub trait BlockStore: Send {
    fn block_size(&self) -> usize;

    fn block_count(&self) -> u32;

    fn read_block(&mut self, block: u32, buffer: &mut [u8]) -> Result<(), DeviceError>;

    fn write_block(&mut self, block: u32, buffer: &[u8]) -> Result<(), DeviceError>;
}

fn check_access(
    block: u32,
    count: u32,
    block_size: usize,
    buffer_len: usize,
) -> Result<(), DeviceError> {
    if block >= count {
        return Err(DeviceError::OutOfRange { block, count });
    }
    if buffer_len != block_size {
        return Err(DeviceError::BufferSize {
            expected: block_size,
            actual: buffer_len,
        });
    }
    Ok(())
}

fn check_block_size(block_size: usize) -> Result<(), DeviceError> {
    if block_size == 0 {
        return Err(DeviceError::BlockSize(block_size));
    }
    Ok(())
}

/// Zero-filled in-memory store.
pub struct MemStore {
    block_size: usize,
    blocks: u32,
    data: Vec<u8>,
}

impl MemStore {
    pub fn new(blocks: u32, block_size: usize) -> Self {
        Self {
            block_size,
            blocks,
            data: vec![0; blocks as usize * block_size],
        }
    }
}

impl BlockStore for MemStore {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u32 {
        self.blocks
    }

    fn read_block(&mut self, block: u32, buffer: &mut [u8]) -> Result<(), DeviceError> {
        check_access(block, self.block_count(), self.block_size, buffer.len())?;
        let start = block as usize * self.block_size;
        buffer.copy_from_slice(&self.data[start..start + self.block_size]);
        Ok(())
    }

    fn write_block(&mut self, block: u32, buffer: &[u8]) -> Result<(), DeviceError> {
        check_access(block, self.block_count(), self.block_size, buffer.len())?;
        let start = block as usize * self.block_size;
        self.data[start..start + self.block_size].copy_from_slice(buffer);
        Ok(())
    }
}

/// Disk image file, one block after another.
pub struct FileStore {
    file: File,
    block_size: usize,
    blocks: u32,
}

impl FileStore {
    /// Format a zeroed image of `blocks` blocks, truncating any existing file.
    pub fn create(path: &Path, blocks: u32, block_size: usize) -> Result<Self, DeviceError> {
        check_block_size(block_size)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(blocks as u64 * block_size as u64)?;

        Ok(Self {
            file,
            block_size,
            blocks,
        })
    }

    /// Open an existing image. Trailing bytes short of a full block are ignored.
    pub fn open(path: &Path, block_size: usize) -> Result<Self, DeviceError> {
        check_block_size(block_size)?;
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();

        Ok(Self {
            file,
            block_size,
            blocks: (len / block_size as u64) as u32,
        })
    }

    fn seek_to(&mut self, block: u32) -> Result<(), DeviceError> {
        let pos = block as u64 * self.block_size as u64;
        self.file.seek(SeekFrom::Start(pos))?;
        Ok(())
    }
}

impl BlockStore for FileStore {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u32 {
        self.blocks
    }

    fn read_block(&mut self, block: u32, buffer: &mut [u8]) -> Result<(), DeviceError> {
        check_access(block, self.blocks, self.block_size, buffer.len())?;
        self.seek_to(block)?;
        self.file.read_exact(buffer)?;
        Ok(())
    }

    fn write_block(&mut self, block: u32, buffer: &[u8]) -> Result<(), DeviceError> {
        check_access(block, self.blocks, self.block_size, buffer.len())?;
        self.seek_to(block)?;
        self.file.write_all(buffer)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct DiskConfig {
    /// Artificial service time added to every request.
    pub latency: Option<Duration>,
}

/// Operation counters of a [`Disk`].
#[derive(Debug, Default)]
pub struct DiskStats {
    reads: AtomicU64,
    writes: AtomicU64,
    failures: AtomicU64,
}

impl DiskStats {
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

struct Job {
    request: Request,
    done: CompletionFn,
}

/// Asynchronous block device.
///
/// Requests are queued to a worker that owns the [`BlockStore`]; `submit` returns
/// at once and the outcome is reported through the completion callback, which
/// runs on the worker.
pub struct Disk {
    id: DiskId,
    name: String,
    block_size: usize,
    block_count: u32,
    jobs: Option<Sender<Job>>,
    worker: Option<JoinHandle<()>>,
    stats: Arc<DiskStats>,
}

impl Disk {
    pub fn new(
        name: &str,
        store: Box<dyn BlockStore>,
        config: DiskConfig,
    ) -> Result<Self, DeviceError> {
        let block_size = store.block_size();
        check_block_size(block_size)?;
        let id = DiskId::next();
        let block_count = store.block_count();
        let stats = Arc::new(DiskStats::default());
        let (tx, rx) = mpsc::channel();

        let worker_stats = Arc::clone(&stats);
        let worker = thread::Builder::new()
            .name(format!("{}-{}", name, id))
            .spawn(move || serve(store, rx, config, worker_stats))?;

        info!(
            "Attached {} ({}): {} blocks of {} bytes",
            id, name, block_count, block_size
        );

        Ok(Self {
            id,
            name: name.to_string(),
            block_size,
            block_count,
            jobs: Some(tx),
            worker: Some(worker),
            stats,
        })
    }

    pub fn id(&self) -> DiskId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn block_count(&self) -> u32 {
        self.block_count
    }

    pub fn stats(&self) -> &DiskStats {
        &self.stats
    }

    /// Queue a request. On error the callback has been dropped without running.
    pub fn submit(&self, request: Request, done: CompletionFn) -> Result<(), DeviceError> {
        let jobs = self.jobs.as_ref().ok_or(DeviceError::Disconnected)?;
        jobs.send(Job { request, done })
            .map_err(|_| DeviceError::Disconnected)
    }
}

impl Drop for Disk {
    fn drop(&mut self) {
        // Closing the queue stops the worker once the backlog drains.
        self.jobs.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("{} worker panicked", self.id);
            }
        }
    }
}

fn serve(
    mut store: Box<dyn BlockStore>,
    jobs: Receiver<Job>,
    config: DiskConfig,
    stats: Arc<DiskStats>,
) {
    let block_size = store.block_size();

    for Job { request, done } in jobs {
        if let Some(latency) = config.latency {
            thread::sleep(latency);
        }

        let block = request.block();
        let result = match request {
            Request::Read { block } => {
                stats.reads.fetch_add(1, Ordering::Relaxed);
                let mut buffer = vec![0u8; block_size].into_boxed_slice();
                store.read_block(block, &mut buffer).map(|_| Some(buffer))
            }
            Request::Write { block, data } => {
                stats.writes.fetch_add(1, Ordering::Relaxed);
                store.write_block(block, &data).map(|_| None)
            }
        };

        let completion = match result {
            Ok(data) => Completion {
                block,
                reply: Reply::Ok,
                data,
            },
            Err(e) => {
                debug!("Request on block {} failed: {}", block, e);
                stats.failures.fetch_add(1, Ordering::Relaxed);
                Completion {
                    block,
                    reply: Reply::Error,
                    data: None,
                }
            }
        };

        done(completion);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;

    fn roundtrip(disk: &Disk, request: Request) -> Completion {
        let (tx, rx) = channel();
        disk.submit(
            request,
            Box::new(move |c| {
                let _ = tx.send(c);
            }),
        )
        .unwrap();
        rx.recv().unwrap()
    }

    #[test]
    fn test_mem_store_bounds() {
        let mut store = MemStore::new(4, 16);
        let mut buf = [0u8; 16];
        assert_eq!(store.block_count(), 4);
        assert!(store.read_block(3, &mut buf).is_ok());
        assert!(matches!(
            store.read_block(4, &mut buf),
            Err(DeviceError::OutOfRange { block: 4, count: 4 })
        ));
        assert!(matches!(
            store.write_block(0, &[0u8; 8]),
            Err(DeviceError::BufferSize {
                expected: 16,
                actual: 8
            })
        ));
    }

    #[test]
    fn test_disk_write_then_read() {
        let disk = Disk::new("mem", Box::new(MemStore::new(8, 32)), DiskConfig::default()).unwrap();

        let write = roundtrip(
            &disk,
            Request::Write {
                block: 5,
                data: vec![0xAB; 32].into_boxed_slice(),
            },
        );
        assert!(write.is_ok());
        assert!(write.data.is_none());

        let read = roundtrip(&disk, Request::Read { block: 5 });
        assert!(read.is_ok());
        assert_eq!(read.block, 5);
        assert!(read.data.unwrap().iter().all(|&b| b == 0xAB));

        assert_eq!(disk.stats().reads(), 1);
        assert_eq!(disk.stats().writes(), 1);
        assert_eq!(disk.stats().failures(), 0);
    }

    #[test]
    fn test_disk_reports_error_reply() {
        let disk = Disk::new("mem", Box::new(MemStore::new(2, 32)), DiskConfig::default()).unwrap();

        let read = roundtrip(&disk, Request::Read { block: 9 });
        assert_eq!(read.reply, Reply::Error);
        assert!(read.data.is_none());
        assert_eq!(disk.stats().failures(), 1);
    }

    #[test]
    fn test_file_store_persists() {
        let path = std::env::temp_dir().join(format!("spindle-vm-{}.img", std::process::id()));

        {
            let mut store = FileStore::create(&path, 3, 64).unwrap();
            store.write_block(2, &[7u8; 64]).unwrap();
        }

        let mut store = FileStore::open(&path, 64).unwrap();
        assert_eq!(store.block_count(), 3);
        let mut buf = [0u8; 64];
        store.read_block(2, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 7));
        store.read_block(0, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_zero_block_size_rejected() {
        let store = MemStore::new(4, 0);
        assert_eq!(store.block_count(), 4);
        assert!(matches!(
            Disk::new("mem", Box::new(store), DiskConfig::default()),
            Err(DeviceError::BlockSize(0))
        ));

        let path = std::env::temp_dir().join(format!("spindle-vm-zero-{}.img", std::process::id()));
        assert!(matches!(
            FileStore::create(&path, 3, 0),
            Err(DeviceError::BlockSize(0))
        ));
        assert!(!path.exists());

        FileStore::create(&path, 3, 64).unwrap();
        assert!(matches!(
            FileStore::open(&path, 0),
            Err(DeviceError::BlockSize(0))
        ));

        let _ = std::fs::remove_file(&path);
    }
}
