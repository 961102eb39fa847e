//! Block buffer cache.
//!
//! Blocks are keyed by `(disk, block)` and hashed into buckets. Each bucket
//! owns a lock semaphore that serializes every acquire of a block in that
//! bucket, plus the completion mailbox used while that lock is held. Cached
//! blocks nobody holds sit on a single LRU list; a held block is on no list
//! and its arena slot is empty until it is released.
//!
//! The structure lock only ever guards bookkeeping and is never held while a
//! thread sleeps.

use super::block::{transfer, IoChannel};
use super::lru::{BufId, LruList};
use crate::error::KernelError;
use crate::sync::{Semaphore, SpinLock};
use crate::thread::context::{ContextSwitch, Handoff};
use crate::Kernel;
use log::{debug, trace, warn};
use spindle_vm::devices::{Disk, DiskId, Request};
use spindle_vm::DeviceError;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Number of hash buckets. This is also the number of blocks the cache
    /// keeps resident before it starts evicting.
    pub buckets: usize,
    /// Device requests allowed in flight across the whole cache.
    pub max_pending_requests: usize,
    /// Hard cap on resident blocks. Without one the cache grows past
    /// `buckets` only while every resident block is held.
    pub block_limit: Option<usize>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            buckets: 64,
            max_pending_requests: 16,
            block_limit: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Clean,
    Dirty,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    /// Successful device writes, write-through and write-back alike.
    pub writes: u64,
    pub live_blocks: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct BlockKey {
    disk: DiskId,
    block: u32,
}

struct BufferBlock {
    key: BlockKey,
    disk: Arc<Disk>,
    state: BlockState,
    data: Box<[u8]>,
}

impl BufferBlock {
    fn new(disk: &Arc<Disk>, key: BlockKey) -> Self {
        Self {
            key,
            disk: Arc::clone(disk),
            state: BlockState::Clean,
            data: vec![0; disk.block_size()].into_boxed_slice(),
        }
    }

    /// Reuse an evicted block's storage for another key.
    fn rebind(&mut self, disk: &Arc<Disk>, key: BlockKey) {
        if self.data.len() != disk.block_size() {
            self.data = vec![0; disk.block_size()].into_boxed_slice();
        }
        self.key = key;
        self.disk = Arc::clone(disk);
        self.state = BlockState::Clean;
    }
}

struct Bucket {
    lock: Semaphore,
    io: Arc<IoChannel>,
}

#[derive(Default)]
struct CacheInner {
    /// `None` while the block is held, or while the slot is free.
    slots: Vec<Option<BufferBlock>>,
    free_slots: Vec<BufId>,
    index: HashMap<BlockKey, BufId>,
    lru: LruList,
    live: usize,
    stats: CacheStats,
}

impl CacheInner {
    fn allocate_slot(&mut self) -> BufId {
        self.live += 1;
        if let Some(id) = self.free_slots.pop() {
            return id;
        }
        self.slots.push(None);
        BufId(self.slots.len() - 1)
    }

    fn free_slot(&mut self, id: BufId) {
        self.slots[id.0] = None;
        self.free_slots.push(id);
        self.live -= 1;
    }
}

pub struct BufferCache {
    config: CacheConfig,
    buckets: Vec<Bucket>,
    permit: Semaphore,
    inner: SpinLock<CacheInner>,
}

impl Default for BufferCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl BufferCache {
    pub fn new(config: CacheConfig) -> Self {
        let buckets = (0..config.buckets.max(1))
            .map(|_| Bucket {
                lock: Semaphore::new(1),
                io: Arc::new(IoChannel::new()),
            })
            .collect();

        Self {
            permit: Semaphore::new(config.max_pending_requests.max(1)),
            buckets,
            config,
            inner: SpinLock::new(CacheInner::default()),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Resident blocks allowed before eviction starts.
    pub fn capacity(&self) -> usize {
        let buckets = self.buckets.len();
        self.config
            .block_limit
            .map_or(buckets, |limit| limit.clamp(1, buckets))
    }

    /// Whether a fresh block may be allocated once nothing can be reclaimed.
    fn under_limit(&self, live: usize) -> bool {
        self.config.block_limit.map_or(true, |limit| live < limit)
    }

    pub fn bucket_of(&self, disk: DiskId, block: u32) -> usize {
        (disk.val() as usize)
            .wrapping_mul(31)
            .wrapping_add(block as usize)
            % self.buckets.len()
    }

    fn bucket_index(&self, key: BlockKey) -> usize {
        self.bucket_of(key.disk, key.block)
    }

    /// Whether the block is resident, held or not.
    pub fn contains(&self, disk: DiskId, block: u32) -> bool {
        self.inner
            .lock()
            .index
            .contains_key(&BlockKey { disk, block })
    }

    /// Resident blocks that are not currently held.
    pub fn idle_blocks(&self) -> usize {
        self.inner.lock().lru.len()
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            live_blocks: inner.live,
            ..inner.stats
        }
    }

    /// Obtain exclusive use of a block, reading it from the device on a miss.
    ///
    /// The caller holds the block's bucket lock until the returned [`Buf`] is
    /// released, written or dropped. Any other acquire that hashes to the same
    /// bucket waits until then.
    pub fn acquire<'a, C: ContextSwitch>(
        &'a self,
        kernel: &'a Kernel<C>,
        disk: &Arc<Disk>,
        block: u32,
    ) -> Result<Buf<'a, C>, KernelError> {
        let count = disk.block_count();
        if block >= count {
            return Err(KernelError::InvalidBlock { block, count });
        }

        let key = BlockKey {
            disk: disk.id(),
            block,
        };
        let bucket = &self.buckets[self.bucket_index(key)];
        bucket.lock.p(kernel);

        {
            let mut inner = self.inner.lock();
            if let Some(&id) = inner.index.get(&key) {
                inner.lru.remove(id);
                let Some(held) = inner.slots[id.0].take() else {
                    drop(inner);
                    warn!("{} block {} indexed but already held", key.disk, block);
                    bucket.lock.v(kernel);
                    return Err(KernelError::NoBuffer);
                };
                inner.stats.hits += 1;
                trace!("Cache hit on {} block {}", key.disk, block);
                return Ok(Buf::new(self, kernel, id, held));
            }
            inner.stats.misses += 1;
        }

        let (id, mut held) = match self.obtain(kernel, disk, key) {
            Ok(found) => found,
            Err(e) => {
                bucket.lock.v(kernel);
                return Err(e);
            }
        };

        let read = transfer(kernel, disk, &self.permit, &bucket.io, Request::Read { block })
            .and_then(|completion| {
                let ok = completion.is_ok();
                match completion.data {
                    Some(data) if ok && data.len() == held.data.len() => Ok(data),
                    _ => Err(DeviceError::Failed { block }.into()),
                }
            });

        match read {
            Ok(data) => {
                held.data.copy_from_slice(&data);
                self.inner.lock().index.insert(key, id);
                debug!("Loaded {} block {}", key.disk, block);
                Ok(Buf::new(self, kernel, id, held))
            }
            Err(e) => {
                warn!("Read of {} block {} failed: {}", key.disk, block, e);
                self.inner.lock().free_slot(id);
                bucket.lock.v(kernel);
                Err(e)
            }
        }
    }

    /// Find storage for a missed block: a fresh slot while under capacity,
    /// otherwise the least recently used block that can be taken without
    /// waiting, otherwise a fresh slot if the hard limit allows. Dirty victims
    /// are written back first.
    fn obtain<C: ContextSwitch>(
        &self,
        kernel: &Kernel<C>,
        disk: &Arc<Disk>,
        key: BlockKey,
    ) -> Result<(BufId, BufferBlock), KernelError> {
        let own = self.bucket_index(key);
        let mut skipped = Vec::new();

        loop {
            let (id, mut victim, bucket) = {
                let mut inner = self.inner.lock();
                let reclaimed = if inner.live >= self.capacity() {
                    self.pick_victim(&mut inner, own, &skipped)
                } else {
                    None
                };

                match reclaimed {
                    Some(found) => found,
                    None if self.under_limit(inner.live) => {
                        let id = inner.allocate_slot();
                        return Ok((id, BufferBlock::new(disk, key)));
                    }
                    None => return Err(KernelError::NoBuffer),
                }
            };

            if victim.state == BlockState::Dirty {
                if let Err(e) = self.write_back(kernel, &mut victim) {
                    warn!(
                        "Write-back of {} block {} failed, keeping it: {}",
                        victim.key.disk, victim.key.block, e
                    );
                    {
                        let mut inner = self.inner.lock();
                        inner.slots[id.0] = Some(victim);
                        inner.lru.push_front(id);
                    }
                    if bucket != own {
                        self.buckets[bucket].lock.v(kernel);
                    }
                    skipped.push(id);
                    continue;
                }
            }

            {
                let mut inner = self.inner.lock();
                inner.index.remove(&victim.key);
                inner.stats.evictions += 1;
            }
            debug!(
                "Evicted {} block {} for {} block {}",
                victim.key.disk, victim.key.block, key.disk, key.block
            );
            if bucket != own {
                self.buckets[bucket].lock.v(kernel);
            }

            victim.rebind(disk, key);
            return Ok((id, victim));
        }
    }

    /// Oldest idle block whose bucket is the caller's own or is free right
    /// now. A foreign bucket taken here stays locked until the eviction ends.
    fn pick_victim(
        &self,
        inner: &mut CacheInner,
        own: usize,
        skipped: &[BufId],
    ) -> Option<(BufId, BufferBlock, usize)> {
        let mut chosen = None;
        for id in inner.lru.iter() {
            if skipped.contains(&id) {
                continue;
            }
            let Some(block) = inner.slots[id.0].as_ref() else {
                continue;
            };
            let bucket = self.bucket_index(block.key);
            if bucket == own || self.buckets[bucket].lock.try_p() {
                chosen = Some((id, bucket));
                break;
            }
        }

        let (id, bucket) = chosen?;
        inner.lru.remove(id);
        let block = inner.slots[id.0].take()?;
        Some((id, block, bucket))
    }

    /// Write a block to its device, marking it clean on success. The caller
    /// holds the block's bucket lock.
    fn write_back<C: ContextSwitch>(
        &self,
        kernel: &Kernel<C>,
        block: &mut BufferBlock,
    ) -> Result<(), KernelError> {
        let bucket = &self.buckets[self.bucket_index(block.key)];
        let request = Request::Write {
            block: block.key.block,
            data: block.data.clone(),
        };

        let completion = transfer(kernel, &block.disk, &self.permit, &bucket.io, request)?;
        if !completion.is_ok() {
            return Err(DeviceError::Failed {
                block: block.key.block,
            }
            .into());
        }

        block.state = BlockState::Clean;
        self.inner.lock().stats.writes += 1;
        trace!("Wrote {} block {}", block.key.disk, block.key.block);
        Ok(())
    }

    fn put_back<C: ContextSwitch>(&self, kernel: &Kernel<C>, id: BufId, block: BufferBlock) {
        let bucket = self.bucket_index(block.key);
        {
            let mut inner = self.inner.lock();
            inner.slots[id.0] = Some(block);
            inner.lru.push_back(id);
        }
        self.buckets[bucket].lock.v(kernel);
    }

    /// Copy a block's contents into `out`, which must be exactly one block.
    pub fn pull<C: ContextSwitch>(
        &self,
        kernel: &Kernel<C>,
        disk: &Arc<Disk>,
        block: u32,
        out: &mut [u8],
    ) -> Result<(), KernelError> {
        check_len(disk, out.len())?;
        let buf = self.acquire(kernel, disk, block)?;
        out.copy_from_slice(buf.data());
        buf.release();
        Ok(())
    }

    /// Replace a block's contents and write it through to the device.
    pub fn push<C: ContextSwitch>(
        &self,
        kernel: &Kernel<C>,
        disk: &Arc<Disk>,
        block: u32,
        data: &[u8],
    ) -> Result<(), KernelError> {
        check_len(disk, data.len())?;
        let mut buf = self.acquire(kernel, disk, block)?;
        buf.data_mut().copy_from_slice(data);
        buf.write_through()
    }

    /// Replace a block's contents, deferring the device write to eviction or
    /// flush.
    pub fn push_deferred<C: ContextSwitch>(
        &self,
        kernel: &Kernel<C>,
        disk: &Arc<Disk>,
        block: u32,
        data: &[u8],
    ) -> Result<(), KernelError> {
        check_len(disk, data.len())?;
        let mut buf = self.acquire(kernel, disk, block)?;
        buf.data_mut().copy_from_slice(data);
        buf.write_deferred();
        Ok(())
    }

    /// Write back every idle dirty block of `disk`. Blocks held by a thread
    /// when the scan runs are left to their holder. Returns the number of
    /// blocks written.
    pub fn flush<C: ContextSwitch>(
        &self,
        kernel: &Kernel<C>,
        disk: &Arc<Disk>,
    ) -> Result<usize, KernelError> {
        let mut dirty: Vec<u32> = {
            let inner = self.inner.lock();
            inner
                .index
                .iter()
                .filter(|(key, id)| {
                    key.disk == disk.id()
                        && inner.slots[id.0]
                            .as_ref()
                            .is_some_and(|b| b.state == BlockState::Dirty)
                })
                .map(|(key, _)| key.block)
                .collect()
        };
        dirty.sort_unstable();

        let mut written = 0;
        for block in dirty {
            let buf = self.acquire(kernel, disk, block)?;
            if buf.is_dirty() {
                buf.write_through()?;
                written += 1;
            }
        }

        if written > 0 {
            debug!("Flushed {} block(s) of {}", written, disk.id());
        }
        Ok(written)
    }
}

fn check_len(disk: &Disk, len: usize) -> Result<(), KernelError> {
    if len != disk.block_size() {
        return Err(DeviceError::BufferSize {
            expected: disk.block_size(),
            actual: len,
        }
        .into());
    }
    Ok(())
}

/// Exclusive handle on a cached block. Dropping it releases the block.
pub struct Buf<'a, C: ContextSwitch = Handoff> {
    cache: &'a BufferCache,
    kernel: &'a Kernel<C>,
    id: BufId,
    block: Option<BufferBlock>,
}

impl<'a, C: ContextSwitch> Buf<'a, C> {
    fn new(cache: &'a BufferCache, kernel: &'a Kernel<C>, id: BufId, block: BufferBlock) -> Self {
        Self {
            cache,
            kernel,
            id,
            block: Some(block),
        }
    }

    fn held(&self) -> &BufferBlock {
        // Only taken by the consuming methods and `drop`.
        self.block.as_ref().expect("buffer used after release")
    }

    fn held_mut(&mut self) -> &mut BufferBlock {
        self.block.as_mut().expect("buffer used after release")
    }

    pub fn block(&self) -> u32 {
        self.held().key.block
    }

    pub fn disk(&self) -> &Arc<Disk> {
        &self.held().disk
    }

    pub fn state(&self) -> BlockState {
        self.held().state
    }

    pub fn is_dirty(&self) -> bool {
        self.state() == BlockState::Dirty
    }

    pub fn data(&self) -> &[u8] {
        &self.held().data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.held_mut().data
    }

    /// Give the block back unchanged.
    pub fn release(self) {}

    /// Write the block to its device now, then release it. On failure the
    /// block stays cached and dirty.
    pub fn write_through(mut self) -> Result<(), KernelError> {
        let cache = self.cache;
        let kernel = self.kernel;
        let block = self.held_mut();
        block.state = BlockState::Dirty;
        cache.write_back(kernel, block)
    }

    /// Mark the block dirty and release it. The device write happens when the
    /// block is evicted or flushed.
    pub fn write_deferred(mut self) {
        self.held_mut().state = BlockState::Dirty;
    }

    pub fn write_scheduled(self) {
        self.write_deferred();
    }
}

impl<C: ContextSwitch> Drop for Buf<'_, C> {
    fn drop(&mut self) {
        if let Some(block) = self.block.take() {
            self.cache.put_back(self.kernel, self.id, block);
        }
    }
}
