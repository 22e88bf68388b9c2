//! In-memory test doubles for the device and the block cache.

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use spin::Mutex;

use crate::block::{note_clean, note_dirty, BlockBuf, BlockCache, BlockFlags, BlockId, BlockPtr};
use crate::common::{FileId, LfsError, LfsResult};
use crate::device::{BlockDevice, IoCompletion};
use crate::engine::CleanerSignal;

/// Sparse in-memory device with a write journal, deferrable completions
/// and write fault injection.
pub struct MemDevice {
    data: Mutex<Vec<u8>>,
    writes: Mutex<Vec<(u64, usize)>>,
    pending: Mutex<Vec<(u64, Vec<u8>, IoCompletion)>>,
    defer_completions: AtomicBool,
    fail_writes: AtomicBool,
    size: u64,
}

impl MemDevice {
    pub fn new(size: u64) -> Arc<Self> {
        Arc::new(Self {
            data: Mutex::new(Vec::new()),
            writes: Mutex::new(Vec::new()),
            pending: Mutex::new(Vec::new()),
            defer_completions: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            size,
        })
    }

    pub fn set_defer(&self, on: bool) {
        self.defer_completions.store(on, Ordering::Release);
    }

    pub fn set_fail(&self, on: bool) {
        self.fail_writes.store(on, Ordering::Release);
    }

    /// Settle every deferred write in submission order.
    pub fn complete_pending(&self) {
        let pending: Vec<_> = core::mem::take(&mut *self.pending.lock());
        for (pos, data, done) in pending {
            if self.fail_writes.load(Ordering::Acquire) {
                done(Err(LfsError::Io));
            } else {
                self.apply(pos, &data);
                done(Ok(()));
            }
        }
    }

    pub fn write_count(&self) -> usize {
        self.writes.lock().len()
    }

    pub fn writes_at(&self, pos: u64) -> usize {
        self.writes.lock().iter().filter(|(p, _)| *p == pos).count()
    }

    pub fn read(&self, pos: u64, len: usize) -> Vec<u8> {
        let mut buf = alloc::vec![0u8; len];
        let data = self.data.lock();
        if (pos as usize) < data.len() {
            let end = data.len().min(pos as usize + len);
            let n = end - pos as usize;
            buf[..n].copy_from_slice(&data[pos as usize..end]);
        }
        buf
    }

    pub fn corrupt(&self, pos: u64) {
        let mut data = self.data.lock();
        if (pos as usize) < data.len() {
            data[pos as usize] ^= 0xff;
        }
    }

    fn apply(&self, pos: u64, bytes: &[u8]) {
        let mut data = self.data.lock();
        let end = pos as usize + bytes.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[pos as usize..end].copy_from_slice(bytes);
        self.writes.lock().push((pos, bytes.len()));
    }
}

impl BlockDevice for MemDevice {
    fn read_at(&self, pos: u64, buf: &mut [u8]) -> LfsResult<usize> {
        if pos + buf.len() as u64 > self.size {
            return Err(LfsError::Io);
        }
        let copy = self.read(pos, buf.len());
        buf.copy_from_slice(&copy);
        Ok(buf.len())
    }

    fn write_async(&self, pos: u64, data: Vec<u8>, done: IoCompletion) {
        if self.defer_completions.load(Ordering::Acquire) {
            self.pending.lock().push((pos, data, done));
            return;
        }
        if self.fail_writes.load(Ordering::Acquire) {
            done(Err(LfsError::Io));
            return;
        }
        self.apply(pos, &data);
        done(Ok(()));
    }

    fn size(&self) -> u64 {
        self.size
    }
}

/// Minimal block cache: a map of handles plus dirty bookkeeping, backed by
/// a [`MemDevice`] for metadata fetches.
pub struct MemCache {
    block_size: u32,
    blocks: Mutex<BTreeMap<(FileId, BlockId), Arc<BlockBuf>>>,
    device: Mutex<Option<Arc<MemDevice>>>,
}

impl MemCache {
    pub fn new(block_size: u32) -> Arc<Self> {
        Arc::new(Self {
            block_size,
            blocks: Mutex::new(BTreeMap::new()),
            device: Mutex::new(None),
        })
    }

    pub fn attach_device(&self, device: Arc<MemDevice>) {
        *self.device.lock() = Some(device);
    }

    /// Test entry point standing in for the write path: install `data` as
    /// a dirty data block of `file`.
    pub fn write_data(&self, file: FileId, lbn: u64, data: Vec<u8>) -> Arc<BlockBuf> {
        self.push_dirty(file, BlockId::Data(lbn), data)
    }

    pub fn block(&self, file: FileId, id: BlockId) -> Option<Arc<BlockBuf>> {
        self.blocks.lock().get(&(file, id)).cloned()
    }
}

impl BlockCache for MemCache {
    fn dirty_blocks(&self, file: FileId) -> Vec<Arc<BlockBuf>> {
        self.blocks
            .lock()
            .range((file, BlockId::Data(0))..=(file, BlockId::Inode(u64::MAX)))
            .map(|(_, b)| b.clone())
            .filter(|b| b.flags().contains(BlockFlags::DIRTY))
            .collect()
    }

    fn lookup(&self, file: FileId, id: BlockId) -> Option<Arc<BlockBuf>> {
        self.block(file, id)
    }

    fn fetch(&self, file: FileId, id: BlockId, from: BlockPtr) -> LfsResult<Arc<BlockBuf>> {
        if let Some(blk) = self.block(file, id) {
            return Ok(blk);
        }
        let blk = match from {
            BlockPtr::Addr(a) => {
                let dev = self.device.lock().clone().ok_or(LfsError::Io)?;
                let mut buf = alloc::vec![0u8; self.block_size as usize];
                dev.read_at(a, &mut buf)?;
                let blk = BlockBuf::new(file, id, buf);
                note_clean(&blk);
                blk
            }
            // Reserved but never materialized: a zeroed block that still
            // needs writing.
            BlockPtr::Unallocated | BlockPtr::Unwritten => {
                BlockBuf::new(file, id, alloc::vec![0u8; self.block_size as usize])
            }
        };
        self.blocks.lock().insert((file, id), blk.clone());
        Ok(blk)
    }

    fn push_dirty(&self, file: FileId, id: BlockId, data: Vec<u8>) -> Arc<BlockBuf> {
        let mut blocks = self.blocks.lock();
        if let Some(existing) = blocks.get(&(file, id)) {
            let existing = existing.clone();
            drop(blocks);
            existing.modify(|d| *d = data);
            existing
        } else {
            let blk = BlockBuf::new(file, id, data);
            blocks.insert((file, id), blk.clone());
            blk
        }
    }

    fn mark_clean(&self, blk: &Arc<BlockBuf>) {
        note_clean(blk);
    }

    fn mark_dirty(&self, blk: &Arc<BlockBuf>) {
        note_dirty(blk);
    }

    fn files_with_dirty(&self) -> Vec<FileId> {
        let mut files = BTreeSet::new();
        for ((file, _), blk) in self.blocks.lock().iter() {
            if blk.flags().contains(BlockFlags::DIRTY) {
                files.insert(*file);
            }
        }
        files.into_iter().collect()
    }
}

/// Counting cleaner hook.
pub struct CleanerProbe {
    pub wakes: AtomicUsize,
}

impl CleanerProbe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            wakes: AtomicUsize::new(0),
        })
    }
}

impl CleanerSignal for CleanerProbe {
    fn wake(&self) {
        self.wakes.fetch_add(1, Ordering::AcqRel);
    }
}
