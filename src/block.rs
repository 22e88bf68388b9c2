//! Block handles shared between the engine and the block cache, plus the
//! pointer accessor that hides the on-block pointer encoding.

use alloc::sync::Arc;
use alloc::vec::Vec;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use spin::Mutex;

use crate::common::{FileId, LfsResult};

bitflags! {
    pub struct BlockFlags: u32 {
        const DIRTY   = 1 << 0;
        /// Included in a sealed segment; mutation blocks until completion.
        const BUSY    = 1 << 1;
        /// Already appended to the active partial segment.
        const OFFERED = 1 << 2;
        /// Dirtied while BUSY; honored when the write completes.
        const REDIRTY = 1 << 3;
        const ERROR   = 1 << 4;
        /// Cleaner-supplied block carrying relocated live data.
        const FAKE    = 1 << 5;
    }
}

/// Typed block identity. Indirect blocks are numbered per level instead of
/// the traditional negative logical block numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum BlockId {
    Data(u64),
    Indirect { level: u8, index: u64 },
    Inode(FileId),
}

impl BlockId {
    pub fn is_data(&self) -> bool {
        matches!(self, BlockId::Data(_))
    }

    pub fn is_indirect(&self) -> bool {
        matches!(self, BlockId::Indirect { .. })
    }

    pub fn is_inode(&self) -> bool {
        matches!(self, BlockId::Inode(_))
    }
}

/// A block pointer. The "space reserved but not yet on disk" placeholder is
/// a first-class variant; sentinel integers exist only inside the accessor
/// below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockPtr {
    Unallocated,
    Unwritten,
    Addr(u64),
}

impl BlockPtr {
    pub fn is_addr(&self) -> bool {
        matches!(self, BlockPtr::Addr(_))
    }

    pub fn addr(&self) -> Option<u64> {
        match self {
            BlockPtr::Addr(a) => Some(*a),
            _ => None,
        }
    }

    pub fn is_unwritten(&self) -> bool {
        matches!(self, BlockPtr::Unwritten)
    }
}

impl Default for BlockPtr {
    fn default() -> Self {
        BlockPtr::Unallocated
    }
}

pub struct BlockState {
    pub flags: BlockFlags,
    pub data: Vec<u8>,
}

/// One cached block. The cache owns lookup and dirty lists; flag and data
/// mutation goes through this handle so the busy window is enforced in one
/// place.
pub struct BlockBuf {
    file: FileId,
    id: BlockId,
    state: Mutex<BlockState>,
}

impl BlockBuf {
    pub fn new(file: FileId, id: BlockId, data: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            file,
            id,
            state: Mutex::new(BlockState {
                flags: BlockFlags::DIRTY,
                data,
            }),
        })
    }

    pub fn file(&self) -> FileId {
        self.file
    }

    pub fn id(&self) -> BlockId {
        self.id
    }

    pub fn len(&self) -> usize {
        self.state.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn flags(&self) -> BlockFlags {
        self.state.lock().flags
    }

    pub fn set_flags(&self, set: BlockFlags) {
        self.state.lock().flags.insert(set);
    }

    pub fn clear_flags(&self, clear: BlockFlags) {
        self.state.lock().flags.remove(clear);
    }

    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut BlockState) -> R) -> R {
        f(&mut self.state.lock())
    }

    /// Mutate the block contents, blocking while the block is busy inside a
    /// sealed segment. The block comes out dirty.
    pub fn modify<R>(&self, f: impl FnOnce(&mut Vec<u8>) -> R) -> R {
        loop {
            {
                let mut st = self.state.lock();
                if !st.flags.contains(BlockFlags::BUSY) {
                    st.flags.insert(BlockFlags::DIRTY);
                    return f(&mut st.data);
                }
            }
            core::hint::spin_loop();
        }
    }

    /// Copy of the current contents; used by cluster assembly after the
    /// block has been marked busy.
    pub fn snapshot(&self) -> Vec<u8> {
        self.state.lock().data.clone()
    }

    pub fn ptr_at(&self, index: usize) -> BlockPtr {
        get_pointer(&self.state.lock().data, index)
    }

    pub fn set_ptr_at(&self, index: usize, ptr: BlockPtr) {
        self.modify(|data| set_pointer(data, index, ptr));
    }
}

/// Record a dirtying intent on the handle. Returns false when the block is
/// busy and the intent was deferred to I/O completion.
pub fn note_dirty(blk: &BlockBuf) -> bool {
    blk.with_state(|st| {
        if st.flags.contains(BlockFlags::BUSY) {
            st.flags.insert(BlockFlags::REDIRTY);
            false
        } else {
            st.flags.insert(BlockFlags::DIRTY);
            true
        }
    })
}

pub fn note_clean(blk: &BlockBuf) {
    blk.with_state(|st| {
        st.flags
            .remove(BlockFlags::DIRTY | BlockFlags::OFFERED | BlockFlags::REDIRTY)
    });
}

/// The dirty-block source and synchronous read/write surface of the block
/// cache. The engine never touches cache internals.
pub trait BlockCache: Send + Sync {
    /// Current dirty blocks of `file`, data blocks before indirect blocks.
    fn dirty_blocks(&self, file: FileId) -> Vec<Arc<BlockBuf>>;

    fn lookup(&self, file: FileId, id: BlockId) -> Option<Arc<BlockBuf>>;

    /// Resolve a metadata block, reading it synchronously from `from` on a
    /// cache miss. A miss with no disk address materializes a zeroed block.
    fn fetch(&self, file: FileId, id: BlockId, from: BlockPtr) -> LfsResult<Arc<BlockBuf>>;

    /// Install freshly generated contents as a dirty block of `file`.
    fn push_dirty(&self, file: FileId, id: BlockId, data: Vec<u8>) -> Arc<BlockBuf>;

    fn mark_clean(&self, blk: &Arc<BlockBuf>);

    fn mark_dirty(&self, blk: &Arc<BlockBuf>);

    /// Files that currently hold at least one dirty block.
    fn files_with_dirty(&self) -> Vec<FileId>;
}

// Pointer accessor. Pointers are 8-byte little-endian words; the two
// reserved encodings never leave this module.

pub const PTR_BYTES: usize = 8;
const PTR_UNALLOCATED: u64 = 0;
const PTR_UNWRITTEN: u64 = u64::MAX;

pub fn get_pointer(data: &[u8], index: usize) -> BlockPtr {
    let off = index * PTR_BYTES;
    if off + PTR_BYTES > data.len() {
        return BlockPtr::Unallocated;
    }
    match u64::from_le_bytes(data[off..off + PTR_BYTES].try_into().unwrap()) {
        PTR_UNALLOCATED => BlockPtr::Unallocated,
        PTR_UNWRITTEN => BlockPtr::Unwritten,
        a => BlockPtr::Addr(a),
    }
}

pub fn set_pointer(data: &mut Vec<u8>, index: usize, ptr: BlockPtr) {
    let off = index * PTR_BYTES;
    if data.len() < off + PTR_BYTES {
        data.resize(off + PTR_BYTES, 0);
    }
    let word = match ptr {
        BlockPtr::Unallocated => PTR_UNALLOCATED,
        BlockPtr::Unwritten => PTR_UNWRITTEN,
        BlockPtr::Addr(a) => a,
    };
    data[off..off + PTR_BYTES].copy_from_slice(&word.to_le_bytes());
}

/// Replace leftover unwritten placeholders with unallocated pointers.
/// Applied to indirect blocks at seal time so a concurrently truncated file
/// never leaks a garbage address to disk. Returns how many were clamped.
pub fn clamp_unwritten(data: &mut [u8]) -> usize {
    let mut clamped = 0;
    let words = data.len() / PTR_BYTES;
    for i in 0..words {
        let off = i * PTR_BYTES;
        let word = u64::from_le_bytes(data[off..off + PTR_BYTES].try_into().unwrap());
        if word == PTR_UNWRITTEN {
            data[off..off + PTR_BYTES].copy_from_slice(&PTR_UNALLOCATED.to_le_bytes());
            clamped += 1;
        }
    }
    clamped
}
