//! Per-file metadata handles and the indirection geometry used to locate
//! the pointer that names any given block.
//!
//! The real inode encoding belongs to the surrounding filesystem; what the
//! engine keeps here is exactly the state the segment pipeline needs:
//! typed pointer roots, the fragment-size table, the written-block
//! watermark and the flush-related flags.

use alloc::sync::Arc;
use alloc::vec::Vec;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use spin::Mutex;

use crate::block::{BlockId, BlockPtr};
use crate::common::{FileId, LfsError, LfsResult, LogGeometry};

bitflags! {
    pub struct FileFlags: u32 {
        /// Metadata modified; the inode must be rewritten this pass.
        const ALLMOD        = 1 << 0;
        /// A rename/link/unlink sequence is not yet durable; descriptors
        /// for this file are kept even when empty so roll-forward can
        /// order the sequence.
        const DIROP         = 1 << 1;
        const DIRTY_DATA    = 1 << 2;
        const DIRTY_CLEANER = 1 << 3;
        /// A truncation is racing the flush; gathered state is not clean.
        const TRUNCATING    = 1 << 4;
    }
}

/// The persisted inode image the engine writes into segments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InodeRec {
    pub file: FileId,
    pub version: u32,
    pub size: u64,
    /// Native blocks held, maintained as holes fill.
    pub nblocks: u64,
    pub daddr: Vec<BlockPtr>,
    pub iaddr: [BlockPtr; 3],
    /// Byte lengths of blocks shorter than a full block.
    pub frags: Vec<(u64, u32)>,
}

impl InodeRec {
    fn new(file: FileId, ndaddr: usize) -> Self {
        Self {
            file,
            version: 1,
            size: 0,
            nblocks: 0,
            daddr: alloc::vec![BlockPtr::Unallocated; ndaddr],
            iaddr: [BlockPtr::Unallocated; 3],
            frags: Vec::new(),
        }
    }
}

pub struct FileState {
    pub flags: FileFlags,
    pub inode: InodeRec,
    /// Highest data block actually written. Declared size is clamped down
    /// to this at inode-commit time, never up.
    pub hiblk: Option<u64>,
}

pub struct FileMeta {
    id: FileId,
    state: Mutex<FileState>,
}

impl FileMeta {
    pub fn new(id: FileId, geom: &LogGeometry) -> Arc<Self> {
        Arc::new(Self {
            id,
            state: Mutex::new(FileState {
                flags: FileFlags::empty(),
                inode: InodeRec::new(id, geom.ndaddr),
                hiblk: None,
            }),
        })
    }

    pub fn id(&self) -> FileId {
        self.id
    }

    pub fn with<R>(&self, f: impl FnOnce(&FileState) -> R) -> R {
        f(&self.state.lock())
    }

    pub fn with_mut<R>(&self, f: impl FnOnce(&mut FileState) -> R) -> R {
        f(&mut self.state.lock())
    }

    pub fn flags(&self) -> FileFlags {
        self.state.lock().flags
    }

    pub fn set_flags(&self, set: FileFlags) {
        self.state.lock().flags.insert(set);
    }

    pub fn clear_flags(&self, clear: FileFlags) {
        self.state.lock().flags.remove(clear);
    }

    pub fn version(&self) -> u32 {
        self.state.lock().inode.version
    }

    pub fn set_size(&self, size: u64) {
        let mut st = self.state.lock();
        st.inode.size = size;
        st.flags.insert(FileFlags::ALLMOD);
    }

    /// On-log byte length of a data block, from the fragment table; full
    /// block when untracked.
    pub fn frag_len(&self, lbn: u64, geom: &LogGeometry) -> u32 {
        let st = self.state.lock();
        st.inode
            .frags
            .iter()
            .find(|(l, _)| *l == lbn)
            .map(|(_, len)| *len)
            .unwrap_or(geom.block_size)
    }

    /// Track the byte length a data block was written with. Fragments can
    /// shrink or grow between flushes.
    pub fn set_frag_len(&self, lbn: u64, len: u32, geom: &LogGeometry) {
        let mut st = self.state.lock();
        st.inode.frags.retain(|(l, _)| *l != lbn);
        if len < geom.block_size {
            st.inode.frags.push((lbn, len));
        }
    }

    pub fn note_written(&self, lbn: u64) {
        let mut st = self.state.lock();
        st.hiblk = Some(st.hiblk.map_or(lbn, |h| h.max(lbn)));
    }

    pub(crate) fn root_ptr(&self, root: PtrRoot) -> BlockPtr {
        let st = self.state.lock();
        match root {
            PtrRoot::Direct(i) => st.inode.daddr[i],
            PtrRoot::IndirectRoot(level) => st.inode.iaddr[level as usize - 1],
        }
    }

    pub(crate) fn set_root_ptr(&self, root: PtrRoot, ptr: BlockPtr) {
        let mut st = self.state.lock();
        match root {
            PtrRoot::Direct(i) => st.inode.daddr[i] = ptr,
            PtrRoot::IndirectRoot(level) => st.inode.iaddr[level as usize - 1] = ptr,
        }
        st.flags.insert(FileFlags::ALLMOD);
    }
}

/// Where a block's naming pointer lives: directly in the inode, or at the
/// end of a chain of indirect blocks rooted in the inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtrRoot {
    Direct(usize),
    IndirectRoot(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtrStep {
    /// Indirect block holding the pointer.
    pub block: BlockId,
    pub index: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtrPath {
    pub root: PtrRoot,
    /// Indirect chain from the root down; empty means the pointer is the
    /// inode slot itself. The final pointer sits in the last step's block.
    pub steps: Vec<PtrStep>,
}

/// Resolve which pointer names `id`, through up to three indirection
/// levels. Indirect blocks are numbered uniquely per level: block 0 of each
/// level hangs off the inode, the rest hang off the level above.
pub fn pointer_path(geom: &LogGeometry, id: BlockId) -> LfsResult<PtrPath> {
    let ni = geom.nindir();
    match id {
        BlockId::Data(lbn) => {
            if (lbn as usize) < geom.ndaddr {
                return Ok(PtrPath {
                    root: PtrRoot::Direct(lbn as usize),
                    steps: Vec::new(),
                });
            }
            let r = lbn - geom.ndaddr as u64;
            if r < ni {
                Ok(PtrPath {
                    root: PtrRoot::IndirectRoot(1),
                    steps: alloc::vec![PtrStep {
                        block: BlockId::Indirect { level: 1, index: 0 },
                        index: r as usize,
                    }],
                })
            } else if r < ni + ni * ni {
                let r2 = r - ni;
                Ok(PtrPath {
                    root: PtrRoot::IndirectRoot(2),
                    steps: alloc::vec![
                        PtrStep {
                            block: BlockId::Indirect { level: 2, index: 0 },
                            index: (r2 / ni) as usize,
                        },
                        PtrStep {
                            block: BlockId::Indirect {
                                level: 1,
                                index: 1 + r2 / ni,
                            },
                            index: (r2 % ni) as usize,
                        },
                    ],
                })
            } else if r < ni + ni * ni + ni * ni * ni {
                let r3 = r - ni - ni * ni;
                Ok(PtrPath {
                    root: PtrRoot::IndirectRoot(3),
                    steps: alloc::vec![
                        PtrStep {
                            block: BlockId::Indirect { level: 3, index: 0 },
                            index: (r3 / (ni * ni)) as usize,
                        },
                        PtrStep {
                            block: BlockId::Indirect {
                                level: 2,
                                index: 1 + r3 / (ni * ni),
                            },
                            index: ((r3 / ni) % ni) as usize,
                        },
                        PtrStep {
                            block: BlockId::Indirect {
                                level: 1,
                                index: 1 + ni + r3 / ni,
                            },
                            index: (r3 % ni) as usize,
                        },
                    ],
                })
            } else {
                Err(LfsError::Invalid)
            }
        }
        BlockId::Indirect { level: 1, index: j } => {
            if j == 0 {
                Ok(PtrPath {
                    root: PtrRoot::IndirectRoot(1),
                    steps: Vec::new(),
                })
            } else if j < 1 + ni {
                Ok(PtrPath {
                    root: PtrRoot::IndirectRoot(2),
                    steps: alloc::vec![PtrStep {
                        block: BlockId::Indirect { level: 2, index: 0 },
                        index: (j - 1) as usize,
                    }],
                })
            } else if j < 1 + ni + ni * ni {
                let j2 = j - 1 - ni;
                Ok(PtrPath {
                    root: PtrRoot::IndirectRoot(3),
                    steps: alloc::vec![
                        PtrStep {
                            block: BlockId::Indirect { level: 3, index: 0 },
                            index: (j2 / ni) as usize,
                        },
                        PtrStep {
                            block: BlockId::Indirect {
                                level: 2,
                                index: 1 + j2 / ni,
                            },
                            index: (j2 % ni) as usize,
                        },
                    ],
                })
            } else {
                Err(LfsError::Invalid)
            }
        }
        BlockId::Indirect { level: 2, index: k } => {
            if k == 0 {
                Ok(PtrPath {
                    root: PtrRoot::IndirectRoot(2),
                    steps: Vec::new(),
                })
            } else if k < 1 + ni {
                Ok(PtrPath {
                    root: PtrRoot::IndirectRoot(3),
                    steps: alloc::vec![PtrStep {
                        block: BlockId::Indirect { level: 3, index: 0 },
                        index: (k - 1) as usize,
                    }],
                })
            } else {
                Err(LfsError::Invalid)
            }
        }
        BlockId::Indirect { level: 3, index: 0 } => Ok(PtrPath {
            root: PtrRoot::IndirectRoot(3),
            steps: Vec::new(),
        }),
        _ => Err(LfsError::Invalid),
    }
}
