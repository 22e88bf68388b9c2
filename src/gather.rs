//! The block gatherer: walk a file's dirty list, feed matching blocks to
//! the builder, and when the segment fills, seal it and carry on in the
//! next one. This is a loop, since one file's dirty list can span many
//! segments.

use alloc::sync::Arc;

use crate::block::{BlockBuf, BlockFlags};
use crate::common::{LfsError, LfsResult};
use crate::device::BlockDevice;
use crate::engine::Engine;
use crate::file::{FileFlags, FileMeta};
use crate::lock::SegToken;
use crate::segment::Offer;

/// Which blocks a gather pass collects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatherClass {
    /// Ordinary data blocks.
    Data,
    /// Single/double/triple indirect blocks.
    Indirect,
    /// Cleaner-supplied blocks carrying relocated live data.
    Fake,
}

fn matches(class: GatherClass, blk: &Arc<BlockBuf>) -> bool {
    let fake = blk.flags().contains(BlockFlags::FAKE);
    match class {
        GatherClass::Data => blk.id().is_data() && !fake,
        GatherClass::Indirect => blk.id().is_indirect(),
        GatherClass::Fake => blk.id().is_data() && fake,
    }
}

impl<D: BlockDevice> Engine<D> {
    /// Offer every dirty block of `file` matching `class` to the builder.
    /// Requires an open descriptor for the file. Returns how many blocks
    /// were newly offered; already-offered blocks are skipped, so a repeat
    /// gather with no new dirty blocks offers nothing.
    pub(crate) fn gather(
        &self,
        tok: &SegToken<'_>,
        file: &Arc<FileMeta>,
        class: GatherClass,
    ) -> LfsResult<usize> {
        if file.flags().contains(FileFlags::TRUNCATING) {
            self.with_builder(tok, |ps| ps.mark_unclean())?;
        }
        let mut count = 0;
        for blk in self.cache.dirty_blocks(file.id()) {
            let flags = blk.flags();
            if !flags.contains(BlockFlags::DIRTY)
                || flags.contains(BlockFlags::OFFERED)
                || !matches(class, &blk)
            {
                continue;
            }
            let mut fresh = false;
            loop {
                let offer = self.with_builder(tok, |ps| ps.offer(&self.geom, &blk))?;
                match offer {
                    Offer::Accepted { .. } => {
                        count += 1;
                        break;
                    }
                    Offer::Full if fresh => {
                        // A block that cannot fit an empty segment will
                        // never fit; surface it instead of spinning.
                        return Err(LfsError::NoSpace);
                    }
                    Offer::Full => {
                        self.flush_pointers(tok)?;
                        self.write_segment(tok)?;
                        let reopened = self
                            .with_builder(tok, |ps| ps.acquire_file(file.id(), file.version()))?;
                        if !reopened {
                            return Err(LfsError::NoSpace);
                        }
                        fresh = true;
                    }
                }
            }
        }
        Ok(count)
    }
}
