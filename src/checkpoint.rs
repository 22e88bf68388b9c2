//! The checkpoint orchestrator: top-level entry points that decide between
//! an ordinary partial-segment flush and a full checkpoint, drive the
//! per-file passes, run the inode-map fixed point and finish with the
//! superblock when the checkpoint advanced.

use alloc::sync::Arc;
use alloc::vec::Vec;

use bitflags::bitflags;
use log::{debug, warn};

use crate::block::BlockFlags;
use crate::common::{FileId, LfsError, LfsResult, IFILE_ID};
use crate::device::BlockDevice;
use crate::engine::Engine;
use crate::file::{FileFlags, FileMeta};
use crate::gather::GatherClass;
use crate::lock::SegToken;

bitflags! {
    pub struct CkpFlags: u32 {
        /// Checkpoint unconditionally.
        const FORCE   = 1 << 0;
        /// Wait for all submitted I/O before returning.
        const SYNC    = 1 << 1;
        /// Pass initiated by the cleaner; gathers its fake blocks too.
        const RECLAIM = 1 << 2;
    }
}

impl<D: BlockDevice> Engine<D> {
    /// Flush dirty state; whether this becomes a full checkpoint depends on
    /// the flags and on how much of the log is tied up.
    pub fn request_checkpoint(&self, flags: CkpFlags) -> LfsResult<()> {
        let owner = self.begin_op();
        let tok = self.lock_segments(owner);
        self.segwrite(&tok, flags)
    }

    /// Fully evict one file: everything dirty gathered and sealed, inode
    /// committed, and the write drained before returning.
    pub fn flush_file(&self, id: FileId) -> LfsResult<()> {
        let f = self.file(id)?;
        let owner = self.begin_op();
        let tok = self.lock_segments(owner);

        // Low-space admission: under the low-water mark an ordinary flush
        // is not admitted; it becomes a checkpoint, which frees ACTIVE
        // segments, and the cleaner is woken.
        let clean = self.usage.lock().clean_count();
        if clean <= self.geom.low_water {
            self.wake_cleaner();
        }
        if clean == 0 || clean < self.geom.low_water {
            return self.segwrite(&tok, CkpFlags::FORCE | CkpFlags::SYNC);
        }

        self.ensure_builder(&tok)?;
        self.write_file(&tok, &f, false)?;
        self.write_segment(&tok)?;
        drop(tok);
        self.io.wait_drained();
        Ok(())
    }

    fn segwrite(&self, tok: &SegToken<'_>, flags: CkpFlags) -> LfsResult<()> {
        let (clean, active) = {
            let usage = self.usage.lock();
            (usage.clean_count(), usage.active_count())
        };
        let ckp = flags.contains(CkpFlags::FORCE)
            || active > self.geom.active_limit
            || clean <= self.geom.low_water;
        if clean <= self.geom.low_water {
            self.wake_cleaner();
        }
        debug!(
            "segwrite: checkpoint={} clean={} active={}",
            ckp, clean, active
        );

        self.ensure_builder(tok)?;

        // Regular-file pass: everything dirty or with a pending directory
        // operation, the inode-map file excluded until last.
        let mut worklist: Vec<FileId> = self.cache.files_with_dirty();
        {
            let files = self.files.lock();
            for (id, f) in files.iter() {
                if f.flags().intersects(FileFlags::ALLMOD | FileFlags::DIROP)
                    && !worklist.contains(id)
                {
                    worklist.push(*id);
                }
            }
        }
        worklist.sort_unstable();
        worklist.dedup();

        let mut advanced = false;
        for id in worklist {
            if id == IFILE_ID {
                continue;
            }
            let f = match self.file(id) {
                Ok(f) => f,
                Err(_) => {
                    warn!("dirty blocks for unregistered file {}", id);
                    continue;
                }
            };
            advanced = true;
            self.write_file(tok, &f, flags.contains(CkpFlags::RECLAIM))?;
        }

        if ckp && advanced {
            self.flush_self_describing(tok)?;
        }
        self.write_segment(tok)?;

        // Everything written during this pass stops being ACTIVE except the
        // segment still being filled.
        {
            let slot = self.builder.lock();
            self.usage.lock().clear_active_except(slot.curseg);
        }

        if ckp && advanced {
            self.write_superblock()?;
        } else if ckp {
            debug!("checkpoint did not advance; superblock untouched");
        }
        if flags.contains(CkpFlags::SYNC) {
            self.io.wait_drained();
        }
        Ok(())
    }

    /// One file through the pipeline: open its descriptor, gather, settle
    /// pointers, and commit its metadata.
    fn write_file(&self, tok: &SegToken<'_>, f: &Arc<FileMeta>, reclaim: bool) -> LfsResult<()> {
        let mut tries = 0;
        while !self.with_builder(tok, |ps| ps.acquire_file(f.id(), f.version()))? {
            tries += 1;
            if tries > 2 {
                return Err(LfsError::NoSpace);
            }
            self.write_segment(tok)?;
        }

        self.gather(tok, f, GatherClass::Data)?;
        if reclaim {
            self.gather(tok, f, GatherClass::Fake)?;
        }
        self.gather(tok, f, GatherClass::Indirect)?;

        // Pointer updates must land before the inode image is cut.
        self.flush_pointers(tok)?;

        let dirop = f.flags().contains(FileFlags::DIROP);
        self.with_builder(tok, |ps| ps.release_file(dirop))?;
        if dirop {
            f.clear_flags(FileFlags::DIROP);
        }

        if f.flags().contains(FileFlags::ALLMOD) || dirop {
            self.write_inode(tok, f)?;
        }
        Ok(())
    }

    /// Flush the file that describes its own flush. The inode-map file's
    /// blocks carry the usage table and inode map, which mutate as the file
    /// itself is written, so it is written twice back to back; a boundary
    /// crossing or unclean gather forces another round, and a final smaller
    /// pass runs only while indirect blocks are still dirty. The iteration
    /// bound is asserted: the file touches at most two summary blocks per
    /// pass, so failure to converge is a bug.
    fn flush_self_describing(&self, tok: &SegToken<'_>) -> LfsResult<()> {
        let ifile = self.file(IFILE_ID)?;
        let mut passes = 0u32;
        loop {
            passes += 1;
            assert!(
                passes <= self.geom.imap_flush_bound,
                "inode-map flush did not converge in {} passes",
                passes
            );
            self.regen_ifile(&ifile)?;
            self.write_file(tok, &ifile, false)?;
            let w = self.write_segment(tok)?;
            if passes == 1 {
                // The table just written went stale the moment its own
                // write was charged; always go around once more.
                continue;
            }
            if w.crossed || w.redo {
                continue;
            }
            break;
        }

        let still_dirty = self
            .cache
            .dirty_blocks(IFILE_ID)
            .iter()
            .any(|b| b.id().is_indirect() && b.flags().contains(BlockFlags::DIRTY));
        if still_dirty {
            let mut tries = 0;
            while !self.with_builder(tok, |ps| ps.acquire_file(IFILE_ID, ifile.version()))? {
                tries += 1;
                if tries > 2 {
                    return Err(LfsError::NoSpace);
                }
                self.write_segment(tok)?;
            }
            self.gather(tok, &ifile, GatherClass::Indirect)?;
            self.flush_pointers(tok)?;
            self.with_builder(tok, |ps| ps.release_file(false))?;
            self.write_inode(tok, &ifile)?;
            self.write_segment(tok)?;
        }
        Ok(())
    }

    /// Regenerate the inode-map file's dirty image from the live tables.
    fn regen_ifile(&self, ifile: &Arc<FileMeta>) -> LfsResult<()> {
        let blocks = {
            let usage = self.usage.lock();
            let imap = self.imap.lock();
            imap.encode(&usage.snapshot(), self.geom.block_size as usize)?
        };
        let nblocks = blocks.len() as u64;
        for (i, data) in blocks.into_iter().enumerate() {
            self.cache.push_dirty(IFILE_ID, crate::block::BlockId::Data(i as u64), data);
        }
        ifile.set_size(nblocks * self.geom.block_size as u64);
        Ok(())
    }
}
