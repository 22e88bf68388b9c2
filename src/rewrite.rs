//! Pointer rewriting: after a block is assigned its place in the partial
//! segment, the on-disk pointer that named its old location is walked down
//! the indirect chain and overwritten, and the old segment gives the bytes
//! back.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::block::{BlockBuf, BlockId, BlockPtr};
use crate::common::{frame_into_block, FileId, LfsResult};
use crate::device::BlockDevice;
use crate::engine::Engine;
use crate::file::{pointer_path, FileFlags, FileMeta};
use crate::lock::SegToken;
use crate::segment::Offer;

impl<D: BlockDevice> Engine<D> {
    /// Apply pointer updates for every block the builder accepted since the
    /// last flush. Runs before sealing and whenever the gatherer fills a
    /// segment mid-file.
    pub(crate) fn flush_pointers(&self, tok: &SegToken<'_>) -> LfsResult<()> {
        let pending: Vec<(FileId, BlockId, u64, u32)> = {
            let mut slot = self.builder.lock();
            let ps = match slot.cur.as_mut() {
                Some(ps) => ps,
                None => return Ok(()),
            };
            let list: Vec<_> = ps
                .unrelocated()
                .iter()
                .map(|sb| (sb.buf.file(), sb.buf.id(), sb.addr, sb.len))
                .collect();
            ps.mark_relocated(list.len());
            list
        };
        for (file, id, addr, len) in pending {
            if id.is_inode() {
                continue;
            }
            let f = self.file(file)?;
            self.relocate(tok, &f, id, addr, len)?;
        }
        Ok(())
    }

    /// Point `id` at `new_addr`, releasing whatever it pointed at before.
    ///
    /// A previous unwritten placeholder means a hole is being materialized:
    /// the file's block count grows and nothing is released. An old address
    /// inside the segment currently being built means the file was written
    /// twice in one pass; the duplicate counter absorbs it instead of the
    /// accountant asserting.
    pub(crate) fn relocate(
        &self,
        _tok: &SegToken<'_>,
        file: &Arc<FileMeta>,
        id: BlockId,
        new_addr: u64,
        len: u32,
    ) -> LfsResult<()> {
        let path = pointer_path(&self.geom, id)?;

        let old = if path.steps.is_empty() {
            let old = file.root_ptr(path.root);
            file.set_root_ptr(path.root, BlockPtr::Addr(new_addr));
            old
        } else {
            let mut parent = file.root_ptr(path.root);
            let last = path.steps.len() - 1;
            let mut old = BlockPtr::Unallocated;
            for (i, step) in path.steps.iter().enumerate() {
                let blk = self.cache.fetch(file.id(), step.block, parent)?;
                if i == last {
                    old = blk.ptr_at(step.index);
                    blk.set_ptr_at(step.index, BlockPtr::Addr(new_addr));
                    self.cache.mark_dirty(&blk);
                } else {
                    parent = blk.ptr_at(step.index);
                }
            }
            old
        };

        let now = self.now();
        match old {
            BlockPtr::Addr(a) => {
                let old_len = match id {
                    BlockId::Data(lbn) => file.frag_len(lbn, &self.geom),
                    _ => self.geom.block_size,
                };
                let released = self.geom.frag_ceil(old_len as u64);
                let sn = self.geom.seg_of(a);
                let dup = {
                    let mut slot = self.builder.lock();
                    match slot.cur.as_mut() {
                        Some(ps) if ps.contains(a) => {
                            ps.dup_count += 1;
                            true
                        }
                        _ => false,
                    }
                };
                if dup {
                    self.usage.lock().release_tolerant(sn, released, now);
                } else {
                    self.usage.lock().release(sn, released, now);
                }
            }
            BlockPtr::Unwritten => {
                file.with_mut(|st| {
                    st.inode.nblocks += self.geom.blocks_of(len as u64) as u64;
                });
            }
            BlockPtr::Unallocated => {}
        }

        if let BlockId::Data(lbn) = id {
            file.note_written(lbn);
            file.set_frag_len(lbn, len, &self.geom);
        }
        file.set_flags(FileFlags::ALLMOD);
        Ok(())
    }

    /// Commit a file's metadata: serialize the inode image, place it in the
    /// partial segment (sealing and retrying under a hard bound when the
    /// segment is full), and swing the inode-map entry to the new location.
    pub(crate) fn write_inode(&self, tok: &SegToken<'_>, file: &Arc<FileMeta>) -> LfsResult<()> {
        let rec = file.with_mut(|st| {
            // Declared size only ever shrinks to match what was written.
            if let Some(h) = st.hiblk {
                let cap = (h + 1) * self.geom.block_size as u64;
                if st.inode.size > cap {
                    st.inode.size = cap;
                }
            }
            st.inode.clone()
        });
        let bytes = frame_into_block(&rec, self.geom.block_size as usize)?;
        let blk = BlockBuf::new(file.id(), BlockId::Inode(file.id()), bytes);
        let bs = self.geom.block_size as u64;

        let mut tries = 0u32;
        loop {
            self.ensure_builder(tok)?;
            let offer = {
                let mut slot = self.builder.lock();
                let ps = slot.cur.as_mut().expect("builder just ensured");
                ps.offer_inode(&self.geom, blk.clone(), rec.version)
            };
            match offer {
                Offer::Accepted { addr } => {
                    let now = self.now();
                    let seg = self.geom.seg_of(addr);
                    let prev = self
                        .imap
                        .lock()
                        .set(file.id(), BlockPtr::Addr(addr), rec.version);
                    self.usage.lock().inode_charged(seg);
                    if let Some(a) = prev.addr.addr() {
                        let sn = self.geom.seg_of(a);
                        let dup = {
                            let mut slot = self.builder.lock();
                            match slot.cur.as_mut() {
                                Some(ps) if ps.contains(a) => {
                                    ps.dup_count += 1;
                                    true
                                }
                                _ => false,
                            }
                        };
                        if dup {
                            self.usage.lock().release_tolerant(sn, bs, now);
                        } else {
                            self.usage.lock().release(sn, bs, now);
                        }
                        self.usage.lock().inode_released(sn);
                    }
                    file.clear_flags(FileFlags::ALLMOD);
                    return Ok(());
                }
                Offer::Full => {
                    tries += 1;
                    if tries > self.geom.inode_retry_bound {
                        panic!("inode placement for file {} exceeded retry bound", file.id());
                    }
                    self.write_segment(tok)?;
                }
            }
        }
    }
}
