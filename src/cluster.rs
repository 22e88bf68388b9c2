//! Cluster I/O: coalesce a sealed segment's blocks into large contiguous
//! device writes, submit them asynchronously and settle the bookkeeping on
//! completion.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use log::{error, warn};
use spin::Mutex;

use crate::block::{BlockCache, BlockFlags};
use crate::common::{FileId, LfsResult, LogGeometry};
use crate::device::BlockDevice;
use crate::file::{FileFlags, FileMeta};
use crate::segment::{SealedSegment, SegBlock};
use crate::usage::SpaceAccountant;

/// Outstanding-I/O gate. The count starts at one: the calling context's
/// synthetic reservation, so `wait_drained` has a stable floor.
pub(crate) struct IoGate {
    pending: AtomicU32,
}

impl IoGate {
    pub fn new() -> Self {
        Self {
            pending: AtomicU32::new(1),
        }
    }

    pub fn begin(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
    }

    pub fn complete(&self) {
        let prev = self.pending.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 1, "completion without submission");
    }

    pub fn outstanding(&self) -> u32 {
        self.pending.load(Ordering::Acquire) - 1
    }

    /// Cooperative wait until every submitted write has settled.
    pub fn wait_drained(&self) {
        while self.pending.load(Ordering::Acquire) != 1 {
            core::hint::spin_loop();
        }
    }
}

/// Shared handles a completion needs; cheap to clone into the callback.
pub(crate) struct ClusterCtx {
    pub cache: Arc<dyn BlockCache>,
    pub files: Arc<Mutex<BTreeMap<FileId, Arc<FileMeta>>>>,
    pub usage: Arc<Mutex<SpaceAccountant>>,
    pub io: Arc<IoGate>,
    pub clock: Arc<AtomicU64>,
}

impl Clone for ClusterCtx {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            files: self.files.clone(),
            usage: self.usage.clone(),
            io: self.io.clone(),
            clock: self.clock.clone(),
        }
    }
}

/// Per-sealed-segment completion state: when every cluster has failed, the
/// segment's charge is rolled back so a dead write never marks the segment
/// used.
struct SegCommit {
    seg: u32,
    charged: u64,
    ninodes: u32,
    clusters: u32,
    done: AtomicU32,
    failed: AtomicU32,
}

/// Greedy cluster assembly: contiguous runs up to the transfer cap.
/// Oversized page-cluster blocks are already one I/O unit and are never
/// merged further.
pub(crate) fn partition(geom: &LogGeometry, blocks: Vec<SegBlock>) -> Vec<(u64, Vec<SegBlock>)> {
    let mut clusters: Vec<(u64, Vec<SegBlock>)> = Vec::new();
    for sb in blocks {
        let oversized = sb.len > geom.block_size;
        let start_new = match clusters.last() {
            None => true,
            Some((_, list)) => {
                let last = list.last().unwrap();
                let contiguous = last.addr + last.charged == sb.addr;
                let bytes: u64 = list.iter().map(|b| b.charged).sum();
                let prev_oversized = last.len > geom.block_size;
                oversized
                    || prev_oversized
                    || !contiguous
                    || bytes + sb.charged > geom.max_cluster as u64
            }
        };
        if start_new {
            clusters.push((sb.addr, alloc::vec![sb]));
        } else {
            clusters.last_mut().unwrap().1.push(sb);
        }
    }
    clusters
}

/// Submit a sealed segment. Data clusters go first, the summary block
/// last, each with its own completion. Once sealed there is no
/// cancellation; the batch commits regardless.
pub(crate) fn submit<D: BlockDevice>(
    device: &D,
    ctx: &ClusterCtx,
    geom: &LogGeometry,
    sealed: SealedSegment,
) {
    let SealedSegment {
        seg,
        summary_addr,
        summary_bytes,
        blocks,
        charged,
        ..
    } = sealed;
    let ninodes = blocks.iter().filter(|b| b.buf.id().is_inode()).count() as u32;
    let clusters = partition(geom, blocks);
    let commit = Arc::new(SegCommit {
        seg,
        charged,
        ninodes,
        clusters: clusters.len() as u32 + 1,
        done: AtomicU32::new(0),
        failed: AtomicU32::new(0),
    });

    for (start, list) in clusters {
        let mut bytes = Vec::new();
        for sb in &list {
            let mut data = sb.buf.snapshot();
            data.resize(sb.charged as usize, 0);
            bytes.extend_from_slice(&data);
        }
        let cctx = ctx.clone();
        let ccommit = commit.clone();
        ctx.io.begin();
        device.write_async(
            start,
            bytes,
            Box::new(move |res| settle(cctx, ccommit, list, res)),
        );
    }

    let cctx = ctx.clone();
    ctx.io.begin();
    device.write_async(
        summary_addr,
        summary_bytes,
        Box::new(move |res| settle(cctx, commit, Vec::new(), res)),
    );
}

fn settle(ctx: ClusterCtx, commit: Arc<SegCommit>, list: Vec<SegBlock>, res: LfsResult<()>) {
    let ok = res.is_ok();
    if !ok {
        error!("cluster write failed in segment {}", commit.seg);
    }
    for sb in &list {
        finish_block(&ctx, sb, ok);
    }
    if !ok {
        commit.failed.fetch_add(1, Ordering::AcqRel);
    }
    let done = commit.done.fetch_add(1, Ordering::AcqRel) + 1;
    if done == commit.clusters && commit.failed.load(Ordering::Acquire) == commit.clusters {
        // Nothing of this write landed; the segment must not read as used.
        warn!("segment {} write failed entirely, rolling back charge", commit.seg);
        let now = ctx.clock.load(Ordering::Acquire);
        ctx.usage
            .lock()
            .rollback_failed_write(commit.seg, commit.charged, commit.ninodes, now);
    }
    ctx.io.complete();
}

/// Release one block back to its owner: re-dirtied when it changed (or
/// failed) during the busy window, clean otherwise, with the per-file
/// dirty census updated to match.
fn finish_block(ctx: &ClusterCtx, sb: &SegBlock, ok: bool) {
    let blk = &sb.buf;
    let redirty = blk.with_state(|st| {
        st.flags.remove(BlockFlags::BUSY | BlockFlags::OFFERED);
        if !ok {
            st.flags.insert(BlockFlags::ERROR);
            true
        } else if st.flags.contains(BlockFlags::REDIRTY) {
            st.flags.remove(BlockFlags::REDIRTY);
            true
        } else {
            false
        }
    });

    if blk.id().is_inode() {
        // Inode blocks are synthesized by the engine; a failed one means
        // the file's metadata never committed.
        if !ok {
            if let Some(f) = ctx.files.lock().get(&blk.file()) {
                f.set_flags(FileFlags::ALLMOD);
            }
        }
        return;
    }

    if redirty {
        ctx.cache.mark_dirty(blk);
    } else {
        ctx.cache.mark_clean(blk);
    }

    let file = ctx.files.lock().get(&blk.file()).cloned();
    if let Some(f) = file {
        let dirty = ctx.cache.dirty_blocks(blk.file());
        let ordinary = dirty.iter().any(|b| !b.flags().contains(BlockFlags::FAKE));
        let cleaner = dirty.iter().any(|b| b.flags().contains(BlockFlags::FAKE));
        f.with_mut(|st| {
            st.flags.set(FileFlags::DIRTY_DATA, ordinary);
            st.flags.set(FileFlags::DIRTY_CLEANER, cleaner);
        });
    }
}
