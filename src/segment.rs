//! The partial segment: summary header, per-file descriptor records and the
//! ordered blocks gathered so far, with budget tracking, provisional
//! address assignment and the two-level checksum computed at seal time.
//!
//! Exactly one partial segment exists at a time; the engine guards it with
//! the segment lock and hands sealed batches to cluster I/O.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::mem;

use serde::{Deserialize, Serialize};

use crate::block::{clamp_unwritten, BlockBuf, BlockFlags, BlockId};
use crate::common::{frame_into_block, unframe, FileId, LfsError, LfsResult, LogGeometry, IFILE_ID};

pub const SUMMARY_MAGIC: u32 = 0x4c46_5332;

// Conservative byte estimates for the encoded summary; offers are refused
// once the estimates no longer fit in the summary block.
const SUMMARY_BASE_BYTES: u32 = 320;
const REC_BLOCK_BYTES: u32 = 40;
const REC_FINFO_BYTES: u32 = 96;
const REC_INODE_BYTES: u32 = 80;

/// Hand-rolled CRC32 (reflected, polynomial 0xEDB88320).
pub fn crc32(data: &[u8]) -> u32 {
    !crc32_feed(0xFFFF_FFFF, data)
}

/// Incremental form: fold successive buffers through the running state,
/// then finish with a bitwise negation.
pub fn crc32_feed(mut crc: u32, data: &[u8]) -> u32 {
    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xEDB8_8320;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Per-file block-descriptor record: every logical block this file
/// contributed to the partial segment, in gathered order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinfoRecord {
    pub file: FileId,
    pub version: u32,
    pub blocks: Vec<BlockId>,
    /// Byte length of the last (possibly fragment) block.
    pub last_len: u32,
}

/// Location of an inode block committed with this partial segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeLoc {
    pub file: FileId,
    pub version: u32,
    pub addr: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentSummary {
    pub magic: u32,
    /// Monotonic across every sealed segment; gives roll-forward a total
    /// order over checkpoints.
    pub serial: u64,
    pub timestamp: u64,
    pub segment: u32,
    /// Hint for where the log continues after this segment.
    pub next_seg: u32,
    pub nfinfo: u32,
    pub ninodes: u32,
    /// A directory-operation sequence continues past this segment.
    pub cont: bool,
    pub data_sum: u32,
    pub sum_sum: u32,
    pub finfos: Vec<FinfoRecord>,
    pub inodes: Vec<InodeLoc>,
}

impl SegmentSummary {
    fn new(segment: u32) -> Self {
        Self {
            magic: SUMMARY_MAGIC,
            serial: 0,
            timestamp: 0,
            segment,
            next_seg: segment,
            nfinfo: 0,
            ninodes: 0,
            cont: false,
            data_sum: 0,
            sum_sum: 0,
            finfos: Vec::new(),
            inodes: Vec::new(),
        }
    }

    /// Stamp `sum_sum` over the encoding with the field zeroed, then return
    /// the final summary block bytes.
    pub fn seal(&mut self, block_size: usize) -> LfsResult<Vec<u8>> {
        self.nfinfo = self.finfos.len() as u32;
        self.ninodes = self.inodes.len() as u32;
        self.sum_sum = 0;
        let bare = frame_into_block(&*self, block_size)?;
        self.sum_sum = crc32(&bare);
        frame_into_block(&*self, block_size)
    }

    /// Parse and validate a summary block. Anything that fails here is
    /// ignored by recovery.
    pub fn decode(bytes: &[u8]) -> LfsResult<SegmentSummary> {
        let sum: SegmentSummary = unframe(bytes)?;
        if sum.magic != SUMMARY_MAGIC {
            return Err(LfsError::Corrupt);
        }
        let mut bare = sum.clone();
        bare.sum_sum = 0;
        let encoded = frame_into_block(&bare, bytes.len())?;
        if crc32(&encoded) != sum.sum_sum {
            return Err(LfsError::Corrupt);
        }
        Ok(sum)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuilderState {
    Empty,
    Filling,
    Sealing,
    Flushed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    Accepted { addr: u64 },
    Full,
}

/// One block scheduled into the partial segment.
pub struct SegBlock {
    pub buf: Arc<BlockBuf>,
    pub addr: u64,
    /// Actual byte length at offer time.
    pub len: u32,
    /// Fragment-rounded bytes occupied on the log.
    pub charged: u64,
}

pub struct PartialSegment {
    seg: u32,
    state: BuilderState,
    /// Address of the summary block; data follows it.
    start_addr: u64,
    next_addr: u64,
    bytes_left: u64,
    rec_bytes_left: u32,
    summary: SegmentSummary,
    cur_finfo: Option<FinfoRecord>,
    blocks: Vec<SegBlock>,
    /// Blocks below this index already had their pointers rewritten.
    meta_done: usize,
    /// Inode records superseded within this same unflushed segment.
    pub dup_count: u32,
    clean_start: bool,
}

impl PartialSegment {
    /// Room check before `begin`: a summary block plus one native block.
    pub fn fits(geom: &LogGeometry, seg: u32, at: u64) -> bool {
        at + 2 * geom.block_size as u64 <= geom.seg_end(seg)
    }

    pub fn begin(geom: &LogGeometry, seg: u32, at: u64) -> Self {
        debug_assert!(at >= geom.usable_start(seg));
        debug_assert!(Self::fits(geom, seg, at));
        let bs = geom.block_size as u64;
        Self {
            seg,
            state: BuilderState::Filling,
            start_addr: at,
            next_addr: at + bs,
            bytes_left: geom.seg_end(seg) - at - bs,
            rec_bytes_left: geom.block_size - SUMMARY_BASE_BYTES,
            summary: SegmentSummary::new(seg),
            cur_finfo: None,
            blocks: Vec::new(),
            meta_done: 0,
            dup_count: 0,
            clean_start: true,
        }
    }

    pub fn state(&self) -> BuilderState {
        self.state
    }

    pub fn seg(&self) -> u32 {
        self.seg
    }

    pub fn bytes_left(&self) -> u64 {
        self.bytes_left
    }

    /// Address the next flush in this segment would start at.
    pub fn end_addr(&self) -> u64 {
        self.next_addr
    }

    /// Nothing to write: no blocks and no continuation to signal.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty() && self.summary.finfos.is_empty() && !self.summary.cont
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start_addr && addr < self.next_addr
    }

    pub fn has_ifile_blocks(&self) -> bool {
        self.summary
            .finfos
            .iter()
            .chain(self.cur_finfo.iter())
            .any(|f| f.file == IFILE_ID)
    }

    pub fn set_cont(&mut self) {
        self.summary.cont = true;
    }

    /// Gathered state raced a truncation; the eventual seal must report a
    /// same-pass redo.
    pub fn mark_unclean(&mut self) {
        self.clean_start = false;
    }

    /// Open a per-file descriptor record. Returns false when the summary
    /// has no room left for another descriptor header; the caller seals and
    /// retries in the next partial segment.
    pub fn acquire_file(&mut self, file: FileId, version: u32) -> bool {
        debug_assert!(self.cur_finfo.is_none(), "descriptor already open");
        debug_assert_eq!(self.state, BuilderState::Filling);
        if self.rec_bytes_left < REC_FINFO_BYTES {
            return false;
        }
        self.rec_bytes_left -= REC_FINFO_BYTES;
        self.cur_finfo = Some(FinfoRecord {
            file,
            version,
            blocks: Vec::new(),
            last_len: 0,
        });
        true
    }

    /// Close the open descriptor. Empty records are dropped unless the
    /// caller needs the record to signal a directory-operation
    /// continuation to roll-forward.
    pub fn release_file(&mut self, keep_empty: bool) {
        if let Some(finfo) = self.cur_finfo.take() {
            if !finfo.blocks.is_empty() {
                self.summary.finfos.push(finfo);
            } else if keep_empty {
                self.summary.cont = true;
                self.summary.finfos.push(finfo);
            } else {
                self.rec_bytes_left += REC_FINFO_BYTES;
            }
        }
    }

    /// Append a data or indirect block. `Full` mutates nothing; the caller
    /// seals the segment and re-offers.
    pub fn offer(&mut self, geom: &LogGeometry, blk: &Arc<BlockBuf>) -> Offer {
        debug_assert_eq!(self.state, BuilderState::Filling);
        let finfo = self
            .cur_finfo
            .as_mut()
            .expect("offer without an open descriptor");
        let len = blk.len() as u64;
        let charged = geom.frag_ceil(len);
        let units = geom.blocks_of(len);
        let rec_cost = units * REC_BLOCK_BYTES;
        if self.bytes_left < charged || self.rec_bytes_left < rec_cost {
            return Offer::Full;
        }
        let addr = self.next_addr;
        self.next_addr += charged;
        self.bytes_left -= charged;
        self.rec_bytes_left -= rec_cost;
        finfo.blocks.push(blk.id());
        finfo.last_len = len as u32;
        blk.set_flags(BlockFlags::OFFERED);
        self.blocks.push(SegBlock {
            buf: blk.clone(),
            addr,
            len: len as u32,
            charged,
        });
        Offer::Accepted { addr }
    }

    /// Append an inode block, recorded in the summary's inode list rather
    /// than a descriptor.
    pub fn offer_inode(&mut self, geom: &LogGeometry, blk: Arc<BlockBuf>, version: u32) -> Offer {
        debug_assert_eq!(self.state, BuilderState::Filling);
        debug_assert!(blk.id().is_inode());
        let charged = geom.block_size as u64;
        if self.bytes_left < charged || self.rec_bytes_left < REC_INODE_BYTES {
            return Offer::Full;
        }
        let addr = self.next_addr;
        self.next_addr += charged;
        self.bytes_left -= charged;
        self.rec_bytes_left -= REC_INODE_BYTES;
        self.summary.inodes.push(InodeLoc {
            file: blk.file(),
            version,
            addr,
        });
        blk.set_flags(BlockFlags::OFFERED);
        self.blocks.push(SegBlock {
            len: charged as u32,
            buf: blk,
            addr,
            charged,
        });
        Offer::Accepted { addr }
    }

    /// Blocks whose pointers still need rewriting, oldest first.
    pub fn unrelocated(&self) -> &[SegBlock] {
        &self.blocks[self.meta_done..]
    }

    pub fn mark_relocated(&mut self, n: usize) {
        self.meta_done += n;
        debug_assert!(self.meta_done <= self.blocks.len());
    }

    /// Seal the partial segment: mark every collected block busy, clamp
    /// leftover unwritten placeholders out of indirect blocks, compute the
    /// data checksum and then the summary checksum over it, and produce the
    /// batch for cluster I/O.
    ///
    /// The summary checksum is computed strictly after all data blocks are
    /// finalized and busy, so the on-disk image is self-consistent no
    /// matter where a crash lands.
    pub fn seal(
        mut self,
        geom: &LogGeometry,
        serial: u64,
        now: u64,
        next_seg: u32,
    ) -> LfsResult<SealedSegment> {
        debug_assert_eq!(self.state, BuilderState::Filling);
        self.release_file(false);
        self.state = BuilderState::Sealing;

        let mut data_crc = 0xFFFF_FFFFu32;
        for sb in &self.blocks {
            sb.buf.with_state(|st| {
                st.flags.insert(BlockFlags::BUSY);
                if sb.buf.id().is_indirect() {
                    let clamped = clamp_unwritten(&mut st.data);
                    if clamped > 0 {
                        log::debug!(
                            "clamped {} unwritten pointers in {:?}",
                            clamped,
                            sb.buf.id()
                        );
                    }
                }
                data_crc = crc32_feed(data_crc, &st.data);
            });
        }

        self.summary.serial = serial;
        self.summary.timestamp = now;
        self.summary.next_seg = next_seg;
        self.summary.data_sum = !data_crc;
        let summary_bytes = match self.summary.seal(geom.block_size as usize) {
            Ok(bytes) => bytes,
            Err(e) => {
                // Nothing was handed to the device; give the blocks back so
                // the orchestrator can abandon this attempt cleanly.
                for sb in &self.blocks {
                    sb.buf.clear_flags(BlockFlags::BUSY | BlockFlags::OFFERED);
                }
                return Err(e);
            }
        };

        self.state = BuilderState::Flushed;
        let charged: u64 =
            geom.block_size as u64 + self.blocks.iter().map(|b| b.charged).sum::<u64>();
        Ok(SealedSegment {
            seg: self.seg,
            summary_addr: self.start_addr,
            summary_bytes,
            blocks: mem::take(&mut self.blocks),
            end_addr: self.next_addr,
            charged,
            clean_start: self.clean_start,
            had_ifile: self
                .summary
                .finfos
                .iter()
                .any(|f| f.file == IFILE_ID),
        })
    }
}

/// A sealed batch on its way to the device.
pub struct SealedSegment {
    pub seg: u32,
    pub summary_addr: u64,
    pub summary_bytes: Vec<u8>,
    pub blocks: Vec<SegBlock>,
    pub end_addr: u64,
    /// Bytes to attribute to the segment, summary block included.
    pub charged: u64,
    pub clean_start: bool,
    pub had_ifile: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockPtr;

    fn geom() -> LogGeometry {
        let mut g = LogGeometry::with_defaults(8);
        g.block_size = 4096;
        g.frag_size = 1024;
        g.segment_size = 256 * 1024;
        g
    }

    fn data_block(file: FileId, lbn: u64, len: usize) -> Arc<BlockBuf> {
        BlockBuf::new(file, BlockId::Data(lbn), alloc::vec![0xabu8; len])
    }

    /// Builder positioned so that exactly `free` data bytes remain.
    fn builder_with_free(g: &LogGeometry, free: u64) -> PartialSegment {
        let at = g.seg_end(1) - free - g.block_size as u64;
        PartialSegment::begin(g, 1, at)
    }

    #[test]
    fn exact_budget_accepts_then_fills() {
        let g = geom();
        let mut ps = builder_with_free(&g, 6144);
        assert_eq!(ps.bytes_left(), 6144);
        assert!(ps.acquire_file(7, 1));

        let a = data_block(7, 0, 4096);
        let b = data_block(7, 1, 4096);
        match ps.offer(&g, &a) {
            Offer::Accepted { addr } => assert_eq!(addr, ps.end_addr() - 4096),
            Offer::Full => panic!("first block must fit"),
        }
        assert_eq!(ps.offer(&g, &b), Offer::Full);
        // Full mutates nothing: same budget, same cursor, b not offered.
        assert_eq!(ps.bytes_left(), 2048);
        assert!(!b.flags().contains(BlockFlags::OFFERED));

        ps.release_file(false);
        let sealed = ps.seal(&g, 1, 1, 1).unwrap();
        assert_eq!(sealed.blocks.len(), 1);
        assert_eq!(sealed.blocks[0].buf.id(), BlockId::Data(0));
    }

    #[test]
    fn summary_checksum_roundtrip() {
        let g = geom();
        let mut ps = builder_with_free(&g, 64 * 1024);
        assert!(ps.acquire_file(7, 2));
        ps.offer(&g, &data_block(7, 0, 4096));
        ps.offer(&g, &data_block(7, 1, 1500));
        ps.release_file(false);

        let sealed = ps.seal(&g, 9, 100, 2).unwrap();
        let sum = SegmentSummary::decode(&sealed.summary_bytes).unwrap();
        assert_eq!(sum.serial, 9);
        assert_eq!(sum.nfinfo, 1);
        assert_eq!(sum.finfos[0].blocks.len(), 2);
        assert_eq!(sum.finfos[0].last_len, 1500);

        // Data checksum matches a recomputation over the sealed contents.
        let mut crc = 0xFFFF_FFFFu32;
        for sb in &sealed.blocks {
            crc = crc32_feed(crc, &sb.buf.snapshot());
        }
        assert_eq!(sum.data_sum, !crc);

        let mut corrupted = sealed.summary_bytes.clone();
        corrupted[40] ^= 0x01;
        assert!(SegmentSummary::decode(&corrupted).is_err());
    }

    #[test]
    fn fragment_rounding_charges_the_log() {
        let g = geom();
        let mut ps = builder_with_free(&g, 8192);
        assert!(ps.acquire_file(3, 1));
        let before = ps.bytes_left();
        ps.offer(&g, &data_block(3, 0, 1500));
        assert_eq!(before - ps.bytes_left(), 2048);
    }

    #[test]
    fn oversized_block_counts_as_multiple_records() {
        let g = geom();
        let mut ps = builder_with_free(&g, 64 * 1024);
        assert!(ps.acquire_file(3, 1));
        let big = data_block(3, 0, 8192);
        let before = ps.bytes_left();
        assert!(matches!(ps.offer(&g, &big), Offer::Accepted { .. }));
        assert_eq!(before - ps.bytes_left(), 8192);
        // Still one I/O unit in the block list.
        assert_eq!(ps.unrelocated().len(), 1);
    }

    #[test]
    fn empty_descriptor_dropped_unless_continuation() {
        let g = geom();
        let mut ps = builder_with_free(&g, 64 * 1024);
        assert!(ps.acquire_file(4, 1));
        ps.release_file(false);
        assert!(ps.is_empty());

        assert!(ps.acquire_file(4, 1));
        ps.release_file(true);
        assert!(!ps.is_empty());
        let sealed = ps.seal(&g, 1, 1, 1).unwrap();
        let sum = SegmentSummary::decode(&sealed.summary_bytes).unwrap();
        assert!(sum.cont);
        assert_eq!(sum.nfinfo, 1);
        assert!(sum.finfos[0].blocks.is_empty());
    }

    #[test]
    fn descriptor_budget_eventually_refuses() {
        let g = geom();
        let mut ps = builder_with_free(&g, 128 * 1024);
        let mut opened = 0;
        while ps.acquire_file(100 + opened as u64, 1) {
            ps.release_file(true);
            opened += 1;
            assert!(opened < 10_000, "record budget never exhausted");
        }
        assert!(opened > 0);
    }

    #[test]
    fn sealing_clamps_unwritten_indirect_pointers() {
        let g = geom();
        let mut ps = builder_with_free(&g, 64 * 1024);
        let ind = BlockBuf::new(
            5,
            BlockId::Indirect { level: 1, index: 0 },
            alloc::vec![0u8; 4096],
        );
        ind.set_ptr_at(3, BlockPtr::Unwritten);
        ind.set_ptr_at(4, BlockPtr::Addr(0x9000));
        assert!(ps.acquire_file(5, 1));
        ps.offer(&g, &ind);
        ps.release_file(false);
        let sealed = ps.seal(&g, 1, 1, 1).unwrap();
        let data = sealed.blocks[0].buf.snapshot();
        assert_eq!(crate::block::get_pointer(&data, 3), BlockPtr::Unallocated);
        assert_eq!(crate::block::get_pointer(&data, 4), BlockPtr::Addr(0x9000));
    }
}
