//! Space accountant: per-segment usage entries, the clean-segment census
//! and next-segment selection.
//!
//! The table is mutated only while the segment lock is held; the cleaner
//! reads it through [`SpaceAccountant::snapshot`]. Byte accounting is
//! exact: a release that would go negative is a prior bug, not an
//! environmental condition, and aborts.

use alloc::vec::Vec;

use bitflags::bitflags;
use log::warn;
use serde::{Deserialize, Serialize};

use crate::common::{LfsError, LfsResult, LogGeometry};

bitflags! {
    pub struct SegFlags: u32 {
        /// Holds live data; skipped by selection until cleaned.
        const DIRTY      = 1 << 0;
        /// Written during the checkpoint in progress; never selected.
        const ACTIVE     = 1 << 1;
        /// Never written since creation or cleaning.
        const EMPTY      = 1 << 2;
        /// Overlaps the superblock/label region.
        const SUPERBLOCK = 1 << 3;
        /// Summary failed validation; selectable only as a last resort.
        const INVALID    = 1 << 4;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegUsageEntry {
    pub bytes_used: u64,
    pub ninodes: u32,
    pub nsums: u32,
    pub mtime: u64,
    flags: u32,
}

impl SegUsageEntry {
    fn empty() -> Self {
        Self {
            bytes_used: 0,
            ninodes: 0,
            nsums: 0,
            mtime: 0,
            flags: SegFlags::EMPTY.bits(),
        }
    }

    pub fn flags(&self) -> SegFlags {
        SegFlags::from_bits_truncate(self.flags)
    }

    fn insert(&mut self, set: SegFlags) {
        self.flags |= set.bits();
    }

    fn remove(&mut self, clear: SegFlags) {
        self.flags &= !clear.bits();
    }
}

fn is_clean(e: &SegUsageEntry) -> bool {
    !e.flags()
        .intersects(SegFlags::DIRTY | SegFlags::ACTIVE | SegFlags::INVALID)
}

pub struct SpaceAccountant {
    entries: Vec<SegUsageEntry>,
    clean: u32,
    interleave: u32,
}

impl SpaceAccountant {
    pub fn new(geom: &LogGeometry) -> Self {
        let mut entries = alloc::vec![SegUsageEntry::empty(); geom.nsegments as usize];
        entries[0].insert(SegFlags::SUPERBLOCK);
        Self {
            clean: geom.nsegments,
            interleave: geom.interleave,
            entries,
        }
    }

    /// Rebuild from a persisted table (the inode-map file's copy).
    pub fn from_entries(geom: &LogGeometry, entries: Vec<SegUsageEntry>) -> LfsResult<Self> {
        if entries.len() != geom.nsegments as usize {
            return Err(LfsError::Corrupt);
        }
        let clean = entries.iter().filter(|e| is_clean(e)).count() as u32;
        Ok(Self {
            entries,
            clean,
            interleave: geom.interleave,
        })
    }

    pub fn entry(&self, sn: u32) -> &SegUsageEntry {
        &self.entries[sn as usize]
    }

    /// All flag/count transitions funnel through here so the clean census
    /// stays consistent with the flags.
    fn mutate<R>(&mut self, sn: u32, f: impl FnOnce(&mut SegUsageEntry) -> R) -> R {
        let e = &mut self.entries[sn as usize];
        let was_clean = is_clean(e);
        let r = f(e);
        let now_clean = is_clean(e);
        if was_clean && !now_clean {
            self.clean -= 1;
        } else if !was_clean && now_clean {
            self.clean += 1;
        }
        r
    }

    /// Attribute `nbytes` newly committed to `sn`. Called exactly once per
    /// block when its segment seals.
    pub fn charge(&mut self, sn: u32, nbytes: u64, now: u64) {
        self.mutate(sn, |e| {
            e.bytes_used += nbytes;
            e.mtime = now;
            e.insert(SegFlags::DIRTY);
            e.remove(SegFlags::EMPTY);
        });
    }

    /// Give back `nbytes` previously attributed to `sn`. Underflow means a
    /// block was released twice or never charged.
    pub fn release(&mut self, sn: u32, nbytes: u64, now: u64) {
        self.mutate(sn, |e| {
            if e.bytes_used < nbytes {
                panic!(
                    "segment {} usage underflow: {} held, {} released",
                    sn, e.bytes_used, nbytes
                );
            }
            e.bytes_used -= nbytes;
            e.mtime = now;
        });
    }

    /// Release variant for the duplicate-write window: a file rewritten
    /// within one checkpoint pass releases an address whose charge has not
    /// landed yet. Clamps instead of asserting.
    pub fn release_tolerant(&mut self, sn: u32, nbytes: u64, now: u64) {
        self.mutate(sn, |e| {
            e.bytes_used = e.bytes_used.saturating_sub(nbytes);
            e.mtime = now;
        });
    }

    pub fn inode_charged(&mut self, sn: u32) {
        self.mutate(sn, |e| e.ninodes += 1);
    }

    pub fn inode_released(&mut self, sn: u32) {
        self.mutate(sn, |e| {
            if e.ninodes == 0 {
                warn!("segment {} inode count already zero", sn);
            } else {
                e.ninodes -= 1;
            }
        });
    }

    pub fn note_summary(&mut self, sn: u32) {
        self.mutate(sn, |e| e.nsums += 1);
    }

    pub fn mark_active(&mut self, sn: u32) {
        self.mutate(sn, |e| e.insert(SegFlags::ACTIVE));
    }

    pub fn clear_active(&mut self, sn: u32) {
        self.mutate(sn, |e| e.remove(SegFlags::ACTIVE));
    }

    /// Checkpoint epilogue: every segment written during the pass stops
    /// being ACTIVE except the one still being filled.
    pub fn clear_active_except(&mut self, keep: u32) {
        for sn in 0..self.entries.len() as u32 {
            if sn != keep && self.entries[sn as usize].flags().contains(SegFlags::ACTIVE) {
                self.clear_active(sn);
            }
        }
    }

    /// Undo the accounting of a segment write that failed in its entirety.
    /// Only then may the segment drop back out of the DIRTY set.
    pub fn rollback_failed_write(&mut self, sn: u32, nbytes: u64, ninodes: u32, now: u64) {
        self.mutate(sn, |e| {
            e.bytes_used = e.bytes_used.saturating_sub(nbytes);
            e.nsums = e.nsums.saturating_sub(1);
            e.ninodes = e.ninodes.saturating_sub(ninodes);
            e.mtime = now;
            if e.bytes_used == 0 && e.ninodes == 0 && e.nsums == 0 {
                e.remove(SegFlags::DIRTY);
                e.insert(SegFlags::EMPTY);
            }
        });
    }

    pub fn mark_invalid(&mut self, sn: u32) {
        self.mutate(sn, |e| e.insert(SegFlags::INVALID));
    }

    /// Cleaner bookkeeping: `sn` has been emptied and may be selected
    /// again.
    pub fn note_cleaned(&mut self, sn: u32, now: u64) {
        self.mutate(sn, |e| {
            let keep_sb = e.flags().contains(SegFlags::SUPERBLOCK);
            e.bytes_used = 0;
            e.ninodes = 0;
            e.nsums = 0;
            e.mtime = now;
            e.flags = SegFlags::EMPTY.bits();
            if keep_sb {
                e.insert(SegFlags::SUPERBLOCK);
            }
        });
    }

    /// Pick the segment the log advances into. First pass accepts only
    /// clean segments; the second falls back to INVALID ones. Scan starts
    /// at `cur + interleave` and wraps, so the first hit is the lowest
    /// acceptable segment number in ring order.
    pub fn select_next_segment(&self, cur: u32) -> LfsResult<u32> {
        let n = self.entries.len() as u32;
        let start = (cur + self.interleave) % n;
        for pass in 0..2 {
            for i in 0..n {
                let sn = (start + i) % n;
                let flags = self.entries[sn as usize].flags();
                if flags.intersects(SegFlags::ACTIVE | SegFlags::DIRTY) {
                    continue;
                }
                if pass == 0 && flags.contains(SegFlags::INVALID) {
                    continue;
                }
                return Ok(sn);
            }
        }
        Err(LfsError::NoCleanSegment)
    }

    pub fn clean_count(&self) -> u32 {
        self.clean
    }

    pub fn active_count(&self) -> u32 {
        self.entries
            .iter()
            .filter(|e| e.flags().contains(SegFlags::ACTIVE))
            .count() as u32
    }

    pub fn live_bytes_total(&self) -> u64 {
        self.entries.iter().map(|e| e.bytes_used).sum()
    }

    pub fn snapshot(&self) -> Vec<SegUsageEntry> {
        self.entries.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accountant() -> SpaceAccountant {
        SpaceAccountant::new(&LogGeometry::with_defaults(8))
    }

    #[test]
    fn charge_release_roundtrip() {
        let mut a = accountant();
        a.charge(2, 8192, 1);
        assert_eq!(a.entry(2).bytes_used, 8192);
        assert!(a.entry(2).flags().contains(SegFlags::DIRTY));
        assert!(!a.entry(2).flags().contains(SegFlags::EMPTY));
        a.release(2, 8192, 2);
        assert_eq!(a.entry(2).bytes_used, 0);
        // Released bytes do not make a segment clean; only the cleaner does.
        assert!(a.entry(2).flags().contains(SegFlags::DIRTY));
    }

    #[test]
    #[should_panic(expected = "usage underflow")]
    fn release_underflow_aborts() {
        let mut a = accountant();
        a.charge(1, 4096, 1);
        a.release(1, 8192, 2);
    }

    #[test]
    fn tolerant_release_clamps() {
        let mut a = accountant();
        a.charge(1, 1024, 1);
        a.release_tolerant(1, 4096, 2);
        assert_eq!(a.entry(1).bytes_used, 0);
    }

    #[test]
    fn clean_census_follows_flags() {
        let mut a = accountant();
        assert_eq!(a.clean_count(), 8);
        a.charge(3, 512, 1);
        assert_eq!(a.clean_count(), 7);
        a.mark_active(4);
        assert_eq!(a.clean_count(), 6);
        a.clear_active(4);
        assert_eq!(a.clean_count(), 7);
        a.note_cleaned(3, 2);
        assert_eq!(a.clean_count(), 8);
    }

    #[test]
    fn selection_skips_active_dirty_and_wraps() {
        let mut a = accountant();
        a.charge(1, 512, 1);
        a.mark_active(2);
        // interleave 1: scan starts at 1, skips 1 (dirty) and 2 (active)
        assert_eq!(a.select_next_segment(0).unwrap(), 3);
        // wraps past the end
        assert_eq!(a.select_next_segment(7).unwrap(), 0);
    }

    #[test]
    fn selection_falls_back_to_invalid() {
        let mut a = accountant();
        for sn in 0..8 {
            if sn == 5 {
                a.mark_invalid(sn);
            } else {
                a.charge(sn, 512, 1);
            }
        }
        assert_eq!(a.select_next_segment(0).unwrap(), 5);
    }

    #[test]
    fn selection_reports_exhaustion() {
        let mut a = accountant();
        for sn in 0..8 {
            a.charge(sn, 512, 1);
        }
        assert_eq!(a.select_next_segment(0), Err(LfsError::NoCleanSegment));
    }

    #[test]
    fn cleaning_preserves_superblock_flag() {
        let mut a = accountant();
        a.charge(0, 512, 1);
        a.note_cleaned(0, 2);
        assert!(a.entry(0).flags().contains(SegFlags::SUPERBLOCK));
        assert!(a.entry(0).flags().contains(SegFlags::EMPTY));
    }
}
