//! Engine-level scenarios: gathering across segment boundaries, checkpoint
//! behavior, accounting invariants and failure handling, all against the
//! in-memory device and cache.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::Ordering;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::block::{BlockBuf, BlockCache, BlockFlags, BlockId, BlockPtr};
use crate::checkpoint::CkpFlags;
use crate::common::{LfsError, LogGeometry, IFILE_ID};
use crate::engine::Engine;
use crate::file::FileFlags;
use crate::imap::InodeMap;
use crate::segment::SegmentSummary;
use crate::testutil::{CleanerProbe, MemCache, MemDevice};
use crate::usage::SegFlags;

fn test_geom(nsegments: u32) -> LogGeometry {
    let mut geom = LogGeometry::with_defaults(nsegments);
    geom.block_size = 4096;
    geom.frag_size = 1024;
    geom.segment_size = 64 * 1024;
    geom.label_bytes = 4096;
    geom.max_cluster = 16 * 1024;
    geom.low_water = 0;
    geom
}

fn setup(geom: LogGeometry) -> (Arc<Engine<MemDevice>>, Arc<MemDevice>, Arc<MemCache>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let device = MemDevice::new(geom.nsegments as u64 * geom.segment_size);
    let cache = MemCache::new(geom.block_size);
    cache.attach_device(device.clone());
    let cache_dyn: Arc<dyn BlockCache> = cache.clone();
    let engine = Engine::new(device.clone(), cache_dyn, geom).unwrap();
    (engine, device, cache)
}

/// Roll-forward style sweep: every fragment-aligned offset that decodes as
/// a valid summary, with its position.
fn scan_summaries(device: &MemDevice, geom: &LogGeometry) -> Vec<(u64, SegmentSummary)> {
    let mut found = Vec::new();
    let end = geom.nsegments as u64 * geom.segment_size;
    let mut pos = geom.label_bytes;
    while pos + geom.block_size as u64 <= end {
        let bytes = device.read(pos, geom.block_size as usize);
        if let Ok(sum) = SegmentSummary::decode(&bytes) {
            found.push((pos, sum));
        }
        pos += geom.frag_size as u64;
    }
    found
}

#[test]
fn flush_file_commits_and_is_idempotent() {
    let (engine, device, cache) = setup(test_geom(8));
    engine.register_file(7);
    cache.write_data(7, 0, alloc::vec![0x11u8; 4096]);
    cache.write_data(7, 1, alloc::vec![0x22u8; 4096]);

    engine.flush_file(7).unwrap();

    // Summary + two data blocks + inode block, all in segment 0.
    let snap = engine.segment_usage_snapshot();
    assert_eq!(snap[0].bytes_used, 4 * 4096);
    assert_eq!(snap[0].nsums, 1);
    assert_eq!(snap[0].ninodes, 1);

    let blk = cache.block(7, BlockId::Data(0)).unwrap();
    assert!(!blk.flags().contains(BlockFlags::DIRTY));
    let f = engine.file(7).unwrap();
    assert_eq!(f.with(|st| st.inode.daddr[0]), BlockPtr::Addr(2 * 4096));
    assert_eq!(f.with(|st| st.inode.nblocks), 0);

    // Nothing new dirty: a second flush offers nothing and writes nothing.
    let writes = device.write_count();
    engine.flush_file(7).unwrap();
    assert_eq!(device.write_count(), writes);
}

#[test]
fn exact_budget_seals_once_and_resumes() {
    let (engine, _device, cache) = setup(test_geom(8));
    let f7 = engine.register_file(7);
    engine.register_file(8);

    let owner = engine.begin_op();
    let tok = engine.lock_segments(owner);
    engine.ensure_builder(&tok).unwrap();

    // Burn the fresh segment down to exactly 6144 free bytes.
    let filler = BlockBuf::new(8, BlockId::Data(0), alloc::vec![0u8; 51200]);
    engine
        .with_builder(&tok, |ps| {
            assert!(ps.acquire_file(8, 1));
            ps.offer(engine.geometry(), &filler);
            ps.release_file(false);
            assert!(ps.acquire_file(7, 1));
            assert_eq!(ps.bytes_left(), 6144);
        })
        .unwrap();

    cache.write_data(7, 0, alloc::vec![0xaau8; 4096]);
    cache.write_data(7, 1, alloc::vec![0xbbu8; 4096]);

    // A fits, B forces exactly one seal and lands in the next segment.
    assert_eq!(engine.gather(&tok, &f7, crate::gather::GatherClass::Data).unwrap(), 2);
    drop(tok);

    let snap = engine.segment_usage_snapshot();
    assert_eq!(snap[0].nsums, 1);
    assert_eq!(snap[0].bytes_used, 4096 + 51200 + 4096);
    assert!(snap[1].flags().contains(SegFlags::ACTIVE));

    let (seg, last_addr) = engine
        .with_builder(&engine.lock_segments(engine.begin_op()), |ps| {
            (ps.seg(), ps.unrelocated().last().map(|sb| sb.addr))
        })
        .unwrap();
    assert_eq!(seg, 1);
    assert_eq!(last_addr, Some(64 * 1024 + 4096));
}

#[test]
fn checkpoint_writes_superblock_once() {
    let (engine, device, cache) = setup(test_geom(8));
    engine.register_file(7);
    cache.write_data(7, 0, alloc::vec![0x33u8; 4096]);

    engine.request_checkpoint(CkpFlags::FORCE | CkpFlags::SYNC).unwrap();
    assert_eq!(device.writes_at(0), 1);
    let sb = engine.superblock();
    assert!(sb.serial > 0);
    assert!(sb.imap_addr.is_addr());

    // No intervening writes: the second checkpoint succeeds but leaves the
    // superblock alone.
    engine.request_checkpoint(CkpFlags::FORCE | CkpFlags::SYNC).unwrap();
    assert_eq!(device.writes_at(0), 1);
    assert_eq!(engine.superblock().serial, sb.serial);
}

#[test]
fn checkpoint_persists_decodable_tables() {
    let (engine, _device, cache) = setup(test_geom(8));
    engine.register_file(7);
    cache.write_data(7, 0, alloc::vec![0x44u8; 4096]);
    engine.request_checkpoint(CkpFlags::FORCE | CkpFlags::SYNC).unwrap();

    let mut blocks = Vec::new();
    let mut i = 0;
    while let Some(b) = cache.block(IFILE_ID, BlockId::Data(i)) {
        blocks.push(b.snapshot());
        i += 1;
    }
    assert!(!blocks.is_empty());
    let (imap, usage) = InodeMap::decode(&blocks).unwrap();
    assert_eq!(usage.len(), 8);
    assert!(imap.entry(7).addr.is_addr());
}

#[test]
fn uncheckpointed_segments_outrank_the_superblock() {
    let (engine, device, cache) = setup(test_geom(8));
    engine.register_file(7);
    engine.register_file(9);
    cache.write_data(7, 0, alloc::vec![0x55u8; 4096]);
    engine.request_checkpoint(CkpFlags::FORCE | CkpFlags::SYNC).unwrap();
    let sb = engine.superblock();

    // Sealed after the checkpoint, never covered by a superblock.
    cache.write_data(9, 0, alloc::vec![0x66u8; 4096]);
    engine.flush_file(9).unwrap();

    let geom = engine.geometry().clone();
    let sums = scan_summaries(&device, &geom);
    assert!(!sums.is_empty());
    let (newest_pos, newest) = sums
        .iter()
        .max_by_key(|(_, s)| s.serial)
        .map(|(p, s)| (*p, s.serial))
        .unwrap();
    assert!(newest > sb.serial);

    // Corrupt the newest summary: recovery must ignore it.
    device.corrupt(newest_pos + 64);
    let survivors = scan_summaries(&device, &geom);
    assert!(survivors.iter().all(|(_, s)| s.serial != newest));
}

#[test]
fn relocation_accounting_balances() {
    let (engine, _device, cache) = setup(test_geom(16));
    let f = engine.register_file(9);
    let geom = engine.geometry().clone();
    let mut rng = StdRng::seed_from_u64(0x5e6f);

    for _ in 0..30 {
        let lbn = rng.gen_range(0..6u64);
        let len = rng.gen_range(1..=4096usize);
        cache.write_data(9, lbn, alloc::vec![0x77u8; len]);
        engine.flush_file(9).unwrap();
    }

    // Replay block ownership: every segment's usage must equal its stale
    // summaries plus whatever still lives there.
    let mut expected = alloc::vec![0u64; 16];
    let snap = engine.segment_usage_snapshot();
    for (sn, e) in snap.iter().enumerate() {
        expected[sn] += e.nsums as u64 * geom.block_size as u64;
    }
    let daddr = f.with(|st| st.inode.daddr.clone());
    for (lbn, ptr) in daddr.iter().enumerate() {
        if let Some(a) = ptr.addr() {
            let len = f.frag_len(lbn as u64, &geom);
            expected[geom.seg_of(a) as usize] += geom.frag_ceil(len as u64);
        }
    }
    let imap_addr = {
        let owner = engine.begin_op();
        let _tok = engine.lock_segments(owner);
        engine.imap.lock().entry(9).addr
    };
    if let Some(a) = imap_addr.addr() {
        expected[geom.seg_of(a) as usize] += geom.block_size as u64;
    }
    for (sn, e) in snap.iter().enumerate() {
        assert_eq!(
            e.bytes_used, expected[sn],
            "segment {} usage diverged from live blocks",
            sn
        );
    }
}

#[test]
fn duplicate_write_within_one_pass_is_tolerated() {
    let (engine, _device, cache) = setup(test_geom(8));
    let f = engine.register_file(9);
    let blk = cache.write_data(9, 0, alloc::vec![0x88u8; 4096]);

    let owner = engine.begin_op();
    let tok = engine.lock_segments(owner);
    engine.ensure_builder(&tok).unwrap();
    let addr = engine
        .with_builder(&tok, |ps| {
            assert!(ps.acquire_file(9, 1));
            match ps.offer(engine.geometry(), &blk) {
                crate::segment::Offer::Accepted { addr } => addr,
                crate::segment::Offer::Full => panic!("fresh segment refused a block"),
            }
        })
        .unwrap();

    // Pretend an earlier write in this same unflushed segment owned the
    // block, then relocate over it.
    f.set_root_ptr(crate::file::PtrRoot::Direct(0), BlockPtr::Addr(addr));
    engine
        .relocate(&tok, &f, BlockId::Data(0), addr + 4096, 4096)
        .unwrap();
    let dups = engine.with_builder(&tok, |ps| ps.dup_count).unwrap();
    assert_eq!(dups, 1);
}

#[test]
fn busy_blocks_are_redirtied_on_completion() {
    let (engine, device, cache) = setup(test_geom(8));
    let f = engine.register_file(9);
    let blk = cache.write_data(9, 0, alloc::vec![0x99u8; 4096]);

    let owner = engine.begin_op();
    let tok = engine.lock_segments(owner);
    engine.ensure_builder(&tok).unwrap();
    engine
        .with_builder(&tok, |ps| assert!(ps.acquire_file(9, 1)))
        .unwrap();
    engine.gather(&tok, &f, crate::gather::GatherClass::Data).unwrap();
    engine
        .with_builder(&tok, |ps| ps.release_file(false))
        .unwrap();

    device.set_defer(true);
    engine.write_segment(&tok).unwrap();
    drop(tok);
    assert!(blk.flags().contains(BlockFlags::BUSY));

    // A write racing the in-flight segment defers its dirtying intent.
    cache.mark_dirty(&blk);
    assert!(blk.flags().contains(BlockFlags::REDIRTY));

    device.complete_pending();
    engine.wait_io();
    let flags = blk.flags();
    assert!(!flags.contains(BlockFlags::BUSY));
    assert!(flags.contains(BlockFlags::DIRTY));
    assert!(cache.dirty_blocks(9).iter().any(|b| b.id() == BlockId::Data(0)));
}

#[test]
fn failed_segment_write_rolls_back_accounting() {
    let (engine, device, cache) = setup(test_geom(8));
    let f = engine.register_file(9);
    let blk = cache.write_data(9, 0, alloc::vec![0xaau8; 4096]);

    device.set_fail(true);
    engine.flush_file(9).unwrap();

    // The blocks are flagged and stay dirty for a later retry; the segment
    // must not read as used.
    let flags = blk.flags();
    assert!(flags.contains(BlockFlags::ERROR));
    assert!(flags.contains(BlockFlags::DIRTY));
    assert!(f.flags().contains(FileFlags::ALLMOD));
    let snap = engine.segment_usage_snapshot();
    assert_eq!(snap[0].bytes_used, 0);
    assert_eq!(snap[0].ninodes, 0);
    assert!(snap[0].flags().contains(SegFlags::EMPTY));
    assert!(!snap[0].flags().contains(SegFlags::DIRTY));
}

#[test]
fn pending_dirop_emits_a_continuation_record() {
    let (engine, device, _cache) = setup(test_geom(8));
    engine.register_file(5);
    engine.note_dirop(5).unwrap();

    engine.request_checkpoint(CkpFlags::FORCE | CkpFlags::SYNC).unwrap();

    let geom = engine.geometry().clone();
    let sums = scan_summaries(&device, &geom);
    let cont = sums
        .iter()
        .map(|(_, s)| s)
        .find(|s| s.cont)
        .expect("continuation summary missing");
    let finfo = cont.finfos.iter().find(|f| f.file == 5).unwrap();
    assert!(finfo.blocks.is_empty());
    assert!(!engine.file(5).unwrap().flags().contains(FileFlags::DIROP));
}

#[test]
fn low_water_wakes_the_cleaner() {
    let mut geom = test_geom(8);
    geom.low_water = 8;
    let (engine, _device, cache) = setup(geom);
    let probe = CleanerProbe::new();
    engine.set_cleaner(probe.clone());

    engine.register_file(9);
    cache.write_data(9, 0, alloc::vec![0xbbu8; 4096]);
    engine.flush_file(9).unwrap();
    assert!(probe.wakes.load(Ordering::Acquire) >= 1);
}

#[test]
fn exhausted_log_surfaces_no_clean_segment() {
    let (engine, _device, cache) = setup(test_geom(2));
    engine.register_file(9);

    let mut failed = None;
    for round in 0..40u64 {
        cache.write_data(9, round % 4, alloc::vec![0xccu8; 4096]);
        if let Err(e) = engine.flush_file(9) {
            failed = Some(e);
            break;
        }
    }
    assert_eq!(failed, Some(LfsError::NoCleanSegment));
}
