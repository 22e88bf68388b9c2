//! The engine handle: every piece of process-wide state the segment
//! pipeline needs, constructed at mount and passed explicitly. No ambient
//! globals.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use log::{debug, warn};
use spin::Mutex;

use crate::block::BlockCache;
use crate::cluster::{ClusterCtx, IoGate};
use crate::common::{FileId, LfsError, LfsResult, LogGeometry, IFILE_ID};
use crate::device::BlockDevice;
use crate::file::FileMeta;
use crate::imap::InodeMap;
use crate::lock::{SegLock, SegToken};
use crate::segment::PartialSegment;
use crate::superblock::SuperBlock;
use crate::usage::{SegUsageEntry, SpaceAccountant};

/// Wake-up side of the cleaner; the engine only ever pokes it.
pub trait CleanerSignal: Send + Sync {
    fn wake(&self);
}

pub(crate) struct BuilderSlot {
    pub cur: Option<PartialSegment>,
    pub curseg: u32,
    /// Next unassigned byte of the current segment.
    pub cursor: u64,
}

/// Outcome of a `write_segment` call.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct SegWrite {
    pub wrote: bool,
    /// Gathering did not start from a clean state (truncation raced); the
    /// pass must be redone immediately.
    pub redo: bool,
    /// The inode-map file's own write crossed a segment boundary; its
    /// just-persisted accounting is stale.
    pub crossed: bool,
}

pub struct Engine<D: BlockDevice> {
    pub(crate) geom: LogGeometry,
    pub(crate) device: Arc<D>,
    pub(crate) cache: Arc<dyn BlockCache>,
    pub(crate) files: Arc<Mutex<BTreeMap<FileId, Arc<FileMeta>>>>,
    pub(crate) usage: Arc<Mutex<SpaceAccountant>>,
    pub(crate) imap: Mutex<InodeMap>,
    pub(crate) seglock: SegLock,
    pub(crate) builder: Mutex<BuilderSlot>,
    pub(crate) io: Arc<IoGate>,
    serial: AtomicU64,
    pub(crate) clock: Arc<AtomicU64>,
    next_owner: AtomicU64,
    /// Superblock single-writer flag, distinct from the segment lock.
    sb_busy: AtomicBool,
    pub(crate) sb: Mutex<SuperBlock>,
    cleaner: Mutex<Option<Arc<dyn CleanerSignal>>>,
}

impl<D: BlockDevice> Engine<D> {
    pub fn new(device: Arc<D>, cache: Arc<dyn BlockCache>, geom: LogGeometry) -> LfsResult<Arc<Self>> {
        geom.validate()?;
        if device.size() < geom.nsegments as u64 * geom.segment_size {
            return Err(LfsError::Invalid);
        }
        let usage = SpaceAccountant::new(&geom);
        let cursor = geom.usable_start(0);
        let sb = SuperBlock::new(&geom);
        let engine = Arc::new(Self {
            device,
            cache,
            files: Arc::new(Mutex::new(BTreeMap::new())),
            usage: Arc::new(Mutex::new(usage)),
            imap: Mutex::new(InodeMap::new()),
            seglock: SegLock::new(),
            builder: Mutex::new(BuilderSlot {
                cur: None,
                curseg: 0,
                cursor,
            }),
            io: Arc::new(IoGate::new()),
            serial: AtomicU64::new(0),
            clock: Arc::new(AtomicU64::new(0)),
            next_owner: AtomicU64::new(1),
            sb_busy: AtomicBool::new(false),
            sb: Mutex::new(sb),
            cleaner: Mutex::new(None),
            geom,
        });
        engine.register_file(IFILE_ID);
        Ok(engine)
    }

    pub fn geometry(&self) -> &LogGeometry {
        &self.geom
    }

    /// Monotonic engine tick used for mtimes and summary timestamps.
    pub(crate) fn now(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn next_serial(&self) -> u64 {
        self.serial.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn last_serial(&self) -> u64 {
        self.serial.load(Ordering::Acquire)
    }

    /// Owner id for one logical operation; passed through the segment lock
    /// so nested entry into the write path is recognized.
    pub fn begin_op(&self) -> u64 {
        self.next_owner.fetch_add(1, Ordering::AcqRel)
    }

    pub fn lock_segments(&self, owner: u64) -> SegToken<'_> {
        self.seglock.acquire(owner)
    }

    pub fn register_file(&self, id: FileId) -> Arc<FileMeta> {
        self.files
            .lock()
            .entry(id)
            .or_insert_with(|| FileMeta::new(id, &self.geom))
            .clone()
    }

    pub fn file(&self, id: FileId) -> LfsResult<Arc<FileMeta>> {
        self.files.lock().get(&id).cloned().ok_or(LfsError::NotFound)
    }

    /// Record that a rename/link/unlink touching `id` awaits durability.
    pub fn note_dirop(&self, id: FileId) -> LfsResult<()> {
        let f = self.file(id)?;
        f.set_flags(crate::file::FileFlags::DIROP | crate::file::FileFlags::ALLMOD);
        Ok(())
    }

    pub fn set_cleaner(&self, cleaner: Arc<dyn CleanerSignal>) {
        *self.cleaner.lock() = Some(cleaner);
    }

    pub fn wake_cleaner(&self) {
        if let Some(c) = self.cleaner.lock().as_ref() {
            c.wake();
        }
    }

    /// Cleaner-facing read access to the usage table.
    pub fn segment_usage_snapshot(&self) -> Vec<SegUsageEntry> {
        self.usage.lock().snapshot()
    }

    /// Cleaner bookkeeping: `sn` has been emptied.
    pub fn note_cleaned(&self, sn: u32) -> LfsResult<()> {
        if sn >= self.geom.nsegments {
            return Err(LfsError::Invalid);
        }
        let now = self.now();
        self.usage.lock().note_cleaned(sn, now);
        Ok(())
    }

    pub fn clean_count(&self) -> u32 {
        self.usage.lock().clean_count()
    }

    /// Last durably written checkpoint record.
    pub fn superblock(&self) -> SuperBlock {
        self.sb.lock().clone()
    }

    /// Block until every submitted segment write has settled.
    pub fn wait_io(&self) {
        self.io.wait_drained();
    }

    pub(crate) fn ctx(&self) -> ClusterCtx {
        ClusterCtx {
            cache: self.cache.clone(),
            files: self.files.clone(),
            usage: self.usage.clone(),
            io: self.io.clone(),
            clock: self.clock.clone(),
        }
    }

    /// Move the log into the next writable segment.
    fn advance_locked(&self, slot: &mut BuilderSlot) -> LfsResult<()> {
        let next = {
            let usage = self.usage.lock();
            usage.select_next_segment(slot.curseg)?
        };
        self.usage.lock().mark_active(next);
        slot.curseg = next;
        slot.cursor = self.geom.usable_start(next);
        debug!("log advances to segment {}", next);
        Ok(())
    }

    /// Make sure an open partial segment exists.
    pub(crate) fn ensure_builder(&self, _tok: &SegToken<'_>) -> LfsResult<()> {
        let mut slot = self.builder.lock();
        if slot.cur.is_some() {
            return Ok(());
        }
        if !PartialSegment::fits(&self.geom, slot.curseg, slot.cursor) {
            self.advance_locked(&mut slot)?;
        }
        slot.cur = Some(PartialSegment::begin(&self.geom, slot.curseg, slot.cursor));
        Ok(())
    }

    pub(crate) fn with_builder<R>(
        &self,
        tok: &SegToken<'_>,
        f: impl FnOnce(&mut PartialSegment) -> R,
    ) -> LfsResult<R> {
        self.ensure_builder(tok)?;
        let mut slot = self.builder.lock();
        Ok(f(slot.cur.as_mut().expect("builder just ensured")))
    }

    /// Seal and flush the current partial segment, then immediately open
    /// the next one unless the log has run out of segments.
    pub(crate) fn write_segment(&self, tok: &SegToken<'_>) -> LfsResult<SegWrite> {
        // Stale pointers would otherwise go to disk inside this batch.
        self.flush_pointers(tok)?;

        let mut slot = self.builder.lock();
        let ps = match slot.cur.take() {
            Some(ps) => ps,
            None => return Ok(SegWrite::default()),
        };
        if ps.is_empty() {
            slot.cur = Some(ps);
            return Ok(SegWrite::default());
        }

        let seg = ps.seg();
        let bs = self.geom.block_size as u64;
        let next_hint = if ps.end_addr() + 2 * bs <= self.geom.seg_end(seg) {
            seg
        } else {
            self.usage
                .lock()
                .select_next_segment(seg)
                .unwrap_or(seg)
        };
        let serial = self.next_serial();
        let now = self.now();
        let sealed = match ps.seal(&self.geom, serial, now, next_hint) {
            Ok(sealed) => sealed,
            Err(e) => {
                // The builder is gone but its blocks were released; the
                // orchestrator abandons this attempt.
                warn!("segment {} seal failed: {:?}", seg, e);
                return Err(e);
            }
        };

        slot.cursor = sealed.end_addr;
        let redo = !sealed.clean_start;
        let had_ifile = sealed.had_ifile;

        {
            let mut usage = self.usage.lock();
            usage.charge(seg, sealed.charged, now);
            usage.note_summary(seg);
        }
        crate::cluster::submit(&*self.device, &self.ctx(), &self.geom, sealed);

        let mut crossed = false;
        if !PartialSegment::fits(&self.geom, slot.curseg, slot.cursor) {
            match self.advance_locked(&mut slot) {
                Ok(()) => crossed = had_ifile,
                Err(LfsError::NoCleanSegment) => {
                    warn!("log is out of clean segments");
                    return Err(LfsError::NoCleanSegment);
                }
                Err(e) => return Err(e),
            }
        }
        slot.cur = Some(PartialSegment::begin(&self.geom, slot.curseg, slot.cursor));
        Ok(SegWrite {
            wrote: true,
            redo,
            crossed,
        })
    }

    /// Write the checkpoint record. A concurrent superblock write finishes
    /// first; two can never race each other.
    pub(crate) fn write_superblock(&self) -> LfsResult<()> {
        while self
            .sb_busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            core::hint::spin_loop();
        }

        let record = {
            let slot = self.builder.lock();
            let usage = self.usage.lock();
            let imap_ent = self.imap.lock().entry(IFILE_ID);
            let mut sb = self.sb.lock().clone();
            sb.curseg = slot.curseg;
            sb.serial = self.last_serial();
            sb.clean = usage.clean_count();
            sb.imap_addr = imap_ent.addr;
            sb.imap_version = imap_ent.version;
            sb.timestamp = self.now();
            sb
        };
        let bytes = match record.encode(self.geom.block_size as usize) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.sb_busy.store(false, Ordering::Release);
                return Err(e);
            }
        };
        *self.sb.lock() = record;

        let io = self.io.clone();
        let done_flag = Arc::new(AtomicBool::new(false));
        let done_in_cb = done_flag.clone();
        io.begin();
        self.device.write_async(
            0,
            bytes,
            alloc::boxed::Box::new(move |res| {
                if let Err(e) = res {
                    log::error!("superblock write failed: {:?}", e);
                }
                done_in_cb.store(true, Ordering::Release);
                io.complete();
            }),
        );
        // The single-writer window closes only once the block is durable.
        while !done_flag.load(Ordering::Acquire) {
            core::hint::spin_loop();
        }
        self.sb_busy.store(false, Ordering::Release);
        Ok(())
    }
}
