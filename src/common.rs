//! Shared types for the segment engine: error taxonomy, identifiers and
//! the log geometry every component is parameterized over.

use alloc::vec::Vec;

use onlyerror::Error;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// File identifier as seen by the engine. The on-disk inode encoding is
/// owned by the surrounding filesystem; the engine only routes blocks.
pub type FileId = u64;

/// The inode-map file. Its blocks carry the segment usage table and the
/// file-id to inode-address map, and travel through the same write pipeline
/// as everything else.
pub const IFILE_ID: FileId = 1;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LfsError {
    /// Both selection passes failed; the log has no segment left to write
    /// into until the cleaner reclaims space.
    #[error("no clean segment available")]
    NoCleanSegment,
    /// Cluster or summary buffer could not be sized; the current checkpoint
    /// attempt is abandoned without touching flushed segments.
    #[error("allocation failure building segment write")]
    NoSpace,
    /// Transient condition, caller retries under its own bound.
    #[error("retry later")]
    Retry,
    #[error("device i/o error")]
    Io,
    #[error("corrupt on-disk structure")]
    Corrupt,
    #[error("unknown file")]
    NotFound,
    #[error("invalid geometry or argument")]
    Invalid,
}

pub type LfsResult<T> = Result<T, LfsError>;

/// Layout of the log device. Constructed once at mount and never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogGeometry {
    /// Native block size in bytes.
    pub block_size: u32,
    /// Fragment granularity; the last block of a file may occupy less than
    /// a full block, rounded up to this.
    pub frag_size: u32,
    /// Fixed byte size of one segment.
    pub segment_size: u64,
    pub nsegments: u32,
    /// Reserved superblock/label region at the start of the device. It
    /// overlaps segment 0, whose budget shrinks accordingly.
    pub label_bytes: u64,
    /// Direct block pointers per inode.
    pub ndaddr: usize,
    /// Upper bound on one coalesced device transfer.
    pub max_cluster: u32,
    /// Segment selection starts scanning at current + interleave.
    pub interleave: u32,
    /// Below this many clean segments, non-checkpoint writes escalate and
    /// the cleaner is woken.
    pub low_water: u32,
    /// More ACTIVE segments than this forces a checkpoint.
    pub active_limit: u32,
    /// Iteration bound for the inode-map fixed-point flush.
    pub imap_flush_bound: u32,
    /// Bound on seal-and-retry loops while placing an inode block.
    pub inode_retry_bound: u32,
}

impl LogGeometry {
    pub fn with_defaults(nsegments: u32) -> Self {
        let block_size = crate::DEFAULT_BLOCK_SIZE;
        Self {
            block_size,
            frag_size: block_size / 8,
            segment_size: 1024 * 1024,
            nsegments,
            label_bytes: block_size as u64,
            ndaddr: 12,
            max_cluster: 64 * 1024,
            interleave: 1,
            low_water: 2,
            active_limit: 4,
            imap_flush_bound: 4,
            inode_retry_bound: 3,
        }
    }

    pub fn validate(&self) -> LfsResult<()> {
        if self.block_size == 0
            || self.frag_size == 0
            || self.block_size % self.frag_size != 0
            || self.segment_size < 4 * self.block_size as u64
            || self.nsegments < 2
            || self.label_bytes >= self.segment_size
            || self.ndaddr == 0
            || self.max_cluster < self.block_size
        {
            return Err(LfsError::Invalid);
        }
        Ok(())
    }

    /// Byte offset where segment `sn` starts. Segment 0 contains the label
    /// region; see [`Self::usable_start`].
    pub fn seg_start(&self, sn: u32) -> u64 {
        sn as u64 * self.segment_size
    }

    pub fn seg_end(&self, sn: u32) -> u64 {
        self.seg_start(sn) + self.segment_size
    }

    /// First byte of `sn` that segment data may occupy.
    pub fn usable_start(&self, sn: u32) -> u64 {
        if sn == 0 {
            self.label_bytes
        } else {
            self.seg_start(sn)
        }
    }

    pub fn seg_of(&self, addr: u64) -> u32 {
        (addr / self.segment_size) as u32
    }

    /// Pointers held by one indirect block.
    pub fn nindir(&self) -> u64 {
        self.block_size as u64 / crate::block::PTR_BYTES as u64
    }

    /// Bytes a block of `len` occupies on the log (fragment rounding).
    pub fn frag_ceil(&self, len: u64) -> u64 {
        let f = self.frag_size as u64;
        (len + f - 1) / f * f
    }

    /// Native blocks a buffer of `len` counts as for budget purposes.
    /// Oversized page-cluster buffers count as several.
    pub fn blocks_of(&self, len: u64) -> u32 {
        let b = self.block_size as u64;
        ((len + b - 1) / b).max(1) as u32
    }
}

// Persisted structures share one framing: [len: u32 le][serde_json payload],
// optionally zero-padded out to a block.

pub(crate) fn frame_bytes<T: Serialize>(v: &T) -> LfsResult<Vec<u8>> {
    let payload = serde_json::to_vec(v).map_err(|_| LfsError::Corrupt)?;
    let mut out = Vec::with_capacity(4 + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

pub(crate) fn frame_into_block<T: Serialize>(v: &T, block_size: usize) -> LfsResult<Vec<u8>> {
    let mut out = frame_bytes(v)?;
    if out.len() > block_size {
        return Err(LfsError::NoSpace);
    }
    out.resize(block_size, 0);
    Ok(out)
}

pub(crate) fn unframe<T: DeserializeOwned>(bytes: &[u8]) -> LfsResult<T> {
    if bytes.len() < 4 {
        return Err(LfsError::Corrupt);
    }
    let len = u32::from_le_bytes(bytes[..4].try_into().unwrap()) as usize;
    if len == 0 || bytes.len() < 4 + len {
        return Err(LfsError::Corrupt);
    }
    serde_json::from_slice(&bytes[4..4 + len]).map_err(|_| LfsError::Corrupt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_defaults_validate() {
        let geom = LogGeometry::with_defaults(8);
        assert!(geom.validate().is_ok());
        assert_eq!(geom.seg_of(geom.seg_start(3)), 3);
        assert_eq!(geom.usable_start(0), geom.label_bytes);
        assert_eq!(geom.usable_start(1), geom.segment_size);
    }

    #[test]
    fn fragment_rounding() {
        let geom = LogGeometry::with_defaults(8);
        assert_eq!(geom.frag_ceil(1), geom.frag_size as u64);
        assert_eq!(geom.frag_ceil(geom.block_size as u64), geom.block_size as u64);
        assert_eq!(geom.blocks_of(1), 1);
        assert_eq!(geom.blocks_of(geom.block_size as u64 * 2), 2);
    }

    #[test]
    fn framing_roundtrip() {
        let geom = LogGeometry::with_defaults(8);
        let block = frame_into_block(&geom, 4096).unwrap();
        assert_eq!(block.len(), 4096);
        let back: LogGeometry = unframe(&block).unwrap();
        assert_eq!(back.nsegments, 8);
    }
}
