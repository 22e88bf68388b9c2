//! The checkpoint record. One fixed-location block; either it decodes with
//! a matching checksum or recovery ignores it and falls back to the
//! previous checkpoint's segments.

use alloc::vec::Vec;

use serde::{Deserialize, Serialize};

use crate::block::BlockPtr;
use crate::common::{frame_into_block, unframe, LfsError, LfsResult, LogGeometry};
use crate::segment::crc32;

pub const SB_MAGIC: u32 = 0x4c66_5332;
pub const SB_VERSION: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuperBlock {
    pub magic: u32,
    pub version: u32,
    pub block_size: u32,
    pub segment_size: u64,
    pub nsegments: u32,
    /// Segment being filled when the checkpoint completed.
    pub curseg: u32,
    /// Serial of the newest segment this checkpoint covers. Segments with
    /// higher serials postdate the checkpoint and belong to roll-forward.
    pub serial: u64,
    pub clean: u32,
    /// Location of the inode-map file's inode.
    pub imap_addr: BlockPtr,
    pub imap_version: u32,
    pub timestamp: u64,
    pub checksum: u32,
}

impl SuperBlock {
    pub fn new(geom: &LogGeometry) -> Self {
        Self {
            magic: SB_MAGIC,
            version: SB_VERSION,
            block_size: geom.block_size,
            segment_size: geom.segment_size,
            nsegments: geom.nsegments,
            curseg: 0,
            serial: 0,
            clean: geom.nsegments,
            imap_addr: BlockPtr::Unallocated,
            imap_version: 0,
            timestamp: 0,
            checksum: 0,
        }
    }

    /// Serialize into one label-region block, stamping the checksum over
    /// the encoding with the checksum field zeroed.
    pub fn encode(&self, block_size: usize) -> LfsResult<Vec<u8>> {
        let mut rec = self.clone();
        rec.checksum = 0;
        let bare = frame_into_block(&rec, block_size)?;
        rec.checksum = crc32(&bare);
        frame_into_block(&rec, block_size)
    }

    pub fn decode(bytes: &[u8]) -> LfsResult<SuperBlock> {
        let rec: SuperBlock = unframe(bytes)?;
        if rec.magic != SB_MAGIC || rec.version != SB_VERSION {
            return Err(LfsError::Corrupt);
        }
        let mut bare = rec.clone();
        bare.checksum = 0;
        let encoded = frame_into_block(&bare, bytes.len())?;
        if crc32(&encoded) != rec.checksum {
            return Err(LfsError::Corrupt);
        }
        Ok(rec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip() {
        let geom = LogGeometry::with_defaults(8);
        let mut sb = SuperBlock::new(&geom);
        sb.curseg = 3;
        sb.serial = 42;
        sb.imap_addr = BlockPtr::Addr(0x2000);
        let bytes = sb.encode(geom.block_size as usize).unwrap();
        assert_eq!(bytes.len(), geom.block_size as usize);
        let back = SuperBlock::decode(&bytes).unwrap();
        assert_eq!(back.curseg, 3);
        assert_eq!(back.serial, 42);
        assert_eq!(back.imap_addr, BlockPtr::Addr(0x2000));
        assert_ne!(back.checksum, 0);
    }

    #[test]
    fn corruption_is_detected() {
        let geom = LogGeometry::with_defaults(8);
        let sb = SuperBlock::new(&geom);
        let mut bytes = sb.encode(geom.block_size as usize).unwrap();
        bytes[20] ^= 0xff;
        assert_eq!(SuperBlock::decode(&bytes), Err(LfsError::Corrupt));
    }
}
