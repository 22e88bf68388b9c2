//! The inode-map file: the file-id to inode-address map plus the persisted
//! copy of the segment usage table.
//!
//! Its blocks are regenerated from the in-memory tables and pushed through
//! the same segment pipeline as ordinary files, which is what creates the
//! re-entrancy the checkpoint orchestrator's fixed-point flush resolves.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use serde::{Deserialize, Serialize};

use crate::block::BlockPtr;
use crate::common::{frame_bytes, unframe, FileId, LfsResult};
use crate::usage::SegUsageEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImapEntry {
    pub addr: BlockPtr,
    pub version: u32,
}

impl Default for ImapEntry {
    fn default() -> Self {
        Self {
            addr: BlockPtr::Unallocated,
            version: 0,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct ImapImage {
    usage: Vec<SegUsageEntry>,
    files: Vec<(FileId, ImapEntry)>,
}

pub struct InodeMap {
    files: BTreeMap<FileId, ImapEntry>,
}

impl InodeMap {
    pub fn new() -> Self {
        Self {
            files: BTreeMap::new(),
        }
    }

    pub fn entry(&self, file: FileId) -> ImapEntry {
        self.files.get(&file).copied().unwrap_or_default()
    }

    /// Record a new inode location; returns the superseded entry so the
    /// caller can release its segment.
    pub fn set(&mut self, file: FileId, addr: BlockPtr, version: u32) -> ImapEntry {
        let prev = self.entry(file);
        self.files.insert(file, ImapEntry { addr, version });
        prev
    }

    pub fn remove(&mut self, file: FileId) -> ImapEntry {
        let prev = self.entry(file);
        self.files.remove(&file);
        prev
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Serialize the map and the usage table into block-sized chunks, the
    /// dirty image of the inode-map file.
    pub fn encode(&self, usage: &[SegUsageEntry], block_size: usize) -> LfsResult<Vec<Vec<u8>>> {
        let image = ImapImage {
            usage: usage.to_vec(),
            files: self.files.iter().map(|(k, v)| (*k, *v)).collect(),
        };
        let framed = frame_bytes(&image)?;
        let mut blocks = Vec::new();
        for chunk in framed.chunks(block_size) {
            let mut block = chunk.to_vec();
            block.resize(block_size, 0);
            blocks.push(block);
        }
        if blocks.is_empty() {
            blocks.push(alloc::vec![0u8; block_size]);
        }
        Ok(blocks)
    }

    pub fn decode(blocks: &[Vec<u8>]) -> LfsResult<(InodeMap, Vec<SegUsageEntry>)> {
        let mut bytes = Vec::new();
        for b in blocks {
            bytes.extend_from_slice(b);
        }
        let image: ImapImage = unframe(&bytes)?;
        Ok((
            InodeMap {
                files: image.files.into_iter().collect(),
            },
            image.usage,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::LogGeometry;
    use crate::usage::SpaceAccountant;

    #[test]
    fn set_returns_superseded_entry() {
        let mut m = InodeMap::new();
        assert_eq!(m.set(7, BlockPtr::Addr(4096), 1), ImapEntry::default());
        let prev = m.set(7, BlockPtr::Addr(8192), 1);
        assert_eq!(prev.addr, BlockPtr::Addr(4096));
        assert_eq!(m.entry(7).addr, BlockPtr::Addr(8192));
    }

    #[test]
    fn encode_decode_roundtrip() {
        let geom = LogGeometry::with_defaults(8);
        let mut acc = SpaceAccountant::new(&geom);
        acc.charge(3, 12345, 9);
        let mut m = InodeMap::new();
        for f in 2..40u64 {
            m.set(f, BlockPtr::Addr(f * 4096), f as u32);
        }
        let blocks = m.encode(&acc.snapshot(), 512).unwrap();
        assert!(blocks.len() > 1, "image should span several small blocks");
        assert!(blocks.iter().all(|b| b.len() == 512));

        let (back, usage) = InodeMap::decode(&blocks).unwrap();
        assert_eq!(back.entry(17).addr, BlockPtr::Addr(17 * 4096));
        assert_eq!(usage[3].bytes_used, 12345);
    }

    #[test]
    fn truncated_image_is_rejected() {
        let mut m = InodeMap::new();
        m.set(2, BlockPtr::Addr(4096), 1);
        let blocks = m.encode(&[], 4096).unwrap();
        let cut = alloc::vec![blocks[0][..8].to_vec()];
        assert!(InodeMap::decode(&cut).is_err());
    }
}
