//! B-tree primitives: bulk build, descent search paths, and page I/O.

pub mod build;
pub mod fastpath;
pub mod find;
pub mod io;
pub mod scan;

use crate::error::{EngineError, Result};
use crate::types::{Downlink, BLCKSZ};

/// Maximum tree depth the builder supports.
pub const MAX_DEPTH: usize = 32;

/// Largest tuple the tree accepts; bigger values must be toasted first.
pub const MAX_TUPLE_SIZE: usize = BLCKSZ / 4;

/// Serialized size of a [`CheckpointFileHeader`].
pub const CHECKPOINT_FILE_HEADER_LEN: usize = 44;

/// Fixed-size record describing a finished tree, written to the relation's
/// seq-buf file at checkpoint time and by every bulk build.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CheckpointFileHeader {
    /// Downlink of the root page.
    pub root_downlink: Downlink,
    /// Bytes used in the data file.
    pub datafile_length: u64,
    /// Free blocks tracked for reuse.
    pub num_free_blocks: u64,
    /// Number of leaf pages in the tree.
    pub leaf_pages_num: u32,
    /// Next ctid counter value.
    pub ctid: u64,
    /// Next bridge ctid counter value.
    pub bridge_ctid: u64,
}

impl CheckpointFileHeader {
    /// Encodes the header into its on-disk little-endian form.
    pub fn encode(&self) -> [u8; CHECKPOINT_FILE_HEADER_LEN] {
        let mut buf = [0u8; CHECKPOINT_FILE_HEADER_LEN];
        buf[0..8].copy_from_slice(&self.root_downlink.to_le_bytes());
        buf[8..16].copy_from_slice(&self.datafile_length.to_le_bytes());
        buf[16..24].copy_from_slice(&self.num_free_blocks.to_le_bytes());
        buf[24..28].copy_from_slice(&self.leaf_pages_num.to_le_bytes());
        buf[28..36].copy_from_slice(&self.ctid.to_le_bytes());
        buf[36..44].copy_from_slice(&self.bridge_ctid.to_le_bytes());
        buf
    }

    /// Decodes a header from its on-disk form.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < CHECKPOINT_FILE_HEADER_LEN {
            return Err(EngineError::Corruption(
                "checkpoint file header truncated".into(),
            ));
        }
        Ok(Self {
            root_downlink: u64::from_le_bytes(buf[0..8].try_into().expect("8 bytes")),
            datafile_length: u64::from_le_bytes(buf[8..16].try_into().expect("8 bytes")),
            num_free_blocks: u64::from_le_bytes(buf[16..24].try_into().expect("8 bytes")),
            leaf_pages_num: u32::from_le_bytes(buf[24..28].try_into().expect("4 bytes")),
            ctid: u64::from_le_bytes(buf[28..36].try_into().expect("8 bytes")),
            bridge_ctid: u64::from_le_bytes(buf[36..44].try_into().expect("8 bytes")),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_header_roundtrip() {
        let header = CheckpointFileHeader {
            root_downlink: 0x8000_0000_0000_0003,
            datafile_length: 8192 * 7,
            num_free_blocks: 2,
            leaf_pages_num: 5,
            ctid: 100,
            bridge_ctid: 7,
        };
        let encoded = header.encode();
        assert_eq!(CheckpointFileHeader::decode(&encoded).expect("decode"), header);
    }
}
