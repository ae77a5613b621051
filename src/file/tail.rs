//! The file tail: a small fixed-size record at EOF giving the index
//! extent's location and the final chained checksum (spec §3/§4.1/§6).

use crate::error::{Error, Result};

/// `[8B index_extent_offset][4B index_extent_len][4B chained_checksum]`.
pub const TAIL_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tail {
    pub index_extent_offset: u64,
    pub index_extent_len: u32,
    pub chained_checksum: u32,
}

impl Tail {
    pub fn encode(&self) -> [u8; TAIL_SIZE] {
        let mut out = [0u8; TAIL_SIZE];
        out[0..8].copy_from_slice(&self.index_extent_offset.to_le_bytes());
        out[8..12].copy_from_slice(&self.index_extent_len.to_le_bytes());
        out[12..16].copy_from_slice(&self.chained_checksum.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Tail> {
        if bytes.len() != TAIL_SIZE {
            return Err(Error::TruncatedTail);
        }
        Ok(Tail {
            index_extent_offset: u64::from_le_bytes(bytes[0..8].try_into().unwrap()),
            index_extent_len: u32::from_le_bytes(bytes[8..12].try_into().unwrap()),
            chained_checksum: u32::from_le_bytes(bytes[12..16].try_into().unwrap()),
        })
    }
}

/// Check a running chain against the tail's recorded value (spec §3:
/// "after reading extents in order, a running XOR equals the tail's stored
/// value"). Unused bytes of `running_chain` after the last data extent
/// already equal what the writer stored, so this is a plain equality check.
pub fn verify_chain(tail: &Tail, running_chain: u32) -> Result<()> {
    if tail.chained_checksum == running_chain {
        Ok(())
    } else {
        Err(Error::ChainBroken)
    }
}
