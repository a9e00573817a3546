//! Byte-level delta primitive.
//!
//! The bundle format treats deltas as opaque payloads; anything that can
//! rebuild `target` from `base` plus the payload implements [`DeltaCodec`].
//! [`BlockDelta`] is the built-in codec: rsync-style block matching that
//! emits copy/insert chunks, serialized with bincode.

mod apply;
mod diff;

use serde::{Deserialize, Serialize};

use crate::error::{PatchError, Result};

pub use apply::apply_chunks;
pub use diff::compute_chunks;

/// Default block size for matching. Small enough to find shared runs in
/// class-file sized inputs.
pub const DEFAULT_BLOCK_SIZE: usize = 256;

/// Computes and applies binary deltas.
pub trait DeltaCodec: Send + Sync {
    /// Produce a payload that rebuilds `target` from `base`. Never empty.
    fn compute(&self, base: &[u8], target: &[u8]) -> Result<Vec<u8>>;

    /// Rebuild the target from `base` and a payload made by `compute`.
    fn patch(&self, base: &[u8], delta: &[u8]) -> Result<Vec<u8>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiffChunk {
    Copy { offset: u64, length: u64 },
    Insert { data: Vec<u8> },
}

/// Block-matching codec.
#[derive(Debug, Clone, Copy)]
pub struct BlockDelta {
    block_size: usize,
}

impl BlockDelta {
    pub fn new() -> Self {
        Self::with_block_size(DEFAULT_BLOCK_SIZE)
    }

    /// A block size of zero is bumped to one.
    pub fn with_block_size(block_size: usize) -> Self {
        Self {
            block_size: block_size.max(1),
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }
}

impl Default for BlockDelta {
    fn default() -> Self {
        Self::new()
    }
}

impl DeltaCodec for BlockDelta {
    fn compute(&self, base: &[u8], target: &[u8]) -> Result<Vec<u8>> {
        let chunks = compute_chunks(base, target, self.block_size);
        bincode::serialize(&chunks)
            .map_err(|e| PatchError::Delta(format!("Failed to encode delta: {e}")))
    }

    fn patch(&self, base: &[u8], delta: &[u8]) -> Result<Vec<u8>> {
        let chunks: Vec<DiffChunk> = bincode::deserialize(delta)
            .map_err(|e| PatchError::Delta(format!("Failed to decode delta: {e}")))?;
        apply_chunks(base, &chunks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_rebuilds_target() {
        let codec = BlockDelta::with_block_size(16);
        let base: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        let mut target = base.clone();
        target.splice(1000..1000, b"inserted run".iter().copied());
        target.truncate(3000);

        let delta = codec.compute(&base, &target).unwrap();
        assert!(delta.len() < target.len());
        assert_eq!(codec.patch(&base, &delta).unwrap(), target);
    }

    #[test]
    fn test_delta_never_empty() {
        let codec = BlockDelta::new();
        assert!(!codec.compute(b"", b"").unwrap().is_empty());
        assert!(!codec.compute(b"abc", b"").unwrap().is_empty());
    }

    #[test]
    fn test_garbage_payload_rejected() {
        let codec = BlockDelta::new();
        let err = codec.patch(b"base", &[0xff; 3]).unwrap_err();
        assert!(matches!(err, PatchError::Delta(_)));
    }

    #[test]
    fn test_zero_block_size_clamped() {
        assert_eq!(BlockDelta::with_block_size(0).block_size(), 1);
    }
}
