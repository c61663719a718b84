//! Chunk sizing: one shot for small files, fixed blocks for large ones.

use serde::Deserialize;

use crate::frame::{CHUNK_PREFIX_LEN, MAX_FRAME_LEN};

/// Files smaller than this go out as a single chunk.
pub const DEFAULT_THRESHOLD: u64 = 2_000_000;

/// Block size for files at or above the threshold.
pub const DEFAULT_BLOCK_SIZE: u64 = 200_000;

/// Adaptive chunk-size policy. Decided once per transfer from its total size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChunkPolicy {
    #[serde(default = "default_threshold")]
    pub threshold: u64,
    #[serde(default = "default_block_size")]
    pub block_size: u64,
}

fn default_threshold() -> u64 {
    DEFAULT_THRESHOLD
}
fn default_block_size() -> u64 {
    DEFAULT_BLOCK_SIZE
}

impl Default for ChunkPolicy {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

impl ChunkPolicy {
    /// Largest chunk this policy will produce for a file of `total_size` bytes.
    pub fn chunk_len(&self, total_size: u64) -> u64 {
        if total_size < self.threshold {
            total_size
        } else {
            self.block_size
        }
    }

    /// Check that every chunk fits in one frame.
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.block_size == 0 {
            return Err(PolicyError::ZeroBlockSize);
        }
        let max_data = u64::from(MAX_FRAME_LEN) - CHUNK_PREFIX_LEN as u64;
        // A single-shot chunk can be up to threshold - 1 bytes.
        let largest = self.block_size.max(self.threshold.saturating_sub(1));
        if largest > max_data {
            return Err(PolicyError::ExceedsFrame(largest));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    #[error("block size must be non-zero")]
    ZeroBlockSize,
    #[error("chunks of {0} bytes do not fit in a frame")]
    ExceedsFrame(u64),
}

/// One slice of a transfer: byte range + sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpan {
    pub sequence: u32,
    pub offset: u64,
    pub len: u64,
}

impl ChunkSpan {
    pub fn end(&self) -> u64 {
        self.offset + self.len
    }
}

/// Split `total_len` bytes into spans under `policy`. Empty files have no chunks.
pub fn plan_chunks(total_len: u64, policy: &ChunkPolicy) -> Vec<ChunkSpan> {
    let size = policy.chunk_len(total_len).max(1);
    let mut out = Vec::new();
    let mut offset = 0u64;
    let mut sequence = 0u32;
    while offset < total_len {
        let len = size.min(total_len - offset);
        out.push(ChunkSpan {
            sequence,
            offset,
            len,
        });
        offset += len;
        sequence += 1;
    }
    out
}
