//! Link configuration.

use std::path::PathBuf;

use crate::chunk::ChunkPolicy;
use crate::error::LinkError;

#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Chunk sizing for outbound transfers.
    pub chunk: ChunkPolicy,
    /// Where incoming files are written.
    pub download_dir: PathBuf,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            chunk: ChunkPolicy::default(),
            download_dir: PathBuf::from("."),
        }
    }
}

impl LinkConfig {
    pub fn validate(&self) -> Result<(), LinkError> {
        self.chunk.validate()?;
        Ok(())
    }
}
