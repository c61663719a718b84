//! File transfer manager: admission, per-transfer state, and the ready set the
//! scheduler round-robins over.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::chunk::{ChunkPolicy, ChunkSpan};
use crate::error::LinkError;

/// Outbound transfer identifier. Assigned by the sender, unique per link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferId(pub u32);

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    /// Admitted, no chunk scheduled yet.
    Queued,
    /// At least one chunk scheduled, bytes remaining.
    Active,
    /// Final chunk handed to the writer, not yet on the wire.
    Draining,
    Completed,
    Failed,
}

/// One outbound file.
#[derive(Debug, Clone)]
pub struct FileTransfer {
    pub id: TransferId,
    pub path: PathBuf,
    /// Name announced to the peer.
    pub name: String,
    /// Higher is more urgent.
    pub priority: i32,
    pub total_size: u64,
    remaining: u64,
    next_offset: u64,
    next_sequence: u32,
    chunk_len: u64,
    state: TransferState,
}

impl FileTransfer {
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    fn is_ready(&self) -> bool {
        self.remaining > 0 && matches!(self.state, TransferState::Queued | TransferState::Active)
    }

    fn take_span(&mut self) -> ChunkSpan {
        let len = self.chunk_len.min(self.remaining);
        let span = ChunkSpan {
            sequence: self.next_sequence,
            offset: self.next_offset,
            len,
        };
        self.next_offset += len;
        self.next_sequence += 1;
        self.remaining -= len;
        self.state = if self.remaining == 0 {
            TransferState::Draining
        } else {
            TransferState::Active
        };
        span
    }
}

/// The next chunk the writer should produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPick {
    pub id: TransferId,
    pub path: PathBuf,
    pub span: ChunkSpan,
    /// This is the transfer's final chunk.
    pub last: bool,
}

/// What admission learned about a source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceInfo {
    pub name: String,
    pub size: u64,
}

/// Check that `path` is a readable regular file and read its size.
pub async fn inspect_source(path: &Path) -> Result<SourceInfo, LinkError> {
    let not_found = || LinkError::SourceNotFound(path.to_path_buf());
    let file = tokio::fs::File::open(path).await.map_err(|_| not_found())?;
    let meta = file.metadata().await.map_err(|_| not_found())?;
    if !meta.is_file() {
        return Err(not_found());
    }
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(not_found)?;
    Ok(SourceInfo {
        name,
        size: meta.len(),
    })
}

/// Owns every outbound transfer until it completes or fails.
pub struct TransferManager {
    transfers: BTreeMap<TransferId, FileTransfer>,
    last_served: Option<TransferId>,
    next_id: u32,
    policy: ChunkPolicy,
}

impl TransferManager {
    pub fn new(policy: ChunkPolicy) -> Self {
        Self {
            transfers: BTreeMap::new(),
            last_served: None,
            next_id: 1,
            policy,
        }
    }

    /// Register a transfer in `Queued`. The chunk size is fixed here from the total size.
    pub fn admit(&mut self, path: PathBuf, name: String, total_size: u64, priority: i32) -> TransferId {
        let id = TransferId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        self.transfers.insert(
            id,
            FileTransfer {
                id,
                path,
                name,
                priority,
                total_size,
                remaining: total_size,
                next_offset: 0,
                next_sequence: 0,
                chunk_len: self.policy.chunk_len(total_size).max(1),
                state: TransferState::Queued,
            },
        );
        id
    }

    #[cfg(test)]
    pub(crate) fn get(&self, id: TransferId) -> Option<&FileTransfer> {
        self.transfers.get(&id)
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }

    /// Transfers with bytes left at the highest priority present, in id order.
    pub fn ready_set(&self) -> Vec<TransferId> {
        let Some(top) = self
            .transfers
            .values()
            .filter(|t| t.is_ready())
            .map(|t| t.priority)
            .max()
        else {
            return Vec::new();
        };
        self.transfers
            .values()
            .filter(|t| t.is_ready() && t.priority == top)
            .map(|t| t.id)
            .collect()
    }

    pub fn has_ready(&self) -> bool {
        self.transfers.values().any(FileTransfer::is_ready)
    }

    /// Advance one transfer of the ready set by one chunk, rotating by id.
    pub fn next_chunk(&mut self) -> Option<ChunkPick> {
        let ready = self.ready_set();
        let first = *ready.first()?;
        let id = self
            .last_served
            .and_then(|last| ready.iter().copied().find(|&id| id > last))
            .unwrap_or(first);
        self.last_served = Some(id);
        let transfer = self.transfers.get_mut(&id)?;
        let span = transfer.take_span();
        Some(ChunkPick {
            id,
            path: transfer.path.clone(),
            span,
            last: transfer.state == TransferState::Draining,
        })
    }

    /// The final chunk is on the wire: the transfer is done and discarded.
    pub fn complete(&mut self, id: TransferId) -> Option<FileTransfer> {
        let mut transfer = self.transfers.remove(&id)?;
        transfer.state = TransferState::Completed;
        Some(transfer)
    }

    /// Source I/O failed: the transfer is discarded.
    pub fn fail(&mut self, id: TransferId) -> Option<FileTransfer> {
        let mut transfer = self.transfers.remove(&id)?;
        transfer.state = TransferState::Failed;
        Some(transfer)
    }
}
