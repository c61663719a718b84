//! Outbound scheduler: decides which frame the writer puts on the wire next.
//!
//! Policy per pick:
//!   1. anything in the priority queue (text, file start/end, resend traffic), FIFO;
//!   2. otherwise one chunk from the ready set of file transfers, round-robin.
//!
//! The priority queue is consulted before every chunk, so queued text waits for
//! at most the chunk currently being written.

use std::collections::VecDeque;
use std::path::PathBuf;

use crate::chunk::ChunkPolicy;
use crate::frame::{Frame, FrameKind, MAGIC};
use crate::transfer::{ChunkPick, FileTransfer, TransferId, TransferManager};

/// One unit of work for the writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundItem {
    /// Encode and write.
    Frame(Frame),
    /// Write these already-encoded bytes verbatim.
    Retransmit(Vec<u8>),
    /// Read this span from the source file, frame it, and write it.
    Chunk(ChunkPick),
}

/// Sending-side state shared between the application and the writer loop.
pub struct Scheduler {
    queue: VecDeque<OutboundItem>,
    transfers: TransferManager,
    last_sent: Option<Vec<u8>>,
}

impl Scheduler {
    pub fn new(policy: ChunkPolicy) -> Self {
        Self {
            queue: VecDeque::new(),
            transfers: TransferManager::new(policy),
            last_sent: None,
        }
    }

    pub fn enqueue_text(&mut self, message: &str) {
        self.queue.push_back(OutboundItem::Frame(Frame::text(message)));
    }

    /// Admit a transfer and queue its `FileStart` ahead of any of its chunks.
    /// An empty file is finished on the spot.
    pub fn admit(&mut self, path: PathBuf, name: String, total_size: u64, priority: i32) -> TransferId {
        let id = self.transfers.admit(path, name.clone(), total_size, priority);
        self.queue
            .push_back(OutboundItem::Frame(Frame::file_start(id, &name, total_size)));
        if total_size == 0 {
            self.transfers.complete(id);
            self.queue.push_back(OutboundItem::Frame(Frame::file_end(id)));
        }
        id
    }

    /// Our peer's last frame failed its digest.
    pub fn request_resend(&mut self) {
        self.queue
            .push_back(OutboundItem::Frame(Frame::resend_request()));
    }

    /// Queue a byte-exact copy of the last frame written. False if nothing was written yet.
    pub fn retransmit_last(&mut self) -> bool {
        match &self.last_sent {
            Some(bytes) => {
                self.queue.push_back(OutboundItem::Retransmit(bytes.clone()));
                true
            }
            None => false,
        }
    }

    pub fn has_work(&self) -> bool {
        !self.queue.is_empty() || self.transfers.has_ready()
    }

    /// Next item for the writer, or `None` when idle.
    pub fn next_item(&mut self) -> Option<OutboundItem> {
        if let Some(item) = self.queue.pop_front() {
            return Some(item);
        }
        self.transfers.next_chunk().map(OutboundItem::Chunk)
    }

    /// LastSentCache: called after every successful write. A `ResendRequest` is
    /// never cached, or two peers would answer each other's requests forever.
    pub fn record_sent(&mut self, bytes: Vec<u8>) {
        if bytes.get(MAGIC.len()) == Some(&u8::from(FrameKind::ResendRequest)) {
            return;
        }
        self.last_sent = Some(bytes);
    }

    #[cfg(test)]
    fn last_sent(&self) -> Option<&[u8]> {
        self.last_sent.as_deref()
    }

    /// A chunk made it onto the wire. Returns the transfer if that was its last chunk.
    pub fn chunk_written(&mut self, pick: &ChunkPick) -> Option<FileTransfer> {
        if !pick.last {
            return None;
        }
        let done = self.transfers.complete(pick.id)?;
        self.queue
            .push_back(OutboundItem::Frame(Frame::file_end(pick.id)));
        Some(done)
    }

    /// Source read failed. The peer gets a `FileEnd` so it sees the short count.
    pub fn abort_transfer(&mut self, id: TransferId) -> Option<FileTransfer> {
        let failed = self.transfers.fail(id)?;
        self.queue.push_back(OutboundItem::Frame(Frame::file_end(id)));
        Some(failed)
    }

    #[cfg(test)]
    fn transfers(&self) -> &TransferManager {
        &self.transfers
    }
}
