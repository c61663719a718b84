//! Inbound demultiplexer. Host-driven: the reader passes each frame in and gets
//! back the actions to perform (deliver text, touch files, talk to the writer).

use std::collections::{HashMap, HashSet};

use tracing::{debug, info, warn};

use crate::frame::{Payload, PayloadError, RawFrame};
use crate::integrity::{self, IntegrityError};
use crate::transfer::TransferId;

/// Action for the reader to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundAction {
    DeliverText(String),
    CreateFile {
        id: TransferId,
        name: String,
        size: u64,
    },
    AppendChunk {
        id: TransferId,
        data: Vec<u8>,
    },
    /// All declared bytes arrived and the sender closed the transfer.
    FinishFile {
        id: TransferId,
        name: String,
        size: u64,
    },
    /// Drop the destination; what was written is not the sender's file.
    AbortFile {
        id: TransferId,
        name: String,
        reason: AbortReason,
    },
    /// Ask the peer to send its last frame again.
    RequestResend,
    /// The peer asked for our last frame again.
    Retransmit,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AbortReason {
    #[error("expected chunk {expected}, got {got}")]
    SequenceGap { expected: u32, got: u32 },
    #[error("received more than the declared {declared} bytes")]
    Overflow { declared: u64 },
    #[error("transfer ended after {received} of {declared} bytes")]
    Truncated { declared: u64, received: u64 },
    #[error("destination write failed: {0}")]
    WriteFailed(String),
}

/// Why a frame was not dispatched.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InboundError {
    #[error(transparent)]
    Integrity(#[from] IntegrityError),
    #[error(transparent)]
    Payload(#[from] PayloadError),
}

struct InboundTransfer {
    name: String,
    declared: u64,
    received: u64,
    next_sequence: u32,
}

/// Completed or failed transfer ids. The sender counts ids up from 1, so the
/// contiguous prefix collapses into a watermark; only ids closed out of order are kept.
#[derive(Debug, Default)]
struct ClosedIds {
    /// Every id up to and including this one is closed.
    through: u32,
    above: HashSet<u32>,
}

impl ClosedIds {
    fn contains(&self, id: TransferId) -> bool {
        id.0 <= self.through || self.above.contains(&id.0)
    }

    fn insert(&mut self, id: TransferId) {
        if id.0 <= self.through {
            return;
        }
        self.above.insert(id.0);
        while let Some(next) = self.through.checked_add(1) {
            if !self.above.remove(&next) {
                break;
            }
            self.through = next;
        }
    }
}

/// Per-connection receive state.
pub struct Demultiplexer {
    open: HashMap<TransferId, InboundTransfer>,
    /// Later frames for these ids are dropped quietly.
    closed: ClosedIds,
    integrity_failures: u64,
}

impl Demultiplexer {
    pub fn new() -> Self {
        Self {
            open: HashMap::new(),
            closed: ClosedIds::default(),
            integrity_failures: 0,
        }
    }

    /// Verify the digest and parse. `ResendRequest` carries nothing to verify.
    pub fn accept(frame: RawFrame) -> Result<Payload, InboundError> {
        if frame.kind != crate::frame::FrameKind::ResendRequest {
            integrity::verify(&frame.payload, &frame.digest)?;
        }
        Ok(Payload::parse(frame.kind, frame.payload)?)
    }

    /// Process one frame read off the wire.
    pub fn on_frame(&mut self, frame: RawFrame) -> Vec<InboundAction> {
        let kind = frame.kind;
        match Self::accept(frame) {
            Ok(payload) => self.dispatch(payload),
            Err(InboundError::Integrity(e)) => {
                self.integrity_failures += 1;
                warn!(?kind, error = %e, "corrupt frame discarded, requesting resend");
                vec![InboundAction::RequestResend]
            }
            Err(InboundError::Payload(e)) => {
                warn!(?kind, error = %e, "malformed payload dropped");
                vec![]
            }
        }
    }

    fn dispatch(&mut self, payload: Payload) -> Vec<InboundAction> {
        match payload {
            Payload::Text(text) => vec![InboundAction::DeliverText(text)],
            Payload::ResendRequest => vec![InboundAction::Retransmit],
            Payload::FileStart { id, name, size } => {
                if self.open.contains_key(&id) || self.closed.contains(id) {
                    warn!(transfer_id = %id, %name, "duplicate file start rejected");
                    return vec![];
                }
                info!(transfer_id = %id, %name, size, "incoming file");
                self.open.insert(
                    id,
                    InboundTransfer {
                        name: name.clone(),
                        declared: size,
                        received: 0,
                        next_sequence: 0,
                    },
                );
                vec![InboundAction::CreateFile { id, name, size }]
            }
            Payload::FileChunk { id, sequence, data } => self.on_chunk(id, sequence, data),
            Payload::FileEnd { id } => {
                let Some(t) = self.open.remove(&id) else {
                    debug!(transfer_id = %id, "file end for unknown transfer");
                    return vec![];
                };
                self.closed.insert(id);
                if t.received == t.declared {
                    info!(transfer_id = %id, name = %t.name, size = t.declared, "file complete");
                    vec![InboundAction::FinishFile {
                        id,
                        name: t.name,
                        size: t.declared,
                    }]
                } else {
                    let reason = AbortReason::Truncated {
                        declared: t.declared,
                        received: t.received,
                    };
                    warn!(transfer_id = %id, name = %t.name, %reason, "file failed");
                    vec![InboundAction::AbortFile {
                        id,
                        name: t.name,
                        reason,
                    }]
                }
            }
        }
    }

    fn on_chunk(&mut self, id: TransferId, sequence: u32, data: Vec<u8>) -> Vec<InboundAction> {
        let Some(t) = self.open.get_mut(&id) else {
            debug!(transfer_id = %id, sequence, "chunk for unknown or closed transfer dropped");
            return vec![];
        };
        if sequence < t.next_sequence {
            // Retransmitted copy of a chunk we already have.
            debug!(transfer_id = %id, sequence, "duplicate chunk ignored");
            return vec![];
        }
        let reason = if sequence > t.next_sequence {
            Some(AbortReason::SequenceGap {
                expected: t.next_sequence,
                got: sequence,
            })
        } else if t.received + data.len() as u64 > t.declared {
            Some(AbortReason::Overflow {
                declared: t.declared,
            })
        } else {
            None
        };
        if let Some(reason) = reason {
            return self.abort(id, reason).into_iter().collect();
        }
        t.received += data.len() as u64;
        t.next_sequence += 1;
        debug!(transfer_id = %id, sequence, len = data.len(), "chunk accepted");
        vec![InboundAction::AppendChunk { id, data }]
    }

    /// The destination could not be created or written.
    pub fn on_write_failed(&mut self, id: TransferId, error: &std::io::Error) -> Option<InboundAction> {
        self.abort(id, AbortReason::WriteFailed(error.to_string()))
    }

    fn abort(&mut self, id: TransferId, reason: AbortReason) -> Option<InboundAction> {
        let t = self.open.remove(&id)?;
        self.closed.insert(id);
        warn!(transfer_id = %id, name = %t.name, %reason, "file failed");
        Some(InboundAction::AbortFile {
            id,
            name: t.name,
            reason,
        })
    }

    pub fn integrity_failures(&self) -> u64 {
        self.integrity_failures
    }

    /// Transfers still receiving.
    pub fn open_transfers(&self) -> usize {
        self.open.len()
    }
}

impl Default for Demultiplexer {
    fn default() -> Self {
        Self::new()
    }
}
