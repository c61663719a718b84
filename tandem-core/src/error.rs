//! Link-level error taxonomy.
//!
//! Fatal: `Framing`, `Send`, `ConnectionClosed` end the session.
//! Caller-facing: `SourceNotFound`, `Encode`, `Policy`.
//! `DestinationWrite` is only logged; the inbound transfer fails and the link continues.
//! Integrity failures never surface here: the demultiplexer answers them with a resend request.

use std::path::PathBuf;

use crate::chunk::PolicyError;
use crate::frame::{FrameEncodeError, FramingError};

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),
    #[error("source file not found: {}", .0.display())]
    SourceNotFound(PathBuf),
    #[error("failed to write {}: {source}", .path.display())]
    DestinationWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("connection closed")]
    ConnectionClosed,
    #[error("send failed: {0}")]
    Send(#[source] std::io::Error),
    #[error(transparent)]
    Encode(#[from] FrameEncodeError),
    #[error("invalid chunk policy: {0}")]
    Policy(#[from] PolicyError),
}

impl LinkError {
    /// True for errors that end the session.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LinkError::Framing(_) | LinkError::ConnectionClosed | LinkError::Send(_)
        )
    }
}
