//! Tandem link core.
//!
//! A two-party, full-duplex link over one reliable byte stream: text messages and
//! file transfers share the connection, every frame carries a payload digest, and a
//! corrupted frame is answered with a resend request. The pure state machines
//! (`scheduler`, `transfer`, `demux`) do no I/O; `link` drives them over tokio.

pub mod chunk;
pub mod config;
pub mod demux;
pub mod error;
pub mod frame;
pub mod integrity;
pub mod link;
pub mod scheduler;
pub mod transfer;

pub use chunk::{ChunkPolicy, ChunkSpan};
pub use config::LinkConfig;
pub use demux::{Demultiplexer, InboundAction};
pub use error::LinkError;
pub use frame::{decode_frame, encode_frame, read_frame, Frame, FrameKind, Payload, MAX_FRAME_LEN};
pub use link::{spawn_link, Link, LinkEvent, LinkHandle};
pub use scheduler::Scheduler;
pub use transfer::{TransferId, TransferState};
