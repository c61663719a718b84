//! Framing: magic + type byte + digest + 4-byte BE length + payload.
//!
//! ```text
//! +-------+------+-----------------+-----------------+-------------------+
//! | "TD"  | type | digest (16)     | length (u32 BE) | payload           |
//! +-------+------+-----------------+-----------------+-------------------+
//! ```
//!
//! `ResendRequest` is header-only: magic and type byte, nothing else.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::integrity::{self, Digest, DIGEST_LEN};
use crate::transfer::TransferId;

/// Marker at the start of every frame. Lets the reader detect a desynced stream.
pub const MAGIC: [u8; 2] = *b"TD";

/// Magic + type byte.
pub const HEADER_LEN: usize = MAGIC.len() + 1;

const LEN_SIZE: usize = 4;

/// Digest + length, present for every type except `ResendRequest`.
const BODY_HEADER_LEN: usize = DIGEST_LEN + LEN_SIZE;

/// Largest payload either side will encode or accept.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// Prefix of a `FileChunk` payload: transfer id + sequence.
pub const CHUNK_PREFIX_LEN: usize = 8;

/// Frame type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Text = 0,
    FileStart = 1,
    FileChunk = 2,
    ResendRequest = 3,
    FileEnd = 4,
}

impl TryFrom<u8> for FrameKind {
    type Error = FramingError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FrameKind::Text),
            1 => Ok(FrameKind::FileStart),
            2 => Ok(FrameKind::FileChunk),
            3 => Ok(FrameKind::ResendRequest),
            4 => Ok(FrameKind::FileEnd),
            other => Err(FramingError::UnknownType(other)),
        }
    }
}

impl From<FrameKind> for u8 {
    fn from(k: FrameKind) -> u8 {
        k as u8
    }
}

/// One logical unit ready to encode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn text(message: &str) -> Self {
        Self {
            kind: FrameKind::Text,
            payload: message.as_bytes().to_vec(),
        }
    }

    /// `"<id>:<filename>:<size>"`.
    pub fn file_start(id: TransferId, name: &str, size: u64) -> Self {
        Self {
            kind: FrameKind::FileStart,
            payload: format!("{}:{}:{}", id.0, name, size).into_bytes(),
        }
    }

    pub fn file_chunk(id: TransferId, sequence: u32, data: &[u8]) -> Self {
        let mut payload = Vec::with_capacity(CHUNK_PREFIX_LEN + data.len());
        payload.extend_from_slice(&id.0.to_be_bytes());
        payload.extend_from_slice(&sequence.to_be_bytes());
        payload.extend_from_slice(data);
        Self {
            kind: FrameKind::FileChunk,
            payload,
        }
    }

    pub fn file_end(id: TransferId) -> Self {
        Self {
            kind: FrameKind::FileEnd,
            payload: id.0.to_be_bytes().to_vec(),
        }
    }

    pub fn resend_request() -> Self {
        Self {
            kind: FrameKind::ResendRequest,
            payload: Vec::new(),
        }
    }
}

/// Encode a frame. The digest is computed over the payload here.
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, FrameEncodeError> {
    if frame.kind == FrameKind::ResendRequest {
        let mut out = Vec::with_capacity(HEADER_LEN);
        out.extend_from_slice(&MAGIC);
        out.push(frame.kind.into());
        return Ok(out);
    }
    let len = u32::try_from(frame.payload.len())
        .ok()
        .filter(|&l| l <= MAX_FRAME_LEN)
        .ok_or(FrameEncodeError::TooLarge(frame.payload.len()))?;
    let mut out = Vec::with_capacity(HEADER_LEN + BODY_HEADER_LEN + frame.payload.len());
    out.extend_from_slice(&MAGIC);
    out.push(frame.kind.into());
    out.extend_from_slice(&integrity::digest(&frame.payload));
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(&frame.payload);
    Ok(out)
}

/// Error encoding a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("payload of {0} bytes exceeds the {} byte frame limit", MAX_FRAME_LEN)]
    TooLarge(usize),
}

/// A frame as read off the wire, before digest verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub kind: FrameKind,
    /// Zeroed for `ResendRequest`.
    pub digest: Digest,
    pub payload: Vec<u8>,
}

impl RawFrame {
    fn resend_request() -> Self {
        Self {
            kind: FrameKind::ResendRequest,
            digest: [0u8; DIGEST_LEN],
            payload: Vec::new(),
        }
    }
}

fn parse_header(header: &[u8]) -> Result<FrameKind, FramingError> {
    if header[..MAGIC.len()] != MAGIC {
        return Err(FramingError::BadMagic([header[0], header[1]]));
    }
    FrameKind::try_from(header[MAGIC.len()])
}

fn parse_body_header(body: &[u8]) -> Result<(Digest, usize), FramingError> {
    let mut digest = [0u8; DIGEST_LEN];
    digest.copy_from_slice(&body[..DIGEST_LEN]);
    let len = u32::from_be_bytes([
        body[DIGEST_LEN],
        body[DIGEST_LEN + 1],
        body[DIGEST_LEN + 2],
        body[DIGEST_LEN + 3],
    ]);
    if len > MAX_FRAME_LEN {
        return Err(FramingError::TooLarge(len));
    }
    Ok((digest, len as usize))
}

/// Decode one frame from the front of `bytes`. Returns the frame and the number of bytes consumed.
/// Call with partial buffer; returns `NeedMore` if not enough bytes (caller should try again after more data).
pub fn decode_frame(bytes: &[u8]) -> Result<(RawFrame, usize), FrameDecodeError> {
    if bytes.len() < HEADER_LEN {
        return Err(FrameDecodeError::NeedMore);
    }
    let kind = parse_header(&bytes[..HEADER_LEN])?;
    if kind == FrameKind::ResendRequest {
        return Ok((RawFrame::resend_request(), HEADER_LEN));
    }
    let body_start = HEADER_LEN + BODY_HEADER_LEN;
    if bytes.len() < body_start {
        return Err(FrameDecodeError::NeedMore);
    }
    let (digest, len) = parse_body_header(&bytes[HEADER_LEN..body_start])?;
    if bytes.len() < body_start + len {
        return Err(FrameDecodeError::NeedMore);
    }
    let payload = bytes[body_start..body_start + len].to_vec();
    Ok((
        RawFrame {
            kind,
            digest,
            payload,
        },
        body_start + len,
    ))
}

/// Error decoding a frame from a buffer.
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error(transparent)]
    Framing(#[from] FramingError),
}

/// Read exactly one frame from a stream.
///
/// Returns `Ok(None)` when the stream ends cleanly on a frame boundary. A stream that
/// ends anywhere else is `Truncated`.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<RawFrame>, FramingError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    let n = reader.read(&mut header).await?;
    if n == 0 {
        return Ok(None);
    }
    read_full(reader, &mut header[n..]).await?;
    let kind = parse_header(&header)?;
    if kind == FrameKind::ResendRequest {
        return Ok(Some(RawFrame::resend_request()));
    }

    let mut body = [0u8; BODY_HEADER_LEN];
    read_full(reader, &mut body).await?;
    let (digest, len) = parse_body_header(&body)?;

    let mut payload = vec![0u8; len];
    read_full(reader, &mut payload).await?;
    Ok(Some(RawFrame {
        kind,
        digest,
        payload,
    }))
}

async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), FramingError>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(FramingError::Truncated),
        Err(e) => Err(FramingError::Io(e)),
    }
}

/// Unrecoverable stream error. The connection is torn down.
#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error("stream ended mid-frame")]
    Truncated,
    #[error("bad frame marker: {0:02x?}")]
    BadMagic([u8; 2]),
    #[error("unknown frame type: 0x{0:02x}")]
    UnknownType(u8),
    #[error("frame length {0} exceeds limit {}", MAX_FRAME_LEN)]
    TooLarge(u32),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Typed view of a verified payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    FileStart {
        id: TransferId,
        name: String,
        size: u64,
    },
    FileChunk {
        id: TransferId,
        sequence: u32,
        data: Vec<u8>,
    },
    FileEnd {
        id: TransferId,
    },
    ResendRequest,
}

impl Payload {
    /// Parse a payload whose digest has already been checked.
    pub fn parse(kind: FrameKind, payload: Vec<u8>) -> Result<Self, PayloadError> {
        match kind {
            FrameKind::Text => Ok(Payload::Text(
                String::from_utf8_lossy(&payload).into_owned(),
            )),
            FrameKind::FileStart => parse_file_start(&payload),
            FrameKind::FileChunk => {
                if payload.len() < CHUNK_PREFIX_LEN {
                    return Err(PayloadError::ShortChunk(payload.len()));
                }
                let id = TransferId(u32::from_be_bytes([
                    payload[0], payload[1], payload[2], payload[3],
                ]));
                let sequence = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
                let mut data = payload;
                data.drain(..CHUNK_PREFIX_LEN);
                Ok(Payload::FileChunk { id, sequence, data })
            }
            FrameKind::FileEnd => {
                let bytes: [u8; 4] = payload
                    .as_slice()
                    .try_into()
                    .map_err(|_| PayloadError::BadFileEnd(payload.len()))?;
                Ok(Payload::FileEnd {
                    id: TransferId(u32::from_be_bytes(bytes)),
                })
            }
            FrameKind::ResendRequest => Ok(Payload::ResendRequest),
        }
    }
}

/// Id is everything before the first `:`, size everything after the last one.
/// The name in between may itself contain `:`.
fn parse_file_start(payload: &[u8]) -> Result<Payload, PayloadError> {
    let text = std::str::from_utf8(payload).map_err(|_| PayloadError::BadFileStart)?;
    let (id, rest) = text.split_once(':').ok_or(PayloadError::BadFileStart)?;
    let (name, size) = rest.rsplit_once(':').ok_or(PayloadError::BadFileStart)?;
    let id = id.parse::<u32>().map_err(|_| PayloadError::BadFileStart)?;
    let size = size.parse::<u64>().map_err(|_| PayloadError::BadFileStart)?;
    if name.is_empty() {
        return Err(PayloadError::BadFileStart);
    }
    Ok(Payload::FileStart {
        id: TransferId(id),
        name: name.to_string(),
        size,
    })
}

/// A payload that passed its digest but is not well-formed for its type.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PayloadError {
    #[error("malformed file start descriptor")]
    BadFileStart,
    #[error("file chunk payload too short: {0} bytes")]
    ShortChunk(usize),
    #[error("file end payload must be 4 bytes, got {0}")]
    BadFileEnd(usize),
}
