//! Integrity: per-frame content digest (truncated SHA-256), verify on receive.

use sha2::{Digest as _, Sha256};

/// Digest length on the wire.
pub const DIGEST_LEN: usize = 16;

/// 128-bit content digest carried in every non-control frame.
pub type Digest = [u8; DIGEST_LEN];

/// Hash a frame payload. Returns the first 16 bytes of its SHA-256.
pub fn digest(payload: &[u8]) -> Digest {
    let full: [u8; 32] = Sha256::digest(payload).into();
    let mut out = [0u8; DIGEST_LEN];
    out.copy_from_slice(&full[..DIGEST_LEN]);
    out
}

/// Verify a payload against the digest it arrived with.
pub fn verify(payload: &[u8], expected: &Digest) -> Result<(), IntegrityError> {
    let actual = digest(payload);
    if actual == *expected {
        Ok(())
    } else {
        Err(IntegrityError {
            expected: *expected,
            actual,
        })
    }
}

/// Digest mismatch. Recoverable: the payload is discarded and a resend requested.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("digest mismatch: expected {}, got {}", hex(.expected), hex(.actual))]
pub struct IntegrityError {
    pub expected: Digest,
    pub actual: Digest,
}

fn hex(d: &Digest) -> String {
    d.iter().map(|b| format!("{b:02x}")).collect()
}
