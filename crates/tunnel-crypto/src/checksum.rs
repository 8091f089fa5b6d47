//! End-to-end checksum over a preprocessed tunnel message.
//!
//! The checksum is the first `checksum_len` bytes of
//! `SHA-256(fragments ‖ IV)`, stored right after the IV. It can only match
//! once every hop has unwound its layer in order, so it is the sole
//! integrity signal of the tunnel.
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::config::TunnelParams;
use crate::types::IV_LENGTH;

/// A truncated SHA-256 digest.
#[derive(Clone, Copy)]
pub struct Checksum {
    digest: [u8; 32],
    len: usize,
}

impl Checksum {
    pub fn as_bytes(&self) -> &[u8] {
        &self.digest[..self.len]
    }

    /// Constant-time comparison against an embedded checksum.
    pub fn matches(&self, embedded: &[u8]) -> bool {
        self.as_bytes().ct_eq(embedded).into()
    }
}

impl std::fmt::Debug for Checksum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Checksum(")?;
        for b in self.as_bytes() {
            write!(f, "{b:02x}")?;
        }
        f.write_str(")")
    }
}

/// Hash `fragments` then `iv`, truncated to `len` bytes (at most 32).
pub fn compute(iv: &[u8], fragments: &[u8], len: usize) -> Checksum {
    let mut hasher = Sha256::new();
    hasher.update(fragments);
    hasher.update(iv);
    Checksum {
        digest: hasher.finalize().into(),
        len: len.min(32),
    }
}

/// Offset of the first fragment byte: one past the zero byte that ends
/// the padding. `None` when the padding has no terminator.
pub fn find_fragments_start(params: &TunnelParams, region: &[u8]) -> Option<usize> {
    let padding_start = IV_LENGTH + params.checksum_len;
    region
        .get(padding_start..)?
        .iter()
        .position(|b| *b == 0)
        .map(|i| padding_start + i + 1)
}

/// Bytes of nonzero padding in front of the terminator.
pub fn padding_len(params: &TunnelParams, region: &[u8]) -> Option<usize> {
    find_fragments_start(params, region).map(|start| start - 1 - IV_LENGTH - params.checksum_len)
}

/// Check the embedded checksum of a fully unwrapped message.
pub fn verify(params: &TunnelParams, region: &[u8]) -> bool {
    if region.len() != params.message_size {
        return false;
    }
    let Some(start) = find_fragments_start(params, region) else {
        tracing::debug!("no padding terminator in {} byte message", region.len());
        return false;
    };
    let embedded = &region[IV_LENGTH..IV_LENGTH + params.checksum_len];
    compute(&region[..IV_LENGTH], &region[start..], params.checksum_len).matches(embedded)
}

/// Fill in the checksum slot for fragments starting at `fragments_start`.
/// The IV must already be in place.
pub fn write(params: &TunnelParams, region: &mut [u8], fragments_start: usize) {
    let sum = compute(
        &region[..IV_LENGTH],
        &region[fragments_start..],
        params.checksum_len,
    );
    region[IV_LENGTH..IV_LENGTH + params.checksum_len].copy_from_slice(sum.as_bytes());
}
