use serde::{Deserialize, Serialize};

use crate::error::TunnelError;
use crate::types::{DEFAULT_CHECKSUM_LEN, DEFAULT_MESSAGE_SIZE, IV_LENGTH};

/// Bytes of SHA-256 output available for the checksum.
const MAX_CHECKSUM_LEN: usize = 32;

/// Header of a follow-on fragment: control byte, message id, size.
pub(crate) const FOLLOW_ON_HEADER_LEN: usize = 1 + 4 + 2;

/// Network-wide tunnel message dimensions.
///
/// Every processor, preprocessor and defragmenter of one tunnel must share
/// the same parameters. Defaults match the production network:
///
/// ```rust
/// use tunnel_crypto::TunnelParams;
///
/// let params = TunnelParams::new();
/// assert_eq!(params.message_size, 1024);
/// assert_eq!(params.checksum_len, 4);
///
/// let small = TunnelParams::new().message_size(128);
/// assert!(small.validate().is_ok());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelParams {
    /// Total tunnel message length, IV included.
    pub message_size: usize,
    /// Truncated SHA-256 width embedded after the IV.
    pub checksum_len: usize,
}

impl Default for TunnelParams {
    fn default() -> Self {
        Self::new()
    }
}

impl TunnelParams {
    /// Production parameters (1024-byte messages, 4-byte checksum).
    pub const fn new() -> Self {
        Self {
            message_size: DEFAULT_MESSAGE_SIZE,
            checksum_len: DEFAULT_CHECKSUM_LEN,
        }
    }

    /// Defaults, overridden by `TUNNEL_MESSAGE_SIZE` and
    /// `TUNNEL_CHECKSUM_LEN` when set.
    pub fn from_env() -> Result<Self, TunnelError> {
        let mut params = Self::new();
        if let Some(size) = env_usize("TUNNEL_MESSAGE_SIZE")? {
            params.message_size = size;
        }
        if let Some(len) = env_usize("TUNNEL_CHECKSUM_LEN")? {
            params.checksum_len = len;
        }
        params.validate()?;
        Ok(params)
    }

    /// Set the total message size (default: 1024).
    pub fn message_size(mut self, bytes: usize) -> Self {
        self.message_size = bytes;
        self
    }

    /// Set the checksum width (default: 4).
    pub fn checksum_len(mut self, bytes: usize) -> Self {
        self.checksum_len = bytes;
        self
    }

    /// Check that the dimensions describe a usable message layout.
    pub fn validate(&self) -> Result<(), TunnelError> {
        let invalid =
            |reason: String| -> Result<(), TunnelError> { Err(TunnelError::InvalidParams { reason }) };

        if self.message_size % 16 != 0 {
            return invalid(format!(
                "message size {} is not a multiple of the AES block size",
                self.message_size
            ));
        }
        if self.message_size < IV_LENGTH + 16 {
            return invalid(format!(
                "message size {} leaves no payload block",
                self.message_size
            ));
        }
        if self.checksum_len == 0 || self.checksum_len > MAX_CHECKSUM_LEN {
            return invalid(format!(
                "checksum length {} outside 1..={MAX_CHECKSUM_LEN}",
                self.checksum_len
            ));
        }
        // Room for at least one instruction header and one data byte.
        if self.fragment_capacity() <= FOLLOW_ON_HEADER_LEN {
            return invalid(format!(
                "message size {} too small for a {}-byte checksum",
                self.message_size, self.checksum_len
            ));
        }
        Ok(())
    }

    /// Bytes after the IV: the region the payload layer encrypts.
    pub fn payload_len(&self) -> usize {
        self.message_size - IV_LENGTH
    }

    /// Bytes available for delivery instructions and fragment data when
    /// no padding is used.
    pub fn fragment_capacity(&self) -> usize {
        self.message_size
            .saturating_sub(IV_LENGTH + self.checksum_len + 1)
    }

    /// Largest fragment that fits behind a follow-on header.
    pub fn max_fragment_size(&self) -> usize {
        self.fragment_capacity().saturating_sub(FOLLOW_ON_HEADER_LEN)
    }
}

fn env_usize(name: &str) -> Result<Option<usize>, TunnelError> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| TunnelError::InvalidParams {
                reason: format!("{name}={value} is not a byte count"),
            }),
        Err(_) => Ok(None),
    }
}
