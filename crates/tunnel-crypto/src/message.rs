use crate::config::TunnelParams;
use crate::error::TunnelError;
use crate::types::IV_LENGTH;

/// A fixed-size tunnel message: `IV (16 bytes) ‖ ciphertext region`.
///
/// The length is fixed at construction and no stage ever changes it;
/// processors transform the bytes in place through
/// [`as_mut_bytes`](Self::as_mut_bytes).
#[derive(Clone, PartialEq, Eq)]
pub struct TunnelMessage {
    bytes: Box<[u8]>,
}

impl TunnelMessage {
    /// An all-zero message of the configured size.
    pub fn zeroed(params: &TunnelParams) -> Self {
        Self {
            bytes: vec![0u8; params.message_size].into_boxed_slice(),
        }
    }

    /// Take ownership of raw bytes received from the transport.
    pub fn from_bytes(params: &TunnelParams, bytes: Vec<u8>) -> Result<Self, TunnelError> {
        if bytes.len() != params.message_size {
            return Err(TunnelError::MessageSize {
                expected: params.message_size,
                actual: bytes.len(),
            });
        }
        Ok(Self {
            bytes: bytes.into_boxed_slice(),
        })
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// The IV slice at the head of the message.
    pub fn iv(&self) -> &[u8] {
        &self.bytes[..IV_LENGTH]
    }

    /// Everything after the IV.
    pub fn payload(&self) -> &[u8] {
        &self.bytes[IV_LENGTH..]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_mut_bytes(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes.into_vec()
    }
}

impl std::fmt::Debug for TunnelMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TunnelMessage({} bytes, iv ", self.bytes.len())?;
        for b in &self.bytes[..4.min(self.bytes.len())] {
            write!(f, "{b:02x}")?;
        }
        f.write_str("..)")
    }
}
