//! Delivery instructions and fragment framing inside the preprocessed
//! payload.
//!
//! Each fragment starts with a control byte. With the high bit clear it is
//! an initial fragment (or a whole message):
//!
//! ```text
//! control   bit 7     0
//!           bits 6-5  delivery type: 0 local, 1 tunnel, 2 router, 3 undefined
//!           bit 3     fragmented
//!           bit 2     extended options (skipped)
//! [tunnel id: 4]      tunnel delivery only
//! [router hash: 32]   tunnel and router delivery
//! [message id: 4]     fragmented only
//! [ext len: 1, ext]   extended only
//! size: 2, data
//! ```
//!
//! With the high bit set it is a follow-on fragment:
//!
//! ```text
//! control   bit 7     1
//!           bits 6-1  fragment number (1..=63)
//!           bit 0     last fragment
//! message id: 4, size: 2, data
//! ```
use crate::config::TunnelParams;
use crate::types::{RouterHash, TunnelId, HASH_LENGTH};

const MASK_IS_SUBSEQUENT: u8 = 0x80;
const MASK_TYPE: u8 = 0x60;
const MASK_FRAGMENTED: u8 = 0x08;
const MASK_EXTENDED: u8 = 0x04;
const MASK_FRAGMENT_NUM: u8 = 0x7E;
const MASK_IS_LAST: u8 = 0x01;

const TYPE_LOCAL: u8 = 0;
const TYPE_TUNNEL: u8 = 1;
const TYPE_ROUTER: u8 = 2;

/// Fragments per message, initial fragment included.
pub const MAX_FRAGMENTS: usize = 64;

/// Errors in fragment framing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FragmentError {
    #[error("fragment truncated at offset {offset}")]
    Truncated { offset: usize },

    #[error("invalid fragment size {size} (max {max})")]
    InvalidSize { size: usize, max: usize },

    #[error("invalid follow-on fragment number {0}")]
    InvalidFragmentNumber(u8),
}

/// Where the endpoint should send a reassembled message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryInstructions {
    /// Hand to the endpoint router itself.
    Local,
    /// Forward to another tunnel's gateway.
    Tunnel {
        tunnel_id: TunnelId,
        gateway: RouterHash,
    },
    /// Forward directly to a router.
    Router { hash: RouterHash },
}

impl DeliveryInstructions {
    fn type_bits(&self) -> u8 {
        match self {
            DeliveryInstructions::Local => TYPE_LOCAL,
            DeliveryInstructions::Tunnel { .. } => TYPE_TUNNEL,
            DeliveryInstructions::Router { .. } => TYPE_ROUTER,
        }
    }

    /// Size of an initial-fragment header carrying these instructions.
    pub fn header_len(&self, fragmented: bool) -> usize {
        let target = match self {
            DeliveryInstructions::Local => 0,
            DeliveryInstructions::Tunnel { .. } => 4 + HASH_LENGTH,
            DeliveryInstructions::Router { .. } => HASH_LENGTH,
        };
        let message_id = if fragmented { 4 } else { 0 };
        1 + target + message_id + 2
    }
}

/// One framed piece of a message inside a tunnel message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fragment {
    /// First (or only) piece of a message. `message_id` is `None` when the
    /// whole message fits in this fragment.
    Initial {
        instructions: DeliveryInstructions,
        message_id: Option<u32>,
        data: Vec<u8>,
    },
    /// A later piece of a fragmented message.
    FollowOn {
        message_id: u32,
        number: u8,
        is_last: bool,
        data: Vec<u8>,
    },
}

impl Fragment {
    /// A complete message in a single fragment.
    pub fn whole(instructions: DeliveryInstructions, data: Vec<u8>) -> Self {
        Fragment::Initial {
            instructions,
            message_id: None,
            data,
        }
    }

    pub fn data(&self) -> &[u8] {
        match self {
            Fragment::Initial { data, .. } | Fragment::FollowOn { data, .. } => data,
        }
    }

    pub fn message_id(&self) -> Option<u32> {
        match self {
            Fragment::Initial { message_id, .. } => *message_id,
            Fragment::FollowOn { message_id, .. } => Some(*message_id),
        }
    }

    /// Header plus data length on the wire.
    pub fn encoded_len(&self) -> usize {
        match self {
            Fragment::Initial {
                instructions,
                message_id,
                data,
            } => instructions.header_len(message_id.is_some()) + data.len(),
            Fragment::FollowOn { data, .. } => crate::config::FOLLOW_ON_HEADER_LEN + data.len(),
        }
    }

    /// Append the framed fragment to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) -> Result<(), FragmentError> {
        let data = self.data();
        if data.is_empty() || data.len() > u16::MAX as usize {
            return Err(FragmentError::InvalidSize {
                size: data.len(),
                max: u16::MAX as usize,
            });
        }

        match self {
            Fragment::Initial {
                instructions,
                message_id,
                ..
            } => {
                let mut control = instructions.type_bits() << 5;
                if message_id.is_some() {
                    control |= MASK_FRAGMENTED;
                }
                out.push(control);
                match instructions {
                    DeliveryInstructions::Local => {}
                    DeliveryInstructions::Tunnel { tunnel_id, gateway } => {
                        out.extend_from_slice(&tunnel_id.to_bytes());
                        out.extend_from_slice(gateway.as_bytes());
                    }
                    DeliveryInstructions::Router { hash } => {
                        out.extend_from_slice(hash.as_bytes());
                    }
                }
                if let Some(id) = message_id {
                    out.extend_from_slice(&id.to_be_bytes());
                }
            }
            Fragment::FollowOn {
                message_id,
                number,
                is_last,
                ..
            } => {
                if *number == 0 || *number as usize >= MAX_FRAGMENTS {
                    return Err(FragmentError::InvalidFragmentNumber(*number));
                }
                let mut control = MASK_IS_SUBSEQUENT | (number << 1);
                if *is_last {
                    control |= MASK_IS_LAST;
                }
                out.push(control);
                out.extend_from_slice(&message_id.to_be_bytes());
            }
        }
        out.extend_from_slice(&(data.len() as u16).to_be_bytes());
        out.extend_from_slice(data);
        Ok(())
    }
}

/// Result of parsing the fragment area of a validated message.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ParsedFragments {
    pub fragments: Vec<Fragment>,
    /// Well-formed fragments skipped for unusable delivery instructions.
    pub dropped: usize,
}

/// Parse every fragment in `area` (the bytes after the padding terminator).
///
/// Framing errors fail the whole message. Fragments with the undefined
/// delivery type, or tunnel delivery to tunnel 0, are skipped and counted.
pub fn parse_fragments(
    params: &TunnelParams,
    area: &[u8],
) -> Result<ParsedFragments, FragmentError> {
    let mut reader = Reader { area, offset: 0 };
    let mut parsed = ParsedFragments::default();
    let max = params.max_fragment_size();

    while reader.offset < area.len() {
        let control = reader.u8()?;
        if control & MASK_IS_SUBSEQUENT == 0 {
            let kind = (control & MASK_TYPE) >> 5;
            let fragmented = control & MASK_FRAGMENTED != 0;
            let extended = control & MASK_EXTENDED != 0;

            let tunnel_id = if kind == TYPE_TUNNEL {
                Some(TunnelId::new(reader.u32()?))
            } else {
                None
            };
            let hash = if kind == TYPE_TUNNEL || kind == TYPE_ROUTER {
                Some(reader.hash()?)
            } else {
                None
            };
            let message_id = if fragmented { Some(reader.u32()?) } else { None };
            if extended {
                let skip = reader.u8()? as usize;
                reader.take(skip)?;
            }
            let size = reader.u16()? as usize;
            let remaining = area.len() - reader.offset;
            let limit = if fragmented { max } else { remaining };
            if size == 0 || size > limit {
                return Err(FragmentError::InvalidSize { size, max: limit });
            }
            let data = reader.take(size)?;

            let instructions = match (kind, tunnel_id, hash) {
                (TYPE_LOCAL, _, _) => Some(DeliveryInstructions::Local),
                (TYPE_TUNNEL, Some(tunnel_id), Some(gateway)) if tunnel_id.is_valid() => {
                    Some(DeliveryInstructions::Tunnel { tunnel_id, gateway })
                }
                (TYPE_ROUTER, _, Some(hash)) => Some(DeliveryInstructions::Router { hash }),
                _ => None,
            };
            match instructions {
                Some(instructions) => parsed.fragments.push(Fragment::Initial {
                    instructions,
                    message_id,
                    data: data.to_vec(),
                }),
                None => {
                    tracing::warn!(
                        "dropping fragment with unusable delivery type {kind} (tunnel {tunnel_id:?})"
                    );
                    parsed.dropped += 1;
                }
            }
        } else {
            let number = (control & MASK_FRAGMENT_NUM) >> 1;
            let is_last = control & MASK_IS_LAST != 0;
            let message_id = reader.u32()?;
            let size = reader.u16()? as usize;
            if number == 0 {
                return Err(FragmentError::InvalidFragmentNumber(number));
            }
            if size == 0 || size > max {
                return Err(FragmentError::InvalidSize { size, max });
            }
            let data = reader.take(size)?;
            parsed.fragments.push(Fragment::FollowOn {
                message_id,
                number,
                is_last,
                data: data.to_vec(),
            });
        }
    }
    Ok(parsed)
}

struct Reader<'a> {
    area: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], FragmentError> {
        let end = self
            .offset
            .checked_add(n)
            .filter(|end| *end <= self.area.len())
            .ok_or(FragmentError::Truncated {
                offset: self.offset,
            })?;
        let slice = &self.area[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, FragmentError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, FragmentError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, FragmentError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn hash(&mut self) -> Result<RouterHash, FragmentError> {
        let mut bytes = [0u8; HASH_LENGTH];
        bytes.copy_from_slice(self.take(HASH_LENGTH)?);
        Ok(RouterHash::from_bytes(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> TunnelParams {
        TunnelParams::new()
    }

    fn encode(fragments: &[Fragment]) -> Vec<u8> {
        let mut out = Vec::new();
        for f in fragments {
            f.encode_into(&mut out).unwrap();
        }
        out
    }

    #[test]
    fn local_whole_message_layout() {
        let f = Fragment::whole(DeliveryInstructions::Local, vec![0xAA, 0xBB]);
        let bytes = encode(&[f.clone()]);
        assert_eq!(bytes, vec![0x00, 0x00, 0x02, 0xAA, 0xBB]);
        assert_eq!(f.encoded_len(), bytes.len());
    }

    #[test]
    fn tunnel_fragmented_layout() {
        let gateway = RouterHash::from_bytes([7; 32]);
        let f = Fragment::Initial {
            instructions: DeliveryInstructions::Tunnel {
                tunnel_id: TunnelId::new(0x0A0B0C0D),
                gateway,
            },
            message_id: Some(0x01020304),
            data: vec![1, 2, 3],
        };
        let bytes = encode(&[f.clone()]);
        assert_eq!(bytes[0], 0x20 | 0x08);
        assert_eq!(&bytes[1..5], &[0x0A, 0x0B, 0x0C, 0x0D]);
        assert_eq!(&bytes[5..37], gateway.as_bytes());
        assert_eq!(&bytes[37..41], &[1, 2, 3, 4]);
        assert_eq!(&bytes[41..43], &[0, 3]);
        assert_eq!(bytes.len(), f.encoded_len());
    }

    #[test]
    fn follow_on_control_byte() {
        let f = Fragment::FollowOn {
            message_id: 9,
            number: 5,
            is_last: true,
            data: vec![0xFF],
        };
        let bytes = encode(&[f]);
        assert_eq!(bytes[0], 0x80 | (5 << 1) | 0x01);
        assert_eq!(bytes.len(), 8);
    }

    #[test]
    fn parse_mixed_sequence() {
        let fragments = vec![
            Fragment::whole(DeliveryInstructions::Local, vec![1; 10]),
            Fragment::Initial {
                instructions: DeliveryInstructions::Router {
                    hash: RouterHash::from_bytes([3; 32]),
                },
                message_id: Some(77),
                data: vec![2; 20],
            },
            Fragment::FollowOn {
                message_id: 76,
                number: 2,
                is_last: true,
                data: vec![3; 5],
            },
        ];
        let parsed = parse_fragments(&params(), &encode(&fragments)).unwrap();
        assert_eq!(parsed.fragments, fragments);
        assert_eq!(parsed.dropped, 0);
    }

    #[test]
    fn undefined_type_is_skipped() {
        let mut bytes = vec![0x60, 0x00, 0x02, 0xAA, 0xBB];
        bytes.extend(encode(&[Fragment::whole(DeliveryInstructions::Local, vec![5])]));
        let parsed = parse_fragments(&params(), &bytes).unwrap();
        assert_eq!(parsed.dropped, 1);
        assert_eq!(parsed.fragments.len(), 1);
        assert_eq!(parsed.fragments[0].data(), &[5]);
    }

    #[test]
    fn tunnel_zero_is_skipped() {
        let f = Fragment::whole(
            DeliveryInstructions::Tunnel {
                tunnel_id: TunnelId::new(0),
                gateway: RouterHash::from_bytes([1; 32]),
            },
            vec![9; 4],
        );
        let parsed = parse_fragments(&params(), &encode(&[f])).unwrap();
        assert!(parsed.fragments.is_empty());
        assert_eq!(parsed.dropped, 1);
    }

    #[test]
    fn extended_options_are_skipped() {
        // local, extended, 2 option bytes, size 1
        let bytes = vec![0x04, 0x02, 0xEE, 0xEE, 0x00, 0x01, 0x42];
        let parsed = parse_fragments(&params(), &bytes).unwrap();
        assert_eq!(parsed.fragments[0].data(), &[0x42]);
    }

    #[test]
    fn truncated_data_fails() {
        let bytes = vec![0x00, 0x00, 0x05, 1, 2];
        let err = parse_fragments(&params(), &bytes).unwrap_err();
        assert!(matches!(err, FragmentError::InvalidSize { size: 5, .. }));

        let bytes = vec![0x20, 0x00, 0x00];
        let err = parse_fragments(&params(), &bytes).unwrap_err();
        assert!(matches!(err, FragmentError::Truncated { .. }));
    }

    #[test]
    fn whole_message_may_fill_the_rest_exactly() {
        let bytes = vec![0x00, 0x00, 0x02, 1, 2];
        let parsed = parse_fragments(&params(), &bytes).unwrap();
        assert_eq!(parsed.fragments[0].data(), &[1, 2]);

        // One byte short of the claimed size.
        let err = parse_fragments(&params(), &bytes[..4]).unwrap_err();
        assert_eq!(err, FragmentError::InvalidSize { size: 2, max: 1 });
    }

    #[test]
    fn zero_size_fails() {
        let err = parse_fragments(&params(), &[0x00, 0x00, 0x00]).unwrap_err();
        assert!(matches!(err, FragmentError::InvalidSize { size: 0, .. }));
    }

    #[test]
    fn follow_on_number_zero_fails() {
        let bytes = vec![0x81, 0, 0, 0, 1, 0, 1, 0xAA];
        let err = parse_fragments(&params(), &bytes).unwrap_err();
        assert_eq!(err, FragmentError::InvalidFragmentNumber(0));
    }

    #[test]
    fn oversized_follow_on_fails() {
        let params = TunnelParams::new().message_size(128);
        let max = params.max_fragment_size();
        let f = Fragment::FollowOn {
            message_id: 1,
            number: 1,
            is_last: true,
            data: vec![0; max + 1],
        };
        let err = parse_fragments(&params, &encode(&[f])).unwrap_err();
        assert!(matches!(err, FragmentError::InvalidSize { .. }));
    }

    #[test]
    fn encode_rejects_empty_and_bad_numbers() {
        let mut out = Vec::new();
        let empty = Fragment::whole(DeliveryInstructions::Local, Vec::new());
        assert!(empty.encode_into(&mut out).is_err());

        let bad = Fragment::FollowOn {
            message_id: 1,
            number: 64,
            is_last: false,
            data: vec![1],
        };
        assert_eq!(
            bad.encode_into(&mut out),
            Err(FragmentError::InvalidFragmentNumber(64))
        );
    }

    #[test]
    fn header_lengths() {
        let hash = RouterHash::from_bytes([0; 32]);
        assert_eq!(DeliveryInstructions::Local.header_len(false), 3);
        assert_eq!(DeliveryInstructions::Local.header_len(true), 7);
        assert_eq!(DeliveryInstructions::Router { hash }.header_len(false), 35);
        let tunnel = DeliveryInstructions::Tunnel {
            tunnel_id: TunnelId::new(1),
            gateway: hash,
        };
        assert_eq!(tunnel.header_len(true), 43);
    }
}
