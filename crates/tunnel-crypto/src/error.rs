use crate::fragment::FragmentError;

/// Contract violations detected while configuring or feeding the pipeline.
///
/// These are caller bugs (bad parameters, missing keys, wrong buffer
/// sizes). Adversary-reachable failures such as checksum mismatches are
/// never reported through this type: the processors return `false`.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("invalid tunnel parameters: {reason}")]
    InvalidParams { reason: String },

    #[error("tunnel length {length} outside 1..={max}")]
    InvalidLength { length: usize, max: usize },

    #[error("hop configuration incomplete: missing {missing}")]
    IncompleteHop { missing: &'static str },

    #[error("{peers} peers given for a {hops}-hop tunnel")]
    PeerCountMismatch { hops: usize, peers: usize },

    #[error("message is {actual} bytes, tunnel messages are {expected} bytes")]
    MessageSize { expected: usize, actual: usize },

    #[error("fragments need {size} bytes, only {capacity} available")]
    PayloadTooLarge { size: usize, capacity: usize },

    #[error("message needs {needed} fragments (max {max})")]
    TooManyFragments { needed: usize, max: usize },

    #[error("fragment error: {0}")]
    Fragment(#[from] FragmentError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_invalid_params() {
        let err = TunnelError::InvalidParams {
            reason: "message size 100 is not a multiple of 16".into(),
        };
        assert_eq!(
            err.to_string(),
            "invalid tunnel parameters: message size 100 is not a multiple of 16"
        );
    }

    #[test]
    fn display_invalid_length() {
        let err = TunnelError::InvalidLength { length: 0, max: 8 };
        assert_eq!(err.to_string(), "tunnel length 0 outside 1..=8");
    }

    #[test]
    fn display_incomplete_hop() {
        let err = TunnelError::IncompleteHop { missing: "layer key" };
        assert_eq!(
            err.to_string(),
            "hop configuration incomplete: missing layer key"
        );
    }

    #[test]
    fn display_message_size() {
        let err = TunnelError::MessageSize {
            expected: 1024,
            actual: 1028,
        };
        assert_eq!(
            err.to_string(),
            "message is 1028 bytes, tunnel messages are 1024 bytes"
        );
    }

    #[test]
    fn fragment_error_converts() {
        let err: TunnelError = FragmentError::Truncated { offset: 12 }.into();
        assert!(matches!(err, TunnelError::Fragment(_)));
        assert_eq!(
            err.to_string(),
            "fragment error: fragment truncated at offset 12"
        );
    }
}
