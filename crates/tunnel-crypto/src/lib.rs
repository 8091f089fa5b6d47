//! I2P tunnel message processing.
//!
//! Applies the layered per-hop transform to fixed-size tunnel messages as
//! they cross a pre-built tunnel: the gateway, every participant and the
//! endpoint each run one AES-256 layer keyed by their own [`HopConfig`].
//! Only the endpoint, after every layer has been applied in order, can
//! check the end-to-end checksum and recover the preprocessed fragments.
//!
//! Wire format: `IV (16 bytes) ‖ ciphertext region`, 1024 bytes in total on
//! the production network (see [`TunnelParams`]).
//! Crypto: AES-256 block transform for the IV, AES-256-CBC for the payload,
//! truncated SHA-256 for the checksum.

pub mod checksum;
pub mod config;
pub mod creator;
mod crypto;
pub mod defragment;
pub mod error;
pub mod fragment;
pub mod hop;
pub mod message;
pub mod pipeline;
pub mod preprocess;
pub mod processor;
pub mod types;

pub use config::TunnelParams;
pub use creator::TunnelCreatorConfig;
pub use defragment::{CompletedMessage, Defragmenter, DefragmenterStats};
pub use error::TunnelError;
pub use fragment::{DeliveryInstructions, Fragment, FragmentError};
pub use hop::{HopConfig, HopConfigBuilder};
pub use message::TunnelMessage;
pub use pipeline::{MessageState, Pipeline, PipelineStats, Stage, Traversal};
pub use preprocess::{PendingMessage, Preprocessor};
pub use processor::{EndpointProcessor, GatewayProcessor, HopProcessor};
pub use types::{
    now_ms, Clock, Direction, Role, RouterHash, SessionKey, SystemClock, TunnelId,
    DEFAULT_CHECKSUM_LEN, DEFAULT_MESSAGE_SIZE, IV_LENGTH, MAX_TUNNEL_LENGTH,
};
