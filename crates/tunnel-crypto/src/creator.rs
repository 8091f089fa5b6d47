use rand::{CryptoRng, RngCore};

use crate::config::TunnelParams;
use crate::crypto::LayerCipher;
use crate::error::TunnelError;
use crate::hop::HopConfig;
use crate::message::TunnelMessage;
use crate::pipeline::Pipeline;
use crate::processor::undo_layer;
use crate::types::{Clock, Direction, Role, RouterHash, SessionKey, TunnelId, MAX_TUNNEL_LENGTH};

/// Lifetime of a generated tunnel.
pub const TUNNEL_LIFETIME_MS: u64 = 10 * 60 * 1000;

/// The tunnel creator's view: every hop's keys, in processing order.
///
/// Hop 0 is the gateway and the last hop the endpoint. Only the router
/// that built the tunnel holds this; relaying routers get a single
/// [`HopConfig`] each. It is deliberately not serializable.
pub struct TunnelCreatorConfig {
    hops: Vec<HopConfig>,
    peers: Vec<RouterHash>,
    direction: Direction,
}

impl TunnelCreatorConfig {
    /// `peers[i]` is the router that runs `hops[i]`.
    pub fn new(
        hops: Vec<HopConfig>,
        peers: Vec<RouterHash>,
        direction: Direction,
    ) -> Result<Self, TunnelError> {
        check_length(hops.len())?;
        if peers.len() != hops.len() {
            return Err(TunnelError::PeerCountMismatch {
                hops: hops.len(),
                peers: peers.len(),
            });
        }
        Ok(Self {
            hops,
            peers,
            direction,
        })
    }

    /// Random keys, peers and tunnel ids for a local tunnel of `length`
    /// hops, with neighbours linked to each other.
    pub fn generate<R: RngCore + CryptoRng + ?Sized>(
        length: usize,
        direction: Direction,
        expiration: u64,
        rng: &mut R,
    ) -> Result<Self, TunnelError> {
        check_length(length)?;
        let peers: Vec<RouterHash> = (0..length).map(|_| RouterHash::random(rng)).collect();
        let ids: Vec<TunnelId> = (0..length).map(|_| TunnelId::random(rng)).collect();

        let mut hops = Vec::with_capacity(length);
        for i in 0..length {
            let mut builder = HopConfig::builder()
                .receive_tunnel_id(ids[i])
                .layer_key(SessionKey::random(rng))
                .iv_key(SessionKey::random(rng))
                .creation(expiration.saturating_sub(TUNNEL_LIFETIME_MS))
                .expiration(expiration);
            if i > 0 {
                builder = builder.receive_from(peers[i - 1]);
            }
            if i + 1 < length {
                builder = builder.send_to(peers[i + 1]).send_tunnel_id(ids[i + 1]);
            }
            hops.push(builder.build()?);
        }

        tracing::debug!("generated {length}-hop {direction} tunnel [{}]", ids[0]);
        Self::new(hops, peers, direction)
    }

    pub fn len(&self) -> usize {
        self.hops.len()
    }

    /// Always false: a tunnel has at least one hop.
    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_inbound(&self) -> bool {
        self.direction.is_inbound()
    }

    pub fn hops(&self) -> &[HopConfig] {
        &self.hops
    }

    pub fn hop(&self, index: usize) -> Option<&HopConfig> {
        self.hops.get(index)
    }

    pub fn peer(&self, index: usize) -> Option<&RouterHash> {
        self.peers.get(index)
    }

    pub fn peers(&self) -> &[RouterHash] {
        &self.peers
    }

    pub fn gateway(&self) -> &HopConfig {
        &self.hops[0]
    }

    pub fn endpoint(&self) -> &HopConfig {
        &self.hops[self.hops.len() - 1]
    }

    /// The peer at the far side from the creator: the gateway of an
    /// inbound tunnel, the endpoint of an outbound one.
    pub fn far_end(&self) -> &RouterHash {
        if self.is_inbound() {
            &self.peers[0]
        } else {
            &self.peers[self.peers.len() - 1]
        }
    }

    /// Role of the hop at `index`. A one-hop tunnel's only hop is its
    /// endpoint.
    pub fn role_of(&self, index: usize) -> Role {
        if index + 1 == self.hops.len() {
            Role::Endpoint
        } else if index == 0 {
            Role::Gateway
        } else {
            Role::Participant
        }
    }

    /// Earliest expiration among the hops.
    pub fn expiration(&self) -> u64 {
        self.hops.iter().map(HopConfig::expiration).min().unwrap_or(0)
    }

    pub fn is_expired(&self, clock: &impl Clock) -> bool {
        clock.now_ms() >= self.expiration()
    }

    /// Turn a preprocessed payload into the ciphertext the gateway
    /// receives, by undoing every hop's layer from the endpoint back to
    /// the gateway.
    pub fn wrap(&self, params: &TunnelParams, buf: &mut [u8]) -> Result<(), TunnelError> {
        params.validate()?;
        if buf.len() != params.message_size {
            return Err(TunnelError::MessageSize {
                expected: params.message_size,
                actual: buf.len(),
            });
        }
        for hop in self.hops.iter().rev() {
            let cipher = LayerCipher::new(hop.iv_key(), hop.layer_key());
            undo_layer(&cipher, self.direction, buf);
        }
        Ok(())
    }

    pub fn wrap_message(
        &self,
        params: &TunnelParams,
        msg: &mut TunnelMessage,
    ) -> Result<(), TunnelError> {
        self.wrap(params, msg.as_mut_bytes())
    }

    /// Processor chain for simulating the whole tunnel locally.
    pub fn pipeline(&self, params: TunnelParams) -> Result<Pipeline, TunnelError> {
        Pipeline::new(self, params)
    }
}

impl std::fmt::Debug for TunnelCreatorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelCreatorConfig")
            .field("direction", &self.direction)
            .field("hops", &self.hops)
            .finish()
    }
}

fn check_length(length: usize) -> Result<(), TunnelError> {
    if length == 0 || length > MAX_TUNNEL_LENGTH {
        return Err(TunnelError::InvalidLength {
            length,
            max: MAX_TUNNEL_LENGTH,
        });
    }
    Ok(())
}
