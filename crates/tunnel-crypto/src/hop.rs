use std::fmt;

use crate::error::TunnelError;
use crate::types::{Clock, RouterHash, SessionKey, TunnelId};

/// One hop's cryptographic identity within one tunnel.
///
/// Supplied fully populated by the tunnel build subsystem and immutable
/// from then on: there are no setters, keys are fixed for the lifetime of
/// the tunnel. This is everything a participating router ever holds about
/// a tunnel it relays for.
#[derive(Clone)]
pub struct HopConfig {
    receive_tunnel_id: TunnelId,
    receive_from: Option<RouterHash>,
    send_tunnel_id: Option<TunnelId>,
    send_to: Option<RouterHash>,
    layer_key: SessionKey,
    iv_key: SessionKey,
    creation: u64,
    expiration: u64,
}

impl HopConfig {
    pub fn builder() -> HopConfigBuilder {
        HopConfigBuilder::default()
    }

    /// Tunnel id this hop receives on.
    pub fn receive_tunnel_id(&self) -> TunnelId {
        self.receive_tunnel_id
    }

    /// Previous peer in the tunnel (`None` at the gateway).
    pub fn receive_from(&self) -> Option<&RouterHash> {
        self.receive_from.as_ref()
    }

    /// Tunnel id of the next hop (`None` at the endpoint).
    pub fn send_tunnel_id(&self) -> Option<TunnelId> {
        self.send_tunnel_id
    }

    /// Next peer in the tunnel (`None` at the endpoint).
    pub fn send_to(&self) -> Option<&RouterHash> {
        self.send_to.as_ref()
    }

    /// Key for the payload layer. Never applied to the IV.
    pub fn layer_key(&self) -> &SessionKey {
        &self.layer_key
    }

    /// Key for the IV block transform. Never applied to the payload.
    pub fn iv_key(&self) -> &SessionKey {
        &self.iv_key
    }

    /// Creation time, ms since the epoch.
    pub fn creation(&self) -> u64 {
        self.creation
    }

    /// Expiration time, ms since the epoch.
    pub fn expiration(&self) -> u64 {
        self.expiration
    }

    pub fn is_expired(&self, clock: &impl Clock) -> bool {
        clock.now_ms() >= self.expiration
    }
}

impl fmt::Debug for HopConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HopConfig")
            .field("receive_tunnel_id", &self.receive_tunnel_id)
            .field("receive_from", &self.receive_from)
            .field("send_tunnel_id", &self.send_tunnel_id)
            .field("send_to", &self.send_to)
            .field("expiration", &self.expiration)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for HopConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "receive on [{}]", self.receive_tunnel_id)?;
        if let Some(to) = &self.send_to {
            write!(f, ", send to [{to}]")?;
            if let Some(id) = self.send_tunnel_id {
                write!(f, ":{id}")?;
            }
        }
        write!(f, ", expires {}", self.expiration)
    }
}

/// Builder for [`HopConfig`].
///
/// ```rust
/// use tunnel_crypto::{HopConfig, SessionKey, TunnelId};
///
/// let hop = HopConfig::builder()
///     .receive_tunnel_id(TunnelId::new(7))
///     .layer_key(SessionKey::from_bytes([1; 32]))
///     .iv_key(SessionKey::from_bytes([2; 32]))
///     .expiration(60_000)
///     .build()
///     .unwrap();
/// assert!(hop.send_to().is_none());
/// ```
#[derive(Default, Clone)]
pub struct HopConfigBuilder {
    receive_tunnel_id: Option<TunnelId>,
    receive_from: Option<RouterHash>,
    send_tunnel_id: Option<TunnelId>,
    send_to: Option<RouterHash>,
    layer_key: Option<SessionKey>,
    iv_key: Option<SessionKey>,
    creation: u64,
    expiration: u64,
}

impl HopConfigBuilder {
    pub fn receive_tunnel_id(mut self, id: TunnelId) -> Self {
        self.receive_tunnel_id = Some(id);
        self
    }

    pub fn receive_from(mut self, peer: RouterHash) -> Self {
        self.receive_from = Some(peer);
        self
    }

    pub fn send_tunnel_id(mut self, id: TunnelId) -> Self {
        self.send_tunnel_id = Some(id);
        self
    }

    pub fn send_to(mut self, peer: RouterHash) -> Self {
        self.send_to = Some(peer);
        self
    }

    pub fn layer_key(mut self, key: SessionKey) -> Self {
        self.layer_key = Some(key);
        self
    }

    pub fn iv_key(mut self, key: SessionKey) -> Self {
        self.iv_key = Some(key);
        self
    }

    pub fn creation(mut self, when: u64) -> Self {
        self.creation = when;
        self
    }

    pub fn expiration(mut self, when: u64) -> Self {
        self.expiration = when;
        self
    }

    /// Finish the config. Both keys and the receive tunnel id are required.
    pub fn build(self) -> Result<HopConfig, TunnelError> {
        let layer_key = self
            .layer_key
            .ok_or(TunnelError::IncompleteHop { missing: "layer key" })?;
        let iv_key = self
            .iv_key
            .ok_or(TunnelError::IncompleteHop { missing: "IV key" })?;
        let receive_tunnel_id = self
            .receive_tunnel_id
            .filter(|id| id.is_valid())
            .ok_or(TunnelError::IncompleteHop {
                missing: "receive tunnel id",
            })?;

        Ok(HopConfig {
            receive_tunnel_id,
            receive_from: self.receive_from,
            send_tunnel_id: self.send_tunnel_id,
            send_to: self.send_to,
            layer_key,
            iv_key,
            creation: self.creation,
            expiration: self.expiration,
        })
    }
}

/// Start from an existing config, e.g. to derive one that differs in a
/// single field.
impl From<&HopConfig> for HopConfigBuilder {
    fn from(hop: &HopConfig) -> Self {
        Self {
            receive_tunnel_id: Some(hop.receive_tunnel_id),
            receive_from: hop.receive_from,
            send_tunnel_id: hop.send_tunnel_id,
            send_to: hop.send_to,
            layer_key: Some(hop.layer_key.clone()),
            iv_key: Some(hop.iv_key.clone()),
            creation: hop.creation,
            expiration: hop.expiration,
        }
    }
}
