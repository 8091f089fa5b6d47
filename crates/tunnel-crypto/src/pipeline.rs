//! Local simulation of a whole tunnel.
//!
//! In production every stage runs on a different router and the network
//! path enforces the order. The creator uses [`Pipeline`] to run the full
//! chain in one process: gateway, participants, endpoint, each stage
//! claiming the previous peer as the sender.
use serde::{Deserialize, Serialize};
use tunnel_metrics::Counter;

use crate::config::TunnelParams;
use crate::creator::TunnelCreatorConfig;
use crate::error::TunnelError;
use crate::fragment::Fragment;
use crate::message::TunnelMessage;
use crate::processor::{EndpointProcessor, GatewayProcessor, HopProcessor};
use crate::types::{Role, RouterHash};

/// Where a message is in its trip through the tunnel.
///
/// Transitions only move forward:
/// `Received → GatewayApplied → HopApplied(1) … → Delivered | Dropped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageState {
    Received,
    GatewayApplied,
    /// Participant at this hop index has applied its layer.
    HopApplied(usize),
    Delivered,
    Dropped,
}

impl MessageState {
    pub fn is_terminal(self) -> bool {
        matches!(self, MessageState::Delivered | MessageState::Dropped)
    }

    /// Position in the forward order. Both terminal states share the
    /// last position.
    pub fn ordinal(self) -> usize {
        match self {
            MessageState::Received => 0,
            MessageState::GatewayApplied => 1,
            MessageState::HopApplied(i) => 1 + i,
            MessageState::Delivered | MessageState::Dropped => usize::MAX,
        }
    }
}

/// One processor in the chain.
#[derive(Debug)]
pub enum Stage {
    Gateway(GatewayProcessor),
    Participant(HopProcessor),
    Endpoint(EndpointProcessor),
}

impl Stage {
    pub fn role(&self) -> Role {
        self.hop_processor().role()
    }

    pub fn hop_processor(&self) -> &HopProcessor {
        match self {
            Stage::Gateway(p) => p.hop_processor(),
            Stage::Participant(p) => p,
            Stage::Endpoint(p) => p.hop_processor(),
        }
    }

    fn with_previous_hop_check(self, enabled: bool) -> Self {
        match self {
            Stage::Participant(p) => Stage::Participant(p.with_previous_hop_check(enabled)),
            Stage::Endpoint(p) => Stage::Endpoint(p.with_previous_hop_check(enabled)),
            gateway => gateway,
        }
    }
}

/// Outcome of one traversal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Traversal {
    pub state: MessageState,
    /// Fragments handed to delivery. Empty unless delivered.
    pub fragments: Vec<Fragment>,
}

impl Traversal {
    pub fn is_delivered(&self) -> bool {
        self.state == MessageState::Delivered
    }
}

/// Counters snapshot for a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStats {
    pub processed: u64,
    pub delivered: u64,
    pub dropped: u64,
    /// Messages each hop transformed, in hop order.
    pub per_hop: Vec<u64>,
}

/// The full processor chain of one tunnel.
///
/// Safe to share across threads: traversals only need `&self` and each
/// works on its own buffer.
#[derive(Debug)]
pub struct Pipeline {
    stages: Vec<Stage>,
    peers: Vec<RouterHash>,
    params: TunnelParams,
    processed: Counter,
    delivered: Counter,
    dropped: Counter,
}

impl Pipeline {
    pub fn new(creator: &TunnelCreatorConfig, params: TunnelParams) -> Result<Self, TunnelError> {
        params.validate()?;
        let direction = creator.direction();
        let mut stages = Vec::with_capacity(creator.len());
        for (i, hop) in creator.hops().iter().enumerate() {
            let hop = hop.clone();
            let stage = match creator.role_of(i) {
                Role::Gateway => Stage::Gateway(GatewayProcessor::new(hop, direction, params)?),
                Role::Participant => {
                    Stage::Participant(HopProcessor::new(hop, direction, Role::Participant, params)?)
                }
                Role::Endpoint => Stage::Endpoint(EndpointProcessor::new(hop, direction, params)?),
            };
            stages.push(stage);
        }
        Ok(Self {
            stages,
            peers: creator.peers().to_vec(),
            params,
            processed: Counter::new(),
            delivered: Counter::new(),
            dropped: Counter::new(),
        })
    }

    /// Check every stage after the first against the peer before it.
    pub fn with_previous_hop_check(mut self, enabled: bool) -> Self {
        self.stages = self
            .stages
            .into_iter()
            .enumerate()
            .map(|(i, stage)| {
                if i == 0 {
                    stage
                } else {
                    stage.with_previous_hop_check(enabled)
                }
            })
            .collect();
        self
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stage(&self, index: usize) -> Option<&Stage> {
        self.stages.get(index)
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn params(&self) -> &TunnelParams {
        &self.params
    }

    /// Run a wrapped message through every stage in order.
    ///
    /// # Panics
    ///
    /// If `buf` is not exactly one tunnel message long.
    pub fn traverse(&self, buf: &mut [u8]) -> Traversal {
        self.traverse_observed(buf, |_, _| {})
    }

    pub fn traverse_message(&self, msg: &mut TunnelMessage) -> Traversal {
        self.traverse(msg.as_mut_bytes())
    }

    /// [`traverse`](Self::traverse), calling `observer` with the state
    /// and buffer contents after every transition.
    pub fn traverse_observed<F>(&self, buf: &mut [u8], observer: F) -> Traversal
    where
        F: FnMut(MessageState, &[u8]),
    {
        self.run(buf, 0, observer)
    }

    /// Resume at stage `from` with a buffer that has already been through
    /// the stages before it.
    pub fn traverse_from(&self, buf: &mut [u8], from: usize) -> Traversal {
        self.run(buf, from, |_, _| {})
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            processed: self.processed.total(),
            delivered: self.delivered.total(),
            dropped: self.dropped.total(),
            per_hop: self
                .stages
                .iter()
                .map(|s| s.hop_processor().processed_count())
                .collect(),
        }
    }

    fn run<F>(&self, buf: &mut [u8], from: usize, mut observer: F) -> Traversal
    where
        F: FnMut(MessageState, &[u8]),
    {
        let length = buf.len();
        self.processed.inc();
        let mut state = MessageState::Received;
        if from == 0 {
            observer(state, buf);
        }

        for (i, stage) in self.stages.iter().enumerate().skip(from) {
            let claimed = i.checked_sub(1).and_then(|prev| self.peers.get(prev));
            match stage {
                Stage::Gateway(gw) => {
                    if !gw.process(buf, 0, length, None) {
                        return self.drop_message(i, buf, &mut observer);
                    }
                    state = MessageState::GatewayApplied;
                }
                Stage::Participant(hop) => {
                    if !hop.process(buf, 0, length, claimed) {
                        return self.drop_message(i, buf, &mut observer);
                    }
                    state = MessageState::HopApplied(i);
                }
                Stage::Endpoint(endpoint) => {
                    return match endpoint.receive(buf, 0, length, claimed) {
                        Some(fragments) => {
                            self.delivered.inc();
                            observer(MessageState::Delivered, buf);
                            Traversal {
                                state: MessageState::Delivered,
                                fragments,
                            }
                        }
                        None => self.drop_message(i, buf, &mut observer),
                    };
                }
            }
            observer(state, buf);
        }

        // Every chain ends with an endpoint stage.
        self.drop_message(self.stages.len(), buf, &mut observer)
    }

    fn drop_message<F>(&self, stage: usize, buf: &[u8], observer: &mut F) -> Traversal
    where
        F: FnMut(MessageState, &[u8]),
    {
        self.dropped.inc();
        tracing::trace!("message dropped at stage {stage}");
        observer(MessageState::Dropped, buf);
        Traversal {
            state: MessageState::Dropped,
            fragments: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum;
    use crate::fragment::DeliveryInstructions;
    use crate::types::Direction;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    const SIZE: usize = 128;

    fn params() -> TunnelParams {
        TunnelParams::new().message_size(SIZE)
    }

    fn creator(length: usize, direction: Direction) -> TunnelCreatorConfig {
        let mut rng = StdRng::seed_from_u64(length as u64);
        TunnelCreatorConfig::generate(length, direction, u64::MAX, &mut rng).unwrap()
    }

    fn preprocessed() -> Vec<u8> {
        let params = params();
        let mut region = vec![0u8; SIZE];
        region[..16].copy_from_slice(&[0x11; 16]);
        let start = 16 + params.checksum_len + 1;
        let mut fragments = Vec::new();
        Fragment::whole(DeliveryInstructions::Local, vec![0x3C; SIZE - start - 3])
            .encode_into(&mut fragments)
            .unwrap();
        region[start..].copy_from_slice(&fragments);
        checksum::write(&params, &mut region, start);
        region
    }

    #[test]
    fn stage_roles_follow_positions() {
        let pipeline = creator(4, Direction::Inbound).pipeline(params()).unwrap();
        let roles: Vec<Role> = pipeline.stages().iter().map(Stage::role).collect();
        assert_eq!(
            roles,
            vec![Role::Gateway, Role::Participant, Role::Participant, Role::Endpoint]
        );
    }

    #[test]
    fn delivers_wrapped_message() {
        let cfg = creator(3, Direction::Outbound);
        let pipeline = cfg.pipeline(params()).unwrap();
        let mut buf = preprocessed();
        cfg.wrap(&params(), &mut buf).unwrap();

        let traversal = pipeline.traverse(&mut buf);
        assert!(traversal.is_delivered());
        assert_eq!(traversal.fragments.len(), 1);
        assert_eq!(buf, preprocessed());
    }

    #[test]
    fn states_move_forward() {
        let cfg = creator(4, Direction::Inbound);
        let pipeline = cfg.pipeline(params()).unwrap();
        let mut buf = preprocessed();
        cfg.wrap(&params(), &mut buf).unwrap();

        let mut states = Vec::new();
        pipeline.traverse_observed(&mut buf, |state, bytes| {
            assert_eq!(bytes.len(), SIZE);
            states.push(state);
        });
        assert_eq!(
            states,
            vec![
                MessageState::Received,
                MessageState::GatewayApplied,
                MessageState::HopApplied(1),
                MessageState::HopApplied(2),
                MessageState::Delivered,
            ]
        );
        assert!(states.windows(2).all(|w| w[0].ordinal() < w[1].ordinal()));
    }

    #[test]
    fn single_hop_is_endpoint_only() {
        let cfg = creator(1, Direction::Inbound);
        let pipeline = cfg.pipeline(params()).unwrap();
        assert!(matches!(pipeline.stage(0), Some(Stage::Endpoint(_))));

        let mut buf = preprocessed();
        cfg.wrap(&params(), &mut buf).unwrap();
        let mut states = Vec::new();
        let traversal = pipeline.traverse_observed(&mut buf, |s, _| states.push(s));
        assert!(traversal.is_delivered());
        assert_eq!(states, vec![MessageState::Received, MessageState::Delivered]);
    }

    #[test]
    fn unwrapped_message_is_dropped() {
        let pipeline = creator(3, Direction::Inbound).pipeline(params()).unwrap();
        let mut buf = preprocessed();
        let traversal = pipeline.traverse(&mut buf);
        assert_eq!(traversal.state, MessageState::Dropped);
        assert!(traversal.fragments.is_empty());
        assert!(traversal.state.is_terminal());
    }

    #[test]
    fn previous_hop_check_passes_in_order() {
        let cfg = creator(5, Direction::Outbound);
        let pipeline = cfg.pipeline(params()).unwrap().with_previous_hop_check(true);
        let mut buf = preprocessed();
        cfg.wrap(&params(), &mut buf).unwrap();
        assert!(pipeline.traverse(&mut buf).is_delivered());
    }

    #[test]
    fn previous_hop_check_on_single_hop_skips_first_stage() {
        let cfg = creator(1, Direction::Outbound);
        let pipeline = cfg.pipeline(params()).unwrap().with_previous_hop_check(true);
        let mut buf = preprocessed();
        cfg.wrap(&params(), &mut buf).unwrap();
        assert!(pipeline.traverse(&mut buf).is_delivered());
    }

    #[test]
    fn resume_after_manual_stages() {
        let cfg = creator(4, Direction::Outbound);
        let pipeline = cfg.pipeline(params()).unwrap();
        let mut buf = preprocessed();
        cfg.wrap(&params(), &mut buf).unwrap();

        for i in 0..2 {
            let hop = pipeline.stage(i).unwrap().hop_processor();
            assert!(hop.process(&mut buf, 0, SIZE, None));
        }
        assert!(pipeline.traverse_from(&mut buf, 2).is_delivered());
        assert_eq!(buf, preprocessed());
    }

    #[test]
    fn stats_count_outcomes() {
        let cfg = creator(3, Direction::Inbound);
        let pipeline = cfg.pipeline(params()).unwrap();

        let mut good = preprocessed();
        cfg.wrap(&params(), &mut good).unwrap();
        pipeline.traverse(&mut good);
        let mut bad = preprocessed();
        pipeline.traverse(&mut bad);

        let stats = pipeline.stats();
        assert_eq!(stats.processed, 2);
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.per_hop, vec![2, 2, 2]);

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["delivered"], 1);
    }
}
