//! Per-hop layered transform and the three roles built on it.
//!
//! Every stage runs the same five steps with its own keys:
//!
//! 1. read the 16-byte IV at the head of the message
//! 2. `iv' = E(ivKey, iv)`
//! 3. CBC-decrypt (inbound) or CBC-encrypt (outbound) the payload under
//!    `layerKey` with IV `iv'`
//! 4. `iv'' = E(ivKey, iv')`
//! 5. write `iv''` back in place of the IV
//!
//! The role only decides which hooks run around the transform: the
//! previous-hop check for participants and the endpoint, checksum
//! validation and fragment parsing for the endpoint.
use tunnel_metrics::Counter;

use crate::checksum;
use crate::config::TunnelParams;
use crate::crypto::{read_iv, LayerCipher};
use crate::error::TunnelError;
use crate::fragment::{parse_fragments, Fragment};
use crate::hop::HopConfig;
use crate::message::TunnelMessage;
use crate::types::{Direction, Role, RouterHash, IV_LENGTH};

// ── Hop ────────────────────────────────────────────────────────────────

/// Applies one hop's layer to tunnel messages.
///
/// Holds a single [`HopConfig`] and nothing else about the tunnel. All
/// operations take `&self`; one processor can serve any number of threads
/// as long as each call gets its own buffer.
pub struct HopProcessor {
    hop: HopConfig,
    cipher: LayerCipher,
    direction: Direction,
    role: Role,
    params: TunnelParams,
    check_previous_hop: bool,
    processed: Counter,
    rejected: Counter,
}

impl HopProcessor {
    /// Fails if `params` do not describe a usable message layout.
    pub fn new(
        hop: HopConfig,
        direction: Direction,
        role: Role,
        params: TunnelParams,
    ) -> Result<Self, TunnelError> {
        params.validate()?;
        let cipher = LayerCipher::new(hop.iv_key(), hop.layer_key());
        Ok(Self {
            hop,
            cipher,
            direction,
            role,
            params,
            check_previous_hop: false,
            processed: Counter::new(),
            rejected: Counter::new(),
        })
    }

    /// Require the claimed previous hop to match the config's
    /// `receive_from`. Never applies to the gateway role.
    pub fn with_previous_hop_check(mut self, enabled: bool) -> Self {
        self.check_previous_hop = enabled;
        self
    }

    pub fn hop(&self) -> &HopConfig {
        &self.hop
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn params(&self) -> &TunnelParams {
        &self.params
    }

    /// Apply this hop's layer to `buf[offset..offset + length]`.
    ///
    /// Returns `false`, leaving the buffer untouched, only when the
    /// previous-hop check is enabled and `claimed_previous_hop` does not
    /// match.
    ///
    /// # Panics
    ///
    /// If `length` is not the configured message size or the range falls
    /// outside `buf`.
    pub fn process(
        &self,
        buf: &mut [u8],
        offset: usize,
        length: usize,
        claimed_previous_hop: Option<&RouterHash>,
    ) -> bool {
        let region = self.region(buf, offset, length);
        if !self.previous_hop_matches(claimed_previous_hop) {
            self.rejected.inc();
            tracing::debug!(
                "previous hop mismatch on [{}]: claimed {:?}",
                self.hop.receive_tunnel_id(),
                claimed_previous_hop
            );
            return false;
        }
        apply_layer(&self.cipher, self.direction, region);
        self.processed.inc();
        true
    }

    /// [`process`](Self::process) over a whole [`TunnelMessage`].
    pub fn process_message(
        &self,
        msg: &mut TunnelMessage,
        claimed_previous_hop: Option<&RouterHash>,
    ) -> bool {
        let length = msg.len();
        self.process(msg.as_mut_bytes(), 0, length, claimed_previous_hop)
    }

    /// Undo [`process`](Self::process). The tunnel creator runs this for
    /// every hop, last to first, to build the ciphertext the gateway
    /// receives.
    ///
    /// # Panics
    ///
    /// Same contract as [`process`](Self::process).
    pub fn reverse(&self, buf: &mut [u8], offset: usize, length: usize) {
        let region = self.region(buf, offset, length);
        undo_layer(&self.cipher, self.direction, region);
    }

    /// Messages transformed since creation.
    pub fn processed_count(&self) -> u64 {
        self.processed.total()
    }

    /// Messages transformed since the last call.
    pub fn take_recent_count(&self) -> u64 {
        self.processed.take_recent()
    }

    /// Messages refused by the previous-hop check.
    pub fn rejected_count(&self) -> u64 {
        self.rejected.total()
    }

    fn region<'a>(&self, buf: &'a mut [u8], offset: usize, length: usize) -> &'a mut [u8] {
        assert_eq!(
            length, self.params.message_size,
            "tunnel message length {length} != {}",
            self.params.message_size
        );
        let end = offset
            .checked_add(length)
            .filter(|end| *end <= buf.len());
        match end {
            Some(end) => &mut buf[offset..end],
            None => panic!(
                "tunnel message range {offset}+{length} outside {}-byte buffer",
                buf.len()
            ),
        }
    }

    fn previous_hop_matches(&self, claimed: Option<&RouterHash>) -> bool {
        if !self.check_previous_hop || self.role == Role::Gateway {
            return true;
        }
        match (claimed, self.hop.receive_from()) {
            (Some(claimed), Some(expected)) => claimed == expected,
            _ => false,
        }
    }
}

/// The forward transform on one message region.
pub(crate) fn apply_layer(cipher: &LayerCipher, direction: Direction, region: &mut [u8]) {
    let (iv_slot, payload) = region.split_at_mut(IV_LENGTH);
    let mut iv = read_iv(iv_slot);
    cipher.encrypt_iv(&mut iv);
    match direction {
        Direction::Inbound => cipher.cbc_decrypt(&iv, payload),
        Direction::Outbound => cipher.cbc_encrypt(&iv, payload),
    }
    cipher.encrypt_iv(&mut iv);
    iv_slot.copy_from_slice(&iv);
}

/// Inverse of [`apply_layer`].
pub(crate) fn undo_layer(cipher: &LayerCipher, direction: Direction, region: &mut [u8]) {
    let (iv_slot, payload) = region.split_at_mut(IV_LENGTH);
    let mut iv = read_iv(iv_slot);
    cipher.decrypt_iv(&mut iv);
    match direction {
        Direction::Inbound => cipher.cbc_encrypt(&iv, payload),
        Direction::Outbound => cipher.cbc_decrypt(&iv, payload),
    }
    cipher.decrypt_iv(&mut iv);
    iv_slot.copy_from_slice(&iv);
}

impl std::fmt::Debug for HopProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HopProcessor")
            .field("hop", &self.hop)
            .field("direction", &self.direction)
            .field("role", &self.role)
            .field("processed", &self.processed)
            .finish_non_exhaustive()
    }
}

// ── Gateway ────────────────────────────────────────────────────────────

/// First stage of a tunnel.
///
/// Its input is a preprocessed payload already wrapped by the tunnel
/// creator. The sender is arbitrary, so there is no previous-hop check.
#[derive(Debug)]
pub struct GatewayProcessor {
    inner: HopProcessor,
}

impl GatewayProcessor {
    pub fn new(
        hop: HopConfig,
        direction: Direction,
        params: TunnelParams,
    ) -> Result<Self, TunnelError> {
        Ok(Self {
            inner: HopProcessor::new(hop, direction, Role::Gateway, params)?,
        })
    }

    /// Apply hop 0's layer. `_external_sender_hint` identifies whoever
    /// handed over the message and is not checked.
    pub fn process(
        &self,
        buf: &mut [u8],
        offset: usize,
        length: usize,
        _external_sender_hint: Option<&RouterHash>,
    ) -> bool {
        self.inner.process(buf, offset, length, None)
    }

    pub fn process_message(&self, msg: &mut TunnelMessage) -> bool {
        self.inner.process_message(msg, None)
    }

    pub fn hop_processor(&self) -> &HopProcessor {
        &self.inner
    }
}

// ── Endpoint ───────────────────────────────────────────────────────────

/// Last stage of a tunnel: applies the final layer, then checks the
/// end-to-end checksum and exposes the fragments.
///
/// Failures are silent to peers. The caller must discard the buffer when
/// validation returns `false`.
#[derive(Debug)]
pub struct EndpointProcessor {
    inner: HopProcessor,
    rejected: Counter,
    corrupt: Counter,
    dropped_fragments: Counter,
}

impl EndpointProcessor {
    pub fn new(
        hop: HopConfig,
        direction: Direction,
        params: TunnelParams,
    ) -> Result<Self, TunnelError> {
        Ok(Self {
            inner: HopProcessor::new(hop, direction, Role::Endpoint, params)?,
            rejected: Counter::new(),
            corrupt: Counter::new(),
            dropped_fragments: Counter::new(),
        })
    }

    pub fn with_previous_hop_check(mut self, enabled: bool) -> Self {
        self.inner = self.inner.with_previous_hop_check(enabled);
        self
    }

    /// Apply the last layer and validate the checksum.
    ///
    /// On `true` the range holds the preprocessed payload exactly as the
    /// creator built it.
    pub fn retrieve_preprocessed_data(
        &self,
        buf: &mut [u8],
        offset: usize,
        length: usize,
        claimed_previous_hop: Option<&RouterHash>,
    ) -> bool {
        if !self.inner.process(buf, offset, length, claimed_previous_hop) {
            return false;
        }
        let params = self.inner.params();
        if checksum::verify(params, &buf[offset..offset + length]) {
            true
        } else {
            self.rejected.inc();
            tracing::debug!(
                "checksum mismatch at endpoint [{}]",
                self.inner.hop().receive_tunnel_id()
            );
            false
        }
    }

    /// Validate and parse the message into delivery-ready fragments.
    ///
    /// `None` on any failure: provenance, checksum, or framing that does
    /// not parse even though the checksum matched.
    pub fn receive(
        &self,
        buf: &mut [u8],
        offset: usize,
        length: usize,
        claimed_previous_hop: Option<&RouterHash>,
    ) -> Option<Vec<Fragment>> {
        if !self.retrieve_preprocessed_data(buf, offset, length, claimed_previous_hop) {
            return None;
        }
        let params = self.inner.params();
        let region = &buf[offset..offset + length];
        let start = checksum::find_fragments_start(params, region)?;
        match parse_fragments(params, &region[start..]) {
            Ok(parsed) => {
                self.dropped_fragments.add(parsed.dropped as u64);
                Some(parsed.fragments)
            }
            Err(e) => {
                self.corrupt.inc();
                tracing::warn!("corrupt fragments after valid checksum: {e}");
                None
            }
        }
    }

    pub fn receive_message(
        &self,
        msg: &mut TunnelMessage,
        claimed_previous_hop: Option<&RouterHash>,
    ) -> Option<Vec<Fragment>> {
        let length = msg.len();
        self.receive(msg.as_mut_bytes(), 0, length, claimed_previous_hop)
    }

    pub fn hop_processor(&self) -> &HopProcessor {
        &self.inner
    }

    /// Messages that failed checksum validation.
    pub fn rejected_count(&self) -> u64 {
        self.rejected.total()
    }

    /// Messages whose fragments did not parse.
    pub fn corrupt_count(&self) -> u64 {
        self.corrupt.total()
    }

    /// Fragments skipped for unusable delivery instructions.
    pub fn dropped_fragment_count(&self) -> u64 {
        self.dropped_fragments.total()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::DeliveryInstructions;
    use crate::types::{SessionKey, TunnelId};

    const SIZE: usize = 128;

    fn params() -> TunnelParams {
        TunnelParams::new().message_size(SIZE)
    }

    fn hop(seed: u8) -> HopConfig {
        HopConfig::builder()
            .receive_tunnel_id(TunnelId::new(seed as u32 + 1))
            .receive_from(RouterHash::from_bytes([seed.wrapping_sub(1); 32]))
            .layer_key(SessionKey::from_bytes([seed; 32]))
            .iv_key(SessionKey::from_bytes([seed ^ 0x5A; 32]))
            .build()
            .unwrap()
    }

    fn processor(seed: u8, direction: Direction, role: Role) -> HopProcessor {
        HopProcessor::new(hop(seed), direction, role, params()).unwrap()
    }

    fn pattern() -> Vec<u8> {
        (0..SIZE).map(|i| (i * 7 + 3) as u8).collect()
    }

    /// One local fragment filling the message, checksum written.
    fn preprocessed() -> Vec<u8> {
        let params = params();
        let mut region = vec![0u8; SIZE];
        region[..16].copy_from_slice(&[0x42; 16]);
        let start = 16 + params.checksum_len + 1;
        let data_len = SIZE - start - 3;
        let mut fragments = Vec::new();
        Fragment::whole(DeliveryInstructions::Local, vec![0xC5; data_len])
            .encode_into(&mut fragments)
            .unwrap();
        region[start..].copy_from_slice(&fragments);
        checksum::write(&params, &mut region, start);
        region
    }

    #[test]
    fn processors_are_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<HopProcessor>();
        assert_send_sync::<GatewayProcessor>();
        assert_send_sync::<EndpointProcessor>();
    }

    #[test]
    fn process_changes_iv_and_payload() {
        for direction in [Direction::Inbound, Direction::Outbound] {
            let p = processor(1, direction, Role::Participant);
            let original = pattern();
            let mut buf = original.clone();
            assert!(p.process(&mut buf, 0, SIZE, None));
            assert_eq!(buf.len(), SIZE);
            assert_ne!(buf[..16], original[..16]);
            assert_ne!(buf[16..], original[16..]);
        }
    }

    #[test]
    fn reverse_undoes_process() {
        for direction in [Direction::Inbound, Direction::Outbound] {
            let p = processor(9, direction, Role::Participant);
            let original = pattern();
            let mut buf = original.clone();
            p.reverse(&mut buf, 0, SIZE);
            assert!(p.process(&mut buf, 0, SIZE, None));
            assert_eq!(buf, original);
        }
    }

    #[test]
    fn forwarded_iv_differs_from_payload_iv() {
        // iv'' must never be the IV that keyed the payload layer.
        let p = processor(3, Direction::Inbound, Role::Participant);
        let cipher = LayerCipher::new(p.hop().iv_key(), p.hop().layer_key());
        let original = pattern();
        let mut payload_iv = read_iv(&original);
        cipher.encrypt_iv(&mut payload_iv);

        let mut buf = original.clone();
        p.process(&mut buf, 0, SIZE, None);
        assert_ne!(buf[..16], payload_iv);
    }

    #[test]
    fn process_respects_offset() {
        let p = processor(4, Direction::Outbound, Role::Participant);
        let mut buf = vec![0xEE; SIZE + 20];
        buf[10..10 + SIZE].copy_from_slice(&pattern());
        assert!(p.process(&mut buf, 10, SIZE, None));
        assert!(buf[..10].iter().all(|b| *b == 0xEE));
        assert!(buf[10 + SIZE..].iter().all(|b| *b == 0xEE));
    }

    #[test]
    #[should_panic(expected = "tunnel message length")]
    fn wrong_length_panics() {
        let p = processor(1, Direction::Inbound, Role::Participant);
        let mut buf = vec![0u8; 256];
        p.process(&mut buf, 0, 144, None);
    }

    #[test]
    #[should_panic(expected = "outside")]
    fn out_of_bounds_panics() {
        let p = processor(1, Direction::Inbound, Role::Participant);
        let mut buf = vec![0u8; SIZE + 8];
        p.process(&mut buf, 16, SIZE, None);
    }

    #[test]
    fn previous_hop_check() {
        let p = processor(5, Direction::Inbound, Role::Participant).with_previous_hop_check(true);
        let expected = RouterHash::from_bytes([4; 32]);
        let stranger = RouterHash::from_bytes([0xFF; 32]);
        let original = pattern();

        let mut buf = original.clone();
        assert!(!p.process(&mut buf, 0, SIZE, Some(&stranger)));
        assert_eq!(buf, original);
        assert!(!p.process(&mut buf, 0, SIZE, None));
        assert_eq!(buf, original);
        assert_eq!(p.rejected_count(), 2);

        assert!(p.process(&mut buf, 0, SIZE, Some(&expected)));
        assert_eq!(p.processed_count(), 1);
    }

    #[test]
    fn previous_hop_check_is_off_by_default() {
        let p = processor(5, Direction::Inbound, Role::Participant);
        let mut buf = pattern();
        let stranger = RouterHash::from_bytes([0xFF; 32]);
        assert!(p.process(&mut buf, 0, SIZE, Some(&stranger)));
    }

    #[test]
    fn gateway_ignores_sender_hint() {
        let gw = GatewayProcessor::new(hop(6), Direction::Outbound, params()).unwrap();
        let participant = processor(6, Direction::Outbound, Role::Participant);
        let stranger = RouterHash::from_bytes([0xFF; 32]);

        let mut a = pattern();
        let mut b = pattern();
        assert!(gw.process(&mut a, 0, SIZE, Some(&stranger)));
        assert!(participant.process(&mut b, 0, SIZE, None));
        assert_eq!(a, b);
    }

    #[test]
    fn gateway_role_skips_check_even_when_enabled() {
        let p = processor(2, Direction::Inbound, Role::Gateway).with_previous_hop_check(true);
        let mut buf = pattern();
        assert!(p.process(&mut buf, 0, SIZE, None));
    }

    #[test]
    fn counters_track_recent_window() {
        let p = processor(7, Direction::Inbound, Role::Participant);
        let mut buf = pattern();
        for _ in 0..3 {
            p.process(&mut buf, 0, SIZE, None);
        }
        assert_eq!(p.take_recent_count(), 3);
        p.process(&mut buf, 0, SIZE, None);
        assert_eq!(p.take_recent_count(), 1);
        assert_eq!(p.processed_count(), 4);
    }

    #[test]
    fn endpoint_accepts_wrapped_payload() {
        for direction in [Direction::Inbound, Direction::Outbound] {
            let endpoint = EndpointProcessor::new(hop(8), direction, params()).unwrap();
            let original = preprocessed();
            let mut buf = original.clone();
            endpoint.hop_processor().reverse(&mut buf, 0, SIZE);

            let fragments = endpoint.receive(&mut buf, 0, SIZE, None).unwrap();
            assert_eq!(buf, original);
            assert_eq!(fragments.len(), 1);
            assert!(fragments[0].data().iter().all(|b| *b == 0xC5));
        }
    }

    #[test]
    fn endpoint_rejects_unwrapped_payload() {
        let endpoint = EndpointProcessor::new(hop(8), Direction::Inbound, params()).unwrap();
        let mut buf = preprocessed();
        assert!(!endpoint.retrieve_preprocessed_data(&mut buf, 0, SIZE, None));
        assert_eq!(endpoint.rejected_count(), 1);
    }

    #[test]
    fn endpoint_checks_previous_hop() {
        let endpoint = EndpointProcessor::new(hop(8), Direction::Inbound, params())
            .unwrap()
            .with_previous_hop_check(true);
        let mut buf = preprocessed();
        endpoint.hop_processor().reverse(&mut buf, 0, SIZE);
        let wrapped = buf.clone();

        let stranger = RouterHash::from_bytes([0xFF; 32]);
        assert!(endpoint.receive(&mut buf, 0, SIZE, Some(&stranger)).is_none());
        assert_eq!(buf, wrapped);

        let expected = RouterHash::from_bytes([7; 32]);
        assert!(endpoint.receive(&mut buf, 0, SIZE, Some(&expected)).is_some());
    }

    #[test]
    fn endpoint_reports_corrupt_fragments() {
        // Valid checksum over bytes that are not a fragment sequence.
        let params = params();
        let mut region = vec![0u8; SIZE];
        let start = 16 + params.checksum_len + 1;
        region[start] = 0x00;
        region[start + 1] = 0xFF;
        region[start + 2] = 0xFF;
        for b in &mut region[start + 3..] {
            *b = 1;
        }
        checksum::write(&params, &mut region, start);

        let endpoint = EndpointProcessor::new(hop(8), Direction::Outbound, params).unwrap();
        endpoint.hop_processor().reverse(&mut region, 0, SIZE);
        assert!(endpoint.receive(&mut region, 0, SIZE, None).is_none());
        assert_eq!(endpoint.corrupt_count(), 1);
        assert_eq!(endpoint.rejected_count(), 0);
    }

    #[test]
    fn endpoint_drops_fragment_for_tunnel_zero() {
        let params = params();
        let start = 16 + params.checksum_len + 1;
        let mut fragments = Vec::new();
        Fragment::whole(
            DeliveryInstructions::Tunnel {
                tunnel_id: TunnelId::new(0),
                gateway: RouterHash::from_bytes([3; 32]),
            },
            vec![1; 10],
        )
        .encode_into(&mut fragments)
        .unwrap();
        let rest = SIZE - start - fragments.len() - 3;
        Fragment::whole(DeliveryInstructions::Local, vec![2; rest])
            .encode_into(&mut fragments)
            .unwrap();

        let mut region = vec![0x42; SIZE];
        region[16 + params.checksum_len] = 0;
        region[start..].copy_from_slice(&fragments);
        checksum::write(&params, &mut region, start);

        let endpoint = EndpointProcessor::new(hop(8), Direction::Inbound, params).unwrap();
        endpoint.hop_processor().reverse(&mut region, 0, SIZE);
        let delivered = endpoint.receive(&mut region, 0, SIZE, None).unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].data(), vec![2; rest].as_slice());
        assert_eq!(endpoint.dropped_fragment_count(), 1);
    }

    #[test]
    fn constructor_validates_params() {
        let bad = TunnelParams::new().message_size(100);
        assert!(HopProcessor::new(hop(1), Direction::Inbound, Role::Participant, bad).is_err());
        assert!(EndpointProcessor::new(hop(1), Direction::Inbound, bad).is_err());
    }
}
