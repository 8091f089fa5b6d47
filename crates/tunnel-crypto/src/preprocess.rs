//! Builds preprocessed tunnel messages on the creator's side, before
//! [`TunnelCreatorConfig::wrap`](crate::TunnelCreatorConfig::wrap).
use rand::{CryptoRng, RngCore};
use tunnel_metrics::{Counter, Distribution, DistributionSnapshot};

use crate::checksum;
use crate::config::TunnelParams;
use crate::error::TunnelError;
use crate::fragment::{DeliveryInstructions, Fragment, FragmentError, MAX_FRAGMENTS};
use crate::message::TunnelMessage;
use crate::types::IV_LENGTH;

/// A message waiting at the gateway to be sent down the tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMessage {
    /// Identifies the fragments of this message at the endpoint.
    pub message_id: u32,
    pub instructions: DeliveryInstructions,
    pub data: Vec<u8>,
}

/// Lays out fragments as `IV ‖ checksum ‖ nonzero padding ‖ 0x00 ‖ fragments`.
#[derive(Debug)]
pub struct Preprocessor {
    params: TunnelParams,
    built: Counter,
    fragments: Counter,
    padding: Distribution,
}

impl Preprocessor {
    pub fn new(params: TunnelParams) -> Result<Self, TunnelError> {
        params.validate()?;
        Ok(Self {
            params,
            built: Counter::new(),
            fragments: Counter::new(),
            padding: Distribution::new(),
        })
    }

    pub fn params(&self) -> &TunnelParams {
        &self.params
    }

    /// Build one tunnel message holding `fragments`, in order.
    pub fn preprocess<R: RngCore + CryptoRng + ?Sized>(
        &self,
        rng: &mut R,
        fragments: &[Fragment],
    ) -> Result<TunnelMessage, TunnelError> {
        let capacity = self.params.fragment_capacity();
        let size: usize = fragments.iter().map(Fragment::encoded_len).sum();
        if size > capacity {
            return Err(TunnelError::PayloadTooLarge { size, capacity });
        }

        let mut encoded = Vec::with_capacity(size);
        for fragment in fragments {
            fragment.encode_into(&mut encoded)?;
        }

        let mut msg = TunnelMessage::zeroed(&self.params);
        let region = msg.as_mut_bytes();
        let start = region.len() - encoded.len();
        let padding_start = IV_LENGTH + self.params.checksum_len;

        rng.fill_bytes(&mut region[..IV_LENGTH]);
        let padding = &mut region[padding_start..start - 1];
        rng.fill_bytes(padding);
        for b in padding.iter_mut() {
            while *b == 0 {
                *b = rng.next_u32() as u8;
            }
        }
        region[start - 1] = 0;
        region[start..].copy_from_slice(&encoded);
        checksum::write(&self.params, region, start);

        self.built.inc();
        self.fragments.add(fragments.len() as u64);
        self.padding.observe((start - 1 - padding_start) as u64);
        Ok(msg)
    }

    /// Pack `messages` into as few tunnel messages as possible.
    ///
    /// A message that does not fit in the space left is split into an
    /// initial fragment and follow-on fragments spanning several tunnel
    /// messages, at most [`MAX_FRAGMENTS`] in total.
    pub fn preprocess_queue<R: RngCore + CryptoRng + ?Sized>(
        &self,
        rng: &mut R,
        messages: &[PendingMessage],
    ) -> Result<Vec<TunnelMessage>, TunnelError> {
        let capacity = self.params.fragment_capacity();
        let max = self.params.max_fragment_size();
        let mut out = Vec::new();
        let mut batch = Batch::default();

        for msg in messages {
            let len = msg.data.len();
            if len == 0 {
                return Err(FragmentError::InvalidSize { size: 0, max }.into());
            }

            let whole = msg.instructions.header_len(false) + len;
            if whole <= capacity - batch.used {
                batch.push(Fragment::whole(msg.instructions, msg.data.clone()));
                continue;
            }

            let header = msg.instructions.header_len(true);
            if capacity - batch.used < header + 1 {
                batch.flush(self, rng, &mut out)?;
                if whole <= capacity {
                    batch.push(Fragment::whole(msg.instructions, msg.data.clone()));
                    continue;
                }
            }

            let first = (capacity - batch.used - header).min(len);
            let needed = 1 + (len - first).div_ceil(max);
            if needed > MAX_FRAGMENTS {
                return Err(TunnelError::TooManyFragments {
                    needed,
                    max: MAX_FRAGMENTS,
                });
            }

            batch.push(Fragment::Initial {
                instructions: msg.instructions,
                message_id: Some(msg.message_id),
                data: msg.data[..first].to_vec(),
            });
            batch.flush(self, rng, &mut out)?;

            let mut offset = first;
            let mut number = 1u8;
            while offset < len {
                let take = max.min(len - offset);
                let is_last = offset + take == len;
                batch.push(Fragment::FollowOn {
                    message_id: msg.message_id,
                    number,
                    is_last,
                    data: msg.data[offset..offset + take].to_vec(),
                });
                offset += take;
                number += 1;
                if !is_last {
                    batch.flush(self, rng, &mut out)?;
                }
            }
        }
        batch.flush(self, rng, &mut out)?;

        tracing::trace!(
            "packed {} messages into {} tunnel messages",
            messages.len(),
            out.len()
        );
        Ok(out)
    }

    /// Tunnel messages built so far.
    pub fn built_count(&self) -> u64 {
        self.built.total()
    }

    /// Fragments written so far.
    pub fn fragment_count(&self) -> u64 {
        self.fragments.total()
    }

    /// Padding bytes per built message.
    pub fn padding_stats(&self) -> DistributionSnapshot {
        self.padding.snapshot()
    }
}

/// Fragments collected for the tunnel message being filled.
#[derive(Default)]
struct Batch {
    fragments: Vec<Fragment>,
    used: usize,
}

impl Batch {
    fn push(&mut self, fragment: Fragment) {
        self.used += fragment.encoded_len();
        self.fragments.push(fragment);
    }

    fn flush<R: RngCore + CryptoRng + ?Sized>(
        &mut self,
        pre: &Preprocessor,
        rng: &mut R,
        out: &mut Vec<TunnelMessage>,
    ) -> Result<(), TunnelError> {
        if self.fragments.is_empty() {
            return Ok(());
        }
        out.push(pre.preprocess(rng, &self.fragments)?);
        self.fragments.clear();
        self.used = 0;
        Ok(())
    }
}
