//! Reassembly of fragmented messages at the endpoint.
//!
//! Fragments of one message can arrive spread over several tunnel messages
//! and in any order. Whole messages are delivered immediately; fragmented
//! ones are held until the initial fragment and every follow-on up to the
//! last have arrived, or until they time out.
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tunnel_metrics::{Counter, Distribution, DistributionSnapshot};

use crate::fragment::{DeliveryInstructions, Fragment, MAX_FRAGMENTS};
use crate::types::{Clock, SystemClock};

/// How long a partial message may wait for its missing fragments.
pub const MAX_DEFRAGMENT_TIME_MS: u64 = 45 * 1000;

/// A reassembled message ready for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedMessage {
    /// `None` for messages that arrived in a single fragment.
    pub message_id: Option<u32>,
    pub instructions: DeliveryInstructions,
    pub data: Vec<u8>,
}

/// Counters snapshot for a [`Defragmenter`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefragmenterStats {
    pub completed: u64,
    /// Partial messages dropped: expired or inconsistent fragments.
    pub failed: u64,
    pub duplicates: u64,
    pub pending: usize,
    pub fragments_per_message: DistributionSnapshot,
}

struct Partial {
    instructions: Option<DeliveryInstructions>,
    pieces: Vec<Option<Vec<u8>>>,
    /// Number of the follow-on flagged as last.
    last: Option<usize>,
    started: u64,
}

impl Partial {
    fn new(started: u64) -> Self {
        Self {
            instructions: None,
            pieces: vec![None; MAX_FRAGMENTS],
            last: None,
            started,
        }
    }

    fn is_complete(&self) -> bool {
        match (self.instructions, self.last) {
            (Some(_), Some(last)) => self.pieces[..=last].iter().all(Option::is_some),
            _ => false,
        }
    }

    fn highest_received(&self) -> usize {
        self.pieces.iter().rposition(Option::is_some).unwrap_or(0)
    }
}

/// Caller-owned reassembly state for one endpoint.
pub struct Defragmenter<C: Clock = SystemClock> {
    clock: C,
    partial: HashMap<u32, Partial>,
    completed: Counter,
    failed: Counter,
    duplicates: Counter,
    fragments_per_message: Distribution,
}

impl Defragmenter<SystemClock> {
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }
}

impl Default for Defragmenter<SystemClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> Defragmenter<C> {
    pub fn with_clock(clock: C) -> Self {
        Self {
            clock,
            partial: HashMap::new(),
            completed: Counter::new(),
            failed: Counter::new(),
            duplicates: Counter::new(),
            fragments_per_message: Distribution::new(),
        }
    }

    /// Feed the fragments of one validated tunnel message. Returns every
    /// message they complete.
    pub fn receive(&mut self, fragments: Vec<Fragment>) -> Vec<CompletedMessage> {
        let mut done = Vec::new();
        for fragment in fragments {
            match fragment {
                Fragment::Initial {
                    instructions,
                    message_id: None,
                    data,
                } => {
                    self.record_complete(1);
                    done.push(CompletedMessage {
                        message_id: None,
                        instructions,
                        data,
                    });
                }
                Fragment::Initial {
                    instructions,
                    message_id: Some(id),
                    data,
                } => {
                    let partial = self.entry(id);
                    if partial.pieces[0].is_some() {
                        self.duplicates.inc();
                        continue;
                    }
                    partial.instructions = Some(instructions);
                    partial.pieces[0] = Some(data);
                    done.extend(self.try_complete(id));
                }
                Fragment::FollowOn {
                    message_id,
                    number,
                    is_last,
                    data,
                } => {
                    let number = number as usize;
                    if number == 0 || number >= MAX_FRAGMENTS {
                        self.failed.inc();
                        continue;
                    }
                    let partial = self.entry(message_id);
                    if partial.pieces[number].is_some() {
                        self.duplicates.inc();
                        continue;
                    }
                    let inconsistent = match partial.last {
                        Some(last) => number > last || (is_last && number != last),
                        None => is_last && partial.highest_received() > number,
                    };
                    if inconsistent {
                        tracing::debug!("inconsistent fragment {number} for message {message_id}");
                        self.partial.remove(&message_id);
                        self.failed.inc();
                        continue;
                    }
                    if is_last {
                        partial.last = Some(number);
                    }
                    partial.pieces[number] = Some(data);
                    done.extend(self.try_complete(message_id));
                }
            }
        }
        done
    }

    /// Drop partial messages older than [`MAX_DEFRAGMENT_TIME_MS`].
    /// Returns how many were dropped.
    pub fn expire(&mut self) -> usize {
        let now = self.clock.now_ms();
        let before = self.partial.len();
        self.partial.retain(|id, partial| {
            let keep = now.saturating_sub(partial.started) < MAX_DEFRAGMENT_TIME_MS;
            if !keep {
                tracing::warn!(
                    "message {id} not reassembled in time ({} fragments received)",
                    partial.pieces.iter().filter(|p| p.is_some()).count()
                );
            }
            keep
        });
        let expired = before - self.partial.len();
        self.failed.add(expired as u64);
        expired
    }

    /// Partial messages currently held.
    pub fn pending(&self) -> usize {
        self.partial.len()
    }

    pub fn stats(&self) -> DefragmenterStats {
        DefragmenterStats {
            completed: self.completed.total(),
            failed: self.failed.total(),
            duplicates: self.duplicates.total(),
            pending: self.partial.len(),
            fragments_per_message: self.fragments_per_message.snapshot(),
        }
    }

    fn entry(&mut self, id: u32) -> &mut Partial {
        let now = self.clock.now_ms();
        self.partial.entry(id).or_insert_with(|| Partial::new(now))
    }

    fn try_complete(&mut self, id: u32) -> Option<CompletedMessage> {
        if !self.partial.get(&id)?.is_complete() {
            return None;
        }
        let partial = self.partial.remove(&id)?;
        let last = partial.last?;
        let instructions = partial.instructions?;
        let data: Vec<u8> = partial
            .pieces
            .into_iter()
            .take(last + 1)
            .flatten()
            .flatten()
            .collect();
        self.record_complete(last + 1);
        Some(CompletedMessage {
            message_id: Some(id),
            instructions,
            data,
        })
    }

    fn record_complete(&self, fragments: usize) {
        self.completed.inc();
        self.fragments_per_message.observe(fragments as u64);
    }
}
