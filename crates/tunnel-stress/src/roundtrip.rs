//! Round trip: gateway preprocessing, creator wrap, full traversal and
//! endpoint reassembly for a stream of random messages.

use std::time::Instant;

use rand::rngs::StdRng;
use tunnel_crypto::{
    DeliveryInstructions, Defragmenter, Direction, PendingMessage, Preprocessor, TunnelParams,
};

use crate::common::{build_tunnel, elapsed_s, random_payload};
use crate::events::{emit, EventRoundtripResult, EventStarted};

pub struct RoundtripConfig {
    pub params: TunnelParams,
    pub hops: usize,
    pub direction: Direction,
    pub count: u32,
    pub payload_size: usize,
}

pub fn run(config: RoundtripConfig, rng: &mut StdRng, start: Instant) -> anyhow::Result<()> {
    emit(&EventStarted::new(
        "roundtrip",
        config.hops,
        config.direction,
        &config.params,
    ));

    let tunnel = build_tunnel(config.hops, config.direction, rng)?;
    let pipeline = tunnel.pipeline(config.params)?;
    let preprocessor = Preprocessor::new(config.params)?;
    let mut defragmenter = Defragmenter::new();

    let mut reassembled = 0u32;
    let mut mismatched = 0u32;
    let run_start = Instant::now();

    for seq in 0..config.count {
        let data = random_payload(config.payload_size, rng);
        let pending = PendingMessage {
            message_id: seq,
            instructions: DeliveryInstructions::Local,
            data,
        };

        for mut msg in preprocessor.preprocess_queue(rng, std::slice::from_ref(&pending))? {
            tunnel.wrap_message(&config.params, &mut msg)?;
            let traversal = pipeline.traverse_message(&mut msg);
            if !traversal.is_delivered() {
                tracing::warn!(seq, "untampered message dropped");
                continue;
            }
            for done in defragmenter.receive(traversal.fragments) {
                reassembled += 1;
                if done.data != pending.data {
                    mismatched += 1;
                    tracing::warn!(seq, "reassembled payload differs");
                }
            }
        }

        if (seq + 1) % 1000 == 0 {
            eprintln!("  {}/{} messages", seq + 1, config.count);
        }
    }

    let secs = run_start.elapsed().as_secs_f64();
    let rate = if secs > 0.0 {
        config.count as f64 / secs
    } else {
        0.0
    };
    emit(&EventRoundtripResult {
        event: "roundtrip_result",
        messages_sent: config.count,
        messages_reassembled: reassembled,
        mismatched,
        tunnel_messages: preprocessor.built_count(),
        padding_avg: preprocessor.padding_stats().mean(),
        messages_per_sec: rate,
        pipeline: pipeline.stats(),
        elapsed_s: elapsed_s(start),
    });
    eprintln!(
        "roundtrip: {reassembled}/{} reassembled, {mismatched} mismatched",
        config.count
    );

    anyhow::ensure!(
        reassembled == config.count && mismatched == 0,
        "{} of {} messages lost or corrupted",
        config.count - reassembled + mismatched,
        config.count
    );
    Ok(())
}
