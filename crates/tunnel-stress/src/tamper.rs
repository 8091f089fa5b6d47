//! Tamper: flip one bit in flight and check that the endpoint drops the
//! message.

use std::time::Instant;

use rand::rngs::StdRng;
use rand::Rng;
use tunnel_crypto::{Direction, Preprocessor, TunnelParams};

use crate::common::{build_tunnel, elapsed_s, full_message};
use crate::events::{emit, EventStarted, EventTamperMiss, EventTamperResult};

pub struct TamperConfig {
    pub params: TunnelParams,
    pub hops: usize,
    pub direction: Direction,
    pub count: u32,
}

pub fn run(config: TamperConfig, rng: &mut StdRng, start: Instant) -> anyhow::Result<()> {
    emit(&EventStarted::new(
        "tamper",
        config.hops,
        config.direction,
        &config.params,
    ));

    let tunnel = build_tunnel(config.hops, config.direction, rng)?;
    let pipeline = tunnel.pipeline(config.params)?;
    let preprocessor = Preprocessor::new(config.params)?;
    let size = config.params.message_size;

    let mut detected = 0u32;
    for seq in 0..config.count {
        let mut buf = full_message(&preprocessor, rng)?;
        tunnel.wrap(&config.params, &mut buf)?;

        let stage = rng.random_range(0..pipeline.len());
        let bit = rng.random_range(0..size * 8);

        for earlier in &pipeline.stages()[..stage] {
            if !earlier.hop_processor().process(&mut buf, 0, size, None) {
                anyhow::bail!("stage rejected an untampered message");
            }
        }
        buf[bit / 8] ^= 1 << (bit % 8);

        if pipeline.traverse_from(&mut buf, stage).is_delivered() {
            tracing::warn!(seq, stage, bit, "tampered message delivered");
            emit(&EventTamperMiss {
                event: "tamper_miss",
                seq,
                stage,
                bit,
            });
        } else {
            detected += 1;
        }
    }

    let missed = config.count - detected;
    emit(&EventTamperResult {
        event: "tamper_result",
        trials: config.count,
        detected,
        missed,
        elapsed_s: elapsed_s(start),
    });
    eprintln!("tamper: {detected}/{} detected", config.count);

    anyhow::ensure!(missed == 0, "{missed} tampered messages were delivered");
    Ok(())
}
