//! Parallel: one pipeline shared by several threads, each pushing its own
//! messages through.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tunnel_crypto::{Direction, Preprocessor, TunnelParams};

use crate::common::{build_tunnel, elapsed_s, full_message};
use crate::events::{emit, EventParallelResult, EventStarted};

pub struct ParallelConfig {
    pub params: TunnelParams,
    pub hops: usize,
    pub direction: Direction,
    pub threads: usize,
    /// Messages per thread.
    pub count: u32,
}

pub fn run(config: ParallelConfig, rng: &mut StdRng, start: Instant) -> anyhow::Result<()> {
    anyhow::ensure!(config.threads > 0, "--threads must be at least 1");
    emit(&EventStarted::new(
        "parallel",
        config.hops,
        config.direction,
        &config.params,
    ));

    let tunnel = build_tunnel(config.hops, config.direction, rng)?;
    let pipeline = tunnel.pipeline(config.params)?;
    let preprocessor = Preprocessor::new(config.params)?;
    let (params, count) = (config.params, config.count);
    let data_len = params.fragment_capacity() - 3;
    let delivered = AtomicU64::new(0);
    let seeds: Vec<u64> = (0..config.threads).map(|_| rng.random()).collect();
    let run_start = Instant::now();

    std::thread::scope(|scope| -> anyhow::Result<()> {
        let workers: Vec<_> = seeds
            .iter()
            .map(|&seed| {
                let (tunnel, pipeline, preprocessor, delivered) =
                    (&tunnel, &pipeline, &preprocessor, &delivered);
                scope.spawn(move || -> anyhow::Result<()> {
                    let mut rng = StdRng::seed_from_u64(seed);
                    for _ in 0..count {
                        let mut buf = full_message(preprocessor, &mut rng)?;
                        let expected = buf[buf.len() - data_len..].to_vec();
                        tunnel.wrap(&params, &mut buf)?;
                        let traversal = pipeline.traverse(&mut buf);
                        let intact = traversal
                            .fragments
                            .first()
                            .is_some_and(|f| f.data() == expected.as_slice());
                        if traversal.is_delivered() && intact {
                            delivered.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    Ok(())
                })
            })
            .collect();

        for worker in workers {
            worker
                .join()
                .map_err(|_| anyhow::anyhow!("worker thread panicked"))??;
        }
        Ok(())
    })?;

    let secs = run_start.elapsed().as_secs_f64();
    let messages = config.threads as u64 * u64::from(config.count);
    let delivered = delivered.into_inner();
    let rate = if secs > 0.0 {
        messages as f64 / secs
    } else {
        0.0
    };
    emit(&EventParallelResult {
        event: "parallel_result",
        threads: config.threads,
        messages,
        delivered,
        messages_per_sec: rate,
        pipeline: pipeline.stats(),
        elapsed_s: elapsed_s(start),
    });
    eprintln!(
        "parallel: {delivered}/{messages} delivered on {} threads ({rate:.0} msg/s)",
        config.threads
    );

    anyhow::ensure!(
        delivered == messages,
        "{} of {messages} messages lost",
        messages - delivered
    );
    Ok(())
}
