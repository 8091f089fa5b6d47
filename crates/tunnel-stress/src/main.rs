mod common;
mod events;
mod parallel;
mod roundtrip;
mod tamper;

use std::path::PathBuf;
use std::time::Instant;

use clap::{Parser, Subcommand};
use common::DirectionArg;

#[derive(Parser)]
#[command(name = "tunnel-stress", about = "Local tunnel simulation and stress runs")]
struct Cli {
    /// JSON file with tunnel parameters (message_size, checksum_len).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Tunnel message size in bytes (overrides config and environment).
    #[arg(long)]
    message_size: Option<usize>,

    /// Checksum width in bytes (overrides config and environment).
    #[arg(long)]
    checksum_len: Option<usize>,

    /// Seed for a reproducible run. Random when omitted.
    #[arg(long)]
    seed: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Preprocess, wrap, traverse and reassemble random messages.
    Roundtrip {
        /// Hops per tunnel.
        #[arg(long, default_value = "3")]
        hops: usize,
        #[arg(long, value_enum, default_value = "outbound")]
        direction: DirectionArg,
        /// Messages to send.
        #[arg(long, default_value = "100")]
        count: u32,
        /// Payload size in bytes. Larger than one tunnel message means
        /// fragmentation.
        #[arg(long, default_value = "512")]
        payload_size: usize,
    },

    /// Flip one random bit before a random stage; every message must be
    /// dropped.
    Tamper {
        #[arg(long, default_value = "8")]
        hops: usize,
        #[arg(long, value_enum, default_value = "inbound")]
        direction: DirectionArg,
        #[arg(long, default_value = "1000")]
        count: u32,
    },

    /// Share one pipeline between threads.
    Parallel {
        #[arg(long, default_value = "5")]
        hops: usize,
        #[arg(long, value_enum, default_value = "inbound")]
        direction: DirectionArg,
        #[arg(long, default_value = "4")]
        threads: usize,
        /// Messages per thread.
        #[arg(long, default_value = "1000")]
        count: u32,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let start = Instant::now();
    let params = common::load_params(cli.config.as_deref(), cli.message_size, cli.checksum_len)?;
    let mut rng = common::make_rng(cli.seed);

    eprintln!("tunnel-stress v{}", env!("CARGO_PKG_VERSION"));
    eprintln!(
        "{}-byte messages, {}-byte checksum",
        params.message_size, params.checksum_len
    );

    match cli.command {
        Command::Roundtrip {
            hops,
            direction,
            count,
            payload_size,
        } => roundtrip::run(
            roundtrip::RoundtripConfig {
                params,
                hops,
                direction: direction.into(),
                count,
                payload_size,
            },
            &mut rng,
            start,
        )?,

        Command::Tamper {
            hops,
            direction,
            count,
        } => tamper::run(
            tamper::TamperConfig {
                params,
                hops,
                direction: direction.into(),
                count,
            },
            &mut rng,
            start,
        )?,

        Command::Parallel {
            hops,
            direction,
            threads,
            count,
        } => parallel::run(
            parallel::ParallelConfig {
                params,
                hops,
                direction: direction.into(),
                threads,
                count,
            },
            &mut rng,
            start,
        )?,
    }

    Ok(())
}
