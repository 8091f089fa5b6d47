use std::path::Path;
use std::time::Instant;

use anyhow::Context;
use clap::ValueEnum;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use tunnel_crypto::{
    DeliveryInstructions, Direction, Fragment, Preprocessor, TunnelCreatorConfig, TunnelParams,
};

#[derive(Clone, Copy, ValueEnum)]
pub enum DirectionArg {
    Inbound,
    Outbound,
}

impl From<DirectionArg> for Direction {
    fn from(arg: DirectionArg) -> Self {
        match arg {
            DirectionArg::Inbound => Direction::Inbound,
            DirectionArg::Outbound => Direction::Outbound,
        }
    }
}

/// Fields a `--config` file may set. Missing fields keep the value from
/// the environment.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ParamsFile {
    message_size: Option<usize>,
    checksum_len: Option<usize>,
}

/// Parameters from, in increasing priority: defaults, environment,
/// `--config` file, command-line flags.
pub fn load_params(
    config: Option<&Path>,
    message_size: Option<usize>,
    checksum_len: Option<usize>,
) -> anyhow::Result<TunnelParams> {
    layer_params(TunnelParams::from_env()?, config, message_size, checksum_len)
}

fn layer_params(
    base: TunnelParams,
    config: Option<&Path>,
    message_size: Option<usize>,
    checksum_len: Option<usize>,
) -> anyhow::Result<TunnelParams> {
    let mut params = base;
    if let Some(path) = config {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let file: ParamsFile =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        if let Some(size) = file.message_size {
            params = params.message_size(size);
        }
        if let Some(len) = file.checksum_len {
            params = params.checksum_len(len);
        }
    }
    if let Some(size) = message_size {
        params = params.message_size(size);
    }
    if let Some(len) = checksum_len {
        params = params.checksum_len(len);
    }
    params.validate()?;
    Ok(params)
}

pub fn make_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    }
}

/// A tunnel that will not expire during the run.
pub fn build_tunnel(
    hops: usize,
    direction: Direction,
    rng: &mut StdRng,
) -> anyhow::Result<TunnelCreatorConfig> {
    let expiration = tunnel_crypto::now_ms() + tunnel_crypto::creator::TUNNEL_LIFETIME_MS;
    Ok(TunnelCreatorConfig::generate(hops, direction, expiration, rng)?)
}

pub fn random_payload(size: usize, rng: &mut StdRng) -> Vec<u8> {
    (0..size).map(|_| rng.random()).collect()
}

/// A preprocessed message whose single fragment fills the whole fragment
/// area, leaving no padding.
pub fn full_message(
    preprocessor: &Preprocessor,
    rng: &mut StdRng,
) -> anyhow::Result<Vec<u8>> {
    let size = preprocessor.params().fragment_capacity() - 3;
    let fragment = Fragment::whole(DeliveryInstructions::Local, random_payload(size, rng));
    Ok(preprocessor.preprocess(rng, &[fragment])?.into_bytes())
}

/// Elapsed seconds since `start`.
pub fn elapsed_s(start: Instant) -> f64 {
    start.elapsed().as_secs_f64()
}
