use std::io::Write;

use serde::Serialize;
use tunnel_crypto::PipelineStats;

/// Emit a JSONL event to stdout (flushed immediately for piped output).
pub fn emit<T: Serialize>(event: &T) {
    if let Ok(json) = serde_json::to_string(event) {
        let stdout = std::io::stdout();
        let mut lock = stdout.lock();
        let _ = writeln!(lock, "{json}");
        let _ = lock.flush();
    }
}

// ── Session events ──────────────────────────────────────────────

#[derive(Serialize)]
pub struct EventStarted {
    pub event: &'static str,
    pub mode: &'static str,
    pub hops: usize,
    pub direction: String,
    pub message_size: usize,
    pub checksum_len: usize,
    pub timestamp_ms: u64,
}

impl EventStarted {
    pub fn new(
        mode: &'static str,
        hops: usize,
        direction: tunnel_crypto::Direction,
        params: &tunnel_crypto::TunnelParams,
    ) -> Self {
        Self {
            event: "started",
            mode,
            hops,
            direction: direction.to_string(),
            message_size: params.message_size,
            checksum_len: params.checksum_len,
            timestamp_ms: tunnel_crypto::now_ms(),
        }
    }
}

// ── Round trip ──────────────────────────────────────────────────

#[derive(Serialize)]
pub struct EventRoundtripResult {
    pub event: &'static str,
    pub messages_sent: u32,
    pub messages_reassembled: u32,
    pub mismatched: u32,
    pub tunnel_messages: u64,
    pub padding_avg: f64,
    pub messages_per_sec: f64,
    pub pipeline: PipelineStats,
    pub elapsed_s: f64,
}

// ── Tamper ──────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct EventTamperMiss {
    pub event: &'static str,
    pub seq: u32,
    pub stage: usize,
    pub bit: usize,
}

#[derive(Serialize)]
pub struct EventTamperResult {
    pub event: &'static str,
    pub trials: u32,
    pub detected: u32,
    pub missed: u32,
    pub elapsed_s: f64,
}

// ── Parallel ────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct EventParallelResult {
    pub event: &'static str,
    pub threads: usize,
    pub messages: u64,
    pub delivered: u64,
    pub messages_per_sec: f64,
    pub pipeline: PipelineStats,
    pub elapsed_s: f64,
}
