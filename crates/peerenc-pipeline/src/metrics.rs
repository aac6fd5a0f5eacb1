//! Per-run counters, throughput reporting and the final run summary.

use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::info;

use peerenc_core::types::{CodecFormat, PixelFormat};

use crate::config::{PipelineConfig, SinkPolicy};

/// Monotonic byte and frame counters of one run.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ByteCounters {
    /// Device-layout bytes uploaded to the producer.
    pub bytes_sent: u64,
    /// Payload bytes (metadata stripped) received from the encoder.
    pub bytes_received: u64,
    /// Source frames rendered.
    pub frames_rendered: u64,
    /// Data frames accepted by the encoder.
    pub frames_submitted: u64,
    /// Data packets written to the sink (the stream header excluded).
    pub packets: u64,
    /// Sink writes that stored fewer bytes than offered.
    pub short_writes: u64,
    /// Submissions the encoder refused and that were resent.
    pub resends: u64,
}

/// Mutable state of one pipeline run.
#[derive(Debug)]
pub struct PipelineState {
    pub counters: ByteCounters,
    pub encode_finished: bool,
    pub receive_finished: bool,
    started_at: Instant,
}

impl PipelineState {
    pub fn new() -> Self {
        Self {
            counters: ByteCounters::default(),
            encode_finished: false,
            receive_finished: false,
            started_at: Instant::now(),
        }
    }

    pub fn is_done(&self) -> bool {
        self.encode_finished && self.receive_finished
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

impl Default for PipelineState {
    fn default() -> Self {
        Self::new()
    }
}

/// Packets per second over `elapsed`, clamped to at least one second.
fn packets_per_second(packets: u64, elapsed: Duration) -> f64 {
    packets as f64 / elapsed.as_secs_f64().max(1.0)
}

/// Emits a throughput line at most once per `interval`.
#[derive(Debug)]
pub struct ThroughputReporter {
    interval: Duration,
    last: Instant,
    reports: u64,
}

impl ThroughputReporter {
    pub fn new() -> Self {
        Self::with_interval(Duration::from_secs(1))
    }

    pub fn with_interval(interval: Duration) -> Self {
        Self {
            interval,
            last: Instant::now(),
            reports: 0,
        }
    }

    /// Log progress if the interval has elapsed.  Returns whether it did.
    pub fn tick(&mut self, state: &PipelineState) -> bool {
        let now = Instant::now();
        if now.duration_since(self.last) < self.interval {
            return false;
        }
        self.last = now;
        self.reports += 1;
        let c = &state.counters;
        info!(
            packets = c.packets,
            fps = format_args!("{:.1}", packets_per_second(c.packets, state.elapsed())),
            bytes = c.bytes_received,
            "Throughput"
        );
        true
    }

    pub fn reports(&self) -> u64 {
        self.reports
    }
}

impl Default for ThroughputReporter {
    fn default() -> Self {
        Self::new()
    }
}

/// Version of the JSON layout of [`RunSummary`].
pub const SUMMARY_SCHEMA_VERSION: u32 = 1;

/// Final report of a completed run.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RunSummary {
    pub schema_version: u32,
    pub ok: bool,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub codec: CodecFormat,
    pub sink_policy: SinkPolicy,
    pub frames_rendered: u64,
    pub frames_submitted: u64,
    pub packets: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub short_writes: u64,
    pub resends: u64,
    pub elapsed_ms: u64,
    pub fps: f64,
}

impl RunSummary {
    pub fn from_state(state: &PipelineState, config: &PipelineConfig) -> Self {
        let c = &state.counters;
        let elapsed = state.elapsed();
        Self {
            schema_version: SUMMARY_SCHEMA_VERSION,
            ok: state.is_done(),
            width: config.width,
            height: config.height,
            format: config.format,
            codec: config.codec,
            sink_policy: config.sink_policy,
            frames_rendered: c.frames_rendered,
            frames_submitted: c.frames_submitted,
            packets: c.packets,
            bytes_sent: c.bytes_sent,
            bytes_received: c.bytes_received,
            short_writes: c.short_writes,
            resends: c.resends,
            elapsed_ms: elapsed.as_millis() as u64,
            fps: packets_per_second(c.packets, elapsed),
        }
    }

    pub fn log(&self) {
        info!(
            packets = self.packets,
            fps = format_args!("{:.1}", self.fps),
            bytes = self.bytes_received,
            frames = self.frames_submitted,
            elapsed_ms = self.elapsed_ms,
            "Run complete"
        );
    }
}
