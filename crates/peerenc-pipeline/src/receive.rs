//! Receive driver: drains encoder output into the sink.
//!
//! The stream header is read exactly once, on the first call; a header
//! read that succeeds falls through to a data read in the same call.
//! Every packet's device metadata prefix is stripped before the sink
//! sees it.  In low-delay mode an empty read is retried in place until the
//! encoder produces data or end-of-stream.

use tracing::{debug, info, warn};

use peerenc_core::device_traits::EncoderSession;
use peerenc_core::error::{EngineError, Result};
use peerenc_core::io_traits::ByteSink;
use peerenc_core::types::{MAX_TX_SIZE, Packet};

use crate::config::SinkPolicy;
use crate::metrics::ByteCounters;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ReceiveState {
    #[default]
    AwaitingHeader,
    Streaming,
    EosReceived,
}

/// Non-fatal result of one [`ReceiveDriver::receive`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// A data packet was written to the sink.
    Packet,
    /// End-of-stream was received.
    EndOfStream,
    /// Nothing available yet.
    Retry,
}

impl ReceiveOutcome {
    /// Status code: `0` packet, `1` end-of-stream, `2` retry.
    pub const fn code(self) -> i32 {
        match self {
            Self::Packet => 0,
            Self::EndOfStream => 1,
            Self::Retry => 2,
        }
    }
}

pub struct ReceiveDriver {
    state: ReceiveState,
    packet: Packet,
    policy: SinkPolicy,
    polls: u64,
}

impl ReceiveDriver {
    /// Allocates the packet buffer ([`MAX_TX_SIZE`] bytes).
    pub fn new(policy: SinkPolicy) -> Result<Self> {
        Self::with_packet_capacity(policy, MAX_TX_SIZE)
    }

    pub fn with_packet_capacity(policy: SinkPolicy, capacity: usize) -> Result<Self> {
        Ok(Self {
            state: ReceiveState::AwaitingHeader,
            packet: Packet::with_capacity(capacity)?,
            policy,
            polls: 0,
        })
    }

    pub fn state(&self) -> ReceiveState {
        self.state
    }

    /// Empty reads spun through in low-delay mode.
    pub fn polls(&self) -> u64 {
        self.polls
    }

    /// End-of-stream flag of the most recently read packet.
    pub fn last_packet_eos(&self) -> bool {
        self.packet.end_of_stream
    }

    /// Drain at most one data packet.
    ///
    /// Once end-of-stream has been received, further calls return
    /// [`ReceiveOutcome::EndOfStream`] without touching the encoder.
    pub fn receive(
        &mut self,
        encoder: &mut dyn EncoderSession,
        sink: &mut dyn ByteSink,
        counters: &mut ByteCounters,
    ) -> Result<ReceiveOutcome> {
        let meta_size = encoder.metadata_size();

        match self.state {
            ReceiveState::EosReceived => return Ok(ReceiveOutcome::EndOfStream),
            ReceiveState::AwaitingHeader => {
                let n = encoder
                    .read_stream_header(&mut self.packet)
                    .map_err(|e| EngineError::HeaderRead(e.to_string()))?;
                if self.packet.end_of_stream {
                    self.state = ReceiveState::EosReceived;
                    warn!("end-of-stream in place of the stream header");
                    return Ok(ReceiveOutcome::EndOfStream);
                }
                if n == 0 {
                    return Ok(ReceiveOutcome::Retry);
                }
                if n <= meta_size {
                    return Err(EngineError::HeaderRead(format!(
                        "header of {n} bytes does not exceed metadata size {meta_size}"
                    )));
                }
                write_payload(sink, &self.packet.data()[meta_size..], self.policy, counters)?;
                counters.bytes_received += (n - meta_size) as u64;
                self.state = ReceiveState::Streaming;
                info!(bytes = n - meta_size, "Stream header written");
            }
            ReceiveState::Streaming => {}
        }

        loop {
            let n = encoder.read(&mut self.packet)?;
            let eos = self.packet.end_of_stream;

            if n > meta_size {
                write_payload(sink, &self.packet.data()[meta_size..], self.policy, counters)?;
                counters.bytes_received += (n - meta_size) as u64;
                counters.packets += 1;
                debug!(bytes = n, packets = counters.packets, "packet received");
            } else if n != 0 {
                return Err(EngineError::ShortPacket {
                    received: n,
                    meta_size,
                });
            } else if !eos && encoder.low_delay() {
                self.polls += 1;
                continue;
            }

            if eos {
                self.state = ReceiveState::EosReceived;
                info!(packets = counters.packets, "Encoder output complete");
                return Ok(ReceiveOutcome::EndOfStream);
            }
            return Ok(if n == 0 {
                ReceiveOutcome::Retry
            } else {
                ReceiveOutcome::Packet
            });
        }
    }
}

/// Append `payload` to `sink`, applying the short-write policy.
fn write_payload(
    sink: &mut dyn ByteSink,
    payload: &[u8],
    policy: SinkPolicy,
    counters: &mut ByteCounters,
) -> Result<()> {
    let written = sink.write(payload)?;
    if written < payload.len() {
        match policy {
            SinkPolicy::Strict => {
                return Err(EngineError::ShortWrite {
                    sink: sink.describe(),
                    written,
                    expected: payload.len(),
                });
            }
            SinkPolicy::Warn => {
                counters.short_writes += 1;
                warn!(
                    sink = %sink.describe(),
                    written,
                    expected = payload.len(),
                    "short write to output"
                );
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerenc_core::types::HwFrame;
    use peerenc_io::MemorySink;
    use std::collections::VecDeque;

    const META: usize = 8;

    /// Encoder whose header and read results come from scripts.
    /// Each read entry is `(payload, eos)`; an empty payload reads as 0 bytes.
    struct ScriptedEncoder {
        header: VecDeque<(Vec<u8>, bool)>,
        reads: VecDeque<(Vec<u8>, bool)>,
        low_delay: bool,
        header_calls: u32,
        read_calls: u32,
    }

    impl ScriptedEncoder {
        fn new(header: Vec<(Vec<u8>, bool)>, reads: Vec<(Vec<u8>, bool)>, low_delay: bool) -> Self {
            Self {
                header: header.into(),
                reads: reads.into(),
                low_delay,
                header_calls: 0,
                read_calls: 0,
            }
        }
    }

    fn next(script: &mut VecDeque<(Vec<u8>, bool)>, packet: &mut Packet) -> Result<usize> {
        let (bytes, eos) = script.pop_front().unwrap_or((Vec::new(), false));
        packet.fill(&bytes, eos)?;
        Ok(bytes.len())
    }

    impl EncoderSession for ScriptedEncoder {
        fn write(&mut self, _frame: &HwFrame) -> Result<usize> {
            Ok(0)
        }

        fn ready_to_close(&self) -> bool {
            false
        }

        fn read_stream_header(&mut self, packet: &mut Packet) -> Result<usize> {
            self.header_calls += 1;
            next(&mut self.header, packet)
        }

        fn read(&mut self, packet: &mut Packet) -> Result<usize> {
            self.read_calls += 1;
            next(&mut self.reads, packet)
        }

        fn metadata_size(&self) -> usize {
            META
        }

        fn low_delay(&self) -> bool {
            self.low_delay
        }

        fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn with_meta(payload: &[u8]) -> Vec<u8> {
        let mut bytes = vec![0xEE; META];
        bytes.extend_from_slice(payload);
        bytes
    }

    fn driver() -> ReceiveDriver {
        ReceiveDriver::with_packet_capacity(SinkPolicy::Warn, 1024).expect("driver")
    }

    #[test]
    fn header_is_read_once_then_falls_through_to_data() {
        let mut encoder = ScriptedEncoder::new(
            vec![(with_meta(b"HDR"), false)],
            vec![(with_meta(b"one"), false), (with_meta(b"two"), false)],
            false,
        );
        let sink = MemorySink::new();
        let mut out = sink.clone();
        let mut counters = ByteCounters::default();
        let mut rx = driver();

        let first = rx.receive(&mut encoder, &mut out, &mut counters).expect("first");
        assert_eq!(first, ReceiveOutcome::Packet);
        let second = rx.receive(&mut encoder, &mut out, &mut counters).expect("second");
        assert_eq!(second.code(), 0);
        assert_eq!(encoder.header_calls, 1);
        assert_eq!(sink.contents(), b"HDRonetwo");
        assert_eq!(counters.packets, 2);
        assert_eq!(counters.bytes_received, 9);
    }

    #[test]
    fn empty_header_read_is_a_retry() {
        let mut encoder = ScriptedEncoder::new(vec![(Vec::new(), false)], Vec::new(), false);
        let mut out = MemorySink::new();
        let mut counters = ByteCounters::default();
        let mut rx = driver();
        let outcome = rx.receive(&mut encoder, &mut out, &mut counters).expect("retry");
        assert_eq!(outcome.code(), 2);
        assert_eq!(rx.state(), ReceiveState::AwaitingHeader);
        assert_eq!(encoder.read_calls, 0);
    }

    #[test]
    fn eos_on_header_read_is_terminal() {
        let mut encoder = ScriptedEncoder::new(vec![(Vec::new(), true)], Vec::new(), true);
        let mut out = MemorySink::new();
        let mut counters = ByteCounters::default();
        let mut rx = driver();
        let outcome = rx.receive(&mut encoder, &mut out, &mut counters).expect("eos");
        assert_eq!(outcome, ReceiveOutcome::EndOfStream);
        assert_eq!(rx.state(), ReceiveState::EosReceived);
        assert_eq!(
            rx.receive(&mut encoder, &mut out, &mut counters).expect("again"),
            ReceiveOutcome::EndOfStream
        );
        assert_eq!(encoder.read_calls, 0);
    }

    #[test]
    fn short_packet_is_fatal() {
        let mut encoder = ScriptedEncoder::new(
            vec![(with_meta(b"H"), false)],
            vec![(vec![0u8; META], false)],
            false,
        );
        let mut out = MemorySink::new();
        let mut counters = ByteCounters::default();
        let err = driver()
            .receive(&mut encoder, &mut out, &mut counters)
            .expect_err("short packet");
        match err {
            EngineError::ShortPacket { received, meta_size } => {
                assert_eq!(received, META);
                assert_eq!(meta_size, META);
            }
            other => panic!("expected ShortPacket, got {other:?}"),
        }
    }

    #[test]
    fn low_delay_polls_until_data_arrives() {
        let mut encoder = ScriptedEncoder::new(
            vec![(with_meta(b"H"), false)],
            vec![
                (Vec::new(), false),
                (Vec::new(), false),
                (Vec::new(), false),
                (with_meta(b"px"), false),
            ],
            true,
        );
        let mut out = MemorySink::new();
        let mut counters = ByteCounters::default();
        let mut rx = driver();
        let outcome = rx.receive(&mut encoder, &mut out, &mut counters).expect("packet");
        assert_eq!(outcome, ReceiveOutcome::Packet);
        assert_eq!(rx.polls(), 3);
        assert_eq!(encoder.read_calls, 4);
    }

    #[test]
    fn empty_read_without_low_delay_is_a_retry() {
        let mut encoder =
            ScriptedEncoder::new(vec![(with_meta(b"H"), false)], vec![(Vec::new(), false)], false);
        let mut out = MemorySink::new();
        let mut counters = ByteCounters::default();
        let outcome = driver()
            .receive(&mut encoder, &mut out, &mut counters)
            .expect("retry");
        assert_eq!(outcome, ReceiveOutcome::Retry);
    }

    #[test]
    fn eos_packet_ends_streaming() {
        let mut encoder = ScriptedEncoder::new(
            vec![(with_meta(b"H"), false)],
            vec![(with_meta(b"last"), false), (Vec::new(), true)],
            true,
        );
        let sink = MemorySink::new();
        let mut out = sink.clone();
        let mut counters = ByteCounters::default();
        let mut rx = driver();
        assert_eq!(
            rx.receive(&mut encoder, &mut out, &mut counters).expect("packet"),
            ReceiveOutcome::Packet
        );
        assert_eq!(
            rx.receive(&mut encoder, &mut out, &mut counters).expect("eos"),
            ReceiveOutcome::EndOfStream
        );
        assert!(rx.last_packet_eos());
        assert_eq!(counters.packets, 1);
        assert_eq!(sink.contents(), b"Hlast");
    }

    #[test]
    fn short_sink_write_warns_or_fails_by_policy() {
        let script = || {
            ScriptedEncoder::new(
                vec![(with_meta(b"HEADER"), false)],
                vec![(with_meta(b"payload"), false)],
                false,
            )
        };

        let mut lenient = MemorySink::with_capacity_limit(8);
        let mut counters = ByteCounters::default();
        driver()
            .receive(&mut script(), &mut lenient, &mut counters)
            .expect("warn policy keeps going");
        assert_eq!(counters.short_writes, 1);
        assert_eq!(counters.packets, 1);

        let mut strict_sink = MemorySink::with_capacity_limit(8);
        let mut counters = ByteCounters::default();
        let err = ReceiveDriver::with_packet_capacity(SinkPolicy::Strict, 1024)
            .expect("driver")
            .receive(&mut script(), &mut strict_sink, &mut counters)
            .expect_err("strict policy fails");
        assert_eq!(err.error_code(), 600);
    }
}
