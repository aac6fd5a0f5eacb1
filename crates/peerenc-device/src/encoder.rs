//! Loopback encoder session.
//!
//! # Bitstream
//!
//! The loopback encoder does not compress.  It frames the visible pixels of
//! every submitted surface (dense source layout) as one packet, which makes
//! end-to-end output byte-exact and easy to verify:
//!
//! ```text
//! packet  = metadata (meta_size bytes) ‖ payload
//! header  = 00 00 00 01 'P' 'E' codec ‖ width ‖ height ‖ fps_num ‖ fps_den ‖ bitrate ‖ gop ‖ flags
//! payload = visible rows of each plane, in plane order
//! ```
//!
//! # Flow control
//!
//! Packets become readable `encoder_latency_reads` read calls after their
//! frame was accepted.  A write is refused (returns `0`) only while
//! `encoder_queue_depth` packets are pending, so a refused write always
//! leaves something for the reader to drain.  The end-of-stream frame is a
//! flag-only submission: it is accepted with a `0` return and
//! `ready_to_close` set, then surfaces as a zero-length packet with the
//! end-of-stream flag.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use tracing::{debug, info, warn};

use peerenc_core::device_traits::{EncoderConfig, EncoderSession};
use peerenc_core::error::{EngineError, Result};
use peerenc_core::types::{CodecFormat, FrameLayout, HwFrame, Packet};

use crate::fabric::FabricState;

/// First bytes of every metadata prefix.
pub const META_MAGIC: &[u8; 4] = b"PEMD";

const FLAG_KEYFRAME: u8 = 0x1;

struct PendingPacket {
    ready_at: u64,
    bytes: Vec<u8>,
    end_of_stream: bool,
}

pub struct LoopbackEncoderSession {
    fabric: Rc<RefCell<FabricState>>,
    device: u32,
    session: u64,
    config: EncoderConfig,
    layout: FrameLayout,
    meta_size: usize,
    queue_depth: usize,
    latency: u64,
    short_packet_at: Option<u64>,
    header: Vec<u8>,
    pending: VecDeque<PendingPacket>,
    reads: u64,
    frames: u64,
    started: bool,
    ready_to_close: bool,
    closed: bool,
}

impl LoopbackEncoderSession {
    pub(crate) fn open(
        fabric: Rc<RefCell<FabricState>>,
        device: u32,
        config: &EncoderConfig,
        first_frame: &HwFrame,
    ) -> Result<Self> {
        let open_err = |reason: String| EngineError::SessionOpen {
            kind: "encoder",
            device,
            reason,
        };
        let layout = FrameLayout::device(config.width, config.height, config.format)?;
        if first_frame.device != device {
            return Err(open_err(format!(
                "first frame lives on device {}, not on the encoder device",
                first_frame.device
            )));
        }
        if (first_frame.width, first_frame.height, first_frame.format)
            != (config.width, config.height, config.format)
        {
            return Err(open_err(format!(
                "first frame is {}x{} {:?}, encoder configured for {}x{} {:?}",
                first_frame.width,
                first_frame.height,
                first_frame.format,
                config.width,
                config.height,
                config.format
            )));
        }

        let (session, options) = {
            let mut state = fabric.borrow_mut();
            state.check_device(device).map_err(|e| open_err(e.to_string()))?;
            (state.open_session(device), state.options.clone())
        };
        if options.meta_size < META_MAGIC.len() + 13 {
            return Err(open_err(format!("metadata size {} too small", options.meta_size)));
        }

        let header = build_header(config);
        info!(
            device,
            codec = config.codec.label(),
            width = config.width,
            height = config.height,
            low_delay = config.low_delay,
            gop_preset = config.gop_preset,
            "Encoder session opened"
        );

        Ok(Self {
            fabric,
            device,
            session,
            config: config.clone(),
            layout,
            meta_size: options.meta_size,
            queue_depth: options.encoder_queue_depth.max(1),
            latency: options.encoder_latency_reads,
            short_packet_at: options.short_packet_at,
            header,
            pending: VecDeque::new(),
            reads: 0,
            frames: 0,
            started: false,
            ready_to_close: false,
            closed: false,
        })
    }

    fn metadata(&self, frame_index: u64, payload_len: usize, flags: u8) -> Vec<u8> {
        let mut meta = vec![0u8; self.meta_size];
        meta[..4].copy_from_slice(META_MAGIC);
        meta[4..12].copy_from_slice(&frame_index.to_le_bytes());
        meta[12..16].copy_from_slice(&(payload_len as u32).to_le_bytes());
        meta[16] = flags;
        meta
    }

    /// Dense visible pixels of `surface`, plane by plane.
    fn visible_pixels(&self, surface: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.layout.used_size());
        for (index, plane) in self.layout.planes().iter().enumerate() {
            let offset = self.layout.plane_offset(index);
            let row_bytes = self.layout.visible_row_bytes(index);
            let rows = if index == 0 || !self.config.format.is_subsampled() {
                self.config.height as usize
            } else {
                self.config.height as usize / 2
            };
            for row in 0..rows {
                let start = offset + row * plane.stride;
                out.extend_from_slice(&surface[start..start + row_bytes]);
            }
        }
        out
    }

    fn validate_frame(&self, frame: &HwFrame) -> Result<()> {
        if frame.device != self.device {
            return Err(EngineError::Encode(format!(
                "frame from device {} submitted to encoder on device {}",
                frame.device, self.device
            )));
        }
        if !self.started && !frame.start_of_stream {
            return Err(EngineError::Encode(
                "first submission must carry start-of-stream".into(),
            ));
        }
        if self.started && frame.start_of_stream {
            return Err(EngineError::Encode(
                "start-of-stream set on a frame after the first".into(),
            ));
        }
        Ok(())
    }
}

fn build_header(config: &EncoderConfig) -> Vec<u8> {
    let mut header = vec![0, 0, 0, 1, b'P', b'E'];
    header.push(match config.codec {
        CodecFormat::H264 => b'a',
        CodecFormat::H265 => b'h',
    });
    for value in [
        config.width,
        config.height,
        config.fps_num,
        config.fps_den,
        config.bitrate,
        config.gop_preset,
    ] {
        header.extend_from_slice(&value.to_le_bytes());
    }
    let mut flags = u8::from(config.low_delay);
    if let Some(color) = config.color {
        flags |= u8::from(color.full_range) << 1;
        header.push(flags);
        header.extend_from_slice(&[color.primaries, color.matrix, color.transfer]);
    } else {
        header.push(flags);
    }
    header
}

impl EncoderSession for LoopbackEncoderSession {
    fn write(&mut self, frame: &HwFrame) -> Result<usize> {
        if self.closed {
            return Err(EngineError::Encode("session closed".into()));
        }
        self.fabric.borrow_mut().stats.encoder_writes += 1;
        if self.ready_to_close {
            return Ok(0);
        }
        self.validate_frame(frame)?;
        if self.pending.len() >= self.queue_depth {
            debug!(pending = self.pending.len(), "encoder busy, frame refused");
            return Ok(0);
        }

        let ready_at = self.reads + self.latency;
        if frame.start_of_stream {
            self.started = true;
            self.fabric.borrow_mut().stats.start_of_stream_frames += 1;
        }

        if frame.end_of_stream {
            self.pending.push_back(PendingPacket {
                ready_at,
                bytes: Vec::new(),
                end_of_stream: true,
            });
            self.ready_to_close = true;
            self.fabric.borrow_mut().stats.encoder_eos += 1;
            debug!(frames = self.frames, "end-of-stream accepted");
            return Ok(0);
        }

        let payload = {
            let state = self.fabric.borrow();
            let surface = state.surface(frame.surface_id)?;
            if !surface.in_use || surface.device != self.device {
                return Err(EngineError::Encode(format!(
                    "surface {} is not an acquired frame on device {}",
                    frame.surface_id, self.device
                )));
            }
            if surface.data.len() < self.layout.used_size() {
                return Err(EngineError::BufferTooSmall {
                    need: self.layout.used_size(),
                    have: surface.data.len(),
                });
            }
            self.visible_pixels(&surface.data)
        };

        let index = self.frames;
        let bytes = if self.short_packet_at == Some(index) {
            warn!(frame = index, "emitting truncated packet");
            self.metadata(index, 0, 0)
        } else {
            let flags = if index == 0 { FLAG_KEYFRAME } else { 0 };
            let mut bytes = self.metadata(index, payload.len(), flags);
            bytes.extend_from_slice(&payload);
            bytes
        };
        self.pending.push_back(PendingPacket {
            ready_at,
            bytes,
            end_of_stream: false,
        });
        self.frames += 1;
        self.fabric.borrow_mut().stats.encoder_frames += 1;
        Ok(frame.data_len.max(1))
    }

    fn ready_to_close(&self) -> bool {
        self.ready_to_close
    }

    fn read_stream_header(&mut self, packet: &mut Packet) -> Result<usize> {
        let mut bytes = self.metadata(0, self.header.len(), 0);
        bytes.extend_from_slice(&self.header);
        packet.fill(&bytes, false)?;
        Ok(bytes.len())
    }

    fn read(&mut self, packet: &mut Packet) -> Result<usize> {
        self.reads += 1;
        let ready = self
            .pending
            .front()
            .is_some_and(|p| p.ready_at <= self.reads);
        if !ready {
            packet.reset();
            return Ok(0);
        }
        let Some(next) = self.pending.pop_front() else {
            packet.reset();
            return Ok(0);
        };
        packet.fill(&next.bytes, next.end_of_stream)?;
        Ok(next.bytes.len())
    }

    fn metadata_size(&self) -> usize {
        self.meta_size
    }

    fn low_delay(&self) -> bool {
        self.config.low_delay
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.fabric.borrow_mut().close_session(self.session)?;
        self.closed = true;
        info!(device = self.device, frames = self.frames, "Encoder session closed");
        Ok(())
    }
}
