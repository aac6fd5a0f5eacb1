//! Run configuration: geometry, mode, device pair and encoder parameters.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use peerenc_core::device_traits::{ColorDescription, EncoderConfig, UploadConfig};
use peerenc_core::error::{EngineError, Result};
use peerenc_core::types::{CodecFormat, PixelFormat, check_dimensions};

/// What to do when the output sink accepts fewer bytes than offered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkPolicy {
    /// Log and count the short write, keep running.
    #[default]
    Warn,
    /// Abort the run with [`EngineError::ShortWrite`].
    Strict,
}

/// Source pixel format and target codec, parsed from `p2a|p2h|r2a|r2h`.
///
/// First letter: `p` planar YUV 4:2:0, `r` packed RGBA.  Last letter:
/// `a` AVC (H.264), `h` HEVC (H.265).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamMode {
    pub format: PixelFormat,
    pub codec: CodecFormat,
}

impl FromStr for StreamMode {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        let mode = s.to_ascii_lowercase();
        let (format, codec) = match mode.as_str() {
            "p2a" => (PixelFormat::PlanarYuv420p8, CodecFormat::H264),
            "p2h" => (PixelFormat::PlanarYuv420p8, CodecFormat::H265),
            "r2a" => (PixelFormat::PackedRgba8, CodecFormat::H264),
            "r2h" => (PixelFormat::PackedRgba8, CodecFormat::H265),
            _ => {
                return Err(EngineError::Config(format!(
                    "Unknown mode '{s}' (expected p2a, p2h, r2a or r2h)"
                )));
            }
        };
        Ok(Self { format, codec })
    }
}

impl fmt::Display for StreamMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let src = match self.format {
            PixelFormat::PlanarYuv420p8 => 'p',
            PixelFormat::PackedRgba8 => 'r',
        };
        let dst = match self.codec {
            CodecFormat::H264 => 'a',
            CodecFormat::H265 => 'h',
        };
        write!(f, "{src}2{dst}")
    }
}

/// Parse `WIDTHxHEIGHT`.  Zero dimensions and dimensions above
/// [`peerenc_core::types::MAX_DIMENSION`] are rejected.
pub fn parse_size(s: &str) -> Result<(u32, u32)> {
    let bad = || EngineError::Config(format!("Invalid size '{s}' (expected WIDTHxHEIGHT)"));
    let (w, h) = s.split_once(['x', 'X']).ok_or_else(bad)?;
    let width: u32 = w.trim().parse().map_err(|_| bad())?;
    let height: u32 = h.trim().parse().map_err(|_| bad())?;
    check_dimensions(width, height)?;
    Ok((width, height))
}

/// Encoder tuning shared by every run.
#[derive(Clone, Debug, PartialEq)]
pub struct EncoderParams {
    pub fps_num: u32,
    pub fps_den: u32,
    /// Target bitrate in bits/sec.
    pub bitrate: u32,
    pub low_delay: bool,
    /// 9 = IPPP, no reordering.
    pub gop_preset: u32,
}

impl Default for EncoderParams {
    fn default() -> Self {
        Self {
            fps_num: 30,
            fps_den: 1,
            bitrate: 200_000,
            low_delay: true,
            gop_preset: 9,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PipelineConfig {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub codec: CodecFormat,
    /// Times the input is played back to back (>= 1).
    pub repeat: u32,
    /// Producer ("GPU") device index.
    pub source_device: u32,
    /// Consumer device index; runs the encoder.
    pub encoder_device: u32,
    pub sink_policy: SinkPolicy,
    pub encoder: EncoderParams,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            format: PixelFormat::PlanarYuv420p8,
            codec: CodecFormat::H264,
            repeat: 1,
            source_device: 1,
            encoder_device: 0,
            sink_policy: SinkPolicy::Warn,
            encoder: EncoderParams::default(),
        }
    }
}

impl PipelineConfig {
    /// Reject configurations that must fail before any session opens.
    pub fn validate(&self) -> Result<()> {
        check_dimensions(self.width, self.height)?;
        if self.source_device == self.encoder_device {
            return Err(EngineError::IdenticalDevices(self.encoder_device));
        }
        if self.repeat == 0 {
            return Err(EngineError::Config("repeat count must be at least 1".into()));
        }
        if self.encoder.fps_den == 0 {
            return Err(EngineError::Config("framerate denominator must be non-zero".into()));
        }
        Ok(())
    }

    pub fn mode(&self) -> StreamMode {
        StreamMode {
            format: self.format,
            codec: self.codec,
        }
    }

    pub fn upload_config(&self) -> UploadConfig {
        UploadConfig {
            width: self.width,
            height: self.height,
            format: self.format,
        }
    }

    /// Encoder session parameters.  Packed RGBA input additionally
    /// signals full-range sRGB so the encoder's colour conversion is
    /// described in the bitstream.
    pub fn encoder_config(&self) -> EncoderConfig {
        EncoderConfig {
            width: self.width,
            height: self.height,
            format: self.format,
            codec: self.codec,
            fps_num: self.encoder.fps_num,
            fps_den: self.encoder.fps_den,
            bitrate: self.encoder.bitrate,
            low_delay: self.encoder.low_delay,
            gop_preset: self.encoder.gop_preset,
            color: match self.format {
                PixelFormat::PackedRgba8 => Some(ColorDescription::SRGB_FULL_RANGE),
                PixelFormat::PlanarYuv420p8 => None,
            },
        }
    }
}
