//! Device-session contracts used across crate boundaries.
//!
//! These traits are the seam between the pipeline orchestration and the
//! accelerator SDK.  `peerenc-device` provides the in-process loopback
//! backend; a vendor binding implements the same traits.
//!
//! All calls are synchronous and may block on hardware readiness.

use crate::error::Result;
use crate::types::{
    CodecFormat, DeviceIdentity, DmaDescriptor, DmaImportRequest, DmaSegment, HwFrame, Packet,
    PixelFormat,
};

// ─── Session configuration ───────────────────────────────────────────────

/// Frame geometry an upload session is opened for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UploadConfig {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

/// VUI colour description written into the bitstream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ColorDescription {
    pub full_range: bool,
    /// Colour primaries (1 = BT.709).
    pub primaries: u8,
    /// Matrix coefficients (1 = BT.709).
    pub matrix: u8,
    /// Transfer characteristics (13 = sRGB / IEC 61966-2-1).
    pub transfer: u8,
}

impl ColorDescription {
    /// sRGB input converted by the encoder with a BT.709 matrix to full-range YCbCr.
    pub const SRGB_FULL_RANGE: Self = Self {
        full_range: true,
        primaries: 1,
        matrix: 1,
        transfer: 13,
    };
}

/// Encoder session parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct EncoderConfig {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub codec: CodecFormat,
    /// Framerate numerator.
    pub fps_num: u32,
    /// Framerate denominator.
    pub fps_den: u32,
    /// Target bitrate in bits/sec.
    pub bitrate: u32,
    /// Emit each packet as soon as its frame is encoded.
    pub low_delay: bool,
    /// GOP structure preset (9 = IPPP, no reordering).
    pub gop_preset: u32,
    /// Colour signalling, `None` keeps the encoder defaults.
    pub color: Option<ColorDescription>,
}

// ─── Sessions ────────────────────────────────────────────────────────────

/// Frame-upload session on one accelerator.
///
/// The producing device uses [`acquire_frame`](Self::acquire_frame) +
/// [`upload`](Self::upload); the consuming device uses
/// [`acquire_frame_for_read`](Self::acquire_frame_for_read) +
/// [`p2p_read`](Self::p2p_read).
pub trait UploadSession {
    /// PCI identity used for DMA mappings into this device.
    fn identity(&self) -> DeviceIdentity;

    /// Create the session's hardware frame pool.  `p2p` pools export a
    /// dma-buf handle per frame.
    fn init_frame_pool(&mut self, pool_size: u32, p2p: bool) -> Result<()>;

    /// Take a frame from the pool for host upload.
    fn acquire_frame(&mut self) -> Result<HwFrame>;

    /// Take a frame from the pool as the destination of P2P reads.
    fn acquire_frame_for_read(&mut self) -> Result<HwFrame>;

    /// Copy a device-layout buffer from host memory into `frame`.
    fn upload(&mut self, frame: &mut HwFrame, data: &[u8]) -> Result<()>;

    /// Pull the remote buffer described by `descriptor` into `frame`.
    fn p2p_read(&mut self, descriptor: &DmaDescriptor, frame: &mut HwFrame) -> Result<()>;

    /// Return `frame` to the pool it was acquired from.
    fn recycle(&mut self, frame: HwFrame) -> Result<()>;

    /// Close the session.  Every acquired frame must have been recycled.
    fn close(&mut self) -> Result<()>;
}

/// Hardware encoder session.
pub trait EncoderSession {
    /// Submit one frame.
    ///
    /// Returns the number of bytes accepted; `Ok(0)` means the device did
    /// not take the frame yet (unless [`ready_to_close`](Self::ready_to_close)
    /// reports that the end-of-stream frame was consumed).
    fn write(&mut self, frame: &HwFrame) -> Result<usize>;

    /// Whether the end-of-stream submission has been accepted.
    fn ready_to_close(&self) -> bool;

    /// Read the out-of-band stream header into `packet`.  `Ok(0)` means
    /// the header is not available yet.
    fn read_stream_header(&mut self, packet: &mut Packet) -> Result<usize>;

    /// Read the next encoded packet.  `Ok(0)` means nothing is ready.
    fn read(&mut self, packet: &mut Packet) -> Result<usize>;

    /// Bytes of device metadata prefixed to every packet.
    fn metadata_size(&self) -> usize;

    /// Whether the session was configured for low-delay output.
    fn low_delay(&self) -> bool;

    fn close(&mut self) -> Result<()>;
}

/// Privileged DMA transfer setup (kernel driver).
pub trait DmaTransfer {
    /// Map the dma-buf `request.fd` into `request.target`'s address space.
    fn import_buffer(&mut self, request: &DmaImportRequest) -> Result<Vec<DmaSegment>>;

    /// Undo a previous successful [`import_buffer`](Self::import_buffer).
    fn release_buffer(&mut self, request: &DmaImportRequest) -> Result<()>;
}

/// Opens sessions on a set of accelerators.
pub trait DeviceBackend {
    /// Human-readable backend name for logs.
    fn name(&self) -> &'static str;

    fn open_upload(&mut self, device: u32, config: &UploadConfig)
    -> Result<Box<dyn UploadSession>>;

    /// Open an encoder on `device`.  `first_frame` describes the hardware
    /// frames that will be submitted.
    fn open_encoder(
        &mut self,
        device: u32,
        config: &EncoderConfig,
        first_frame: &HwFrame,
    ) -> Result<Box<dyn EncoderSession>>;

    /// Handle to the privileged DMA driver.
    fn dma_transfer(&mut self) -> Result<Box<dyn DmaTransfer>>;
}
