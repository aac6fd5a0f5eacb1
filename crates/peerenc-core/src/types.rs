//! Frame, layout, packet and DMA types shared by every pipeline stage.
//!
//! # Layouts
//!
//! Two layouts exist for every frame:
//!
//! - the **source** layout: how a raw frame is stored in the input file
//!   (dense rows, no padding), see [`FrameLayout::source`];
//! - the **device** layout: how the accelerator expects the frame in its
//!   upload buffer (aligned strides, even heights, 4 KiB-rounded total),
//!   see [`FrameLayout::device`].
//!
//! The renderer performs a strided copy from the first to the second.

use serde::Serialize;

use crate::error::{EngineError, Result};

/// DMA granularity of the accelerator.  Every device frame size is rounded
/// up to a multiple of this.
pub const FRAME_SIZE_ALIGNMENT: usize = 4096;

/// Host page size used for staging allocations.
pub const PAGE_SIZE: usize = 4096;

/// Maximum number of scatter-gather entries in one [`DmaDescriptor`].
pub const MAX_DMA_SEGMENTS: usize = 32;

/// Maximum size of one encoder output transfer (10 MiB).
pub const MAX_TX_SIZE: usize = 0xA0_0000;

/// Largest width or height an upload session accepts (8K).
pub const MAX_DIMENSION: u32 = 8192;

/// Round `value` up to the next multiple of `align` (`align` must be a power of two).
#[inline]
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// [`align_up`] that returns `None` instead of overflowing.
#[inline]
pub const fn checked_align_up(value: usize, align: usize) -> Option<usize> {
    match value.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

// ─── Pixel format ────────────────────────────────────────────────────────────

/// Input pixel format accepted by the upload sessions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    /// Packed 8-bit RGBA, one plane, 4 bytes per pixel.
    /// Device stride: `align16(width) × 4`.
    PackedRgba8,

    /// Planar 8-bit YUV 4:2:0, three planes (Y, U, V).
    /// Chroma planes are half width and half (even-rounded) height.
    PlanarYuv420p8,
}

impl PixelFormat {
    /// Bytes per luma sample (8-bit formats only, so always 1) or per packed pixel.
    #[inline]
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            Self::PackedRgba8 => 4,
            Self::PlanarYuv420p8 => 1,
        }
    }

    /// Whether chroma is subsampled 2×2.
    #[inline]
    pub const fn is_subsampled(self) -> bool {
        matches!(self, Self::PlanarYuv420p8)
    }

    /// Bytes one raw frame occupies in the input file.
    ///
    /// Packed: `width × height × 4`.  Planar: `width × height × 3 / 2`.
    /// `None` when the size does not fit in `usize`.
    #[inline]
    pub const fn checked_source_frame_size(self, width: u32, height: u32) -> Option<usize> {
        let Some(pixels) = (width as usize).checked_mul(height as usize) else {
            return None;
        };
        match self {
            Self::PackedRgba8 => pixels.checked_mul(4),
            Self::PlanarYuv420p8 => match pixels.checked_mul(3) {
                Some(n) => Some(n / 2),
                None => None,
            },
        }
    }

    /// [`Self::checked_source_frame_size`], saturating at `usize::MAX`.
    #[inline]
    pub const fn source_frame_size(self, width: u32, height: u32) -> usize {
        match self.checked_source_frame_size(width, height) {
            Some(n) => n,
            None => usize::MAX,
        }
    }
}

// ─── Codec ───────────────────────────────────────────────────────────────────

/// Target bitstream codec.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecFormat {
    H264,
    H265,
}

impl CodecFormat {
    pub const fn label(self) -> &'static str {
        match self {
            Self::H264 => "AVC",
            Self::H265 => "HEVC",
        }
    }
}

// ─── Frame layout ────────────────────────────────────────────────────────────

/// One plane of a frame: row stride in bytes and row count.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PlaneLayout {
    pub stride: usize,
    pub height: usize,
}

impl PlaneLayout {
    #[inline]
    pub const fn size(&self) -> usize {
        self.stride * self.height
    }
}

/// Immutable plane geometry for one `(width, height, format)` triple.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameLayout {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    planes: Vec<PlaneLayout>,
    total_size: usize,
}

/// Reject zero dimensions and anything above [`MAX_DIMENSION`].
pub fn check_dimensions(width: u32, height: u32) -> Result<()> {
    if width == 0 || height == 0 || width > MAX_DIMENSION || height > MAX_DIMENSION {
        return Err(EngineError::InvalidDimensions { width, height });
    }
    Ok(())
}

fn checked_total(planes: &[PlaneLayout]) -> Option<usize> {
    planes
        .iter()
        .try_fold(0usize, |acc, p| acc.checked_add(p.stride.checked_mul(p.height)?))
}

impl FrameLayout {
    /// Device upload layout.
    ///
    /// - `PackedRgba8`: one plane, stride `align16(width) × 4`, `height` rows.
    /// - `PlanarYuv420p8`: luma stride `width`, chroma stride `luma / 2`,
    ///   luma rows `height` rounded up to even, chroma rows half of that.
    ///
    /// The total is rounded up to [`FRAME_SIZE_ALIGNMENT`].
    pub fn device(width: u32, height: u32, format: PixelFormat) -> Result<Self> {
        check_dimensions(width, height)?;
        let overflow = || EngineError::InvalidDimensions { width, height };
        let w = width as usize;
        let h = height as usize;
        let planes = match format {
            PixelFormat::PackedRgba8 => vec![PlaneLayout {
                stride: checked_align_up(w, 16)
                    .and_then(|s| s.checked_mul(format.bytes_per_pixel()))
                    .ok_or_else(overflow)?,
                height: h,
            }],
            PixelFormat::PlanarYuv420p8 => {
                let luma_stride = w * format.bytes_per_pixel();
                let luma_height = checked_align_up(h, 2).ok_or_else(overflow)?;
                let chroma = PlaneLayout {
                    stride: luma_stride / 2,
                    height: luma_height / 2,
                };
                vec![
                    PlaneLayout {
                        stride: luma_stride,
                        height: luma_height,
                    },
                    chroma,
                    chroma,
                ]
            }
        };
        let total_size = checked_total(&planes)
            .and_then(|used| checked_align_up(used, FRAME_SIZE_ALIGNMENT))
            .ok_or_else(overflow)?;
        Ok(Self {
            width,
            height,
            format,
            planes,
            total_size,
        })
    }

    /// Dense layout of one raw frame in the input file.
    ///
    /// Chroma rows are `height / 2` (truncating), matching how raw 4:2:0
    /// files are produced.  The total is exactly
    /// [`PixelFormat::source_frame_size`].
    pub fn source(width: u32, height: u32, format: PixelFormat) -> Result<Self> {
        check_dimensions(width, height)?;
        let overflow = || EngineError::InvalidDimensions { width, height };
        let w = width as usize;
        let h = height as usize;
        let planes = match format {
            PixelFormat::PackedRgba8 => vec![PlaneLayout {
                stride: w.checked_mul(format.bytes_per_pixel()).ok_or_else(overflow)?,
                height: h,
            }],
            PixelFormat::PlanarYuv420p8 => {
                let chroma = PlaneLayout {
                    stride: w / 2,
                    height: h / 2,
                };
                vec![PlaneLayout { stride: w, height: h }, chroma, chroma]
            }
        };
        Ok(Self {
            width,
            height,
            format,
            planes,
            total_size: format
                .checked_source_frame_size(width, height)
                .ok_or_else(overflow)?,
        })
    }

    #[inline]
    pub fn planes(&self) -> &[PlaneLayout] {
        &self.planes
    }

    /// Total byte size (device layouts: 4 KiB-rounded).
    #[inline]
    pub fn total_size(&self) -> usize {
        self.total_size
    }

    /// Byte offset of plane `index` from the start of the frame.
    pub fn plane_offset(&self, index: usize) -> usize {
        self.planes[..index].iter().map(PlaneLayout::size).sum()
    }

    /// Sum of plane sizes before alignment padding.
    pub fn used_size(&self) -> usize {
        self.planes.iter().map(PlaneLayout::size).sum()
    }

    /// Bytes of meaningful pixel data in one row of plane `index`.
    pub fn visible_row_bytes(&self, index: usize) -> usize {
        let w = self.width as usize;
        match self.format {
            PixelFormat::PackedRgba8 => w * self.format.bytes_per_pixel(),
            PixelFormat::PlanarYuv420p8 if index == 0 => w,
            PixelFormat::PlanarYuv420p8 => w / 2,
        }
    }
}

// ─── Device identity ─────────────────────────────────────────────────────────

/// PCI location of an accelerator, passed to the privileged DMA driver so it
/// can map a foreign buffer into that device's address space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DeviceIdentity {
    pub domain: u16,
    pub bus: u8,
    pub dev: u8,
    pub func: u8,
}

impl std::fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{}",
            self.domain, self.bus, self.dev, self.func
        )
    }
}

// ─── DMA descriptor ──────────────────────────────────────────────────────────

/// One scatter-gather entry: a bus address in the importing device's
/// address space and the number of bytes behind it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DmaSegment {
    pub address: u64,
    pub length: u32,
}

/// Physical layout of one remote buffer as seen by the importing device.
///
/// Holds at most [`MAX_DMA_SEGMENTS`] entries.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DmaDescriptor {
    segments: Vec<DmaSegment>,
}

impl DmaDescriptor {
    pub fn from_segments(segments: Vec<DmaSegment>) -> Result<Self> {
        if segments.len() > MAX_DMA_SEGMENTS {
            return Err(EngineError::DescriptorOverflow {
                count: segments.len(),
                max: MAX_DMA_SEGMENTS,
            });
        }
        Ok(Self { segments })
    }

    #[inline]
    pub fn segments(&self) -> &[DmaSegment] {
        &self.segments
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn total_len(&self) -> usize {
        self.segments.iter().map(|s| s.length as usize).sum()
    }
}

/// Parameters of one privileged import/release call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DmaImportRequest {
    /// dma-buf file descriptor exported by the producing device.
    pub fd: i32,
    /// Device that will read through the mapping.
    pub target: DeviceIdentity,
    /// Expected buffer length in bytes (the rendered frame size).
    pub length_hint: usize,
}

// ─── Hardware frame ──────────────────────────────────────────────────────────

/// Handle to a frame living in an accelerator's frame pool.
///
/// Not `Clone`: a handle is acquired from exactly one session and must be
/// handed back through that session's `recycle` before it closes.
#[derive(Debug, PartialEq, Eq)]
pub struct HwFrame {
    /// Device that owns the surface.
    pub device: u32,
    /// Surface index inside the device's frame pool.
    pub surface_id: u64,
    /// Exported dma-buf handle, `-1` when the pool is not P2P-capable.
    pub dma_buf_fd: i32,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub start_of_stream: bool,
    pub end_of_stream: bool,
    pub force_key_frame: bool,
    /// Bytes of valid frame data currently on the surface.
    pub data_len: usize,
}

impl HwFrame {
    /// Reset per-submission flags.
    pub fn clear_flags(&mut self) {
        self.start_of_stream = false;
        self.end_of_stream = false;
        self.force_key_frame = false;
    }
}

// ─── Packet ──────────────────────────────────────────────────────────────────

/// Reusable encoder output buffer.
///
/// Bytes `[0, meta_size)` of every received packet are device metadata;
/// the codec payload follows.
#[derive(Debug)]
pub struct Packet {
    buf: Vec<u8>,
    len: usize,
    pub end_of_stream: bool,
}

impl Packet {
    /// Allocate a packet buffer of `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Result<Self> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(capacity).map_err(|_| EngineError::Alloc {
            bytes: capacity,
            align: 1,
        })?;
        buf.resize(capacity, 0);
        Ok(Self {
            buf,
            len: 0,
            end_of_stream: false,
        })
    }

    /// Valid bytes, metadata prefix included.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Replace the contents with `bytes`.
    pub fn fill(&mut self, bytes: &[u8], end_of_stream: bool) -> Result<()> {
        if bytes.len() > self.buf.len() {
            return Err(EngineError::BufferTooSmall {
                need: bytes.len(),
                have: self.buf.len(),
            });
        }
        self.buf[..bytes.len()].copy_from_slice(bytes);
        self.len = bytes.len();
        self.end_of_stream = end_of_stream;
        Ok(())
    }

    /// Forget the previous contents without releasing the buffer.
    pub fn reset(&mut self) {
        self.len = 0;
        self.end_of_stream = false;
    }
}
