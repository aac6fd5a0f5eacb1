//! Frame renderer: raw input → device layout → producer surface.
//!
//! Each call reads one source frame (dense layout) through the
//! [`RepeatReader`], copies it row by row into the page-aligned staging
//! buffer using the device strides, and uploads the staging buffer onto
//! the producer frame.  The staging buffer is allocated on the first frame
//! and reused for the rest of the run.
//!
//! Bytes the source does not cover (a partial trailing frame, stride
//! padding, the extra chroma row of odd heights) are zero.

use tracing::debug;

use peerenc_core::device_traits::UploadSession;
use peerenc_core::error::{EngineError, Result};
use peerenc_core::io_traits::ByteSource;
use peerenc_core::staging::StagingBuffer;
use peerenc_core::types::{FrameLayout, HwFrame, PixelFormat};
use peerenc_io::RepeatReader;

pub struct FrameRenderer<S: ByteSource> {
    reader: RepeatReader<S>,
    source_layout: FrameLayout,
    device_layout: FrameLayout,
    /// One source frame, as read.
    chunk: Vec<u8>,
    staging: Option<StagingBuffer>,
    exhausted: bool,
    frames: u64,
}

/// Zeroed buffer for one source frame; allocation failure is an error,
/// not an abort.
fn alloc_chunk(len: usize) -> Result<Vec<u8>> {
    let mut chunk = Vec::new();
    chunk
        .try_reserve_exact(len)
        .map_err(|_| EngineError::Alloc { bytes: len, align: 1 })?;
    chunk.resize(len, 0);
    Ok(chunk)
}

impl<S: ByteSource> FrameRenderer<S> {
    pub fn new(
        source: S,
        repeat: u32,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Result<Self> {
        let source_layout = FrameLayout::source(width, height, format)?;
        let device_layout = FrameLayout::device(width, height, format)?;
        let reader = RepeatReader::new(source, repeat)?;
        let chunk = alloc_chunk(source_layout.total_size())?;
        Ok(Self {
            reader,
            source_layout,
            device_layout,
            chunk,
            staging: None,
            exhausted: false,
            frames: 0,
        })
    }

    /// Bytes one raw frame occupies in the input.
    pub fn source_frame_size(&self) -> usize {
        self.source_layout.total_size()
    }

    pub fn device_layout(&self) -> &FrameLayout {
        &self.device_layout
    }

    /// The input, repeats included, has been fully consumed.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub fn frames_rendered(&self) -> u64 {
        self.frames
    }

    /// Staged bytes of the most recent frame, `None` before the first one.
    pub fn staged(&self) -> Option<&[u8]> {
        self.staging.as_ref().map(StagingBuffer::as_slice)
    }

    /// Read and lay out the next frame in the staging buffer.
    ///
    /// Returns the device frame size, or `0` once the input is exhausted
    /// (the exhausted flag is set and nothing is touched).
    pub fn render_next(&mut self) -> Result<usize> {
        if self.exhausted {
            return Ok(0);
        }
        let got = self.reader.read_next_chunk(&mut self.chunk)?;
        if got == 0 {
            debug!(frames = self.frames, "input exhausted");
            self.exhausted = true;
            return Ok(0);
        }
        if got < self.chunk.len() {
            debug!(bytes = got, frame = self.frames, "partial trailing frame, zero-padded");
            self.chunk[got..].fill(0);
        }

        if self.staging.is_none() {
            self.staging = Some(StagingBuffer::new(self.device_layout.total_size())?);
        }
        let Some(staging) = self.staging.as_mut() else {
            return Err(EngineError::InvariantViolation("staging buffer missing".into()));
        };
        copy_planes(
            &self.chunk,
            &self.source_layout,
            staging.as_mut_slice(),
            &self.device_layout,
        );
        self.frames += 1;
        Ok(self.device_layout.total_size())
    }

    /// Render the next frame and upload it onto `frame`.
    ///
    /// Returns the uploaded size, `0` when the input is exhausted.
    pub fn render(
        &mut self,
        session: &mut dyn UploadSession,
        frame: &mut HwFrame,
    ) -> Result<usize> {
        let size = self.render_next()?;
        if size == 0 {
            return Ok(0);
        }
        let staged = self
            .staged()
            .ok_or_else(|| EngineError::InvariantViolation("staging buffer missing".into()))?;
        session.upload(frame, staged)?;
        Ok(size)
    }

    /// Free the staging buffer.  The input stays open.
    pub fn release_staging(&mut self) {
        if self.staging.take().is_some() {
            debug!("staging buffer released");
        }
    }
}

/// Strided per-plane copy from the source layout into the device layout.
fn copy_planes(src: &[u8], src_layout: &FrameLayout, dst: &mut [u8], dst_layout: &FrameLayout) {
    for (index, (sp, dp)) in src_layout
        .planes()
        .iter()
        .zip(dst_layout.planes())
        .enumerate()
    {
        let src_base = src_layout.plane_offset(index);
        let dst_base = dst_layout.plane_offset(index);
        let row_bytes = src_layout.visible_row_bytes(index);
        for row in 0..sp.height {
            let s = src_base + row * sp.stride;
            let d = dst_base + row * dp.stride;
            dst[d..d + row_bytes].copy_from_slice(&src[s..s + row_bytes]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerenc_io::MemoryByteSource;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8 + 1).collect()
    }

    /// Read the visible pixels back out of a device-layout buffer.
    fn visible(staged: &[u8], layout: &FrameLayout, src: &FrameLayout) -> Vec<u8> {
        let mut out = Vec::new();
        for (index, (dp, sp)) in layout.planes().iter().zip(src.planes()).enumerate() {
            let base = layout.plane_offset(index);
            let row_bytes = layout.visible_row_bytes(index);
            for row in 0..sp.height {
                let start = base + row * dp.stride;
                out.extend_from_slice(&staged[start..start + row_bytes]);
            }
        }
        out
    }

    #[test]
    fn planar_frame_lands_at_device_offsets() {
        let (w, h) = (6u32, 4u32);
        let data = pattern(PixelFormat::PlanarYuv420p8.source_frame_size(w, h));
        let mut renderer =
            FrameRenderer::new(MemoryByteSource::new(data.clone()), 1, w, h, PixelFormat::PlanarYuv420p8)
                .expect("renderer");
        let size = renderer.render_next().expect("render");
        assert_eq!(size, 4096);
        let staged = renderer.staged().expect("staged");
        // Y: 6x4, U and V: 3x2
        assert_eq!(&staged[..24], &data[..24]);
        assert_eq!(&staged[24..30], &data[24..30]);
        assert_eq!(&staged[30..36], &data[30..36]);
        assert!(staged[36..].iter().all(|&b| b == 0));
    }

    #[test]
    fn packed_rows_honour_padded_stride() {
        let (w, h) = (10u32, 3u32);
        let data = pattern(PixelFormat::PackedRgba8.source_frame_size(w, h));
        let mut renderer =
            FrameRenderer::new(MemoryByteSource::new(data.clone()), 1, w, h, PixelFormat::PackedRgba8)
                .expect("renderer");
        renderer.render_next().expect("render");
        let staged = renderer.staged().expect("staged");
        // align16(10) * 4 = 64-byte stride, 40 visible bytes per row
        for row in 0..3 {
            assert_eq!(&staged[row * 64..row * 64 + 40], &data[row * 40..row * 40 + 40]);
            assert!(staged[row * 64 + 40..row * 64 + 64].iter().all(|&b| b == 0));
        }
    }

    #[test]
    fn odd_height_leaves_extra_chroma_row_zeroed() {
        let (w, h) = (4u32, 3u32);
        let format = PixelFormat::PlanarYuv420p8;
        let data = pattern(format.source_frame_size(w, h));
        let mut renderer =
            FrameRenderer::new(MemoryByteSource::new(data), 1, w, h, format).expect("renderer");
        renderer.render_next().expect("render");
        let layout = renderer.device_layout().clone();
        assert_eq!(layout.planes()[1].height, 2);
        let staged = renderer.staged().expect("staged");
        // luma 4x4 (last row padding), chroma 2x2 with one row from the source
        assert!(staged[12..16].iter().all(|&b| b == 0));
        let u = layout.plane_offset(1);
        assert!(staged[u..u + 2].iter().all(|&b| b != 0));
        assert!(staged[u + 2..u + 4].iter().all(|&b| b == 0));
    }

    #[test]
    fn repeat_playback_reproduces_every_frame() {
        let (w, h) = (8u32, 8u32);
        let format = PixelFormat::PlanarYuv420p8;
        let frame = format.source_frame_size(w, h);
        let data = pattern(frame * 3);
        let mut renderer =
            FrameRenderer::new(MemoryByteSource::new(data.clone()), 2, w, h, format).expect("renderer");
        let src = FrameLayout::source(w, h, format).expect("layout");
        let mut out = Vec::new();
        let mut first_ptr = None;
        while renderer.render_next().expect("render") > 0 {
            let staged = renderer.staged().expect("staged");
            first_ptr.get_or_insert(staged.as_ptr());
            assert_eq!(first_ptr, Some(staged.as_ptr()), "staging buffer must not move");
            out.extend(visible(staged, renderer.device_layout(), &src));
        }
        assert!(renderer.is_exhausted());
        assert_eq!(renderer.frames_rendered(), 6);
        let expected: Vec<u8> = data.iter().chain(data.iter()).copied().collect();
        assert_eq!(out, expected);
    }

    #[test]
    fn partial_trailing_frame_is_zero_padded() {
        let (w, h) = (4u32, 2u32);
        let format = PixelFormat::PackedRgba8;
        let frame = format.source_frame_size(w, h);
        let data = pattern(frame + 5);
        let mut renderer =
            FrameRenderer::new(MemoryByteSource::new(data.clone()), 1, w, h, format).expect("renderer");
        renderer.render_next().expect("first");
        assert!(renderer.render_next().expect("second") > 0);
        let staged = renderer.staged().expect("staged");
        assert_eq!(&staged[..5], &data[frame..]);
        assert!(staged[5..16].iter().all(|&b| b == 0));
        assert_eq!(renderer.render_next().expect("third"), 0);
        assert!(renderer.is_exhausted());
        assert_eq!(renderer.render_next().expect("after"), 0);
    }

    #[test]
    fn unallocatable_frame_buffer_is_an_error() {
        match alloc_chunk(usize::MAX) {
            Err(EngineError::Alloc { bytes, .. }) => assert_eq!(bytes, usize::MAX),
            other => panic!("expected Alloc, got {:?}", other.map(|c| c.len())),
        }
        assert_eq!(alloc_chunk(16).expect("small").len(), 16);
    }

    #[test]
    fn oversized_geometry_is_rejected_before_allocating() {
        let err = FrameRenderer::new(
            MemoryByteSource::new(vec![1; 16]),
            1,
            u32::MAX,
            u32::MAX,
            PixelFormat::PackedRgba8,
        )
        .err()
        .expect("too large");
        assert_eq!(err.error_code(), 101);
    }

    #[test]
    fn nothing_is_allocated_for_an_empty_source() {
        let mut renderer =
            FrameRenderer::new(MemoryByteSource::new(Vec::new()), 1, 4, 4, PixelFormat::PackedRgba8)
                .expect("renderer");
        assert_eq!(renderer.render_next().expect("render"), 0);
        assert!(renderer.staged().is_none());
    }
}
