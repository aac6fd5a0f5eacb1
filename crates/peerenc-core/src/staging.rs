//! Page-aligned host staging memory.
//!
//! Upload DMA engines require page-aligned source buffers.  A
//! [`StagingBuffer`] is allocated once per run with the device frame size and
//! overwritten in place for every frame; it is never resized.

use std::alloc::{self, Layout};
use std::ptr::NonNull;

use crate::error::{EngineError, Result};
use crate::types::PAGE_SIZE;

/// Zero-initialised, page-aligned, fixed-size host buffer.
pub struct StagingBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl StagingBuffer {
    /// Allocate `len` zeroed bytes aligned to [`PAGE_SIZE`].
    pub fn new(len: usize) -> Result<Self> {
        let alloc_err = || EngineError::Alloc {
            bytes: len,
            align: PAGE_SIZE,
        };
        if len == 0 {
            return Err(alloc_err());
        }
        let layout = Layout::from_size_align(len, PAGE_SIZE).map_err(|_| alloc_err())?;
        // SAFETY: layout has a non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or_else(alloc_err)?;
        tracing::debug!(bytes = len, "staging buffer allocated");
        Ok(Self { ptr, layout })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.layout.size()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for layout.size() initialised bytes for the
        // lifetime of self.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size()) }
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and &mut self guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl Drop for StagingBuffer {
    fn drop(&mut self) {
        // SAFETY: ptr was returned by alloc_zeroed with this exact layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

impl std::fmt::Debug for StagingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagingBuffer")
            .field("ptr", &self.ptr)
            .field("len", &self.layout.size())
            .finish()
    }
}
