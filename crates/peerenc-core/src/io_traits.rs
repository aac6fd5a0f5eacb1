//! Host byte source and sink contracts.
//!
//! The renderer pulls raw frames from a [`ByteSource`]; the receive driver
//! appends encoded payload to a [`ByteSink`].

use crate::error::Result;

/// Sequential, rewindable source of raw frame bytes.
///
/// Implementations: input file, in-memory buffer.
pub trait ByteSource {
    /// Total number of bytes in one pass over the source.
    fn size(&self) -> u64;

    /// Read up to `buf.len()` bytes.  `Ok(0)` means the current pass is exhausted.
    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Seek back to the first byte.
    fn rewind(&mut self) -> Result<()>;
}

/// Append-only destination for encoded bytes.
///
/// Implementations: output file, discarding sink, in-memory buffer.
pub trait ByteSink {
    /// Append `data`, returning how many bytes were actually stored.
    ///
    /// A return value below `data.len()` is a short write; callers decide
    /// whether that is fatal.  Failures are reported, never retried.
    fn write(&mut self, data: &[u8]) -> Result<usize>;

    /// Flush buffered bytes to the underlying storage.
    fn flush(&mut self) -> Result<()>;

    /// Name used in logs and errors.
    fn describe(&self) -> String;
}
