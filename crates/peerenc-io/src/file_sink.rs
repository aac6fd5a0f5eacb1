//! [`ByteSink`] implementations for encoded output.
//!
//! [`FileByteSink`] writes the raw elementary stream (Annex B for both AVC and
//! HEVC) straight to disk.  The output can be remuxed with:
//!
//! ```bash
//! ffmpeg -i output.h265 -c copy output.mp4
//! ```

use std::cell::RefCell;
use std::fs::File;
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use peerenc_core::error::{EngineError, Result};
use peerenc_core::io_traits::ByteSink;

/// Output path that selects [`NullSink`].
pub const NULL_OUTPUT: &str = "null";

/// Open the sink for `path`, honouring the `null` discard path.
pub fn open_output(path: &Path) -> Result<Box<dyn ByteSink>> {
    if path.as_os_str() == NULL_OUTPUT {
        tracing::info!("Output discarded (null sink)");
        return Ok(Box::new(NullSink));
    }
    Ok(Box::new(FileByteSink::create(path.to_path_buf())?))
}

/// Writes encoded bytes to a file.
pub struct FileByteSink {
    writer: BufWriter<File>,
    bytes_written: u64,
    writes: u64,
    path: PathBuf,
}

impl FileByteSink {
    pub fn create(path: PathBuf) -> Result<Self> {
        let file = File::create(&path).map_err(|e| EngineError::io(path.display().to_string(), e))?;

        tracing::info!(path = %path.display(), "Output sink opened");

        Ok(Self {
            writer: BufWriter::with_capacity(4 * 1024 * 1024, file), // 4 MiB buffer
            bytes_written: 0,
            writes: 0,
            path,
        })
    }
}

impl ByteSink for FileByteSink {
    fn write(&mut self, data: &[u8]) -> Result<usize> {
        let mut written = 0;
        while written < data.len() {
            match self.writer.write(&data[written..]) {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if written > 0 => {
                    tracing::warn!(path = %self.path.display(), error = %e, "write stopped early");
                    break;
                }
                Err(e) => return Err(EngineError::io(self.path.display().to_string(), e)),
            }
        }

        self.bytes_written += written as u64;
        self.writes += 1;

        if self.writes.is_multiple_of(100) {
            tracing::debug!(
                writes = self.writes,
                bytes_mb = self.bytes_written / (1024 * 1024),
                "Sink progress"
            );
        }

        Ok(written)
    }

    fn flush(&mut self) -> Result<()> {
        self.writer
            .flush()
            .map_err(|e| EngineError::io(self.path.display().to_string(), e))?;

        tracing::info!(
            path = %self.path.display(),
            writes = self.writes,
            bytes = self.bytes_written,
            "Sink flushed"
        );

        Ok(())
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NullSink;

impl ByteSink for NullSink {
    fn write(&mut self, data: &[u8]) -> Result<usize> {
        Ok(data.len())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn describe(&self) -> String {
        NULL_OUTPUT.to_string()
    }
}

/// In-memory sink whose contents stay readable through a shared handle.
///
/// `capacity` caps the stored bytes; writes beyond it are short.
#[derive(Clone, Debug, Default)]
pub struct MemorySink {
    data: Rc<RefCell<Vec<u8>>>,
    capacity: Option<usize>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity_limit(capacity: usize) -> Self {
        Self {
            data: Rc::default(),
            capacity: Some(capacity),
        }
    }

    /// Copy of everything written so far.
    pub fn contents(&self) -> Vec<u8> {
        self.data.borrow().clone()
    }
}

impl ByteSink for MemorySink {
    fn write(&mut self, data: &[u8]) -> Result<usize> {
        let mut stored = self.data.borrow_mut();
        let room = self
            .capacity
            .map_or(data.len(), |cap| cap.saturating_sub(stored.len()));
        let n = data.len().min(room);
        stored.extend_from_slice(&data[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
