//! File-backed [`ByteSource`] and the repeat-playback reader.
//!
//! # Repeat playback
//!
//! [`RepeatReader`] serves the source `repeat` times back to back.  A read
//! never straddles the end of a pass: the last chunk of a pass may be short,
//! and the following read rewinds and starts the next pass.  Only when the
//! final pass is drained does it report `0`.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use peerenc_core::error::{EngineError, Result};
use peerenc_core::io_traits::ByteSource;

/// Size of a regular input file; empty files are rejected.
pub fn input_file_size(path: &Path) -> Result<u64> {
    let meta = std::fs::metadata(path).map_err(|e| EngineError::io(path.display().to_string(), e))?;
    if meta.len() == 0 {
        return Err(EngineError::Config(format!(
            "Input file {} is empty",
            path.display()
        )));
    }
    Ok(meta.len())
}

/// Reads raw frames from a file on disk.
pub struct FileByteSource {
    file: File,
    path: PathBuf,
    size: u64,
}

impl FileByteSource {
    pub fn open(path: PathBuf) -> Result<Self> {
        let size = input_file_size(&path)?;
        let file = File::open(&path).map_err(|e| EngineError::io(path.display().to_string(), e))?;

        tracing::info!(path = %path.display(), bytes = size, "Input source opened");

        Ok(Self { file, path, size })
    }
}

impl ByteSource for FileByteSource {
    fn size(&self) -> u64 {
        self.size
    }

    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(EngineError::io(self.path.display().to_string(), e)),
            }
        }
        Ok(filled)
    }

    fn rewind(&mut self) -> Result<()> {
        self.file
            .seek(SeekFrom::Start(0))
            .map_err(|e| EngineError::io(self.path.display().to_string(), e))?;
        Ok(())
    }
}

/// In-memory [`ByteSource`].
pub struct MemoryByteSource {
    data: Vec<u8>,
    pos: usize,
}

impl MemoryByteSource {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data, pos: 0 }
    }
}

impl ByteSource for MemoryByteSource {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = buf.len().min(self.data.len() - self.pos);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    fn rewind(&mut self) -> Result<()> {
        self.pos = 0;
        Ok(())
    }
}

/// Serves a [`ByteSource`] `repeat` times without gaps or duplicates.
pub struct RepeatReader<S: ByteSource> {
    source: S,
    total_size: u64,
    left_in_pass: u64,
    repeats_left: u32,
}

impl<S: ByteSource> RepeatReader<S> {
    /// `repeat` must be at least 1.
    pub fn new(source: S, repeat: u32) -> Result<Self> {
        if repeat == 0 {
            return Err(EngineError::Config("repeat count must be at least 1".into()));
        }
        let total_size = source.size();
        Ok(Self {
            source,
            total_size,
            left_in_pass: total_size,
            repeats_left: repeat,
        })
    }

    /// Read the next chunk of at most `buf.len()` bytes.
    ///
    /// Returns `0` only once every pass has been consumed.
    pub fn read_next_chunk(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.left_in_pass == 0 {
            if self.repeats_left > 1 {
                self.repeats_left -= 1;
                self.left_in_pass = self.total_size;
                self.source.rewind()?;
                tracing::debug!(left = self.repeats_left, "input rewound for repeat");
            } else {
                return Ok(0);
            }
        }

        let want = buf.len().min(self.left_in_pass as usize);
        let got = self.source.read_chunk(&mut buf[..want])?;
        if got == 0 && want > 0 {
            return Err(EngineError::InvariantViolation(format!(
                "input ended {} bytes before its reported size",
                self.left_in_pass
            )));
        }
        self.left_in_pass -= got as u64;
        Ok(got)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 251) as u8).collect()
    }

    fn drain(reader: &mut RepeatReader<MemoryByteSource>, chunk: usize) -> (Vec<u8>, usize) {
        let mut out = Vec::new();
        let mut buf = vec![0u8; chunk];
        let mut reads = 0;
        loop {
            let n = reader.read_next_chunk(&mut buf).expect("read");
            if n == 0 {
                break;
            }
            reads += 1;
            out.extend_from_slice(&buf[..n]);
        }
        (out, reads)
    }

    #[test]
    fn repeat_reproduces_source_exactly_n_times() {
        let data = pattern(1000);
        for repeat in [1u32, 2, 5] {
            for chunk in [1usize, 64, 300, 1000, 4096] {
                let mut reader =
                    RepeatReader::new(MemoryByteSource::new(data.clone()), repeat).expect("reader");
                let (out, _) = drain(&mut reader, chunk);
                let expected: Vec<u8> = data
                    .iter()
                    .copied()
                    .cycle()
                    .take(data.len() * repeat as usize)
                    .collect();
                assert_eq!(out, expected, "repeat={repeat} chunk={chunk}");
            }
        }
    }

    #[test]
    fn chunks_never_straddle_a_repeat_boundary() {
        let mut reader = RepeatReader::new(MemoryByteSource::new(pattern(250)), 3).expect("reader");
        let (_, reads) = drain(&mut reader, 100);
        // 100 + 100 + 50 per pass
        assert_eq!(reads, 9);
    }

    #[test]
    fn exhaustion_is_sticky() {
        let mut reader = RepeatReader::new(MemoryByteSource::new(pattern(10)), 1).expect("reader");
        let mut buf = [0u8; 16];
        assert_eq!(reader.read_next_chunk(&mut buf).expect("read"), 10);
        assert_eq!(reader.read_next_chunk(&mut buf).expect("read"), 0);
        assert_eq!(reader.read_next_chunk(&mut buf).expect("read"), 0);
    }

    #[test]
    fn zero_repeat_is_rejected() {
        assert!(RepeatReader::new(MemoryByteSource::new(pattern(4)), 0).is_err());
    }

    #[test]
    fn empty_input_file_is_a_config_error() {
        let path = std::env::temp_dir().join(format!(
            "peerenc_empty_{}_{}.yuv",
            std::process::id(),
            line!()
        ));
        std::fs::write(&path, b"").expect("write empty file");
        let err = input_file_size(&path).expect_err("empty file");
        assert!(err.is_config());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn file_source_rewinds_to_start() {
        let path = std::env::temp_dir().join(format!(
            "peerenc_src_{}_{}.yuv",
            std::process::id(),
            line!()
        ));
        std::fs::write(&path, pattern(64)).expect("write file");
        let mut source = FileByteSource::open(path.clone()).expect("open");
        assert_eq!(source.size(), 64);
        let mut first = [0u8; 8];
        source.read_chunk(&mut first).expect("read");
        source.rewind().expect("rewind");
        let mut again = [0u8; 8];
        source.read_chunk(&mut again).expect("read");
        assert_eq!(first, again);
        let _ = std::fs::remove_file(&path);
    }
}
