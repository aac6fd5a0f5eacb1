#![doc = include_str!("../README.md")]

/// Output sinks: file, discard (`null`) and in-memory.
pub mod file_sink;
/// Input sources and repeat-N playback.
pub mod file_source;

pub use file_sink::{FileByteSink, MemorySink, NULL_OUTPUT, NullSink, open_output};
pub use file_source::{FileByteSource, MemoryByteSource, RepeatReader, input_file_size};
