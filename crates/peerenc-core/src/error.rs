//! Typed error hierarchy for the P2P encode pipeline.
//!
//! Uses `thiserror` for library-grade errors.  Every variant carries a stable
//! [`EngineError::error_code`]; the CLI exits with its class,
//! [`EngineError::exit_code`], since process exit statuses are 8 bits.
//!
//! # Error codes
//!
//! Codes are grouped by failure class so callers can branch on the class
//! without string parsing:
//! - 1xx: configuration (raised before any device resource exists)
//! - 2xx: host resources (files, allocations, session open)
//! - 3xx: device calls
//! - 4xx: DMA import/export
//! - 5xx: encoder protocol
//! - 6xx: output sink
//! - 7xx: invariants

/// All errors originating from the peerenc engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    // ── Configuration ────────────────────────────────────────────────
    #[error("Configuration error: {0}")]
    Config(String),

    #[error(
        "Invalid frame dimensions {width}x{height}: width and height must be between 1 and {max}",
        max = crate::types::MAX_DIMENSION
    )]
    InvalidDimensions { width: u32, height: u32 },

    #[error("Source device and encoder device cannot be the same (index {0})")]
    IdenticalDevices(u32),

    // ── Host resources ───────────────────────────────────────────────
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Allocation of {bytes} bytes (align {align}) failed")]
    Alloc { bytes: usize, align: usize },

    #[error("Failed to open {kind} session on device {device}: {reason}")]
    SessionOpen {
        kind: &'static str,
        device: u32,
        reason: String,
    },

    #[error("Frame pool error: {0}")]
    FramePool(String),

    // ── Device calls ─────────────────────────────────────────────────
    #[error("Device error: {0}")]
    Device(String),

    #[error("Upload error: {0}")]
    Upload(String),

    #[error("P2P read error: {0}")]
    P2pRead(String),

    #[error("Encoder write error: {0}")]
    Encode(String),

    // ── DMA ──────────────────────────────────────────────────────────
    #[error("DMA import of fd {fd} failed: {reason}")]
    DmaImport { fd: i32, reason: String },

    #[error("DMA release of fd {fd} failed: {reason}")]
    DmaRelease { fd: i32, reason: String },

    #[error("DMA descriptor is not bound to an imported buffer")]
    DmaNotBound,

    #[error("DMA buffer fd {0} is already imported")]
    DmaAlreadyBound(i32),

    #[error("DMA descriptor overflow: {count} segments exceed the limit of {max}")]
    DescriptorOverflow { count: usize, max: usize },

    // ── Encoder protocol ─────────────────────────────────────────────
    #[error("Received {received} bytes, not more than metadata size {meta_size}")]
    ShortPacket { received: usize, meta_size: usize },

    #[error("Stream header read failed: {0}")]
    HeaderRead(String),

    // ── Output sink ──────────────────────────────────────────────────
    #[error("Short write to {sink}: wrote {written} of {expected} bytes")]
    ShortWrite {
        sink: String,
        written: usize,
        expected: usize,
    },

    // ── Invariants ───────────────────────────────────────────────────
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Buffer too small: need {need} bytes, have {have}")]
    BufferTooSmall { need: usize, have: usize },
}

impl EngineError {
    /// Stable integer error code, grouped by failure class.
    pub fn error_code(&self) -> u32 {
        match self {
            Self::Config(_) => 100,
            Self::InvalidDimensions { .. } => 101,
            Self::IdenticalDevices(_) => 102,
            Self::Io { .. } => 200,
            Self::Alloc { .. } => 201,
            Self::SessionOpen { .. } => 202,
            Self::FramePool(_) => 203,
            Self::Device(_) => 300,
            Self::Upload(_) => 301,
            Self::P2pRead(_) => 302,
            Self::Encode(_) => 303,
            Self::DmaImport { .. } => 400,
            Self::DmaRelease { .. } => 401,
            Self::DmaNotBound => 402,
            Self::DmaAlreadyBound(_) => 403,
            Self::DescriptorOverflow { .. } => 404,
            Self::ShortPacket { .. } => 500,
            Self::HeaderRead(_) => 501,
            Self::ShortWrite { .. } => 600,
            Self::InvariantViolation(_) => 700,
            Self::BufferTooSmall { .. } => 701,
        }
    }

    /// Process exit status: the failure class (`1` for 1xx ... `7` for 7xx).
    pub fn exit_code(&self) -> i32 {
        (self.error_code() / 100) as i32
    }

    /// Whether this error was raised before any device resource was acquired.
    pub fn is_config(&self) -> bool {
        self.error_code() < 200
    }

    /// Wrap an I/O error with the path it happened on.
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, EngineError>;
