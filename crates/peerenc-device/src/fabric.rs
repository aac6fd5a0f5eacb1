//! Shared state of the loopback accelerator fabric.
//!
//! Every device owns a set of surfaces (frame-pool entries).  P2P-capable
//! surfaces are exported under a dma-buf fd.  Importing an fd into another
//! device allocates a bus-address window in that device's address space;
//! P2P reads resolve addresses through those windows only, so a read after
//! the window was released fails the way an IOMMU fault would.

use std::collections::HashMap;

use peerenc_core::error::{EngineError, Result};
use peerenc_core::types::{
    DeviceIdentity, DmaDescriptor, DmaImportRequest, DmaSegment, MAX_DMA_SEGMENTS, align_up,
};

/// Preferred scatter-gather entry size (2 MiB).
const SEGMENT_BYTES: usize = 2 * 1024 * 1024;

/// Base of the simulated bus-address space.
const BUS_ADDRESS_BASE: u64 = 0x40_0000_0000;

/// Tunables and fault injection for the loopback fabric.
#[derive(Clone, Debug)]
pub struct LoopbackOptions {
    /// Number of devices (card indices `0..device_count`).
    pub device_count: u32,
    /// Metadata bytes prefixed to every encoder packet.
    pub meta_size: usize,
    /// Packets the encoder may hold before refusing new frames.
    pub encoder_queue_depth: usize,
    /// Encoder read calls before a submitted frame's packet is readable.
    pub encoder_latency_reads: u64,
    /// Fail every privileged DMA import.
    pub fail_dma_import: bool,
    /// Emit a packet no larger than the metadata prefix for this frame index.
    pub short_packet_at: Option<u64>,
}

impl Default for LoopbackOptions {
    fn default() -> Self {
        Self {
            device_count: 4,
            meta_size: 64,
            encoder_queue_depth: 1,
            encoder_latency_reads: 0,
            fail_dma_import: false,
            short_packet_at: None,
        }
    }
}

/// Call and resource counters, readable by tests and diagnostics.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FabricStats {
    pub sessions_opened: u64,
    pub sessions_closed: u64,
    pub frames_acquired: u64,
    pub frames_recycled: u64,
    pub uploads: u64,
    pub p2p_reads: u64,
    pub dma_imports: u64,
    pub dma_releases: u64,
    pub encoder_writes: u64,
    pub encoder_frames: u64,
    pub encoder_eos: u64,
    pub start_of_stream_frames: u64,
}

#[derive(Debug)]
pub(crate) struct Surface {
    pub device: u32,
    pub session: u64,
    pub data: Vec<u8>,
    pub in_use: bool,
    pub dma_buf_fd: Option<i32>,
}

#[derive(Clone, Copy, Debug)]
struct Window {
    fd: i32,
    target: DeviceIdentity,
    base: u64,
    len: usize,
}

#[derive(Debug)]
pub(crate) struct FabricState {
    pub options: LoopbackOptions,
    pub stats: FabricStats,
    pub surfaces: HashMap<u64, Surface>,
    exports: HashMap<i32, u64>,
    windows: Vec<Window>,
    open_sessions: HashMap<u64, u32>,
    next_surface: u64,
    next_session: u64,
    next_fd: i32,
    next_bus_address: u64,
}

pub(crate) fn identity_of(device: u32) -> DeviceIdentity {
    DeviceIdentity {
        domain: 0,
        bus: 0x10u8.wrapping_add(device as u8),
        dev: 0,
        func: 0,
    }
}

impl FabricState {
    pub fn new(options: LoopbackOptions) -> Self {
        Self {
            options,
            stats: FabricStats::default(),
            surfaces: HashMap::new(),
            exports: HashMap::new(),
            windows: Vec::new(),
            open_sessions: HashMap::new(),
            next_surface: 1,
            next_session: 1,
            next_fd: 100,
            next_bus_address: BUS_ADDRESS_BASE,
        }
    }

    pub fn check_device(&self, device: u32) -> Result<()> {
        if device >= self.options.device_count {
            return Err(EngineError::Device(format!(
                "no device with index {device} ({} present)",
                self.options.device_count
            )));
        }
        Ok(())
    }

    pub fn open_session(&mut self, device: u32) -> u64 {
        let id = self.next_session;
        self.next_session += 1;
        self.open_sessions.insert(id, device);
        self.stats.sessions_opened += 1;
        id
    }

    pub fn close_session(&mut self, session: u64) -> Result<()> {
        let busy = self
            .surfaces
            .values()
            .filter(|s| s.session == session && s.in_use)
            .count();
        if busy > 0 {
            return Err(EngineError::InvariantViolation(format!(
                "session {session} closed with {busy} frame(s) still acquired"
            )));
        }
        let owned: Vec<u64> = self
            .surfaces
            .iter()
            .filter(|(_, s)| s.session == session)
            .map(|(&id, _)| id)
            .collect();
        for id in owned {
            if let Some(surface) = self.surfaces.remove(&id)
                && let Some(fd) = surface.dma_buf_fd
            {
                self.exports.remove(&fd);
            }
        }
        if self.open_sessions.remove(&session).is_some() {
            self.stats.sessions_closed += 1;
        }
        Ok(())
    }

    pub fn open_session_count(&self) -> usize {
        self.open_sessions.len()
    }

    pub fn create_surface(&mut self, device: u32, session: u64, len: usize, p2p: bool) -> u64 {
        let id = self.next_surface;
        self.next_surface += 1;
        let dma_buf_fd = p2p.then(|| {
            let fd = self.next_fd;
            self.next_fd += 1;
            self.exports.insert(fd, id);
            fd
        });
        self.surfaces.insert(
            id,
            Surface {
                device,
                session,
                data: vec![0; len],
                in_use: false,
                dma_buf_fd,
            },
        );
        id
    }

    pub fn surface(&self, id: u64) -> Result<&Surface> {
        self.surfaces
            .get(&id)
            .ok_or_else(|| EngineError::Device(format!("unknown surface {id}")))
    }

    pub fn surface_mut(&mut self, id: u64) -> Result<&mut Surface> {
        self.surfaces
            .get_mut(&id)
            .ok_or_else(|| EngineError::Device(format!("unknown surface {id}")))
    }

    pub fn outstanding_frames(&self) -> usize {
        self.surfaces.values().filter(|s| s.in_use).count()
    }

    pub fn live_imports(&self) -> usize {
        self.windows.len()
    }

    pub fn fd_is_imported(&self, fd: i32) -> bool {
        self.windows.iter().any(|w| w.fd == fd)
    }

    /// Map an exported buffer into `request.target`'s address space.
    pub fn import(&mut self, request: &DmaImportRequest) -> Result<Vec<DmaSegment>> {
        self.stats.dma_imports += 1;
        if self.options.fail_dma_import {
            return Err(EngineError::DmaImport {
                fd: request.fd,
                reason: "injected import failure".into(),
            });
        }
        let surface_id = *self.exports.get(&request.fd).ok_or_else(|| EngineError::DmaImport {
            fd: request.fd,
            reason: "fd is not an exported dma-buf".into(),
        })?;
        if self
            .windows
            .iter()
            .any(|w| w.fd == request.fd && w.target == request.target)
        {
            return Err(EngineError::DmaAlreadyBound(request.fd));
        }
        let len = self.surface(surface_id)?.data.len();
        if request.length_hint > len {
            return Err(EngineError::DmaImport {
                fd: request.fd,
                reason: format!("length hint {} exceeds buffer size {len}", request.length_hint),
            });
        }

        let seg_len = SEGMENT_BYTES.max(align_up(len.div_ceil(MAX_DMA_SEGMENTS), 4096));
        let base = self.next_bus_address;
        self.next_bus_address += align_up(len, SEGMENT_BYTES) as u64;

        let mut segments = Vec::new();
        let mut offset = 0;
        while offset < len {
            let n = seg_len.min(len - offset);
            segments.push(DmaSegment {
                address: base + offset as u64,
                length: n as u32,
            });
            offset += n;
        }
        self.windows.push(Window {
            fd: request.fd,
            target: request.target,
            base,
            len,
        });
        Ok(segments)
    }

    pub fn release(&mut self, request: &DmaImportRequest) -> Result<()> {
        self.stats.dma_releases += 1;
        let before = self.windows.len();
        self.windows
            .retain(|w| !(w.fd == request.fd && w.target == request.target));
        if self.windows.len() == before {
            return Err(EngineError::DmaRelease {
                fd: request.fd,
                reason: format!("not imported into {}", request.target),
            });
        }
        Ok(())
    }

    /// Gather the bytes behind `descriptor` as seen from `reader`.
    pub fn gather(&self, reader: DeviceIdentity, descriptor: &DmaDescriptor) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(descriptor.total_len());
        for segment in descriptor.segments() {
            let window = self
                .windows
                .iter()
                .find(|w| {
                    w.target == reader
                        && segment.address >= w.base
                        && segment.address + segment.length as u64 <= w.base + w.len as u64
                })
                .ok_or_else(|| {
                    EngineError::P2pRead(format!(
                        "bus address {:#x} is not mapped for {reader}",
                        segment.address
                    ))
                })?;
            let surface_id = *self.exports.get(&window.fd).ok_or_else(|| {
                EngineError::P2pRead(format!("dma-buf fd {} no longer exported", window.fd))
            })?;
            let start = (segment.address - window.base) as usize;
            let data = &self.surface(surface_id)?.data;
            out.extend_from_slice(&data[start..start + segment.length as usize]);
        }
        Ok(out)
    }
}
