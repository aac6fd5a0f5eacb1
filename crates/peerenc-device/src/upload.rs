//! Loopback upload session: frame pool, host upload and P2P read.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::{debug, info};

use peerenc_core::device_traits::{UploadConfig, UploadSession};
use peerenc_core::error::{EngineError, Result};
use peerenc_core::types::{DeviceIdentity, DmaDescriptor, FrameLayout, HwFrame};

use crate::fabric::{FabricState, identity_of};

pub struct LoopbackUploadSession {
    fabric: Rc<RefCell<FabricState>>,
    device: u32,
    session: u64,
    config: UploadConfig,
    layout: FrameLayout,
    pool: Vec<u64>,
    closed: bool,
}

impl LoopbackUploadSession {
    pub(crate) fn open(
        fabric: Rc<RefCell<FabricState>>,
        device: u32,
        config: &UploadConfig,
    ) -> Result<Self> {
        let layout = FrameLayout::device(config.width, config.height, config.format)?;
        let session = {
            let mut state = fabric.borrow_mut();
            state
                .check_device(device)
                .map_err(|e| EngineError::SessionOpen {
                    kind: "upload",
                    device,
                    reason: e.to_string(),
                })?;
            state.open_session(device)
        };
        info!(device, session, "Uploader session opened");
        Ok(Self {
            fabric,
            device,
            session,
            config: *config,
            layout,
            pool: Vec::new(),
            closed: false,
        })
    }

    fn take_free_surface(&mut self) -> Result<HwFrame> {
        if self.pool.is_empty() {
            return Err(EngineError::FramePool(format!(
                "device {}: frame pool not initialised",
                self.device
            )));
        }
        let mut state = self.fabric.borrow_mut();
        for &id in &self.pool {
            let surface = state.surface_mut(id)?;
            if !surface.in_use {
                surface.in_use = true;
                let dma_buf_fd = surface.dma_buf_fd.unwrap_or(-1);
                state.stats.frames_acquired += 1;
                return Ok(HwFrame {
                    device: self.device,
                    surface_id: id,
                    dma_buf_fd,
                    width: self.config.width,
                    height: self.config.height,
                    format: self.config.format,
                    start_of_stream: false,
                    end_of_stream: false,
                    force_key_frame: false,
                    data_len: 0,
                });
            }
        }
        Err(EngineError::FramePool(format!(
            "device {}: all {} frame(s) acquired",
            self.device,
            self.pool.len()
        )))
    }

    fn check_owned(&self, frame: &HwFrame) -> Result<()> {
        if frame.device != self.device || !self.pool.contains(&frame.surface_id) {
            return Err(EngineError::Device(format!(
                "surface {} on device {} does not belong to session {}",
                frame.surface_id, frame.device, self.session
            )));
        }
        Ok(())
    }
}

impl UploadSession for LoopbackUploadSession {
    fn identity(&self) -> DeviceIdentity {
        identity_of(self.device)
    }

    fn init_frame_pool(&mut self, pool_size: u32, p2p: bool) -> Result<()> {
        if !self.pool.is_empty() {
            return Err(EngineError::FramePool("frame pool already initialised".into()));
        }
        if pool_size == 0 {
            return Err(EngineError::FramePool("pool size must be non-zero".into()));
        }
        let mut state = self.fabric.borrow_mut();
        for _ in 0..pool_size {
            let id = state.create_surface(self.device, self.session, self.layout.total_size(), p2p);
            self.pool.push(id);
        }
        info!(device = self.device, pool_size, p2p, "Frame pool created");
        Ok(())
    }

    fn acquire_frame(&mut self) -> Result<HwFrame> {
        self.take_free_surface()
    }

    fn acquire_frame_for_read(&mut self) -> Result<HwFrame> {
        self.take_free_surface()
    }

    fn upload(&mut self, frame: &mut HwFrame, data: &[u8]) -> Result<()> {
        self.check_owned(frame)?;
        let mut state = self.fabric.borrow_mut();
        let surface = state.surface_mut(frame.surface_id)?;
        if data.len() > surface.data.len() {
            return Err(EngineError::Upload(format!(
                "{} bytes do not fit surface of {} bytes",
                data.len(),
                surface.data.len()
            )));
        }
        surface.data[..data.len()].copy_from_slice(data);
        frame.data_len = data.len();
        state.stats.uploads += 1;
        debug!(device = self.device, bytes = data.len(), "frame uploaded");
        Ok(())
    }

    fn p2p_read(&mut self, descriptor: &DmaDescriptor, frame: &mut HwFrame) -> Result<()> {
        self.check_owned(frame)?;
        if descriptor.is_empty() {
            return Err(EngineError::P2pRead("empty DMA descriptor".into()));
        }
        let mut state = self.fabric.borrow_mut();
        let bytes = state.gather(identity_of(self.device), descriptor)?;
        let surface = state.surface_mut(frame.surface_id)?;
        if bytes.len() > surface.data.len() {
            return Err(EngineError::P2pRead(format!(
                "remote buffer of {} bytes exceeds local surface of {} bytes",
                bytes.len(),
                surface.data.len()
            )));
        }
        surface.data[..bytes.len()].copy_from_slice(&bytes);
        frame.data_len = bytes.len();
        state.stats.p2p_reads += 1;
        Ok(())
    }

    fn recycle(&mut self, frame: HwFrame) -> Result<()> {
        self.check_owned(&frame)?;
        let mut state = self.fabric.borrow_mut();
        if frame.dma_buf_fd >= 0 && state.fd_is_imported(frame.dma_buf_fd) {
            return Err(EngineError::InvariantViolation(format!(
                "surface {} recycled while dma-buf fd {} is still imported",
                frame.surface_id, frame.dma_buf_fd
            )));
        }
        state.surface_mut(frame.surface_id)?.in_use = false;
        state.stats.frames_recycled += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.fabric.borrow_mut().close_session(self.session)?;
        self.closed = true;
        self.pool.clear();
        info!(device = self.device, session = self.session, "Uploader session closed");
        Ok(())
    }
}
