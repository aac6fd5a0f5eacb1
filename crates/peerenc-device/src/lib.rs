#![doc = include_str!("../README.md")]

pub mod dma;
pub mod encoder;
mod fabric;
pub mod upload;

use std::cell::RefCell;
use std::rc::Rc;

use peerenc_core::device_traits::{
    DeviceBackend, DmaTransfer, EncoderConfig, EncoderSession, UploadConfig, UploadSession,
};
use peerenc_core::error::Result;
use peerenc_core::types::HwFrame;

pub use encoder::META_MAGIC;
pub use fabric::{FabricStats, LoopbackOptions};

use crate::dma::LoopbackDmaTransfer;
use crate::encoder::LoopbackEncoderSession;
use crate::fabric::FabricState;
use crate::upload::LoopbackUploadSession;

/// In-process accelerator fabric.
///
/// Cloning yields another handle to the same fabric, so a test can keep one
/// handle for inspection while the pipeline owns the other.
#[derive(Clone)]
pub struct LoopbackBackend {
    fabric: Rc<RefCell<FabricState>>,
}

impl LoopbackBackend {
    pub fn new(options: LoopbackOptions) -> Self {
        Self {
            fabric: Rc::new(RefCell::new(FabricState::new(options))),
        }
    }

    pub fn stats(&self) -> FabricStats {
        self.fabric.borrow().stats.clone()
    }

    /// DMA imports not yet released.
    pub fn live_imports(&self) -> usize {
        self.fabric.borrow().live_imports()
    }

    /// Frames acquired from any pool and not yet recycled.
    pub fn outstanding_frames(&self) -> usize {
        self.fabric.borrow().outstanding_frames()
    }

    pub fn open_sessions(&self) -> usize {
        self.fabric.borrow().open_session_count()
    }
}

impl Default for LoopbackBackend {
    fn default() -> Self {
        Self::new(LoopbackOptions::default())
    }
}

impl DeviceBackend for LoopbackBackend {
    fn name(&self) -> &'static str {
        "loopback"
    }

    fn open_upload(
        &mut self,
        device: u32,
        config: &UploadConfig,
    ) -> Result<Box<dyn UploadSession>> {
        Ok(Box::new(LoopbackUploadSession::open(
            Rc::clone(&self.fabric),
            device,
            config,
        )?))
    }

    fn open_encoder(
        &mut self,
        device: u32,
        config: &EncoderConfig,
        first_frame: &HwFrame,
    ) -> Result<Box<dyn EncoderSession>> {
        Ok(Box::new(LoopbackEncoderSession::open(
            Rc::clone(&self.fabric),
            device,
            config,
            first_frame,
        )?))
    }

    fn dma_transfer(&mut self) -> Result<Box<dyn DmaTransfer>> {
        Ok(Box::new(LoopbackDmaTransfer::new(Rc::clone(&self.fabric))))
    }
}
