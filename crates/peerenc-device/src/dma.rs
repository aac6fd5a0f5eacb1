//! Loopback stand-in for the privileged DMA driver.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::debug;

use peerenc_core::device_traits::DmaTransfer;
use peerenc_core::error::Result;
use peerenc_core::types::{DmaImportRequest, DmaSegment};

use crate::fabric::FabricState;

pub struct LoopbackDmaTransfer {
    fabric: Rc<RefCell<FabricState>>,
}

impl LoopbackDmaTransfer {
    pub(crate) fn new(fabric: Rc<RefCell<FabricState>>) -> Self {
        Self { fabric }
    }
}

impl DmaTransfer for LoopbackDmaTransfer {
    fn import_buffer(&mut self, request: &DmaImportRequest) -> Result<Vec<DmaSegment>> {
        let segments = self.fabric.borrow_mut().import(request)?;
        debug!(
            fd = request.fd,
            target = %request.target,
            segments = segments.len(),
            "dma-buf imported"
        );
        Ok(segments)
    }

    fn release_buffer(&mut self, request: &DmaImportRequest) -> Result<()> {
        self.fabric.borrow_mut().release(request)?;
        debug!(fd = request.fd, target = %request.target, "dma-buf released");
        Ok(())
    }
}
