//! DMA bridge: maps the producer's exported frame into the consumer device.
//!
//! The bridge holds at most one live import.  `import` on a bound bridge
//! and `descriptor`/`unimport` on an unbound one are errors, so a read can
//! never be issued against a released mapping.  A bridge dropped while
//! still bound releases its mapping.

use tracing::{debug, info, warn};

use peerenc_core::device_traits::DmaTransfer;
use peerenc_core::error::{EngineError, Result};
use peerenc_core::types::{DeviceIdentity, DmaDescriptor, DmaImportRequest};

struct Binding {
    request: DmaImportRequest,
    descriptor: DmaDescriptor,
}

pub struct DmaBridge {
    transfer: Box<dyn DmaTransfer>,
    binding: Option<Binding>,
}

impl DmaBridge {
    pub fn new(transfer: Box<dyn DmaTransfer>) -> Self {
        Self {
            transfer,
            binding: None,
        }
    }

    pub fn is_bound(&self) -> bool {
        self.binding.is_some()
    }

    /// Import dma-buf `fd` into the device identified by `target`.
    ///
    /// `length_hint` is the frame size in bytes.  On failure the bridge
    /// stays unbound.
    pub fn import(
        &mut self,
        fd: i32,
        target: DeviceIdentity,
        length_hint: usize,
    ) -> Result<&DmaDescriptor> {
        if let Some(binding) = &self.binding {
            return Err(EngineError::DmaAlreadyBound(binding.request.fd));
        }
        if fd < 0 {
            return Err(EngineError::DmaImport {
                fd,
                reason: "frame has no exported dma-buf".into(),
            });
        }
        let request = DmaImportRequest {
            fd,
            target,
            length_hint,
        };
        let segments = self.transfer.import_buffer(&request)?;
        let descriptor = match DmaDescriptor::from_segments(segments) {
            Ok(descriptor) => descriptor,
            Err(err) => {
                if let Err(release_err) = self.transfer.release_buffer(&request) {
                    warn!(fd, error = %release_err, "release after rejected import failed");
                }
                return Err(err);
            }
        };
        info!(
            fd,
            target = %target,
            segments = descriptor.segments().len(),
            bytes = descriptor.total_len(),
            "DMA buffer imported"
        );
        let binding = self.binding.insert(Binding {
            request,
            descriptor,
        });
        Ok(&binding.descriptor)
    }

    /// Descriptor of the live import.
    pub fn descriptor(&self) -> Result<&DmaDescriptor> {
        self.binding
            .as_ref()
            .map(|b| &b.descriptor)
            .ok_or(EngineError::DmaNotBound)
    }

    /// Release the live import.  The bridge is unbound afterwards even if
    /// the driver reports a failure.
    pub fn unimport(&mut self) -> Result<()> {
        let binding = self.binding.take().ok_or(EngineError::DmaNotBound)?;
        self.transfer.release_buffer(&binding.request)?;
        debug!(fd = binding.request.fd, "DMA buffer unimported");
        Ok(())
    }
}

impl Drop for DmaBridge {
    fn drop(&mut self) {
        if self.binding.is_some()
            && let Err(err) = self.unimport()
        {
            warn!(error = %err, "DMA unimport on drop failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerenc_core::types::{DmaSegment, MAX_DMA_SEGMENTS};
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default)]
    struct Log {
        imports: u32,
        releases: u32,
    }

    struct ScriptedTransfer {
        log: Rc<RefCell<Log>>,
        segments: usize,
        fail: bool,
    }

    impl DmaTransfer for ScriptedTransfer {
        fn import_buffer(&mut self, request: &DmaImportRequest) -> Result<Vec<DmaSegment>> {
            self.log.borrow_mut().imports += 1;
            if self.fail {
                return Err(EngineError::DmaImport {
                    fd: request.fd,
                    reason: "scripted".into(),
                });
            }
            Ok((0..self.segments)
                .map(|i| DmaSegment {
                    address: 0x1000 * i as u64,
                    length: 4096,
                })
                .collect())
        }

        fn release_buffer(&mut self, _request: &DmaImportRequest) -> Result<()> {
            self.log.borrow_mut().releases += 1;
            Ok(())
        }
    }

    fn bridge(segments: usize, fail: bool) -> (DmaBridge, Rc<RefCell<Log>>) {
        let log = Rc::new(RefCell::new(Log::default()));
        let transfer = ScriptedTransfer {
            log: Rc::clone(&log),
            segments,
            fail,
        };
        (DmaBridge::new(Box::new(transfer)), log)
    }

    fn target() -> DeviceIdentity {
        DeviceIdentity {
            domain: 0,
            bus: 0x10,
            dev: 0,
            func: 0,
        }
    }

    #[test]
    fn import_then_unimport_pairs_driver_calls() {
        let (mut bridge, log) = bridge(2, false);
        let descriptor = bridge.import(7, target(), 8192).expect("import");
        assert_eq!(descriptor.total_len(), 8192);
        assert!(bridge.is_bound());
        bridge.unimport().expect("unimport");
        assert!(!bridge.is_bound());
        assert!(matches!(bridge.descriptor(), Err(EngineError::DmaNotBound)));
        assert!(matches!(bridge.unimport(), Err(EngineError::DmaNotBound)));
        assert_eq!(log.borrow().imports, 1);
        assert_eq!(log.borrow().releases, 1);
    }

    #[test]
    fn second_import_while_bound_is_rejected() {
        let (mut bridge, log) = bridge(1, false);
        bridge.import(7, target(), 4096).expect("import");
        let err = bridge.import(7, target(), 4096).expect_err("double import");
        assert!(matches!(err, EngineError::DmaAlreadyBound(7)));
        assert_eq!(log.borrow().imports, 1);
    }

    #[test]
    fn failed_import_leaves_bridge_unbound_and_unreleased() {
        let (mut bridge, log) = bridge(1, true);
        assert_eq!(bridge.import(7, target(), 4096).expect_err("fail").error_code(), 400);
        assert!(!bridge.is_bound());
        drop(bridge);
        assert_eq!(log.borrow().releases, 0);
    }

    #[test]
    fn oversized_scatter_list_is_released_and_rejected() {
        let (mut bridge, log) = bridge(MAX_DMA_SEGMENTS + 1, false);
        let err = bridge.import(7, target(), 4096).expect_err("overflow");
        assert!(matches!(err, EngineError::DescriptorOverflow { .. }));
        assert!(!bridge.is_bound());
        assert_eq!(log.borrow().releases, 1);
    }

    #[test]
    fn drop_releases_a_live_import() {
        let (mut bridge, log) = bridge(1, false);
        bridge.import(7, target(), 4096).expect("import");
        drop(bridge);
        assert_eq!(log.borrow().releases, 1);
    }
}
