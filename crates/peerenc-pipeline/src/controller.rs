//! Pipeline controller: producer → P2P DMA → encoder → sink.
//!
//! # Loop
//!
//! ```text
//! setup:  open consumer + producer sessions → render first frame
//!         → import producer frame into consumer → open encoder
//! loop:   p2p_read → encode → render next (unless exhausted/resending) → receive
//! ```
//!
//! Rendering writes the staging buffer and the producer surface, never the
//! consumer frame being encoded, so it runs between the encoder submission
//! and the output drain.
//!
//! # Teardown
//!
//! Every acquired resource lives in [`Resources`], whose teardown runs in a
//! fixed order on success, on error and on unwind:
//!
//! 1. unimport the DMA mapping
//! 2. recycle the consumer then the producer frame
//! 3. close the encoder
//! 4. close the consumer then the producer upload session
//! 5. release host buffers (staging, packet)
//! 6. close the input and flush the output

use tracing::{error, info, warn};

use peerenc_core::device_traits::{DeviceBackend, EncoderSession, UploadSession};
use peerenc_core::error::{EngineError, Result};
use peerenc_core::io_traits::{ByteSink, ByteSource};
use peerenc_core::types::HwFrame;

use crate::config::PipelineConfig;
use crate::dma_bridge::DmaBridge;
use crate::encode::{EncodeDriver, SendOutcome};
use crate::metrics::{PipelineState, RunSummary, ThroughputReporter};
use crate::receive::{ReceiveDriver, ReceiveOutcome};
use crate::render::FrameRenderer;

/// Consumer and producer frame pools hold a single frame each.
const FRAME_POOL_SIZE: u32 = 1;

/// Everything a run acquires, torn down in a fixed order.
struct Resources<'s, S: ByteSource> {
    bridge: Option<DmaBridge>,
    consumer_frame: Option<HwFrame>,
    producer_frame: Option<HwFrame>,
    encoder: Option<Box<dyn EncoderSession>>,
    consumer: Option<Box<dyn UploadSession>>,
    producer: Option<Box<dyn UploadSession>>,
    receiver: Option<ReceiveDriver>,
    renderer: Option<FrameRenderer<S>>,
    sink: &'s mut dyn ByteSink,
    torn_down: bool,
}

fn record(first: &mut Option<EngineError>, step: &'static str, result: Result<()>) {
    if let Err(err) = result {
        warn!(step, error = %err, "teardown step failed");
        first.get_or_insert(err);
    }
}

impl<'s, S: ByteSource> Resources<'s, S> {
    fn new(sink: &'s mut dyn ByteSink) -> Self {
        Self {
            bridge: None,
            consumer_frame: None,
            producer_frame: None,
            encoder: None,
            consumer: None,
            producer: None,
            receiver: None,
            renderer: None,
            sink,
            torn_down: false,
        }
    }

    /// Release everything in order.  Every step runs; the first failure
    /// is returned.
    fn teardown(&mut self) -> Result<()> {
        if self.torn_down {
            return Ok(());
        }
        self.torn_down = true;
        let mut first = None;

        if let Some(mut bridge) = self.bridge.take()
            && bridge.is_bound()
        {
            record(&mut first, "unimport", bridge.unimport());
        }

        if let Some(frame) = self.consumer_frame.take() {
            let result = match self.consumer.as_deref_mut() {
                Some(session) => session.recycle(frame),
                None => Err(EngineError::InvariantViolation(
                    "consumer frame without a session".into(),
                )),
            };
            record(&mut first, "recycle consumer frame", result);
        }
        if let Some(frame) = self.producer_frame.take() {
            let result = match self.producer.as_deref_mut() {
                Some(session) => session.recycle(frame),
                None => Err(EngineError::InvariantViolation(
                    "producer frame without a session".into(),
                )),
            };
            record(&mut first, "recycle producer frame", result);
        }

        if let Some(mut encoder) = self.encoder.take() {
            record(&mut first, "close encoder", encoder.close());
        }
        if let Some(mut session) = self.consumer.take() {
            record(&mut first, "close consumer session", session.close());
        }
        if let Some(mut session) = self.producer.take() {
            record(&mut first, "close producer session", session.close());
        }

        if let Some(renderer) = self.renderer.as_mut() {
            renderer.release_staging();
        }
        self.receiver = None;

        self.renderer = None;
        record(&mut first, "flush output", self.sink.flush());

        match first {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl<S: ByteSource> Drop for Resources<'_, S> {
    fn drop(&mut self) {
        if let Err(err) = self.teardown() {
            error!(error = %err, "teardown on drop failed");
        }
    }
}

fn missing(what: &str) -> EngineError {
    EngineError::InvariantViolation(format!("{what} not initialised"))
}

/// Runs one P2P encode over a [`DeviceBackend`].
pub struct PipelineController {
    config: PipelineConfig,
}

impl PipelineController {
    /// Validates `config`; nothing is opened yet.
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Encode `source` into `sink`.
    ///
    /// On error every acquired resource is still released in order and the
    /// error from the run (not from teardown) is returned.
    pub fn run<S: ByteSource>(
        &self,
        backend: &mut dyn DeviceBackend,
        source: S,
        sink: &mut dyn ByteSink,
    ) -> Result<RunSummary> {
        let mut res = Resources::new(sink);
        let mut state = PipelineState::new();

        let outcome = self.setup(backend, source, &mut res, &mut state).and_then(|()| {
            info!(
                backend = backend.name(),
                mode = %self.config.mode(),
                width = self.config.width,
                height = self.config.height,
                "P2P encode started"
            );
            drive(&mut res, &mut state)
        });
        let teardown = res.teardown();

        match (outcome, teardown) {
            (Err(err), Err(teardown_err)) => {
                warn!(error = %teardown_err, "teardown after failed run also failed");
                Err(err)
            }
            (Err(err), Ok(())) => Err(err),
            (Ok(()), Err(err)) => Err(err),
            (Ok(()), Ok(())) => {
                let summary = RunSummary::from_state(&state, &self.config);
                summary.log();
                Ok(summary)
            }
        }
    }

    fn setup<S: ByteSource>(
        &self,
        backend: &mut dyn DeviceBackend,
        source: S,
        res: &mut Resources<'_, S>,
        state: &mut PipelineState,
    ) -> Result<()> {
        let cfg = &self.config;
        let upload = cfg.upload_config();

        let consumer = res
            .consumer
            .insert(backend.open_upload(cfg.encoder_device, &upload)?);
        let producer = res
            .producer
            .insert(backend.open_upload(cfg.source_device, &upload)?);
        consumer.init_frame_pool(FRAME_POOL_SIZE, false)?;
        producer.init_frame_pool(FRAME_POOL_SIZE, true)?;

        let producer_frame = res.producer_frame.insert(producer.acquire_frame()?);
        let renderer = res.renderer.insert(FrameRenderer::new(
            source,
            cfg.repeat,
            cfg.width,
            cfg.height,
            cfg.format,
        )?);

        let first = renderer.render(&mut **producer, producer_frame)?;
        if first == 0 {
            return Err(EngineError::Config("input holds no frame data".into()));
        }
        state.counters.frames_rendered += 1;
        state.counters.bytes_sent += first as u64;

        let bridge = res.bridge.insert(DmaBridge::new(backend.dma_transfer()?));
        bridge.import(producer_frame.dma_buf_fd, consumer.identity(), first)?;

        let consumer_frame = res.consumer_frame.insert(consumer.acquire_frame_for_read()?);
        res.encoder = Some(backend.open_encoder(
            cfg.encoder_device,
            &cfg.encoder_config(),
            consumer_frame,
        )?);
        res.receiver = Some(ReceiveDriver::new(cfg.sink_policy)?);
        Ok(())
    }
}

/// The encode loop.  Returns once end-of-stream went out and came back.
fn drive<S: ByteSource>(res: &mut Resources<'_, S>, state: &mut PipelineState) -> Result<()> {
    let bridge = res.bridge.as_ref().ok_or_else(|| missing("DMA bridge"))?;
    let consumer = res.consumer.as_deref_mut().ok_or_else(|| missing("consumer session"))?;
    let producer = res.producer.as_deref_mut().ok_or_else(|| missing("producer session"))?;
    let consumer_frame = res.consumer_frame.as_mut().ok_or_else(|| missing("consumer frame"))?;
    let producer_frame = res.producer_frame.as_mut().ok_or_else(|| missing("producer frame"))?;
    let encoder = res.encoder.as_deref_mut().ok_or_else(|| missing("encoder"))?;
    let receiver = res.receiver.as_mut().ok_or_else(|| missing("receive driver"))?;
    let renderer = res.renderer.as_mut().ok_or_else(|| missing("renderer"))?;
    let sink = &mut *res.sink;

    let mut sender = EncodeDriver::new();
    let mut reporter = ThroughputReporter::new();

    while !state.is_done() {
        consumer.p2p_read(bridge.descriptor()?, consumer_frame)?;

        let sent = sender.send(encoder, consumer_frame, renderer.is_exhausted());
        state.counters.resends = sender.resends();
        match sent? {
            SendOutcome::Accepted(_) => state.counters.frames_submitted += 1,
            SendOutcome::EndOfStream => state.encode_finished = true,
            SendOutcome::Pending | SendOutcome::Finished => {}
        }

        if !renderer.is_exhausted() && !sender.resend_pending() {
            let size = renderer.render(producer, producer_frame)?;
            if size > 0 {
                state.counters.frames_rendered += 1;
                state.counters.bytes_sent += size as u64;
            }
        }

        let outcome = receiver.receive(encoder, sink, &mut state.counters)?;
        reporter.tick(state);
        if outcome == ReceiveOutcome::EndOfStream || receiver.last_packet_eos() {
            state.receive_finished = true;
            if !state.encode_finished {
                warn!("encoder signalled end-of-stream before it was sent");
                state.encode_finished = true;
            }
            break;
        }
    }
    Ok(())
}
