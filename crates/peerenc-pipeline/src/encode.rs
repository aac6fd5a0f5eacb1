//! Encode driver: frame submission with start/end-of-stream tracking and
//! resend on back-pressure.
//!
//! ```text
//! NotStarted ──first submission──► Started ──ready_to_close──► EosSent
//!      │                            ▲   │
//!      └──── refused ───► ResendPending ◄┘ refused
//! ```
//!
//! A refused frame is resubmitted unchanged (flags included) on the next
//! call; the caller must not render a new frame in between.

use tracing::{debug, info};

use peerenc_core::device_traits::EncoderSession;
use peerenc_core::error::Result;
use peerenc_core::types::HwFrame;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum EncodeState {
    #[default]
    NotStarted,
    Started,
    ResendPending,
    EosSent,
}

/// Result of one [`EncodeDriver::send`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    /// A data frame was accepted; the device reported this many bytes.
    Accepted(usize),
    /// The end-of-stream submission was accepted.
    EndOfStream,
    /// The device did not take the frame; resubmit it unchanged.
    Pending,
    /// End-of-stream was already sent; nothing was submitted.
    Finished,
}

#[derive(Debug, Default)]
pub struct EncodeDriver {
    state: EncodeState,
    /// Start-of-stream has been put on a frame.
    started: bool,
    submitted: u64,
    resends: u64,
}

impl EncodeDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> EncodeState {
        self.state
    }

    pub fn resend_pending(&self) -> bool {
        self.state == EncodeState::ResendPending
    }

    pub fn is_finished(&self) -> bool {
        self.state == EncodeState::EosSent
    }

    /// Data frames accepted so far.
    pub fn frames_submitted(&self) -> u64 {
        self.submitted
    }

    /// Submissions refused by the device.
    pub fn resends(&self) -> u64 {
        self.resends
    }

    /// Submit `frame`, or resubmit it when the previous attempt was refused.
    ///
    /// `input_exhausted` marks this submission as end-of-stream.  A device
    /// error leaves the driver in resend-pending and is returned.
    pub fn send(
        &mut self,
        encoder: &mut dyn EncoderSession,
        frame: &mut HwFrame,
        input_exhausted: bool,
    ) -> Result<SendOutcome> {
        match self.state {
            EncodeState::EosSent => return Ok(SendOutcome::Finished),
            EncodeState::ResendPending => {}
            EncodeState::NotStarted | EncodeState::Started => {
                frame.clear_flags();
                if !self.started {
                    self.started = true;
                    frame.start_of_stream = true;
                }
                frame.end_of_stream = input_exhausted;
            }
        }

        let written = match encoder.write(frame) {
            Ok(n) => n,
            Err(err) => {
                self.state = EncodeState::ResendPending;
                return Err(err);
            }
        };

        if written == 0 && !encoder.ready_to_close() {
            self.state = EncodeState::ResendPending;
            self.resends += 1;
            debug!(resends = self.resends, "encoder busy, resend pending");
            return Ok(SendOutcome::Pending);
        }

        if encoder.ready_to_close() {
            self.state = EncodeState::EosSent;
            info!(frames = self.submitted, "End-of-stream sent to encoder");
            return Ok(SendOutcome::EndOfStream);
        }

        self.state = EncodeState::Started;
        self.submitted += 1;
        Ok(SendOutcome::Accepted(written))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerenc_core::error::EngineError;
    use peerenc_core::types::{Packet, PixelFormat};
    use std::collections::VecDeque;

    /// Encoder that answers writes from a script and records the flags it saw.
    #[derive(Default)]
    struct ScriptedEncoder {
        answers: VecDeque<Result<usize>>,
        seen: Vec<(bool, bool)>,
        ready: bool,
    }

    impl ScriptedEncoder {
        fn answering(answers: Vec<Result<usize>>) -> Self {
            Self {
                answers: answers.into(),
                ..Self::default()
            }
        }
    }

    impl EncoderSession for ScriptedEncoder {
        fn write(&mut self, frame: &HwFrame) -> Result<usize> {
            self.seen.push((frame.start_of_stream, frame.end_of_stream));
            if frame.end_of_stream {
                self.ready = true;
                return Ok(0);
            }
            self.answers.pop_front().unwrap_or(Ok(100))
        }

        fn ready_to_close(&self) -> bool {
            self.ready
        }

        fn read_stream_header(&mut self, _packet: &mut Packet) -> Result<usize> {
            Ok(0)
        }

        fn read(&mut self, _packet: &mut Packet) -> Result<usize> {
            Ok(0)
        }

        fn metadata_size(&self) -> usize {
            64
        }

        fn low_delay(&self) -> bool {
            false
        }

        fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn frame() -> HwFrame {
        HwFrame {
            device: 0,
            surface_id: 1,
            dma_buf_fd: -1,
            width: 16,
            height: 16,
            format: PixelFormat::PlanarYuv420p8,
            start_of_stream: false,
            end_of_stream: false,
            force_key_frame: false,
            data_len: 4096,
        }
    }

    #[test]
    fn start_and_end_flags_land_on_first_and_final_frames() {
        let mut encoder = ScriptedEncoder::default();
        let mut driver = EncodeDriver::new();
        let mut f = frame();
        for _ in 0..3 {
            assert_eq!(
                driver.send(&mut encoder, &mut f, false).expect("send"),
                SendOutcome::Accepted(100)
            );
        }
        assert_eq!(
            driver.send(&mut encoder, &mut f, true).expect("eos"),
            SendOutcome::EndOfStream
        );
        assert!(driver.is_finished());
        assert_eq!(
            encoder.seen,
            vec![(true, false), (false, false), (false, false), (false, true)]
        );
        assert_eq!(driver.frames_submitted(), 3);
    }

    #[test]
    fn calls_after_eos_are_no_ops() {
        let mut encoder = ScriptedEncoder::default();
        let mut driver = EncodeDriver::new();
        let mut f = frame();
        driver.send(&mut encoder, &mut f, false).expect("first");
        driver.send(&mut encoder, &mut f, true).expect("eos");
        for _ in 0..3 {
            assert_eq!(
                driver.send(&mut encoder, &mut f, true).expect("after eos"),
                SendOutcome::Finished
            );
        }
        assert_eq!(encoder.seen.len(), 2);
    }

    #[test]
    fn refused_frame_is_resent_with_the_same_flags() {
        let mut encoder = ScriptedEncoder::answering(vec![Ok(0), Ok(0), Ok(50)]);
        let mut driver = EncodeDriver::new();
        let mut f = frame();
        assert_eq!(
            driver.send(&mut encoder, &mut f, false).expect("send"),
            SendOutcome::Pending
        );
        assert!(driver.resend_pending());
        assert_eq!(
            driver.send(&mut encoder, &mut f, false).expect("resend"),
            SendOutcome::Pending
        );
        assert_eq!(
            driver.send(&mut encoder, &mut f, false).expect("resend"),
            SendOutcome::Accepted(50)
        );
        assert_eq!(driver.state(), EncodeState::Started);
        // start-of-stream stays on every retry of the first frame only
        driver.send(&mut encoder, &mut f, false).expect("next");
        assert_eq!(
            encoder.seen,
            vec![(true, false), (true, false), (true, false), (false, false)]
        );
        assert_eq!(driver.resends(), 2);
        assert_eq!(driver.frames_submitted(), 2);
    }

    #[test]
    fn write_error_propagates_and_leaves_resend_pending() {
        let mut encoder =
            ScriptedEncoder::answering(vec![Err(EngineError::Encode("device gone".into()))]);
        let mut driver = EncodeDriver::new();
        let mut f = frame();
        let err = driver.send(&mut encoder, &mut f, false).expect_err("write error");
        assert_eq!(err.error_code(), 303);
        assert!(driver.resend_pending());
        assert_eq!(driver.frames_submitted(), 0);
    }
}
