//! Enrollment: collect a fixed number of analysed samples and submit them
//! as one face profile.

use crate::capture::{
    still_from_frame, Admission, AnalysisOutcome, CaptureMode, CaptureOrchestrator, SampleSet,
};
use crate::gateway::{EnrollmentPayload, EnrollmentReceipt, SubmissionError, SubmissionGateway};
use crate::lock;
use crate::session::CaptureSession;
use presence_core::{AnalysisError, DescriptorService, FaceErrorCode, ModelError, Sample, SampleOrigin};
use presence_hw::{CameraBackend, CameraError, DeviceDescriptor};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug)]
pub enum EnrollmentError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("face model failed to load: {0}")]
    ModelLoadFailed(#[from] ModelError),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("{}", .0.code().user_message())]
    Analysis(AnalysisError),
    #[error("a capture is already being analysed")]
    Busy,
    #[error("all samples have been collected")]
    Full,
    #[error("no samples to remove")]
    Empty,
    #[error("camera is not streaming")]
    NotStreaming,
    #[error("the camera stopped unexpectedly; reconnect it and start again")]
    StreamEnded,
    #[error("a submission is already in flight")]
    Submitting,
    #[error("need {needed} analysed samples, have {have}")]
    Incomplete { needed: usize, have: usize },
    #[error(transparent)]
    Submission(#[from] SubmissionError),
    #[error("enrollment was closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrollmentPhase {
    Idle,
    RequestingCamera,
    Streaming { auto_capturing: bool },
    /// `count == N`; waiting for submit or removal.
    Complete,
    Submitting,
    Done,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EnrollmentEvent {
    Phase(EnrollmentPhase),
    SampleAdded { count: usize },
    SampleRemoved { count: usize },
    /// User-facing message for a surfaced failure.
    Notice(String),
    /// Server message after a successful submission.
    Submitted(String),
}

/// What one capture attempt did to the sample set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureOutcome {
    Added { count: usize },
    /// Bit-identical to a stored sample; discarded.
    Duplicate,
    /// Silent tick that did nothing (guard held, dark frame, set full).
    Skipped,
    Cancelled,
    /// Silent tick whose analysis found no usable face.
    Rejected(FaceErrorCode),
}

#[derive(Debug, Clone)]
pub struct EnrollmentOptions {
    /// Samples required for a profile (N).
    pub target_count: usize,
    /// Auto-capture period.
    pub interval: Duration,
    pub auto_capture: bool,
}

impl Default for EnrollmentOptions {
    fn default() -> Self {
        Self {
            target_count: 5,
            interval: Duration::from_millis(1500),
            auto_capture: true,
        }
    }
}

struct AutoCapture {
    id: u64,
    stop: CancellationToken,
}

struct State {
    phase: EnrollmentPhase,
    samples: SampleSet,
    /// Replaced on every start; cancelled on close.
    cancel: CancellationToken,
    ticker: Option<AutoCapture>,
    next_ticker: u64,
}

struct Shared {
    // Lock order: `state` before `session`.
    state: Mutex<State>,
    session: Mutex<CaptureSession>,
    orchestrator: CaptureOrchestrator,
    gateway: Arc<dyn SubmissionGateway>,
    options: EnrollmentOptions,
    events: broadcast::Sender<EnrollmentEvent>,
}

impl Shared {
    fn emit(&self, event: EnrollmentEvent) {
        let _ = self.events.send(event);
    }

    fn set_phase(&self, state: &mut State, phase: EnrollmentPhase) {
        if state.phase != phase {
            tracing::debug!(from = ?state.phase, to = ?phase, "enrollment phase");
            state.phase = phase;
            self.emit(EnrollmentEvent::Phase(phase));
        }
    }

    fn streaming_phase(&self) -> EnrollmentPhase {
        EnrollmentPhase::Streaming {
            auto_capturing: self.options.auto_capture,
        }
    }

    fn arm_ticker(self: &Arc<Self>, state: &mut State) {
        if !self.options.auto_capture || state.ticker.is_some() {
            return;
        }
        let id = state.next_ticker;
        state.next_ticker += 1;
        let stop = state.cancel.child_token();
        state.ticker = Some(AutoCapture {
            id,
            stop: stop.clone(),
        });
        tokio::spawn(Arc::clone(self).run_ticker(id, stop));
    }

    /// Stop the auto-capture loop. With `only`, stop it only if it is that loop.
    fn disarm(&self, state: &mut State, only: Option<u64>) {
        let matches = match (&state.ticker, only) {
            (Some(ticker), Some(id)) => ticker.id == id,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if !matches {
            return;
        }
        if let Some(ticker) = state.ticker.take() {
            ticker.stop.cancel();
        }
    }

    async fn run_ticker(self: Arc<Self>, id: u64, stop: CancellationToken) {
        let period = self.options.interval;
        let mut ticks = tokio::time::interval_at(Instant::now() + period, period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::debug!(interval_ms = period.as_millis() as u64, "auto-capture armed");

        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                _ = ticks.tick() => {}
            }

            let full = {
                let mut state = lock(&self.state);
                let full = state.samples.is_full();
                if full {
                    self.disarm(&mut state, Some(id));
                }
                full
            };
            if full {
                break;
            }
            if self.orchestrator.is_analyzing() {
                tracing::trace!("auto-capture tick skipped, analysis in flight");
                continue;
            }

            let shared = Arc::clone(&self);
            tokio::spawn(async move {
                match shared.capture_cycle(CaptureMode::Silent).await {
                    Ok(outcome) => tracing::trace!(?outcome, "auto-capture tick"),
                    Err(e) => tracing::debug!(error = %e, "auto-capture tick failed"),
                }
            });
        }
        tracing::debug!("auto-capture stopped");
    }

    /// One capture, dedupe, analyse, admit cycle under the analysis guard.
    async fn capture_cycle(&self, mode: CaptureMode) -> Result<CaptureOutcome, EnrollmentError> {
        let silent = mode == CaptureMode::Silent;
        let Some(ticket) = self.orchestrator.begin() else {
            return if silent {
                Ok(CaptureOutcome::Skipped)
            } else {
                Err(EnrollmentError::Busy)
            };
        };

        let (cancel, frame) = {
            let mut state = lock(&self.state);
            match state.phase {
                EnrollmentPhase::Streaming { .. } => {}
                EnrollmentPhase::Submitting => return Err(EnrollmentError::Submitting),
                _ if state.samples.is_full() => return Err(EnrollmentError::Full),
                _ => return Err(EnrollmentError::NotStreaming),
            }
            let mut session = lock(&self.session);
            let frame = match session.snapshot() {
                Ok(frame) => frame,
                Err(_) if !session.is_camera_on() => {
                    tracing::warn!("camera stream ended while enrolling");
                    self.disarm(&mut state, None);
                    session.release();
                    drop(session);
                    self.set_phase(&mut state, EnrollmentPhase::Failed);
                    self.emit(EnrollmentEvent::Notice(
                        EnrollmentError::StreamEnded.to_string(),
                    ));
                    return Err(EnrollmentError::StreamEnded);
                }
                Err(e) => return Err(EnrollmentError::CaptureFailed(e.to_string())),
            };
            (state.cancel.clone(), frame)
        };

        if silent && frame.is_dark {
            tracing::trace!(sequence = frame.sequence, "dark frame skipped");
            return Ok(CaptureOutcome::Skipped);
        }
        let image =
            still_from_frame(frame).map_err(|e| EnrollmentError::CaptureFailed(e.to_string()))?;

        let duplicate = lock(&self.state).samples.contains_image(&image);
        if duplicate {
            tracing::debug!("identical still already stored, discarding");
            return Ok(CaptureOutcome::Duplicate);
        }

        let descriptor = match self.orchestrator.analyze(&ticket, &image, &cancel).await {
            AnalysisOutcome::Descriptor(d) => d,
            AnalysisOutcome::Cancelled => return Ok(CaptureOutcome::Cancelled),
            AnalysisOutcome::Rejected(e) if silent => {
                tracing::debug!(code = %e.code(), "auto-capture miss");
                return Ok(CaptureOutcome::Rejected(e.code()));
            }
            AnalysisOutcome::Rejected(e) => {
                self.emit(EnrollmentEvent::Notice(e.code().user_message().to_string()));
                return Err(EnrollmentError::Analysis(e));
            }
        };

        let mut sample = Sample::new(image, SampleOrigin::Camera);
        sample.descriptor = Some(descriptor);

        let mut state = lock(&self.state);
        if cancel.is_cancelled() || !matches!(state.phase, EnrollmentPhase::Streaming { .. }) {
            return Ok(CaptureOutcome::Cancelled);
        }
        match state.samples.admit(sample) {
            Admission::Added { count } => {
                tracing::info!(count, target = state.samples.capacity(), "enrollment sample stored");
                self.emit(EnrollmentEvent::SampleAdded { count });
                if state.samples.is_full() {
                    self.disarm(&mut state, None);
                    self.set_phase(&mut state, EnrollmentPhase::Complete);
                }
                Ok(CaptureOutcome::Added { count })
            }
            Admission::Duplicate => Ok(CaptureOutcome::Duplicate),
            Admission::Full if silent => Ok(CaptureOutcome::Skipped),
            Admission::Full => Err(EnrollmentError::Full),
        }
    }

    fn fail(&self, cancel: &CancellationToken, message: String) {
        let mut state = lock(&self.state);
        if cancel.is_cancelled() {
            return;
        }
        self.disarm(&mut state, None);
        self.set_phase(&mut state, EnrollmentPhase::Failed);
        lock(&self.session).release();
        self.emit(EnrollmentEvent::Notice(message));
    }

    fn teardown(&self) {
        let mut state = lock(&self.state);
        state.cancel.cancel();
        self.disarm(&mut state, None);
        state.samples.clear();
        self.set_phase(&mut state, EnrollmentPhase::Idle);
        if lock(&self.session).release() {
            tracing::info!("enrollment closed, camera released");
        }
    }
}

/// Face enrollment state machine.
///
/// Closing (or dropping) the flow cancels any in-flight analysis, stops the
/// auto-capture loop, clears samples and releases the camera.
pub struct EnrollmentFlow {
    shared: Arc<Shared>,
}

impl EnrollmentFlow {
    pub fn new(
        camera: Arc<dyn CameraBackend>,
        descriptors: DescriptorService,
        gateway: Arc<dyn SubmissionGateway>,
        options: EnrollmentOptions,
    ) -> Self {
        let options = EnrollmentOptions {
            target_count: options.target_count.max(1),
            ..options
        };
        let (events, _) = broadcast::channel(64);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    phase: EnrollmentPhase::Idle,
                    samples: SampleSet::new(options.target_count),
                    cancel: CancellationToken::new(),
                    ticker: None,
                    next_ticker: 0,
                }),
                session: Mutex::new(CaptureSession::new(camera)),
                orchestrator: CaptureOrchestrator::new(descriptors),
                gateway,
                options,
                events,
            }),
        }
    }

    /// Open the camera, load the model and start streaming.
    ///
    /// No-op while a session is already running. Starting from `Done` or
    /// `Failed` begins a fresh session.
    pub async fn start(&self) -> Result<(), EnrollmentError> {
        let shared = &self.shared;
        let cancel = {
            let mut state = lock(&shared.state);
            match state.phase {
                EnrollmentPhase::Idle | EnrollmentPhase::Done | EnrollmentPhase::Failed => {}
                _ => return Ok(()),
            }
            state.cancel.cancel();
            state.cancel = CancellationToken::new();
            shared.disarm(&mut state, None);
            state.samples.clear();
            shared.set_phase(&mut state, EnrollmentPhase::RequestingCamera);
            state.cancel.clone()
        };

        let opened = lock(&shared.session).open_camera();
        if let Err(e) = opened {
            tracing::warn!(error = %e, "enrollment camera unavailable");
            shared.fail(&cancel, e.to_string());
            return Err(e.into());
        }

        let loaded = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(EnrollmentError::Closed),
            loaded = shared.orchestrator.descriptors().ensure_loaded() => loaded,
        };
        if let Err(e) = loaded {
            tracing::error!(error = %e, "face model failed to load");
            shared.fail(&cancel, format!("Face model unavailable: {e}"));
            return Err(e.into());
        }

        let mut state = lock(&shared.state);
        if cancel.is_cancelled() {
            return Err(EnrollmentError::Closed);
        }
        let phase = shared.streaming_phase();
        shared.set_phase(&mut state, phase);
        shared.arm_ticker(&mut state);
        Ok(())
    }

    /// Capture one still now. `Surfaced` reports analysis failures.
    pub async fn capture(&self, mode: CaptureMode) -> Result<CaptureOutcome, EnrollmentError> {
        self.shared.capture_cycle(mode).await
    }

    /// Drop the newest sample. Falling below the target resumes streaming
    /// and re-arms auto-capture, reopening the camera if it was released.
    ///
    /// Must be called from within a tokio runtime.
    pub fn remove_last(&self) -> Result<Sample, EnrollmentError> {
        let shared = &self.shared;
        let mut state = lock(&shared.state);
        if state.phase == EnrollmentPhase::Submitting {
            return Err(EnrollmentError::Submitting);
        }
        let sample = state.samples.pop().ok_or(EnrollmentError::Empty)?;
        let count = state.samples.len();
        tracing::info!(count, "enrollment sample removed");
        shared.emit(EnrollmentEvent::SampleRemoved { count });

        let reopened = {
            let mut session = lock(&shared.session);
            if session.is_camera_on() {
                Ok(())
            } else {
                session.open_camera()
            }
        };
        match reopened {
            Ok(()) => {
                let phase = shared.streaming_phase();
                shared.set_phase(&mut state, phase);
                shared.arm_ticker(&mut state);
            }
            Err(e) => {
                tracing::warn!(error = %e, "could not reopen camera after removal");
                shared.disarm(&mut state, None);
                shared.set_phase(&mut state, EnrollmentPhase::Failed);
                shared.emit(EnrollmentEvent::Notice(e.to_string()));
            }
        }
        Ok(sample)
    }

    /// Submit all N descriptors and images.
    ///
    /// On failure the samples are kept so the submit can be retried.
    pub async fn submit(&self) -> Result<EnrollmentReceipt, EnrollmentError> {
        let shared = &self.shared;
        let (payload, cancel) = {
            let mut state = lock(&shared.state);
            if state.phase == EnrollmentPhase::Submitting {
                return Err(EnrollmentError::Submitting);
            }
            let payload = state
                .samples
                .is_complete()
                .then(|| EnrollmentPayload::from_samples(state.samples.as_slice()))
                .flatten()
                .ok_or(EnrollmentError::Incomplete {
                    needed: state.samples.capacity(),
                    have: state.samples.len(),
                })?;
            shared.disarm(&mut state, None);
            shared.set_phase(&mut state, EnrollmentPhase::Submitting);
            (payload, state.cancel.clone())
        };

        let result = shared.gateway.enroll(&payload).await;

        let mut state = lock(&shared.state);
        if cancel.is_cancelled() {
            return result.map_err(EnrollmentError::from);
        }
        lock(&shared.session).release();
        match result {
            Ok(receipt) => {
                tracing::info!(descriptors = receipt.profile.descriptors_count, "enrollment accepted");
                state.samples.clear();
                shared.set_phase(&mut state, EnrollmentPhase::Done);
                shared.emit(EnrollmentEvent::Submitted(receipt.message.clone()));
                Ok(receipt)
            }
            Err(e) => {
                tracing::warn!(error = %e, retryable = e.is_retryable(), "enrollment submission failed");
                shared.set_phase(&mut state, EnrollmentPhase::Failed);
                shared.emit(EnrollmentEvent::Notice(e.to_string()));
                Err(e.into())
            }
        }
    }

    /// Stop the current camera and stream from the next device.
    pub fn switch_device(&self) -> Result<Option<String>, EnrollmentError> {
        let shared = &self.shared;
        let mut state = lock(&shared.state);
        if !matches!(
            state.phase,
            EnrollmentPhase::Streaming { .. } | EnrollmentPhase::Complete
        ) {
            return Err(EnrollmentError::NotStreaming);
        }
        let switched = lock(&shared.session).switch_device();
        match switched {
            Ok(device) => {
                tracing::info!(device = ?device, "enrollment camera switched");
                Ok(device)
            }
            Err(e) => {
                shared.disarm(&mut state, None);
                shared.set_phase(&mut state, EnrollmentPhase::Failed);
                shared.emit(EnrollmentEvent::Notice(e.to_string()));
                Err(e.into())
            }
        }
    }

    /// Prefer a device for the next camera open.
    pub fn select_device(&self, id: &str) -> Result<bool, EnrollmentError> {
        Ok(lock(&self.shared.session).select_device(id)?)
    }

    pub fn can_submit(&self) -> bool {
        let state = lock(&self.shared.state);
        state.phase != EnrollmentPhase::Submitting && state.samples.is_complete()
    }

    pub fn close(&self) {
        self.shared.teardown();
    }

    pub fn phase(&self) -> EnrollmentPhase {
        lock(&self.shared.state).phase
    }

    pub fn sample_count(&self) -> usize {
        lock(&self.shared.state).samples.len()
    }

    pub fn samples(&self) -> Vec<Sample> {
        lock(&self.shared.state).samples.as_slice().to_vec()
    }

    pub fn target_count(&self) -> usize {
        self.shared.options.target_count
    }

    pub fn is_auto_capturing(&self) -> bool {
        lock(&self.shared.state).ticker.is_some()
    }

    pub fn is_analyzing(&self) -> bool {
        self.shared.orchestrator.is_analyzing()
    }

    pub fn is_camera_on(&self) -> bool {
        lock(&self.shared.session).is_camera_on()
    }

    pub fn devices(&self) -> Vec<DeviceDescriptor> {
        lock(&self.shared.session).devices().to_vec()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EnrollmentEvent> {
        self.shared.events.subscribe()
    }
}

impl Drop for EnrollmentFlow {
    fn drop(&mut self) {
        self.shared.teardown();
    }
}
