//! Attendance verification: one capture per check-in or check-out, optionally
//! analysed on device, gated by the attendance method's face policy.

use crate::capture::{still_from_frame, AnalysisOutcome, AnalysisTicket, CaptureOrchestrator};
use crate::gateway::{
    AttendancePhase, AttendanceReceipt, Evidence, SubmissionError, SubmissionGateway,
    VerificationPayload,
};
use crate::lock;
use crate::session::CaptureSession;
use presence_core::{DescriptorService, Sample, SampleOrigin, StillImage};
use presence_hw::{CameraBackend, CameraError};
use serde::Deserialize;
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

const CAPTURE_FILE_NAME: &str = "capture.png";

#[derive(Error, Debug)]
pub enum VerificationError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("could not read image file: {0}")]
    FileReadFailed(String),
    #[error("a capture is already being analysed")]
    Busy,
    #[error("camera is not ready")]
    NotStreaming,
    #[error("submission not allowed: {0}")]
    Blocked(SubmitBlocker),
    #[error(transparent)]
    Submission(#[from] SubmissionError),
    /// The capture was discarded by retake or close before analysis finished.
    #[error("capture was discarded")]
    Discarded,
}

/// What happens when face matching is required and analysis fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Hard stop: the attempt cannot be submitted.
    #[default]
    Block,
    /// Annotate and allow submission for manual review.
    Warn,
}

impl std::str::FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "block" => Ok(Self::Block),
            "warn" => Ok(Self::Warn),
            other => Err(format!("unknown face policy '{other}' (expected block or warn)")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerificationPolicy {
    /// The attendance method requires a face match.
    pub face_required: bool,
    pub on_failure: FailurePolicy,
    /// Extract the descriptor locally and attach it to the payload.
    pub analyze_on_device: bool,
}

impl Default for VerificationPolicy {
    fn default() -> Self {
        Self {
            face_required: true,
            on_failure: FailurePolicy::Block,
            analyze_on_device: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationPhase {
    Idle,
    CameraReady,
    /// No usable camera; only file upload remains.
    NoCamera,
    Captured { pending_analysis: bool },
    Analyzed { blocked: bool },
    Submitting,
    Done,
    Failed,
}

/// The one capture of an attendance event.
#[derive(Debug, Clone)]
pub struct VerificationAttempt {
    pub sample: Sample,
    pub phase: AttendancePhase,
    pub block_submission: bool,
    pub warning: Option<String>,
}

/// Why submit is currently disabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitBlocker {
    FileLoading,
    Analyzing,
    NoCapture,
    Blocked,
    /// No camera and the chosen upload could not be decoded.
    Fatal,
    InFlight,
}

impl std::fmt::Display for SubmitBlocker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::FileLoading => "image file is still loading",
            Self::Analyzing => "face analysis is still running",
            Self::NoCapture => "no photo captured yet",
            Self::Blocked => "face verification failed for this photo",
            Self::Fatal => "no camera available and the chosen file could not be read",
            Self::InFlight => "a submission is already in flight",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum VerificationEvent {
    Phase(VerificationPhase),
    Captured { origin: SampleOrigin },
    /// User-facing message for a surfaced failure or warning.
    Notice(String),
    /// Server message after a successful submission, verbatim.
    Submitted(String),
}

struct State {
    phase: VerificationPhase,
    attempt: Option<VerificationAttempt>,
    file_loading: bool,
    fatal: bool,
    cancel: CancellationToken,
}

/// Attendance capture state machine.
///
/// Dropping or closing the flow discards any in-flight analysis and
/// releases the camera.
pub struct VerificationFlow {
    // Lock order: `state` before `session`.
    state: Mutex<State>,
    session: Mutex<CaptureSession>,
    orchestrator: CaptureOrchestrator,
    gateway: Arc<dyn SubmissionGateway>,
    attendance: AttendancePhase,
    policy: VerificationPolicy,
    events: broadcast::Sender<VerificationEvent>,
}

impl VerificationFlow {
    pub fn new(
        camera: Arc<dyn CameraBackend>,
        descriptors: DescriptorService,
        gateway: Arc<dyn SubmissionGateway>,
        attendance: AttendancePhase,
        policy: VerificationPolicy,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            state: Mutex::new(State {
                phase: VerificationPhase::Idle,
                attempt: None,
                file_loading: false,
                fatal: false,
                cancel: CancellationToken::new(),
            }),
            session: Mutex::new(CaptureSession::new(camera)),
            orchestrator: CaptureOrchestrator::new(descriptors),
            gateway,
            attendance,
            policy,
            events,
        }
    }

    fn emit(&self, event: VerificationEvent) {
        let _ = self.events.send(event);
    }

    fn set_phase(&self, state: &mut State, phase: VerificationPhase) {
        if state.phase != phase {
            tracing::debug!(from = ?state.phase, to = ?phase, "verification phase");
            state.phase = phase;
            self.emit(VerificationEvent::Phase(phase));
        }
    }

    /// Try the camera, then warm the model. A missing camera is not an error:
    /// the flow moves to `NoCamera` and waits for a file.
    pub async fn open(&self) -> VerificationPhase {
        let cancel = {
            let mut state = lock(&self.state);
            state.cancel.cancel();
            state.cancel = CancellationToken::new();
            state.attempt = None;
            state.file_loading = false;
            state.fatal = false;
            state.cancel.clone()
        };

        // NoCamera is a valid outcome here; the flow falls back to uploads.
        let _ = self.open_camera();

        if self.policy.analyze_on_device {
            let loaded = tokio::select! {
                biased;
                _ = cancel.cancelled() => return self.phase(),
                loaded = self.orchestrator.descriptors().ensure_loaded() => loaded,
            };
            if let Err(e) = loaded {
                tracing::warn!(error = %e, "face model unavailable, captures will be unanalysed");
                self.emit(VerificationEvent::Notice(format!("Face analysis unavailable: {e}")));
            }
        }
        self.phase()
    }

    fn open_camera(&self) -> Result<(), CameraError> {
        let mut state = lock(&self.state);
        let opened = lock(&self.session).open_camera();
        match &opened {
            Ok(()) => self.set_phase(&mut state, VerificationPhase::CameraReady),
            Err(e) => {
                tracing::info!(error = %e, "no camera for verification, upload only");
                self.set_phase(&mut state, VerificationPhase::NoCamera);
                self.emit(VerificationEvent::Notice(e.to_string()));
            }
        }
        opened
    }

    /// Take the live frame, release the camera and analyse the still.
    pub async fn capture(&self) -> Result<VerificationAttempt, VerificationError> {
        let ticket = self.orchestrator.begin().ok_or(VerificationError::Busy)?;
        let frame = {
            let state = lock(&self.state);
            if state.phase != VerificationPhase::CameraReady {
                return Err(VerificationError::NotStreaming);
            }
            let mut session = lock(&self.session);
            let frame = session
                .snapshot()
                .map_err(|e| VerificationError::CaptureFailed(e.to_string()))?;
            session.release();
            frame
        };
        let image =
            still_from_frame(frame).map_err(|e| VerificationError::CaptureFailed(e.to_string()))?;
        self.record(ticket, Sample::new(image, SampleOrigin::Camera))
            .await
    }

    /// Use an image file instead of the camera.
    ///
    /// If no camera exists and the file cannot be decoded, submission is
    /// disabled until a readable file is chosen.
    pub async fn choose_file(
        &self,
        path: impl AsRef<Path>,
    ) -> Result<VerificationAttempt, VerificationError> {
        let path = path.as_ref();
        let cancel = {
            let mut state = lock(&self.state);
            if state.phase == VerificationPhase::Submitting {
                return Err(VerificationError::Blocked(SubmitBlocker::InFlight));
            }
            state.file_loading = true;
            state.cancel.clone()
        };

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned());
        let decoded = match tokio::fs::read(path).await {
            Ok(bytes) => tokio::task::spawn_blocking(move || StillImage::decode(bytes, file_name))
                .await
                .map_err(|e| e.to_string())
                .and_then(|r| r.map_err(|e| e.to_string())),
            Err(e) => Err(e.to_string()),
        };

        let (ticket, image) = {
            let mut state = lock(&self.state);
            state.file_loading = false;
            if cancel.is_cancelled() {
                return Err(VerificationError::Discarded);
            }
            let image = match decoded {
                Ok(image) => image,
                Err(message) => {
                    let no_camera = !lock(&self.session).has_video_input();
                    state.fatal = no_camera;
                    tracing::warn!(path = %path.display(), error = %message, no_camera, "upload unreadable");
                    self.emit(VerificationEvent::Notice(format!("Could not read image: {message}")));
                    return Err(VerificationError::FileReadFailed(message));
                }
            };
            state.fatal = false;
            let ticket = self.orchestrator.begin().ok_or(VerificationError::Busy)?;
            lock(&self.session).release();
            (ticket, image)
        };
        self.record(ticket, Sample::new(image, SampleOrigin::Upload))
            .await
    }

    async fn record(
        &self,
        ticket: AnalysisTicket<'_>,
        sample: Sample,
    ) -> Result<VerificationAttempt, VerificationError> {
        let origin = sample.origin;
        let image = sample.image.clone();
        let cancel = {
            let mut state = lock(&self.state);
            state.attempt = Some(VerificationAttempt {
                sample,
                phase: self.attendance,
                block_submission: false,
                warning: None,
            });
            self.emit(VerificationEvent::Captured { origin });
            let pending = self.policy.analyze_on_device;
            self.set_phase(&mut state, VerificationPhase::Captured { pending_analysis: pending });
            if !pending {
                self.set_phase(&mut state, VerificationPhase::Analyzed { blocked: false });
                return state.attempt.clone().ok_or(VerificationError::Discarded);
            }
            state.cancel.clone()
        };

        let outcome = self.orchestrator.analyze(&ticket, &image, &cancel).await;
        drop(ticket);

        let mut state = lock(&self.state);
        if cancel.is_cancelled() {
            return Err(VerificationError::Discarded);
        }
        let policy = self.policy;
        let Some(attempt) = state.attempt.as_mut() else {
            return Err(VerificationError::Discarded);
        };
        let mut notice = None;
        match outcome {
            AnalysisOutcome::Descriptor(descriptor) => {
                tracing::info!(dims = descriptor.len(), "verification descriptor extracted");
                attempt.sample.descriptor = Some(descriptor);
            }
            AnalysisOutcome::Rejected(e) => {
                let code = e.code();
                tracing::info!(code = %code, "verification capture kept without descriptor");
                attempt.sample.analysis_error = Some(code);
                let message = code.user_message().to_string();
                if policy.face_required {
                    match policy.on_failure {
                        FailurePolicy::Block => attempt.block_submission = true,
                        FailurePolicy::Warn => attempt.warning = Some(message.clone()),
                    }
                }
                notice = Some(message);
            }
            AnalysisOutcome::Cancelled => return Err(VerificationError::Discarded),
        }
        let attempt = attempt.clone();
        if let Some(message) = notice {
            self.emit(VerificationEvent::Notice(message));
        }
        self.set_phase(
            &mut state,
            VerificationPhase::Analyzed {
                blocked: attempt.block_submission,
            },
        );
        Ok(attempt)
    }

    /// Discard the capture and its analysis, then reopen the camera.
    pub fn retake(&self) -> Result<(), VerificationError> {
        {
            let mut state = lock(&self.state);
            if state.phase == VerificationPhase::Submitting {
                return Err(VerificationError::Blocked(SubmitBlocker::InFlight));
            }
            state.cancel.cancel();
            state.cancel = CancellationToken::new();
            if state.attempt.take().is_some() {
                tracing::info!("verification capture discarded for retake");
            }
            lock(&self.session).release();
        }
        Ok(self.open_camera()?)
    }

    fn blocker(&self, state: &State) -> Option<SubmitBlocker> {
        if state.phase == VerificationPhase::Submitting {
            return Some(SubmitBlocker::InFlight);
        }
        if state.fatal {
            return Some(SubmitBlocker::Fatal);
        }
        if state.file_loading {
            return Some(SubmitBlocker::FileLoading);
        }
        if self.orchestrator.is_analyzing()
            || state.phase == (VerificationPhase::Captured { pending_analysis: true })
        {
            return Some(SubmitBlocker::Analyzing);
        }
        match &state.attempt {
            None => Some(SubmitBlocker::NoCapture),
            Some(attempt) if attempt.block_submission => Some(SubmitBlocker::Blocked),
            Some(_) => None,
        }
    }

    /// Prefer a device for the next camera open.
    pub fn select_device(&self, id: &str) -> Result<bool, VerificationError> {
        Ok(lock(&self.session).select_device(id)?)
    }

    pub fn submit_blocker(&self) -> Option<SubmitBlocker> {
        self.blocker(&lock(&self.state))
    }

    pub fn can_submit(&self) -> bool {
        self.submit_blocker().is_none()
    }

    /// Submit the attempt. The server's message is returned verbatim.
    pub async fn submit(
        &self,
        status: impl Into<String>,
    ) -> Result<AttendanceReceipt, VerificationError> {
        let (payload, cancel) = {
            let mut state = lock(&self.state);
            if let Some(blocker) = self.blocker(&state) {
                return Err(VerificationError::Blocked(blocker));
            }
            let Some(attempt) = state.attempt.as_ref() else {
                return Err(VerificationError::Blocked(SubmitBlocker::NoCapture));
            };
            let payload = self.payload(attempt, status.into());
            self.set_phase(&mut state, VerificationPhase::Submitting);
            (payload, state.cancel.clone())
        };

        let result = self.gateway.submit_attendance(&payload).await;

        let mut state = lock(&self.state);
        if cancel.is_cancelled() {
            return result.map_err(VerificationError::from);
        }
        match result {
            Ok(receipt) => {
                tracing::info!(phase = %self.attendance, "attendance recorded");
                state.attempt = None;
                lock(&self.session).release();
                self.set_phase(&mut state, VerificationPhase::Done);
                self.emit(VerificationEvent::Submitted(receipt.message.clone()));
                Ok(receipt)
            }
            Err(e) => {
                tracing::warn!(error = %e, retryable = e.is_retryable(), "attendance submission failed");
                self.set_phase(&mut state, VerificationPhase::Failed);
                self.emit(VerificationEvent::Notice(e.to_string()));
                Err(e.into())
            }
        }
    }

    fn payload(&self, attempt: &VerificationAttempt, status: String) -> VerificationPayload {
        let sample = &attempt.sample;
        let (face_descriptor, face_error) = if self.policy.analyze_on_device {
            (
                sample.descriptor.as_ref().map(|d| d.values.clone()),
                sample.analysis_error,
            )
        } else {
            (None, None)
        };
        VerificationPayload {
            status,
            phase: attempt.phase,
            evidence: Some(Evidence::from_still(&sample.image, CAPTURE_FILE_NAME)),
            face_descriptor,
            face_error,
        }
    }

    pub fn close(&self) {
        let mut state = lock(&self.state);
        state.cancel.cancel();
        state.attempt = None;
        state.file_loading = false;
        self.set_phase(&mut state, VerificationPhase::Idle);
        if lock(&self.session).release() {
            tracing::info!("verification closed, camera released");
        }
    }

    pub fn phase(&self) -> VerificationPhase {
        lock(&self.state).phase
    }

    pub fn attempt(&self) -> Option<VerificationAttempt> {
        lock(&self.state).attempt.clone()
    }

    /// 0 or 1: verification holds at most one capture.
    pub fn sample_count(&self) -> usize {
        usize::from(lock(&self.state).attempt.is_some())
    }

    pub fn is_camera_on(&self) -> bool {
        lock(&self.session).is_camera_on()
    }

    pub fn policy(&self) -> VerificationPolicy {
        self.policy
    }

    pub fn subscribe(&self) -> broadcast::Receiver<VerificationEvent> {
        self.events.subscribe()
    }
}

impl Drop for VerificationFlow {
    fn drop(&mut self) {
        self.close();
    }
}
