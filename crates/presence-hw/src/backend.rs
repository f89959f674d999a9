//! Camera backend seam: device listing and stream acquisition.

use crate::frame::Frame;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use thiserror::Error;
use tokio::sync::watch;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CameraError {
    #[error("camera permission denied")]
    PermissionDenied,
    #[error("no camera device found")]
    NoDeviceFound,
    #[error("constraints cannot be satisfied: {0}")]
    Overconstrained(String),
    #[error("no frame available from the preview yet")]
    NoFrame,
    #[error("camera error: {0}")]
    Unknown(String),
}

/// A video-input device as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub id: String,
    pub label: String,
}

/// Generic facing-mode hint used when no exact device is requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Facing {
    User,
    Environment,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamConstraints {
    /// Bind to this device id exactly; fail with `Overconstrained` otherwise.
    Device(String),
    Facing(Facing),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackState {
    Live,
    Ended,
}

/// One media track of a camera stream.
pub trait MediaTrack: Send + Sync {
    fn id(&self) -> &str;
    fn state(&self) -> TrackState;
    /// Stop the track. Must be idempotent and must not block.
    fn stop(&self);
}

/// A track whose liveness is a shared flag. Producers poll `is_live()`.
pub struct SignalTrack {
    id: String,
    live: AtomicBool,
}

impl SignalTrack {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            live: AtomicBool::new(true),
        }
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }
}

impl MediaTrack for SignalTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn state(&self) -> TrackState {
        if self.is_live() {
            TrackState::Live
        } else {
            TrackState::Ended
        }
    }

    fn stop(&self) {
        self.live.store(false, Ordering::Release);
    }
}

/// The live camera stream. Not `Clone`: exactly one owner at a time.
///
/// Dropping a handle stops all of its tracks. When a producer thread is
/// attached with [`with_worker`](Self::with_worker), stopping also waits for
/// that thread to exit so the device is free once `stop()` returns.
pub struct StreamHandle {
    id: String,
    device_id: String,
    tracks: Vec<Arc<dyn MediaTrack>>,
    preview: watch::Receiver<Option<Frame>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl StreamHandle {
    pub fn new(
        id: impl Into<String>,
        device_id: impl Into<String>,
        tracks: Vec<Arc<dyn MediaTrack>>,
        preview: watch::Receiver<Option<Frame>>,
    ) -> Self {
        Self {
            id: id.into(),
            device_id: device_id.into(),
            tracks,
            preview,
            worker: Mutex::new(None),
        }
    }

    /// Attach the thread producing this stream's frames.
    ///
    /// The thread must exit promptly once every track has stopped.
    pub fn with_worker(self, worker: JoinHandle<()>) -> Self {
        *self.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(worker);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn tracks(&self) -> &[Arc<dyn MediaTrack>] {
        &self.tracks
    }

    /// True while any track is still live.
    pub fn is_live(&self) -> bool {
        self.tracks.iter().any(|t| t.state() == TrackState::Live)
    }

    /// Stop every track, then join the producer thread if one is attached.
    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            if worker.thread().id() == std::thread::current().id() {
                return;
            }
            if worker.join().is_err() {
                tracing::warn!(stream = %self.id, "capture thread panicked");
            }
        }
    }

    /// Most recent preview frame, if the producer has published one.
    pub fn latest_frame(&self) -> Option<Frame> {
        self.preview.borrow().clone()
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Source of camera streams (V4L2 in production, fakes in tests).
pub trait CameraBackend: Send + Sync {
    fn list_devices(&self) -> Result<Vec<DeviceInfo>, CameraError>;

    fn open(&self, constraints: &StreamConstraints) -> Result<StreamHandle, CameraError>;

    /// Throwaway grant used only to unlock device labels.
    fn request_access(&self) -> Result<StreamHandle, CameraError> {
        self.open(&StreamConstraints::Facing(Facing::User))
    }
}

/// Channel pair for publishing preview frames into a [`StreamHandle`].
pub fn preview_channel() -> (watch::Sender<Option<Frame>>, watch::Receiver<Option<Frame>>) {
    watch::channel(None)
}
