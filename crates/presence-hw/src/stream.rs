//! Ownership of the single live camera stream.

use crate::backend::{CameraBackend, CameraError, StreamConstraints, StreamHandle};
use crate::frame::Frame;
use std::sync::Arc;

/// Owns at most one live [`StreamHandle`].
///
/// Every path that gives up the camera goes through [`hard_stop`](Self::hard_stop).
pub struct StreamController {
    backend: Arc<dyn CameraBackend>,
    active: Option<StreamHandle>,
}

impl StreamController {
    pub fn new(backend: Arc<dyn CameraBackend>) -> Self {
        Self {
            backend,
            active: None,
        }
    }

    /// Open a stream for `constraints`, stopping any current stream first.
    pub fn open(&mut self, constraints: &StreamConstraints) -> Result<(), CameraError> {
        self.hard_stop();

        let handle = self.backend.open(constraints).map_err(|e| {
            tracing::warn!(?constraints, error = %e, "camera open failed");
            e
        })?;

        tracing::info!(
            stream = handle.id(),
            device = handle.device_id(),
            tracks = handle.tracks().len(),
            "camera stream opened"
        );
        self.active = Some(handle);
        Ok(())
    }

    /// Stop every track of the active stream and forget it.
    ///
    /// Returns true if a stream was stopped. Calling with no stream is a no-op.
    pub fn hard_stop(&mut self) -> bool {
        let Some(handle) = self.active.take() else {
            return false;
        };
        handle.stop();
        tracing::debug!(stream = handle.id(), device = handle.device_id(), "camera stream stopped");
        true
    }

    pub fn is_camera_on(&self) -> bool {
        self.active.as_ref().is_some_and(StreamHandle::is_live)
    }

    pub fn active_device(&self) -> Option<&str> {
        self.active.as_ref().map(StreamHandle::device_id)
    }

    /// Latest frame from the live preview.
    pub fn snapshot(&self) -> Result<Frame, CameraError> {
        let handle = self
            .active
            .as_ref()
            .filter(|h| h.is_live())
            .ok_or(CameraError::NoFrame)?;
        handle.latest_frame().ok_or(CameraError::NoFrame)
    }
}

impl Drop for StreamController {
    fn drop(&mut self) {
        self.hard_stop();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::backend::{preview_channel, DeviceInfo, MediaTrack, SignalTrack, TrackState};
    use std::sync::Mutex;

    /// Backend that records every track it hands out.
    #[derive(Default)]
    pub(crate) struct RecordingBackend {
        pub devices: Vec<DeviceInfo>,
        pub tracks: Mutex<Vec<Arc<SignalTrack>>>,
        pub deny: bool,
    }

    impl RecordingBackend {
        pub fn with_devices(labels: &[&str]) -> Self {
            Self {
                devices: labels
                    .iter()
                    .enumerate()
                    .map(|(i, l)| DeviceInfo {
                        id: format!("cam{i}"),
                        label: l.to_string(),
                    })
                    .collect(),
                ..Default::default()
            }
        }

        pub fn live_tracks(&self) -> usize {
            self.tracks
                .lock()
                .unwrap()
                .iter()
                .filter(|t| t.state() == TrackState::Live)
                .count()
        }
    }

    impl CameraBackend for RecordingBackend {
        fn list_devices(&self) -> Result<Vec<DeviceInfo>, CameraError> {
            Ok(self.devices.clone())
        }

        fn open(&self, constraints: &StreamConstraints) -> Result<StreamHandle, CameraError> {
            if self.deny {
                return Err(CameraError::PermissionDenied);
            }
            let device = match constraints {
                StreamConstraints::Device(id) => self
                    .devices
                    .iter()
                    .find(|d| &d.id == id)
                    .ok_or_else(|| CameraError::Overconstrained(id.clone()))?,
                StreamConstraints::Facing(_) => {
                    self.devices.first().ok_or(CameraError::NoDeviceFound)?
                }
            };
            assert_eq!(self.live_tracks(), 0, "two concurrently live streams");

            let mut tracks = self.tracks.lock().unwrap();
            let track = Arc::new(SignalTrack::new(format!("{}-{}", device.id, tracks.len())));
            tracks.push(track.clone());
            let (tx, rx) = preview_channel();
            tx.send_replace(Some(Frame::from_gray(vec![128; 4], 2, 2, 0)));
            Ok(StreamHandle::new(
                format!("stream-{}", tracks.len()),
                device.id.clone(),
                vec![track as Arc<dyn MediaTrack>],
                rx,
            ))
        }
    }

    #[test]
    fn test_hard_stop_leaves_no_live_track() {
        let backend = Arc::new(RecordingBackend::with_devices(&["front"]));
        let mut stream = StreamController::new(backend.clone());
        stream
            .open(&StreamConstraints::Device("cam0".into()))
            .unwrap();
        assert!(stream.is_camera_on());
        assert_eq!(backend.live_tracks(), 1);

        assert!(stream.hard_stop());
        assert_eq!(backend.live_tracks(), 0);
        assert!(!stream.is_camera_on());

        assert!(!stream.hard_stop(), "second stop is a no-op");
    }

    #[test]
    fn test_reopen_stops_previous_stream() {
        let backend = Arc::new(RecordingBackend::with_devices(&["front", "back"]));
        let mut stream = StreamController::new(backend.clone());
        stream.open(&StreamConstraints::Device("cam0".into())).unwrap();
        stream.open(&StreamConstraints::Device("cam1".into())).unwrap();
        assert_eq!(backend.live_tracks(), 1);
        assert_eq!(stream.active_device(), Some("cam1"));
    }

    #[test]
    fn test_exact_device_mismatch_is_overconstrained() {
        let backend = Arc::new(RecordingBackend::with_devices(&["front"]));
        let mut stream = StreamController::new(backend);
        let err = stream
            .open(&StreamConstraints::Device("missing".into()))
            .unwrap_err();
        assert!(matches!(err, CameraError::Overconstrained(_)));
        assert!(!stream.is_camera_on());
    }

    #[test]
    fn test_snapshot_requires_live_stream() {
        let backend = Arc::new(RecordingBackend::with_devices(&["front"]));
        let mut stream = StreamController::new(backend);
        assert_eq!(stream.snapshot().unwrap_err(), CameraError::NoFrame);

        stream
            .open(&StreamConstraints::Facing(crate::backend::Facing::User))
            .unwrap();
        assert!(stream.snapshot().is_ok());

        stream.hard_stop();
        assert_eq!(stream.snapshot().unwrap_err(), CameraError::NoFrame);
    }
}
