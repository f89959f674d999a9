//! Fake camera, descriptor model and gateway shared by the flow tests.

#![allow(dead_code)]

use async_trait::async_trait;
use presence_core::{
    AnalysisError, Descriptor, DescriptorModel, DescriptorService, ModelError, ModelLoader,
    StillImage,
};
use presence_hw::{
    preview_channel, CameraBackend, CameraError, DeviceInfo, Frame, MediaTrack, SignalTrack,
    StreamConstraints, StreamHandle, TrackState,
};
use presence_session::{
    AttendanceReceipt, EnrollmentPayload, EnrollmentReceipt, ProfileStatus, SubmissionError,
    SubmissionGateway, VerificationPayload,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

pub const FRAME_PERIOD: Duration = Duration::from_millis(100);

/// Camera whose streams publish a distinct frame every [`FRAME_PERIOD`].
#[derive(Default)]
pub struct FakeCamera {
    devices: Vec<DeviceInfo>,
    tracks: Mutex<Vec<Arc<SignalTrack>>>,
    opened: Mutex<Vec<String>>,
    max_live: AtomicUsize,
    frames: Arc<AtomicU32>,
    unplugged: AtomicBool,
}

impl FakeCamera {
    pub fn with_devices(labels: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            devices: labels
                .iter()
                .enumerate()
                .map(|(i, l)| DeviceInfo {
                    id: format!("cam{i}"),
                    label: l.to_string(),
                })
                .collect(),
            ..Default::default()
        })
    }

    pub fn none() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn live_tracks(&self) -> usize {
        self.tracks
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.state() == TrackState::Live)
            .count()
    }

    /// Highest number of simultaneously live tracks ever observed.
    pub fn max_live(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }

    /// End every track as if the camera had been pulled out. Later opens
    /// fail until [`replug`](Self::replug).
    pub fn unplug(&self) {
        self.unplugged.store(true, Ordering::SeqCst);
        for track in self.tracks.lock().unwrap().iter() {
            track.stop();
        }
    }

    pub fn replug(&self) {
        self.unplugged.store(false, Ordering::SeqCst);
    }

    /// Device ids opened with an exact-device constraint, in order.
    pub fn opened(&self) -> Vec<String> {
        self.opened.lock().unwrap().clone()
    }
}

impl CameraBackend for FakeCamera {
    fn list_devices(&self) -> Result<Vec<DeviceInfo>, CameraError> {
        Ok(self.devices.clone())
    }

    fn open(&self, constraints: &StreamConstraints) -> Result<StreamHandle, CameraError> {
        if self.unplugged.load(Ordering::SeqCst) {
            return Err(CameraError::Unknown("device disconnected".into()));
        }
        let device = match constraints {
            StreamConstraints::Device(id) => {
                let device = self
                    .devices
                    .iter()
                    .find(|d| &d.id == id)
                    .ok_or_else(|| CameraError::Overconstrained(id.clone()))?;
                self.opened.lock().unwrap().push(id.clone());
                device
            }
            StreamConstraints::Facing(_) => {
                self.devices.first().ok_or(CameraError::NoDeviceFound)?
            }
        };

        let track = {
            let mut tracks = self.tracks.lock().unwrap();
            let track = Arc::new(SignalTrack::new(format!("{}-{}", device.id, tracks.len())));
            tracks.push(track.clone());
            let live = tracks.iter().filter(|t| t.state() == TrackState::Live).count();
            self.max_live.fetch_max(live, Ordering::SeqCst);
            track
        };

        let (tx, rx) = preview_channel();
        let frames = self.frames.clone();
        let publisher = track.clone();
        tx.send_replace(Some(next_frame(&frames)));
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(FRAME_PERIOD).await;
                if !publisher.is_live() {
                    break;
                }
                tx.send_replace(Some(next_frame(&frames)));
            }
        });

        let tracks: Vec<Arc<dyn MediaTrack>> = vec![track];
        Ok(StreamHandle::new(
            format!("stream-{}", device.id),
            device.id.clone(),
            tracks,
            rx,
        ))
    }
}

fn next_frame(counter: &AtomicU32) -> Frame {
    let seq = counter.fetch_add(1, Ordering::SeqCst);
    let level = 64 + (seq % 180) as u8;
    Frame::from_gray(vec![level; 64], 8, 8, seq)
}

/// Descriptor model following a script of results, then succeeding.
#[derive(Default)]
pub struct ScriptedModel {
    script: Mutex<VecDeque<AnalysisError>>,
    calls: AtomicUsize,
    gate: Option<Arc<Notify>>,
}

impl ScriptedModel {
    pub fn succeeding() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail with each error in turn before succeeding.
    pub fn failing_first(errors: Vec<AnalysisError>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(errors.into()),
            ..Default::default()
        })
    }

    /// Each call blocks until `gate` is notified.
    pub fn gated(gate: Arc<Notify>) -> Arc<Self> {
        Arc::new(Self {
            gate: Some(gate),
            ..Default::default()
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn service(self: &Arc<Self>) -> DescriptorService {
        DescriptorService::new(FakeLoader {
            model: Some(self.clone()),
        })
    }
}

#[async_trait]
impl DescriptorModel for ScriptedModel {
    async fn compute(&self, image: &StillImage) -> Result<Descriptor, AnalysisError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if let Some(err) = self.script.lock().unwrap().pop_front() {
            return Err(err);
        }
        let values = image.digest()[..4].iter().map(|&b| b as f32 / 255.0).collect();
        Ok(Descriptor {
            values,
            model_version: Some("fake".into()),
        })
    }
}

pub struct FakeLoader {
    /// `None` fails the load.
    pub model: Option<Arc<ScriptedModel>>,
}

#[async_trait]
impl ModelLoader for FakeLoader {
    async fn load(&self) -> Result<Arc<dyn DescriptorModel>, ModelError> {
        match &self.model {
            Some(model) => Ok(model.clone()),
            None => Err(ModelError::NotFound("det_10g.onnx".into())),
        }
    }
}

/// Gateway recording every payload; can fail once or hold calls on a gate.
#[derive(Default)]
pub struct RecordingGateway {
    pub enrollments: Mutex<Vec<EnrollmentPayload>>,
    pub attendance: Mutex<Vec<VerificationPayload>>,
    fail_next: Mutex<Option<SubmissionError>>,
    gate: Option<Arc<Notify>>,
}

impl RecordingGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn gated(gate: Arc<Notify>) -> Arc<Self> {
        Arc::new(Self {
            gate: Some(gate),
            ..Default::default()
        })
    }

    pub fn fail_next(&self, err: SubmissionError) {
        *self.fail_next.lock().unwrap() = Some(err);
    }

    async fn respond(&self) -> Result<(), SubmissionError> {
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        match self.fail_next.lock().unwrap().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl SubmissionGateway for RecordingGateway {
    async fn enroll(&self, payload: &EnrollmentPayload) -> Result<EnrollmentReceipt, SubmissionError> {
        self.enrollments.lock().unwrap().push(payload.clone());
        self.respond().await?;
        Ok(EnrollmentReceipt {
            profile: ProfileStatus {
                registered: true,
                descriptors_count: payload.descriptors.len(),
                updated_at: None,
            },
            message: "Face profile saved".into(),
        })
    }

    async fn submit_attendance(
        &self,
        payload: &VerificationPayload,
    ) -> Result<AttendanceReceipt, SubmissionError> {
        self.attendance.lock().unwrap().push(payload.clone());
        self.respond().await?;
        Ok(AttendanceReceipt {
            message: format!("{} recorded", payload.phase),
        })
    }

    async fn profile_status(&self) -> Result<ProfileStatus, SubmissionError> {
        Ok(ProfileStatus::default())
    }
}

/// Poll `cond` on the (possibly paused) clock until it holds.
pub async fn until(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
