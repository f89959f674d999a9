//! The capture session arena: device selection plus the one live stream.

use presence_hw::{
    CameraBackend, CameraError, DeviceDescriptor, DeviceManager, Frame, StreamController,
};
use std::sync::Arc;

/// Owns the camera for one open capture flow.
///
/// [`release`](Self::release) is the single point where the stream is given
/// up; it also runs on drop.
pub struct CaptureSession {
    devices: DeviceManager,
    stream: StreamController,
}

impl CaptureSession {
    pub fn new(backend: Arc<dyn CameraBackend>) -> Self {
        Self {
            devices: DeviceManager::new(backend.clone()),
            stream: StreamController::new(backend),
        }
    }

    /// Open the selected camera, enumerating devices first if needed.
    ///
    /// Enumeration is retried on every attempt until a device is found, so a
    /// permission denial is never remembered.
    pub fn open_camera(&mut self) -> Result<(), CameraError> {
        if !self.devices.has_video_input() {
            self.devices.enumerate()?;
        }
        let constraints = self.devices.constraints();
        self.stream.open(&constraints)
    }

    /// Prefer a device by id for the next open. Enumerates if needed.
    pub fn select_device(&mut self, id: &str) -> Result<bool, CameraError> {
        if !self.devices.has_video_input() {
            self.devices.enumerate()?;
        }
        Ok(self.devices.select(id))
    }

    /// Stop the current stream, move to the next device and reopen.
    ///
    /// Returns the id of the device now streaming, or `None` without devices.
    pub fn switch_device(&mut self) -> Result<Option<String>, CameraError> {
        let Some(next) = self.devices.cycle(&mut self.stream).map(|d| d.id.clone()) else {
            return Ok(None);
        };
        let constraints = self.devices.constraints();
        self.stream.open(&constraints)?;
        Ok(Some(next))
    }

    /// Stop every camera track. Idempotent.
    pub fn release(&mut self) -> bool {
        let stopped = self.stream.hard_stop();
        if stopped {
            tracing::debug!("capture session released camera");
        }
        stopped
    }

    pub fn snapshot(&self) -> Result<Frame, CameraError> {
        self.stream.snapshot()
    }

    pub fn is_camera_on(&self) -> bool {
        self.stream.is_camera_on()
    }

    pub fn has_video_input(&self) -> bool {
        self.devices.has_video_input()
    }

    pub fn devices(&self) -> &[DeviceDescriptor] {
        self.devices.devices()
    }

    pub fn active_device(&self) -> Option<&str> {
        self.stream.active_device()
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.release();
    }
}
