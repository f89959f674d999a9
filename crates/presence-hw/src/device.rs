//! Camera enumeration, permission state and device selection.

use crate::backend::{CameraBackend, CameraError, Facing, StreamConstraints};
use crate::stream::StreamController;
use std::sync::Arc;

/// Label fragments that identify a rear-facing camera.
const REAR_FACING_HINTS: [&str; 3] = ["back", "rear", "environment"];

/// A video-input device from one enumeration pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub id: String,
    pub label: String,
    pub is_preferred: bool,
}

/// Camera permission for the current attempt. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionState {
    Prompt,
    Granted,
    Denied,
}

pub struct DeviceManager {
    backend: Arc<dyn CameraBackend>,
    devices: Vec<DeviceDescriptor>,
    selected: usize,
    permission: PermissionState,
}

impl DeviceManager {
    pub fn new(backend: Arc<dyn CameraBackend>) -> Self {
        Self {
            backend,
            devices: Vec::new(),
            selected: 0,
            permission: PermissionState::Prompt,
        }
    }

    /// Unlock labels with a throwaway grant, then list video-input devices.
    ///
    /// On failure the device list is cleared so `has_video_input()` reports false.
    pub fn enumerate(&mut self) -> Result<&[DeviceDescriptor], CameraError> {
        self.devices.clear();
        self.selected = 0;

        match self.backend.request_access() {
            Ok(probe) => {
                probe.stop();
                self.permission = PermissionState::Granted;
            }
            Err(CameraError::PermissionDenied) => {
                self.permission = PermissionState::Denied;
                tracing::warn!("camera permission denied");
                return Err(CameraError::PermissionDenied);
            }
            Err(CameraError::NoDeviceFound) => {
                tracing::info!("no camera device present");
                return Err(CameraError::NoDeviceFound);
            }
            Err(e) => {
                // Labels may be missing, but listing can still succeed.
                tracing::warn!(error = %e, "camera access probe failed");
            }
        }

        let listed = self.backend.list_devices()?;
        if listed.is_empty() {
            return Err(CameraError::NoDeviceFound);
        }

        self.devices = listed
            .into_iter()
            .map(|d| DeviceDescriptor {
                is_preferred: is_rear_facing(&d.label),
                id: d.id,
                label: d.label,
            })
            .collect();
        self.selected = self.devices.iter().position(|d| d.is_preferred).unwrap_or(0);

        tracing::info!(
            count = self.devices.len(),
            selected = %self.devices[self.selected].id,
            "cameras enumerated"
        );
        Ok(&self.devices)
    }

    pub fn has_video_input(&self) -> bool {
        !self.devices.is_empty()
    }

    pub fn devices(&self) -> &[DeviceDescriptor] {
        &self.devices
    }

    pub fn permission(&self) -> PermissionState {
        self.permission
    }

    pub fn selected(&self) -> Option<&DeviceDescriptor> {
        self.devices.get(self.selected)
    }

    /// Select a device by id. Returns false if it is not in the current list.
    pub fn select(&mut self, id: &str) -> bool {
        match self.devices.iter().position(|d| d.id == id) {
            Some(idx) => {
                self.selected = idx;
                true
            }
            None => false,
        }
    }

    /// Advance to the next device, stopping the live stream first.
    pub fn cycle(&mut self, stream: &mut StreamController) -> Option<&DeviceDescriptor> {
        if self.devices.is_empty() {
            return None;
        }
        stream.hard_stop();
        self.selected = (self.selected + 1) % self.devices.len();
        tracing::info!(device = %self.devices[self.selected].id, "camera switched");
        self.devices.get(self.selected)
    }

    /// Constraints for opening the selected device, or a facing-mode fallback.
    pub fn constraints(&self) -> StreamConstraints {
        match self.selected() {
            Some(d) => StreamConstraints::Device(d.id.clone()),
            None => StreamConstraints::Facing(Facing::Environment),
        }
    }
}

fn is_rear_facing(label: &str) -> bool {
    let label = label.to_lowercase();
    REAR_FACING_HINTS.iter().any(|hint| label.contains(hint))
}
