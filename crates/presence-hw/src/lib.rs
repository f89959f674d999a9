//! presence-hw — Camera hardware abstraction.
//!
//! Enumerates video-input devices, owns the single live camera stream and
//! provides a V4L2 backend that publishes grayscale preview frames.

pub mod backend;
pub mod device;
pub mod frame;
pub mod stream;
pub mod v4l2;

pub use backend::{
    preview_channel, CameraBackend, CameraError, DeviceInfo, Facing, MediaTrack, SignalTrack,
    StreamConstraints, StreamHandle, TrackState,
};
pub use device::{DeviceDescriptor, DeviceManager, PermissionState};
pub use frame::Frame;
pub use stream::StreamController;
pub use v4l2::V4l2Backend;
