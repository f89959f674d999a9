//! V4L2 camera backend via the `v4l` crate.
//!
//! Each open stream runs its own capture thread that dequeues mmap buffers,
//! converts them to grayscale and publishes the newest frame into the
//! stream's preview channel. Dequeues poll with a short timeout so the
//! thread notices a stopped track within [`DEQUEUE_TIMEOUT`]; the handle
//! joins the thread on stop, which closes the device before the next open.

use crate::backend::{
    preview_channel, CameraBackend, CameraError, DeviceInfo, MediaTrack, SignalTrack,
    StreamConstraints, StreamHandle,
};
use crate::frame::{self, Frame};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;
use tokio::sync::watch;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const MAX_VIDEO_NODES: usize = 16;
const MMAP_BUFFERS: u32 = 4;
/// Upper bound on how long a stopped stream keeps the device open.
pub const DEQUEUE_TIMEOUT: Duration = Duration::from_millis(200);

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel, extract Y channel).
    Yuyv,
    /// 8-bit grayscale.
    Grey,
    /// 16-bit little-endian grayscale.
    Y16,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        if fourcc == FourCC::new(b"YUYV") {
            Some(Self::Yuyv)
        } else if fourcc == FourCC::new(b"GREY") {
            Some(Self::Grey)
        } else if fourcc == FourCC::new(b"Y16 ") || fourcc == FourCC::new(b"Y16\0") {
            Some(Self::Y16)
        } else {
            None
        }
    }

    fn to_grayscale(self, buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, frame::FrameError> {
        match self {
            Self::Yuyv => frame::yuyv_to_grayscale(buf, width, height),
            Self::Grey => frame::grey_to_grayscale(buf, width, height),
            Self::Y16 => frame::y16_to_grayscale(buf, width, height),
        }
    }
}

/// Camera backend for `/dev/videoN` capture devices.
pub struct V4l2Backend {
    width: u32,
    height: u32,
    next_stream: AtomicU64,
}

impl V4l2Backend {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            next_stream: AtomicU64::new(1),
        }
    }
}

impl Default for V4l2Backend {
    fn default() -> Self {
        Self::new(640, 480)
    }
}

impl CameraBackend for V4l2Backend {
    fn list_devices(&self) -> Result<Vec<DeviceInfo>, CameraError> {
        let mut devices = Vec::new();

        for i in 0..MAX_VIDEO_NODES {
            let path = format!("/dev/video{i}");
            if !Path::new(&path).exists() {
                continue;
            }
            let dev = match Device::with_path(&path) {
                Ok(dev) => dev,
                Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                    return Err(CameraError::PermissionDenied);
                }
                Err(_) => continue,
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                continue;
            }
            devices.push(DeviceInfo {
                id: path,
                label: format!("{} ({})", caps.card, caps.bus),
            });
        }

        Ok(devices)
    }

    fn open(&self, constraints: &StreamConstraints) -> Result<StreamHandle, CameraError> {
        let path = match constraints {
            StreamConstraints::Device(id) => {
                if !Path::new(id).exists() {
                    return Err(CameraError::Overconstrained(format!("no device {id}")));
                }
                id.clone()
            }
            // V4L2 exposes no facing information; take the first capture node.
            StreamConstraints::Facing(_) => self
                .list_devices()?
                .into_iter()
                .next()
                .ok_or(CameraError::NoDeviceFound)?
                .id,
        };

        let stream_id = format!(
            "v4l2-{}",
            self.next_stream.fetch_add(1, Ordering::Relaxed)
        );
        let track = Arc::new(SignalTrack::new(format!("{stream_id}/video")));
        let (frame_tx, frame_rx) = preview_channel();
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);

        let worker = CaptureWorker {
            path: path.clone(),
            width: self.width,
            height: self.height,
            track: track.clone(),
            frames: frame_tx,
        };
        let thread = std::thread::Builder::new()
            .name("presence-capture".into())
            .spawn(move || worker.run(ready_tx))
            .map_err(|e| CameraError::Unknown(format!("failed to spawn capture thread: {e}")))?;

        let ready = ready_rx
            .recv()
            .unwrap_or_else(|_| Err(CameraError::Unknown("capture thread exited during open".into())));
        if let Err(e) = ready {
            let _ = thread.join();
            return Err(e);
        }

        Ok(StreamHandle::new(
            stream_id,
            path,
            vec![track as Arc<dyn MediaTrack>],
            frame_rx,
        )
        .with_worker(thread))
    }
}

struct CaptureWorker {
    path: String,
    width: u32,
    height: u32,
    track: Arc<SignalTrack>,
    frames: watch::Sender<Option<Frame>>,
}

impl CaptureWorker {
    fn run(self, ready: mpsc::SyncSender<Result<(), CameraError>>) {
        let (device, width, height, format) = match self.negotiate() {
            Ok(opened) => opened,
            Err(e) => {
                self.track.stop();
                let _ = ready.send(Err(e));
                return;
            }
        };

        let mut stream = match MmapStream::with_buffers(&device, BufType::VideoCapture, MMAP_BUFFERS) {
            Ok(stream) => stream,
            Err(e) => {
                self.track.stop();
                let _ = ready.send(Err(CameraError::Unknown(format!(
                    "failed to create mmap stream: {e}"
                ))));
                return;
            }
        };
        stream.set_timeout(DEQUEUE_TIMEOUT);
        let _ = ready.send(Ok(()));

        while self.track.is_live() {
            let (buf, meta) = match stream.next() {
                Ok(next) => next,
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                Err(e) => {
                    tracing::warn!(device = %self.path, error = %e, "failed to dequeue buffer");
                    break;
                }
            };
            match format.to_grayscale(buf, width, height) {
                Ok(gray) => {
                    self.frames
                        .send_replace(Some(Frame::from_gray(gray, width, height, meta.sequence)));
                }
                Err(e) => tracing::debug!(device = %self.path, error = %e, "dropping malformed frame"),
            }
        }

        self.track.stop();
        drop(stream);
        drop(device);
        tracing::debug!(device = %self.path, "capture thread exiting, device released");
    }

    fn negotiate(&self) -> Result<(Device, u32, u32, PixelFormat), CameraError> {
        let device = Device::with_path(&self.path).map_err(|e| {
            let msg = e.to_string();
            if e.kind() == std::io::ErrorKind::PermissionDenied {
                CameraError::PermissionDenied
            } else if msg.contains("busy") || msg.contains("EBUSY") {
                CameraError::Unknown(format!("{}: device busy", self.path))
            } else {
                CameraError::NoDeviceFound
            }
        })?;

        let caps = device
            .query_caps()
            .map_err(|e| CameraError::Unknown(format!("failed to query capabilities: {e}")))?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::Overconstrained(format!(
                "{} does not support video capture",
                self.path
            )));
        }

        let mut fmt = device
            .format()
            .map_err(|e| CameraError::Unknown(format!("failed to get format: {e}")))?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = self.width;
        fmt.height = self.height;

        let negotiated = device
            .set_format(&fmt)
            .map_err(|e| CameraError::Overconstrained(format!("failed to set format: {e}")))?;
        let format = PixelFormat::from_fourcc(negotiated.fourcc).ok_or_else(|| {
            CameraError::Overconstrained(format!(
                "unsupported pixel format {:?} (need YUYV, GREY or Y16)",
                negotiated.fourcc
            ))
        })?;

        tracing::info!(
            device = %self.path,
            card = %caps.card,
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?negotiated.fourcc,
            "negotiated format"
        );
        Ok((device, negotiated.width, negotiated.height, format))
    }
}
