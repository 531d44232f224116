//! V4L2 camera capture via the `v4l` crate.
//!
//! [`Camera`] is a plain device handle; [`SharedCamera`] is the process-wide
//! slot every consumer goes through. The ambient loop and on-demand scans
//! both read frames, so all access serializes on the shared lock.

use crate::frame::{self, Frame};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
    #[error("camera lock poisoned")]
    LockPoisoned,
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel, extract Y channel).
    Yuyv,
    /// 8-bit grayscale (1 byte/pixel).
    Grey,
}

/// V4L2 camera device handle.
pub struct Camera {
    device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub fourcc: FourCC,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open a V4L2 camera device by path (e.g., "/dev/video0").
    pub fn open(device_path: &str) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| {
            if e.to_string().contains("busy") || e.to_string().contains("EBUSY") {
                CameraError::DeviceBusy
            } else {
                CameraError::DeviceNotFound(format!("{device_path}: {e}"))
            }
        })?;

        let caps = device.query_caps().map_err(|e| {
            CameraError::CaptureFailed(format!("failed to query capabilities: {e}"))
        })?;

        tracing::info!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );

        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }

        // Request YUYV at 640x480; accept GREY if the driver insists.
        let mut fmt = device.format().map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;

        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = 640;
        fmt.height = 480;

        let negotiated = device.set_format(&fmt).map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
        })?;

        let fourcc = negotiated.fourcc;
        let pixel_format = if fourcc == FourCC::new(b"GREY") {
            PixelFormat::Grey
        } else if fourcc == FourCC::new(b"YUYV") {
            PixelFormat::Yuyv
        } else {
            return Err(CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {fourcc:?} (need YUYV or GREY)"
            )));
        };

        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?fourcc,
            "negotiated format"
        );

        Ok(Self {
            device,
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            fourcc,
            pixel_format,
        })
    }

    /// Capture a single grayscale frame.
    pub fn capture_frame(&self) -> Result<Frame, CameraError> {
        let mut stream =
            MmapStream::with_buffers(&self.device, BufType::VideoCapture, 4).map_err(|e| {
                CameraError::CaptureFailed(format!("failed to create mmap stream: {e}"))
            })?;

        let (buf, meta) = stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;

        Ok(Frame {
            data: self.buf_to_grayscale(buf)?,
            width: self.width,
            height: self.height,
            timestamp: std::time::Instant::now(),
            sequence: meta.sequence,
        })
    }

    /// Capture `count` frames spaced by `interval`, for a presence scan.
    pub fn capture_frames(&self, count: usize, interval: Duration) -> Result<Vec<Frame>, CameraError> {
        let mut stream =
            MmapStream::with_buffers(&self.device, BufType::VideoCapture, 4).map_err(|e| {
                CameraError::CaptureFailed(format!("failed to create mmap stream: {e}"))
            })?;

        let mut frames = Vec::with_capacity(count);
        for i in 0..count {
            let (buf, meta) = stream.next().map_err(|e| {
                CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}"))
            })?;
            frames.push(Frame {
                data: self.buf_to_grayscale(buf)?,
                width: self.width,
                height: self.height,
                timestamp: std::time::Instant::now(),
                sequence: meta.sequence,
            });
            if i + 1 < count {
                std::thread::sleep(interval);
            }
        }
        Ok(frames)
    }

    /// Convert a raw buffer to grayscale based on the negotiated format.
    fn buf_to_grayscale(&self, buf: &[u8]) -> Result<Vec<u8>, CameraError> {
        let pixels = (self.width * self.height) as usize;

        match self.pixel_format {
            PixelFormat::Grey => {
                if buf.len() < pixels {
                    return Err(CameraError::CaptureFailed(format!(
                        "GREY buffer too short: expected {pixels}, got {}",
                        buf.len()
                    )));
                }
                Ok(buf[..pixels].to_vec())
            }
            PixelFormat::Yuyv => frame::yuyv_to_grayscale(buf, self.width, self.height)
                .map_err(|e| CameraError::CaptureFailed(format!("YUYV conversion failed: {e}"))),
        }
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let mut devices = Vec::new();

        for i in 0..16 {
            let path = format!("/dev/video{i}");
            if !Path::new(&path).exists() {
                continue;
            }
            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                continue;
            }
            devices.push(DeviceInfo {
                path,
                name: caps.card.clone(),
                driver: caps.driver.clone(),
                bus: caps.bus.clone(),
            });
        }

        devices
    }
}

/// Process-wide camera slot with open-on-demand semantics.
///
/// The slot holds `None` until a consumer needs a frame; a failed open
/// leaves it `None` so the next attempt retries from scratch. Clones share
/// the same underlying slot.
#[derive(Clone)]
pub struct SharedCamera {
    slot: Arc<Mutex<Option<Camera>>>,
    device_path: String,
}

impl SharedCamera {
    pub fn new(device_path: impl Into<String>) -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
            device_path: device_path.into(),
        }
    }

    /// Run `work` against the open camera, opening it first if needed.
    ///
    /// Holding the lock for the whole call is the point: frame reads from
    /// the ambient loop and from scan cycles must not interleave.
    pub fn with_camera<T>(
        &self,
        work: impl FnOnce(&Camera) -> Result<T, CameraError>,
    ) -> Result<T, CameraError> {
        let mut slot = self.slot.lock().map_err(|_| CameraError::LockPoisoned)?;
        if slot.is_none() {
            match Camera::open(&self.device_path) {
                Ok(camera) => *slot = Some(camera),
                Err(err) => {
                    tracing::warn!(device = %self.device_path, %err, "camera open failed");
                    return Err(err);
                }
            }
        }
        match slot.as_ref() {
            Some(camera) => work(camera),
            None => Err(CameraError::DeviceNotFound(self.device_path.clone())),
        }
    }

    /// Drop the device handle. The next consumer reopens it.
    pub fn release(&self) {
        if let Ok(mut slot) = self.slot.lock() {
            if slot.take().is_some() {
                tracing::info!(device = %self.device_path, "camera released");
            }
        }
    }

    pub fn is_open(&self) -> bool {
        self.slot.lock().map(|s| s.is_some()).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_missing_device() {
        let err = Camera::open("/dev/video-nonexistent").err().unwrap();
        assert!(matches!(err, CameraError::DeviceNotFound(_)));
    }

    #[test]
    fn test_shared_camera_failed_open_leaves_slot_empty() {
        let shared = SharedCamera::new("/dev/video-nonexistent");
        let result = shared.with_camera(|camera| camera.capture_frame());
        assert!(result.is_err());
        assert!(!shared.is_open());
        // Release on an empty slot is a no-op.
        shared.release();
        assert!(!shared.is_open());
    }

    #[test]
    fn test_shared_camera_clones_share_slot() {
        let a = SharedCamera::new("/dev/video-nonexistent");
        let b = a.clone();
        assert!(!a.is_open());
        assert!(!b.is_open());
        assert!(Arc::ptr_eq(&a.slot, &b.slot));
    }
}
