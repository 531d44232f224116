//! rollcall-hw — Hardware abstraction for camera capture.
//!
//! Provides V4L2-based camera access behind a shared, lock-disciplined
//! handle so the ambient loop and on-demand scans never fight over the
//! device.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, DeviceInfo, PixelFormat, SharedCamera};
pub use frame::{yuyv_to_grayscale, Frame, FrameError};
