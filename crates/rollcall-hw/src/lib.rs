//! rollcall-hw — Frame sources for the attendance scanner.
//!
//! Provides V4L2 camera capture with RGB conversion, plus a directory
//! replay source for running without a camera.

pub mod camera;
pub mod frame;
pub mod source;

pub use camera::{Camera, CameraError, DeviceInfo, PixelFormat, V4l2Source};
pub use frame::{Frame, FrameError};
pub use source::{FrameSource, ImageDirSource, SourceError};
