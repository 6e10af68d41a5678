pub mod controller;
pub mod device;
pub mod encoder;
pub mod frame;
pub mod synthetic;
#[cfg(feature = "v4l2")]
pub mod v4l2;

pub use controller::{CameraModeController, CapturePolicy};
pub use device::{CameraDevice, SharedDevice};
pub use frame::{CameraMode, Frame, QualityTier};
pub use synthetic::SyntheticCamera;
#[cfg(feature = "v4l2")]
pub use v4l2::V4l2Camera;
