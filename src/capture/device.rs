//! Camera device abstraction shared by the mode controller and the encoder

use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::capture::frame::ModeProfile;
use crate::error::CameraError;

/// A camera the controller can reconfigure and capture from.
///
/// Implementations are blocking; callers run them off the async runtime.
pub trait CameraDevice: Send {
    fn name(&self) -> &str;

    /// Apply the resolution/format/frame-rate profile for a mode
    fn configure(&mut self, profile: &ModeProfile) -> Result<(), CameraError>;

    /// Stop streaming and release sensor buffers (Idle)
    fn release(&mut self) -> Result<(), CameraError>;

    /// Grab one encoded JPEG in the current profile
    fn capture_jpeg(&mut self) -> Result<Bytes, CameraError>;
}

/// Process-wide device handle. Only the controller and the encoder it starts
/// touch it.
pub type SharedDevice = Arc<Mutex<Box<dyn CameraDevice>>>;

pub fn share(device: Box<dyn CameraDevice>) -> SharedDevice {
    Arc::new(Mutex::new(device))
}

/// Lock a shared device, mapping a poisoned lock to `DeviceUnavailable`
pub fn with_device<T>(
    device: &SharedDevice,
    f: impl FnOnce(&mut dyn CameraDevice) -> Result<T, CameraError>,
) -> Result<T, CameraError> {
    let mut guard = device
        .lock()
        .map_err(|_| CameraError::DeviceUnavailable("camera lock poisoned".into()))?;
    f(&mut **guard)
}
