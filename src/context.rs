//! Hardware handles opened once at startup and handed to the components
//! that own them.

use tracing::{info, warn};

use crate::capture::CameraDevice;
use crate::lights::{PigpioDriver, PwmDriver};
use crate::HardwareConfig;
use crate::LightsConfig;

/// `None` in either slot means that piece of hardware is absent or disabled
/// and its owner runs in degraded mode.
#[derive(Default)]
pub struct DeviceContext {
    pub camera: Option<Box<dyn CameraDevice>>,
    pub pwm: Option<Box<dyn PwmDriver>>,
}

impl DeviceContext {
    /// Open whatever the flags enable. Failures are logged, never fatal.
    pub fn open(hardware: &HardwareConfig, lights: &LightsConfig) -> Self {
        Self {
            camera: open_camera(hardware),
            pwm: open_pwm(hardware, lights),
        }
    }

    /// No hardware at all
    pub fn synthetic() -> Self {
        Self::default()
    }
}

#[cfg(feature = "v4l2")]
fn open_camera(hardware: &HardwareConfig) -> Option<Box<dyn CameraDevice>> {
    use crate::capture::V4l2Camera;

    if !hardware.camera {
        info!("Camera disabled by configuration");
        return None;
    }

    let path = if hardware.camera_device == "auto" {
        match crate::utils::auto_detect_device() {
            Ok(found) => found.path,
            Err(e) => {
                warn!("{e}, running without camera");
                return None;
            }
        }
    } else {
        hardware.camera_device.clone()
    };

    match V4l2Camera::open(&path, hardware.buffer_count) {
        Ok(camera) => Some(Box::new(camera)),
        Err(e) => {
            warn!("{e}, running without camera");
            None
        }
    }
}

#[cfg(not(feature = "v4l2"))]
fn open_camera(hardware: &HardwareConfig) -> Option<Box<dyn CameraDevice>> {
    if hardware.camera {
        warn!("Built without the `v4l2` feature, running without camera");
    } else {
        info!("Camera disabled by configuration");
    }
    None
}

fn open_pwm(hardware: &HardwareConfig, lights: &LightsConfig) -> Option<Box<dyn PwmDriver>> {
    if !hardware.pwm {
        info!("PWM disabled by configuration");
        return None;
    }

    match PigpioDriver::connect(&lights.pigpio_addr) {
        Ok(driver) => Some(Box::new(driver)),
        Err(e) => {
            warn!("{e}, light writes disabled");
            None
        }
    }
}
