#[cfg(feature = "v4l2")]
pub use detect::{auto_detect_device, FoundDevice};

#[cfg(feature = "v4l2")]
mod detect {
    use std::path::Path;

    use tracing::info;
    use v4l::{capability::Flags, video::Capture, Device, FourCC};

    use crate::error::CameraError;

    /// Detected capture device info
    #[derive(Debug, Clone)]
    pub struct FoundDevice {
        pub path: String,
        pub card: String,
    }

    /// First /dev/video* node that captures MJPEG
    pub fn auto_detect_device() -> Result<FoundDevice, CameraError> {
        info!("Auto-detecting capture devices...");

        for i in 0..10 {
            let path = format!("/dev/video{}", i);
            if !Path::new(&path).exists() {
                continue;
            }

            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
                continue;
            }

            if let Ok(formats) = dev.enum_formats() {
                if formats.iter().any(|fmt| fmt.fourcc == FourCC::new(b"MJPG")) {
                    info!("Found MJPEG device: {} - {}", path, caps.card);
                    return Ok(FoundDevice {
                        path,
                        card: caps.card,
                    });
                }
            }
        }

        Err(CameraError::DeviceUnavailable(
            "no MJPEG capture device found".into(),
        ))
    }
}
