//! V4L2 camera backend with memory-mapped buffers

use std::io;

use bytes::Bytes;
use tracing::{debug, info, instrument};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::capture::device::CameraDevice;
use crate::capture::frame::{CameraMode, ModeProfile};
use crate::error::CameraError;

/// MJPEG capture through a V4L2 node (e.g. the Pi camera via libcamera's
/// V4L2 compatibility layer, or a USB webcam)
pub struct V4l2Camera {
    device: Box<Device>,
    stream: Option<MmapStream<'static>>,
    path: String,
    buffer_count: u32,
}

impl V4l2Camera {
    /// Open the node and check it can capture. Any failure here means the
    /// camera is absent or already claimed.
    pub fn open(path: &str, buffer_count: u32) -> Result<Self, CameraError> {
        info!("Opening V4L2 camera: {}", path);

        let device = Device::with_path(path)
            .map_err(|e| CameraError::DeviceUnavailable(format!("{path}: {e}")))?;

        let caps = device
            .query_caps()
            .map_err(|e| CameraError::DeviceUnavailable(format!("{path}: {e}")))?;
        info!("Device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(CameraError::DeviceUnavailable(format!(
                "{path} doesn't support video capture"
            )));
        }

        Ok(Self {
            device: Box::new(device),
            stream: None,
            path: path.to_string(),
            buffer_count: buffer_count.max(1),
        })
    }

    fn reject(&self, profile: &ModeProfile, e: io::Error) -> CameraError {
        classify(&self.path, profile.mode, e)
    }
}

/// A node that opened fine can still be claimed by another process or
/// unplugged; those surface as a missing camera, not a bad mode.
fn classify(path: &str, mode: CameraMode, e: io::Error) -> CameraError {
    match e.raw_os_error() {
        Some(libc::EBUSY | libc::ENODEV | libc::ENXIO) => {
            CameraError::DeviceUnavailable(format!("{path}: {e}"))
        }
        _ => CameraError::ModeTransitionFailed {
            mode,
            reason: format!("{path}: {e}"),
        },
    }
}

impl CameraDevice for V4l2Camera {
    fn name(&self) -> &str {
        &self.path
    }

    #[instrument(skip(self), fields(device = %self.path))]
    fn configure(&mut self, profile: &ModeProfile) -> Result<(), CameraError> {
        // Buffers must be released before the format can change
        self.stream = None;

        let mut fmt = self.device.format().map_err(|e| self.reject(profile, e))?;
        fmt.width = profile.width;
        fmt.height = profile.height;
        fmt.fourcc = FourCC::new(b"MJPG");

        let applied = self
            .device
            .set_format(&fmt)
            .map_err(|e| self.reject(profile, e))?;
        if applied.fourcc != FourCC::new(b"MJPG") {
            return Err(CameraError::ModeTransitionFailed {
                mode: profile.mode,
                reason: format!("{}: driver refused MJPG", self.path),
            });
        }
        debug!("Applied format {}x{}", applied.width, applied.height);

        // The driver picks the readout window for the requested size
        if let Some(sensor) = profile.sensor {
            debug!(
                "Expected sensor crop {}x{}+{}+{} at {} bit",
                sensor.crop.width, sensor.crop.height, sensor.crop.x, sensor.crop.y, sensor.bit_depth
            );
        }

        let fps = profile.fps.round().max(1.0) as u32;
        self.device
            .set_params(&Parameters::with_fps(fps))
            .map_err(|e| self.reject(profile, e))?;

        let stream = MmapStream::with_buffers(&self.device, Type::VideoCapture, self.buffer_count)
            .map_err(|e| self.reject(profile, e))?;
        self.stream = Some(stream);

        info!(
            "Camera configured for {} at {}x{} @ {} fps",
            profile.mode, applied.width, applied.height, fps
        );
        Ok(())
    }

    fn release(&mut self) -> Result<(), CameraError> {
        self.stream = None;
        Ok(())
    }

    fn capture_jpeg(&mut self) -> Result<Bytes, CameraError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| CameraError::EncoderFailure("stream not started".into()))?;

        let (buf, meta) = stream
            .next()
            .map_err(|e| CameraError::EncoderFailure(e.to_string()))?;

        let used = (meta.bytesused as usize).min(buf.len());
        Ok(Bytes::copy_from_slice(&buf[..used]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claimed_or_missing_node_is_unavailable() {
        for errno in [libc::EBUSY, libc::ENODEV, libc::ENXIO] {
            let err = classify("/dev/video0", CameraMode::Video, io::Error::from_raw_os_error(errno));
            assert!(err.is_degraded(), "errno {errno} gave {err:?}");
        }
    }

    #[test]
    fn rejected_format_is_a_transition_failure() {
        let err = classify("/dev/video0", CameraMode::Still, io::Error::from_raw_os_error(libc::EINVAL));
        assert!(matches!(
            err,
            CameraError::ModeTransitionFailed {
                mode: CameraMode::Still,
                ..
            }
        ));
    }
}
