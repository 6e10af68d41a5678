//! Placeholder image generator used when no camera is attached

use std::io::Cursor;

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};

use crate::capture::device::CameraDevice;
use crate::capture::frame::ModeProfile;
use crate::error::CameraError;

/// Render a moving test pattern as JPEG. `tick` shifts the pattern so
/// consecutive stream frames are visibly different.
pub fn render_placeholder(
    width: u32,
    height: u32,
    tick: u64,
    quality: u8,
) -> Result<Bytes, CameraError> {
    let width = width.max(1);
    let height = height.max(1);
    let shift = (tick % 256) as u32;

    let img = RgbImage::from_fn(width, height, |x, y| {
        let band = (x * 8 / width) as u8;
        Rgb([
            ((x * 255 / width + shift) % 256) as u8,
            (y * 255 / height) as u8,
            band.wrapping_mul(32),
        ])
    });

    let mut buf = Cursor::new(Vec::new());
    JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100))
        .encode_image(&img)
        .map_err(|e| CameraError::EncoderFailure(format!("placeholder encode: {e}")))?;

    Ok(Bytes::from(buf.into_inner()))
}

/// Stand-in device that produces placeholder frames at the configured size
pub struct SyntheticCamera {
    profile: Option<ModeProfile>,
    tick: u64,
    quality: u8,
}

impl SyntheticCamera {
    pub fn new(quality: u8) -> Self {
        Self {
            profile: None,
            tick: 0,
            quality,
        }
    }
}

impl CameraDevice for SyntheticCamera {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn configure(&mut self, profile: &ModeProfile) -> Result<(), CameraError> {
        self.profile = Some(profile.clone());
        Ok(())
    }

    fn release(&mut self) -> Result<(), CameraError> {
        self.profile = None;
        Ok(())
    }

    fn capture_jpeg(&mut self) -> Result<Bytes, CameraError> {
        let profile = self
            .profile
            .as_ref()
            .ok_or_else(|| CameraError::EncoderFailure("synthetic camera is idle".into()))?;
        self.tick = self.tick.wrapping_add(1);
        render_placeholder(profile.width, profile.height, self.tick, self.quality)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::CameraMode;

    #[test]
    fn placeholder_is_a_decodable_jpeg() {
        let jpeg = render_placeholder(64, 48, 3, 80).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);

        let img = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((img.width(), img.height()), (64, 48));
    }

    #[test]
    fn idle_synthetic_camera_refuses_capture() {
        let mut cam = SyntheticCamera::new(80);
        assert!(cam.capture_jpeg().is_err());

        cam.configure(&ModeProfile {
            mode: CameraMode::Preview,
            width: 32,
            height: 24,
            fps: 24.0,
            format: "MJPG".into(),
            sensor: None,
        })
        .unwrap();
        assert!(cam.capture_jpeg().is_ok());

        cam.release().unwrap();
        assert!(cam.capture_jpeg().is_err());
    }
}
