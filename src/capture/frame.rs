use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::CameraError;
use crate::CameraConfig;

/// One encoded JPEG, shared between the relay and every reader without copying
#[derive(Debug, Clone)]
pub struct Frame {
    /// Immutable JPEG data
    pub data: Bytes,

    /// Monotonically increasing, assigned by the relay on publish
    pub sequence: u64,

    /// Publish timestamp for latency tracking
    pub timestamp: Instant,
}

impl Frame {
    /// Time since the producer published this frame
    pub fn age(&self) -> Duration {
        self.timestamp.elapsed()
    }
}

/// Camera configuration profile. Exactly one is active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraMode {
    Idle,
    Preview,
    Still,
    Video,
}

impl fmt::Display for CameraMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CameraMode::Idle => "idle",
            CameraMode::Preview => "preview",
            CameraMode::Still => "still",
            CameraMode::Video => "video",
        };
        f.write_str(name)
    }
}

/// Quality tier requested by `/camera?res=`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityTier {
    Low,
    High,
}

impl QualityTier {
    pub fn mode(self) -> CameraMode {
        match self {
            QualityTier::Low => CameraMode::Preview,
            QualityTier::High => CameraMode::Still,
        }
    }
}

impl FromStr for QualityTier {
    type Err = CameraError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(QualityTier::Low),
            "high" => Ok(QualityTier::High),
            other => Err(CameraError::UnknownProfile(format!("resolution '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Crop {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// One row of the sensor capability table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorMode {
    pub size: Resolution,
    pub format: String,
    pub fps: f64,
    pub bit_depth: u8,
    pub crop: Crop,
}

impl SensorMode {
    fn area(&self) -> u64 {
        u64::from(self.size.width) * u64::from(self.size.height)
    }

    fn profile(&self, mode: CameraMode) -> ModeProfile {
        ModeProfile {
            mode,
            width: self.size.width,
            height: self.size.height,
            fps: self.fps,
            format: self.format.clone(),
            sensor: Some(SensorReadout {
                crop: self.crop,
                bit_depth: self.bit_depth,
            }),
        }
    }
}

/// Sensor readout behind a profile: the crop window and raw bit depth
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SensorReadout {
    pub crop: Crop,
    pub bit_depth: u8,
}

/// Resolved device settings for one mode
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModeProfile {
    pub mode: CameraMode,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub format: String,
    /// `None` for the preview, which is scaled from whatever the driver picks
    pub sensor: Option<SensorReadout>,
}

/// Static lookup from mode to device profile
#[derive(Debug, Clone)]
pub struct ProfileTable {
    preview: ModeProfile,
    still: ModeProfile,
    video: ModeProfile,
}

impl ProfileTable {
    pub fn from_config(config: &CameraConfig) -> Result<Self, CameraError> {
        let modes = &config.sensor_modes;

        // Bad indices fall back to the first sensor mode
        let video = match modes.get(config.video_sensor_mode) {
            Some(mode) => mode,
            None => {
                warn!(
                    "Sensor mode index {} out of range ({} modes), using index 0",
                    config.video_sensor_mode,
                    modes.len()
                );
                modes
                    .first()
                    .ok_or_else(|| CameraError::UnknownProfile("video (empty sensor mode table)".into()))?
            }
        };

        // Stills use the full sensor resolution
        let still = modes
            .iter()
            .max_by_key(|m| m.area())
            .ok_or_else(|| CameraError::UnknownProfile("still (empty sensor mode table)".into()))?;

        Ok(Self {
            preview: ModeProfile {
                mode: CameraMode::Preview,
                width: config.preview.width,
                height: config.preview.height,
                fps: config.preview_fps,
                format: "MJPG".into(),
                sensor: None,
            },
            still: still.profile(CameraMode::Still),
            video: video.profile(CameraMode::Video),
        })
    }

    /// `None` for Idle, which has no device profile
    pub fn get(&self, mode: CameraMode) -> Option<&ModeProfile> {
        match mode {
            CameraMode::Idle => None,
            CameraMode::Preview => Some(&self.preview),
            CameraMode::Still => Some(&self.still),
            CameraMode::Video => Some(&self.video),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn video_profile_follows_sensor_mode_index() {
        let config = CameraConfig {
            video_sensor_mode: 2,
            ..CameraConfig::default()
        };
        let table = ProfileTable::from_config(&config).unwrap();
        let video = table.get(CameraMode::Video).unwrap();
        assert_eq!((video.width, video.height), (1920, 1080));

        let sensor = video.sensor.unwrap();
        assert_eq!(sensor.bit_depth, 10);
        assert_eq!(
            sensor.crop,
            Crop {
                x: 348,
                y: 434,
                width: 1928,
                height: 1080
            }
        );
        assert!(table.get(CameraMode::Preview).unwrap().sensor.is_none());
    }

    #[test]
    fn out_of_range_sensor_mode_falls_back_to_first() {
        let config = CameraConfig {
            video_sensor_mode: 42,
            ..CameraConfig::default()
        };
        let table = ProfileTable::from_config(&config).unwrap();
        let video = table.get(CameraMode::Video).unwrap();
        assert_eq!((video.width, video.height), (640, 480));
    }

    #[test]
    fn still_uses_largest_sensor_mode() {
        let table = ProfileTable::from_config(&CameraConfig::default()).unwrap();
        let still = table.get(CameraMode::Still).unwrap();
        assert_eq!((still.width, still.height), (2592, 1944));
        assert!(table.get(CameraMode::Idle).is_none());
    }

    #[test]
    fn empty_sensor_table_is_a_configuration_error() {
        let config = CameraConfig {
            sensor_modes: Vec::new(),
            ..CameraConfig::default()
        };
        assert!(matches!(
            ProfileTable::from_config(&config),
            Err(CameraError::UnknownProfile(_))
        ));
    }

    #[test]
    fn quality_tier_parsing() {
        assert_eq!("low".parse::<QualityTier>().unwrap().mode(), CameraMode::Preview);
        assert_eq!("high".parse::<QualityTier>().unwrap().mode(), CameraMode::Still);
        assert!("ultra".parse::<QualityTier>().is_err());
    }
}
