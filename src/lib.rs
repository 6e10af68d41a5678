pub mod capture;
pub mod context;
pub mod error;
pub mod lights;
pub mod pipeline;
pub mod server;
pub mod utils;

use std::path::Path;
use std::time::Duration;

use capture::frame::{Crop, Resolution, SensorMode};
use capture::{CameraMode, CapturePolicy};
use serde::{Deserialize, Serialize};

/// Prefix for environment overrides, e.g. `PYCAMLIGHTS__SERVER__PORT=9000`
pub const ENV_PREFIX: &str = "PYCAMLIGHTS";

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub hardware: HardwareConfig,
    pub camera: CameraConfig,
    pub stream: StreamConfig,
    pub lights: LightsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
}

/// Hardware-presence flags selecting real vs synthetic behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    pub camera: bool,
    pub pwm: bool,
    /// V4L2 node, or "auto" to probe /dev/video*
    pub camera_device: String,
    pub buffer_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub preview: Resolution,
    pub preview_fps: f64,
    pub video_sensor_mode: usize,
    pub sensor_modes: Vec<SensorMode>,
    pub after_capture: CapturePolicy,
    /// Mode entered when the last viewer leaves
    pub idle_mode: CameraMode,
    pub jpeg_quality: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub grace_period_ms: u64,
    pub keepalive_ms: u64,
    pub frame_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LightsConfig {
    pub pigpio_addr: String,
    pub red_channel: u32,
    pub green_channel: u32,
    pub blue_channel: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".into(),
            port: 8080,
        }
    }
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            camera: true,
            pwm: true,
            camera_device: "/dev/video0".into(),
            buffer_count: 4,
        }
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            preview: Resolution {
                width: 320,
                height: 240,
            },
            preview_fps: 24.0,
            video_sensor_mode: 0,
            sensor_modes: default_sensor_modes(),
            after_capture: CapturePolicy::Resume,
            idle_mode: CameraMode::Idle,
            jpeg_quality: 80,
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: 10_000,
            keepalive_ms: 2_000,
            frame_timeout_ms: 10_000,
        }
    }
}

impl Default for LightsConfig {
    fn default() -> Self {
        Self {
            pigpio_addr: "127.0.0.1:8888".into(),
            red_channel: 17,
            green_channel: 27,
            blue_channel: 22,
        }
    }
}

impl StreamConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_millis(self.keepalive_ms.max(1))
    }

    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }
}

impl Config {
    /// Layer defaults, an optional TOML file and `PYCAMLIGHTS__*` env vars
    pub fn load(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        let file = path.unwrap_or_else(|| Path::new("pycamlights.toml"));

        config::Config::builder()
            .add_source(config::File::from(file).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}

/// OV5647 modes as reported by the sensor driver
fn default_sensor_modes() -> Vec<SensorMode> {
    let mode = |width, height, fps, crop: (u32, u32, u32, u32)| SensorMode {
        size: Resolution { width, height },
        format: "SGBRG10_CSI2P".into(),
        fps,
        bit_depth: 10,
        crop: Crop {
            x: crop.0,
            y: crop.1,
            width: crop.2,
            height: crop.3,
        },
    };

    vec![
        mode(640, 480, 58.92, (16, 0, 2560, 1920)),
        mode(1296, 972, 43.25, (0, 0, 2592, 1944)),
        mode(1920, 1080, 30.62, (348, 434, 1928, 1080)),
        mode(2592, 1944, 15.63, (0, 0, 2592, 1944)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_fixture_wiring() {
        let config = Config::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.stream.grace_period(), Duration::from_secs(10));
        assert_eq!(
            (
                config.lights.red_channel,
                config.lights.green_channel,
                config.lights.blue_channel
            ),
            (17, 27, 22)
        );
        assert_eq!(config.camera.sensor_modes.len(), 4);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = Config::load(Some(Path::new("/nonexistent/pycamlights.toml"))).unwrap();
        assert_eq!(config.camera.preview.width, 320);
        assert_eq!(config.camera.after_capture, CapturePolicy::Resume);
    }
}
