//! RGB fixture state. Every change is pushed to the PWM driver immediately.

pub mod pigpio;

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::LightingError;
use crate::LightsConfig;

pub use pigpio::{PigpioDriver, PwmDriver};

/// Clamp an arbitrary integer into a duty cycle
pub fn clamp_channel(value: i64) -> u8 {
    value.clamp(0, 255) as u8
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LightColor {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
}

impl LightColor {
    pub const OFF: LightColor = LightColor::new(0, 0, 0);
    pub const FULL: LightColor = LightColor::new(255, 255, 255);

    pub const fn new(red: u8, green: u8, blue: u8) -> Self {
        Self { red, green, blue }
    }
}

impl fmt::Display for LightColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RGB:<{}, {}, {}>", self.red, self.green, self.blue)
    }
}

/// Per-channel change; `None` keeps the current value. Values are clamped,
/// never rejected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ColorUpdate {
    pub red: Option<i64>,
    pub green: Option<i64>,
    pub blue: Option<i64>,
}

impl ColorUpdate {
    pub fn all(red: i64, green: i64, blue: i64) -> Self {
        Self {
            red: Some(red),
            green: Some(green),
            blue: Some(blue),
        }
    }

    fn apply(&self, color: &mut LightColor) {
        if let Some(red) = self.red {
            color.red = clamp_channel(red);
        }
        if let Some(green) = self.green {
            color.green = clamp_channel(green);
        }
        if let Some(blue) = self.blue {
            color.blue = clamp_channel(blue);
        }
    }
}

impl From<LightColor> for ColorUpdate {
    fn from(color: LightColor) -> Self {
        Self::all(color.red.into(), color.green.into(), color.blue.into())
    }
}

/// PWM channel numbers (GPIO pins for pigpio) per color
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelMap {
    pub red: u32,
    pub green: u32,
    pub blue: u32,
}

impl From<&LightsConfig> for ChannelMap {
    fn from(config: &LightsConfig) -> Self {
        Self {
            red: config.red_channel,
            green: config.green_channel,
            blue: config.blue_channel,
        }
    }
}

struct Fixture {
    color: LightColor,
    driver: Option<Box<dyn PwmDriver>>,
}

/// Owns the current color and the PWM handle. One lock covers
/// read-modify-publish, so concurrent `set` calls never interleave.
pub struct LightingState {
    fixture: Mutex<Fixture>,
    channels: ChannelMap,
}

impl LightingState {
    /// `driver` is `None` in hardware-disabled mode; writes are then no-ops.
    pub fn new(driver: Option<Box<dyn PwmDriver>>, channels: ChannelMap) -> Self {
        match &driver {
            Some(d) => info!("Lighting using PWM driver {}", d.name()),
            None => warn!("No PWM controller, light writes are disabled"),
        }
        Self {
            fixture: Mutex::new(Fixture {
                color: LightColor::OFF,
                driver,
            }),
            channels,
        }
    }

    pub fn has_driver(&self) -> bool {
        self.lock().driver.is_some()
    }

    pub fn current(&self) -> LightColor {
        self.lock().color
    }

    /// Apply `update`, publish, and return the stored color. A driver error
    /// is logged and the new color is kept; the fixture degrades to no-op
    /// writes rather than failing the caller.
    pub fn set(&self, update: ColorUpdate) -> LightColor {
        let mut fixture = self.lock();
        update.apply(&mut fixture.color);

        if let Err(e) = self.publish_locked(&mut fixture) {
            warn!("Could not publish {}: {e}", fixture.color);
        }
        fixture.color
    }

    pub fn clear(&self) -> LightColor {
        debug!("Clearing lighting values");
        self.set(LightColor::OFF.into())
    }

    pub fn full(&self) -> LightColor {
        self.set(LightColor::FULL.into())
    }

    /// Write the current triple to the driver. Succeeds trivially without one.
    pub fn publish(&self) -> Result<(), LightingError> {
        let mut fixture = self.lock();
        self.publish_locked(&mut fixture)
    }

    fn publish_locked(&self, fixture: &mut Fixture) -> Result<(), LightingError> {
        let color = fixture.color;
        let Some(driver) = fixture.driver.as_mut() else {
            debug!("PWM disabled, skipping write of {color}");
            return Ok(());
        };

        driver.set_duty_cycle(self.channels.red, color.red)?;
        driver.set_duty_cycle(self.channels.green, color.green)?;
        driver.set_duty_cycle(self.channels.blue, color.blue)?;
        debug!("Published {color}");
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Fixture> {
        self.fixture.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
