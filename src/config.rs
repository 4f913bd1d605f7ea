// Device paths, axis tuning, homing offsets, rotation limits.
//
// Built-in values match the production machine; a JSON config file can
// override any subset of them (see `MachineConfig::load`).

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::axis::Axis;

// Hardware device paths
pub const STEPPER_BUS: &str = "/dev/i2c-1";
pub const COPROC_PORT: &str = "/dev/ttyTHS1";
pub const COPROC_BAUD: u32 = 115_200;

// Stepper bus addresses, top-wheel and counter-wheel sides
pub const ADDR_TW_Z1: u8 = 0x10;
pub const ADDR_TW_Z2: u8 = 0x11;
pub const ADDR_TW_T: u8 = 0x0F;
pub const ADDR_TW_R: u8 = 0x0E;
pub const ADDR_CW_Z1: u8 = 0x14;
pub const ADDR_CW_Z2: u8 = 0x15;
pub const ADDR_CW_T: u8 = 0x13;
pub const ADDR_CW_R: u8 = 0x12;

// Rotary axis encoder resolution (pulses per revolution)
pub const COUNTS_PER_REV: i32 = 245_426;

// Rotation limits for axis A
pub const A_RPM_MIN: f64 = 0.0;
pub const A_RPM_MAX: f64 = 60.0;

// Default feed rates
pub const DEFAULT_GLOBAL_FEED: f64 = 100_000.0;
pub const DEFAULT_A_FEED_RPM: f64 = 9.0;

// Illumination current limits (mA)
pub const LED_DEFAULT_CURRENT_MA: u32 = 450;
pub const LED_MAX_CURRENT_MA: u32 = 30_000;

// Motion-wait poll interval; downstream hardware timing depends on this
// staying in the tens-of-milliseconds class.
pub const MOTION_POLL: Duration = Duration::from_millis(20);
pub const ABORT_POLL: Duration = Duration::from_millis(50);

/// Per-drive stepper tuning.
///
/// Units follow the drive firmware: acceleration in steps/100s^2,
/// velocity in steps/10,000s, current in mA.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriveTuning {
    pub step_mode: u8,
    pub max_acceleration: u32,
    pub max_deceleration: u32,
    pub max_velocity: u32,
    pub max_current_ma: u32,
}

/// Homing direction and post-home offset for one axis group.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HomingParams {
    pub direction: u8,
    pub offset: i32,
}

const Z_TUNING: DriveTuning = DriveTuning {
    step_mode: 7,
    max_acceleration: 2_560_000,
    max_deceleration: 2_560_000,
    max_velocity: 105_000_000,
    max_current_ma: 2_000,
};

const RT_TUNING: DriveTuning = DriveTuning {
    step_mode: 4,
    max_acceleration: 320_000,
    max_deceleration: 320_000,
    max_velocity: 450_000_000,
    max_current_ma: 2_000,
};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
}

/// Complete machine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineConfig {
    pub stepper_bus: String,
    pub coproc_port: String,
    pub coproc_baud: u32,
    pub rt: DriveTuning,
    pub z: DriveTuning,
    pub home_r: HomingParams,
    pub home_t: HomingParams,
    pub home_z: HomingParams,
    pub counts_per_rev: i32,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            stepper_bus: STEPPER_BUS.to_string(),
            coproc_port: COPROC_PORT.to_string(),
            coproc_baud: COPROC_BAUD,
            rt: RT_TUNING,
            z: Z_TUNING,
            home_r: HomingParams {
                direction: 1,
                offset: -283_000,
            },
            home_t: HomingParams {
                direction: 1,
                offset: -335_288,
            },
            home_z: HomingParams {
                direction: 0,
                offset: 24_025,
            },
            counts_per_rev: COUNTS_PER_REV,
        }
    }
}

impl MachineConfig {
    /// Load a config file, falling back to defaults for absent fields.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Velocity cap for a linear axis group. Axis A is capped in RPM, not
    /// step rate, and has no entry here.
    pub fn linear_cap(&self, axis: Axis) -> Option<u32> {
        match axis {
            Axis::R | Axis::T => Some(self.rt.max_velocity),
            Axis::Z => Some(self.z.max_velocity),
            Axis::A => None,
        }
    }

    pub fn homing(&self, axis: Axis) -> Option<HomingParams> {
        match axis {
            Axis::R => Some(self.home_r),
            Axis::T => Some(self.home_t),
            Axis::Z => Some(self.home_z),
            Axis::A => None,
        }
    }

    /// RPM to encoder pulses per second for the rotary axis.
    pub fn rpm_to_pps(&self, rpm: f64) -> i32 {
        (rpm * self.counts_per_rev as f64 / 60.0).round() as i32
    }

    /// Inverse of [`rpm_to_pps`], up to rounding.
    pub fn pps_to_rpm(&self, pps: i32) -> f64 {
        pps as f64 * 60.0 / self.counts_per_rev as f64
    }
}
