//! Runtime configuration, loaded from JSON.
//!
//! Every field has a default matching the cart as built, so an empty object
//! (`{}`) is a complete configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

use crate::channel::{
    ChannelSettings, DEFAULT_ADV_INTERVAL_US, DEFAULT_COMMAND_UUID, DEFAULT_DEVICE_NAME,
    DEFAULT_SERVICE_UUID, DEFAULT_TELEMETRY_UUID,
};
use crate::control::{
    LoopSettings, DEFAULT_POSE_DURATION_MS, DEFAULT_SETTLE_MS, DEFAULT_TICK_MS, HOME_ANGLE,
};
use crate::protocol::{ProtocolError, Uuid128, MAX_DEVICE_NAME, MAX_POSE_NAME};
use crate::safety::DEFAULT_OBSTACLE_THRESHOLD_CM;
use crate::subsystems::arm::{
    ArmSettings, Calibration, Pose, PulseRange, MAX_ANGLE, MAX_PULSE_NS, MIN_ANGLE, MIN_PULSE_NS,
    STEP_PERIOD_MS,
};
use crate::subsystems::sensors::{
    DEFAULT_ECHO_TIMEOUT_US, INA219_DEFAULT_ADDR, INA219_DEFAULT_CURRENT_LSB_UA,
    INA219_DEFAULT_SHUNT_MILLIOHM, MAX_ECHO_TIMEOUT_US,
};
use crate::subsystems::Joint;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("{field}: {source}")]
    Uuid {
        field: &'static str,
        #[source]
        source: ProtocolError,
    },
    #[error("device name is {len} bytes, at most {} fit in the scan response", MAX_DEVICE_NAME)]
    NameTooLong { len: usize },
    #[error("pulse range {min_ns}..{max_ns} ns is empty or inverted")]
    PulseRange { min_ns: u32, max_ns: u32 },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("echo timeout of {us} us exceeds the {} us limit", MAX_ECHO_TIMEOUT_US)]
    EchoTimeout { us: u32 },
    #[error("pose `{pose}` sets {joint} to {angle}, outside 0..=180")]
    AngleOutOfRange { pose: String, joint: Joint, angle: i32 },
    #[error("pose name `{0}` must be 1..={} ASCII letters, digits or `_`", MAX_POSE_NAME)]
    PoseName(String),
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CartConfig {
    pub radio: RadioConfig,
    pub control: ControlConfig,
    pub arm: ArmConfig,
    pub sensors: SensorConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RadioConfig {
    pub name: String,
    pub service_uuid: String,
    pub command_uuid: String,
    pub telemetry_uuid: String,
    pub advertise_interval_us: u32,
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_DEVICE_NAME.to_string(),
            service_uuid: DEFAULT_SERVICE_UUID.to_string(),
            command_uuid: DEFAULT_COMMAND_UUID.to_string(),
            telemetry_uuid: DEFAULT_TELEMETRY_UUID.to_string(),
            advertise_interval_us: DEFAULT_ADV_INTERVAL_US,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub tick_ms: u32,
    pub obstacle_threshold_cm: f32,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            tick_ms: DEFAULT_TICK_MS,
            obstacle_threshold_cm: DEFAULT_OBSTACLE_THRESHOLD_CM,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArmConfig {
    pub min_pulse_ns: u32,
    pub max_pulse_ns: u32,
    pub step_period_ms: u32,
    pub settle_ms: u32,
    pub pose_duration_ms: u32,
    pub home_pose: Pose,
    pub calibration: BTreeMap<Joint, Calibration>,
    pub poses: BTreeMap<String, Pose>,
}

impl Default for ArmConfig {
    fn default() -> Self {
        // pick-up routine: park, then lower base and elbow with wrist and gripper held
        let ready = Pose::new()
            .with(Joint::Base, 90)
            .with(Joint::Elbow, 80)
            .with(Joint::Wrist, 180)
            .with(Joint::Gripper, 70);
        let lower = ready.with(Joint::Base, 45).with(Joint::Elbow, 60);

        Self {
            min_pulse_ns: MIN_PULSE_NS,
            max_pulse_ns: MAX_PULSE_NS,
            step_period_ms: STEP_PERIOD_MS,
            settle_ms: DEFAULT_SETTLE_MS,
            pose_duration_ms: DEFAULT_POSE_DURATION_MS,
            home_pose: Pose::uniform(HOME_ANGLE),
            calibration: BTreeMap::new(),
            poses: BTreeMap::from([("ready".to_string(), ready), ("lower".to_string(), lower)]),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    pub echo_timeout_us: u32,
    pub ina219_addr: u8,
    pub shunt_milliohm: u32,
    pub current_lsb_ua: u32,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            echo_timeout_us: DEFAULT_ECHO_TIMEOUT_US,
            ina219_addr: INA219_DEFAULT_ADDR,
            shunt_milliohm: INA219_DEFAULT_SHUNT_MILLIOHM,
            current_lsb_ua: INA219_DEFAULT_CURRENT_LSB_UA,
        }
    }
}

impl CartConfig {
    /// Parses and validates.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Parse`] for malformed JSON, otherwise whatever
    /// [`CartConfig::validate`] rejects.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: CartConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    ///
    /// [`ConfigError::Io`] if the file cannot be read, otherwise as
    /// [`CartConfig::from_json_str`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Checks ranges the type system cannot express.
    ///
    /// # Errors
    ///
    /// The first invalid field found, as the matching [`ConfigError`] variant.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.channel_settings()?;

        let arm = &self.arm;
        if arm.min_pulse_ns >= arm.max_pulse_ns {
            return Err(ConfigError::PulseRange {
                min_ns: arm.min_pulse_ns,
                max_ns: arm.max_pulse_ns,
            });
        }

        let nonzero = [
            ("control.tick_ms", self.control.tick_ms),
            ("arm.step_period_ms", arm.step_period_ms),
            ("sensors.echo_timeout_us", self.sensors.echo_timeout_us),
            ("sensors.shunt_milliohm", self.sensors.shunt_milliohm),
            ("sensors.current_lsb_ua", self.sensors.current_lsb_ua),
        ];
        if let Some((field, _)) = nonzero.into_iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Zero(field));
        }
        if self.sensors.echo_timeout_us > MAX_ECHO_TIMEOUT_US {
            return Err(ConfigError::EchoTimeout {
                us: self.sensors.echo_timeout_us,
            });
        }

        check_pose("home", &arm.home_pose)?;
        for (name, pose) in &arm.poses {
            let valid_name = !name.is_empty()
                && name.len() <= MAX_POSE_NAME
                && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
            if !valid_name {
                return Err(ConfigError::PoseName(name.clone()));
            }
            check_pose(name, pose)?;
        }

        Ok(())
    }

    /// # Errors
    ///
    /// [`ConfigError::NameTooLong`] or [`ConfigError::Uuid`].
    pub fn channel_settings(&self) -> Result<ChannelSettings, ConfigError> {
        let radio = &self.radio;
        if radio.name.len() > MAX_DEVICE_NAME {
            return Err(ConfigError::NameTooLong {
                len: radio.name.len(),
            });
        }

        Ok(ChannelSettings {
            name: radio.name.clone(),
            service: parse_uuid("radio.service_uuid", &radio.service_uuid)?,
            command: parse_uuid("radio.command_uuid", &radio.command_uuid)?,
            telemetry: parse_uuid("radio.telemetry_uuid", &radio.telemetry_uuid)?,
            advertise_interval_us: radio.advertise_interval_us,
        })
    }

    #[must_use]
    pub fn arm_settings(&self) -> ArmSettings {
        let mut calibration = [Calibration::default(); Joint::COUNT];
        for (joint, value) in &self.arm.calibration {
            calibration[joint.index()] = *value;
        }

        ArmSettings {
            pulse_range: PulseRange {
                min_ns: self.arm.min_pulse_ns,
                max_ns: self.arm.max_pulse_ns,
            },
            step_period_ms: self.arm.step_period_ms,
            calibration,
        }
    }

    #[must_use]
    pub fn loop_settings(&self) -> LoopSettings {
        LoopSettings {
            tick_ms: self.control.tick_ms,
            obstacle_threshold_cm: self.control.obstacle_threshold_cm,
            home_pose: self.arm.home_pose,
            settle_ms: self.arm.settle_ms,
            pose_duration_ms: self.arm.pose_duration_ms,
            poses: self.arm.poses.clone(),
        }
    }
}

fn parse_uuid(field: &'static str, value: &str) -> Result<Uuid128, ConfigError> {
    value
        .parse()
        .map_err(|source| ConfigError::Uuid { field, source })
}

fn check_pose(name: &str, pose: &Pose) -> Result<(), ConfigError> {
    match pose
        .iter()
        .find(|(_, angle)| !(MIN_ANGLE..=MAX_ANGLE).contains(angle))
    {
        Some((joint, angle)) => Err(ConfigError::AngleOutOfRange {
            pose: name.to_string(),
            joint,
            angle,
        }),
        None => Ok(()),
    }
}
