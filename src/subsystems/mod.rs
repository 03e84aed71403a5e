pub mod drive;
pub mod arm;
pub mod sensors;

pub use drive::{DriveController, DriveLines, DriveState};
pub use arm::{ArmController, ArmServos, ArmSettings, Calibration, Pose, PulseRange};
pub use sensors::{Ina219, LinePair, SensorError, SensorHub, Sensors, UltrasonicRanger};

use serde::{Deserialize, Serialize};

/// Arm joints, in servo channel order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Joint {
    Base,
    Elbow,
    Wrist,
    Gripper,
}

impl Joint {
    pub const COUNT: usize = 4;
    pub const ALL: [Joint; Joint::COUNT] = [Joint::Base, Joint::Elbow, Joint::Wrist, Joint::Gripper];

    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Joint::Base => "base",
            Joint::Elbow => "elbow",
            Joint::Wrist => "wrist",
            Joint::Gripper => "gripper",
        }
    }

    /// Case-insensitive lookup by name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|joint| joint.name().eq_ignore_ascii_case(name))
    }
}

impl core::fmt::Display for Joint {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}
