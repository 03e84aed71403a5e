//! Servo arm: calibration, single-joint moves and time-synchronised eased
//! trajectories.
//!
//! The controller records the *logical* angle that was commanded for each
//! joint. Calibration is applied on the way to the PWM output only, so a
//! joint's offset or inversion can be retuned without losing what the
//! operator asked for.

use core::f32::consts::PI;
use heapless::Vec;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, warn};

use super::Joint;
use crate::hal::{Clock, HalError, ServoOutput};

pub const MIN_ANGLE: i32 = 0;
pub const MAX_ANGLE: i32 = 180;

/// Pulse width for 0 degrees (0.5 ms).
pub const MIN_PULSE_NS: u32 = 500_000;
/// Pulse width for 180 degrees (2.5 ms).
pub const MAX_PULSE_NS: u32 = 2_500_000;

/// One interpolation step per 50 Hz servo frame.
pub const STEP_PERIOD_MS: u32 = 20;

const_assert!(MIN_PULSE_NS < MAX_PULSE_NS);
const_assert!(STEP_PERIOD_MS > 0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ArmError {
    #[error("joint {0} has no known starting angle; initialize the pose first")]
    UninitializedPose(Joint),
    #[error("servo output for {joint} failed: {source}")]
    Output {
        joint: Joint,
        #[source]
        source: HalError,
    },
}

#[must_use]
pub fn clamp_angle(angle: i32) -> u8 {
    angle.clamp(MIN_ANGLE, MAX_ANGLE) as u8
}

/// Ease-in-out curve with zero velocity at `t = 0` and `t = 1`.
#[must_use]
pub fn ease_in_out(t: f32) -> f32 {
    0.5 * (1.0 - (t * PI).cos())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PulseRange {
    pub min_ns: u32,
    pub max_ns: u32,
}

impl PulseRange {
    pub const DEFAULT: PulseRange = PulseRange {
        min_ns: MIN_PULSE_NS,
        max_ns: MAX_PULSE_NS,
    };

    /// Linear map from the clamped angle onto `[min_ns, max_ns]`.
    #[must_use]
    pub fn angle_to_pulse(self, angle: i32) -> u32 {
        let span = u64::from(self.max_ns.saturating_sub(self.min_ns));
        let angle = u64::from(clamp_angle(angle));
        self.min_ns + (angle * span / MAX_ANGLE as u64) as u32
    }
}

impl Default for PulseRange {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[must_use]
pub fn angle_to_pulse(angle: i32) -> u32 {
    PulseRange::DEFAULT.angle_to_pulse(angle)
}

/// Mechanical correction between the logical and the physical angle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Calibration {
    pub offset_deg: i16,
    pub invert: bool,
}

impl Calibration {
    #[must_use]
    pub fn apply(self, angle: i32) -> u8 {
        let mut raw = i32::from(clamp_angle(angle)) + i32::from(self.offset_deg);
        if self.invert {
            raw = MAX_ANGLE - raw;
        }
        clamp_angle(raw)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServoState {
    /// Last commanded logical angle; `None` until the joint is first moved.
    pub commanded: Option<u8>,
    pub calibration: Calibration,
}

/// Target angles for a subset of joints, moved together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "BTreeMap<Joint, i32>", into = "BTreeMap<Joint, i32>")]
pub struct Pose {
    targets: [Option<i32>; Joint::COUNT],
}

impl Pose {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every joint at the same angle.
    #[must_use]
    pub fn uniform(angle: i32) -> Self {
        Self {
            targets: [Some(angle); Joint::COUNT],
        }
    }

    #[must_use]
    pub fn with(mut self, joint: Joint, angle: i32) -> Self {
        self.set(joint, angle);
        self
    }

    pub fn set(&mut self, joint: Joint, angle: i32) {
        self.targets[joint.index()] = Some(angle);
    }

    #[must_use]
    pub fn get(&self, joint: Joint) -> Option<i32> {
        self.targets[joint.index()]
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.targets.iter().all(Option::is_none)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Joint, i32)> + '_ {
        Joint::ALL
            .into_iter()
            .filter_map(|joint| self.get(joint).map(|angle| (joint, angle)))
    }
}

impl FromIterator<(Joint, i32)> for Pose {
    fn from_iter<I: IntoIterator<Item = (Joint, i32)>>(iter: I) -> Self {
        let mut pose = Pose::new();
        for (joint, angle) in iter {
            pose.set(joint, angle);
        }
        pose
    }
}

impl From<BTreeMap<Joint, i32>> for Pose {
    fn from(map: BTreeMap<Joint, i32>) -> Self {
        map.into_iter().collect()
    }
}

impl From<Pose> for BTreeMap<Joint, i32> {
    fn from(pose: Pose) -> Self {
        pose.iter().collect()
    }
}

pub struct ArmServos<S> {
    pub base: S,
    pub elbow: S,
    pub wrist: S,
    pub gripper: S,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArmSettings {
    pub pulse_range: PulseRange,
    pub step_period_ms: u32,
    pub calibration: [Calibration; Joint::COUNT],
}

impl Default for ArmSettings {
    fn default() -> Self {
        Self {
            pulse_range: PulseRange::DEFAULT,
            step_period_ms: STEP_PERIOD_MS,
            calibration: [Calibration::default(); Joint::COUNT],
        }
    }
}

pub struct ArmController<S: ServoOutput, C: Clock> {
    servos: [S; Joint::COUNT],
    states: [ServoState; Joint::COUNT],
    initialized: [bool; Joint::COUNT],
    pulse_range: PulseRange,
    step_period_ms: u32,
    clock: C,
}

impl<S: ServoOutput, C: Clock> ArmController<S, C> {
    #[must_use]
    pub fn new(servos: ArmServos<S>, clock: C, settings: ArmSettings) -> Self {
        let mut states = [ServoState::default(); Joint::COUNT];
        for (state, calibration) in states.iter_mut().zip(settings.calibration) {
            state.calibration = calibration;
        }

        Self {
            servos: [servos.base, servos.elbow, servos.wrist, servos.gripper],
            states,
            initialized: [false; Joint::COUNT],
            pulse_range: settings.pulse_range,
            step_period_ms: settings.step_period_ms.max(1),
            clock,
        }
    }

    pub fn set_calibration(&mut self, joint: Joint, offset_deg: i16, invert: bool) {
        self.states[joint.index()].calibration = Calibration { offset_deg, invert };
    }

    #[must_use]
    pub fn calibration(&self, joint: Joint) -> Calibration {
        self.states[joint.index()].calibration
    }

    /// Physical angle sent to the servo for a logical `angle`.
    #[must_use]
    pub fn calibrate(&self, joint: Joint, angle: i32) -> u8 {
        self.states[joint.index()].calibration.apply(angle)
    }

    #[must_use]
    pub fn angle_to_pulse(&self, angle: i32) -> u32 {
        self.pulse_range.angle_to_pulse(angle)
    }

    /// Immediate move. Records the clamped logical angle, writes the calibrated pulse.
    ///
    /// # Errors
    ///
    /// [`ArmError::Output`] if the PWM write failed. The logical angle is still recorded.
    pub fn move_to(&mut self, joint: Joint, angle: i32) -> Result<(), ArmError> {
        let index = joint.index();
        let logical = clamp_angle(angle);
        self.states[index].commanded = Some(logical);

        let physical = self.states[index].calibration.apply(i32::from(logical));
        let pulse_ns = self.pulse_range.angle_to_pulse(i32::from(physical));
        self.servos[index]
            .set_pulse_ns(pulse_ns)
            .map_err(|source| ArmError::Output { joint, source })
    }

    /// Logical angle last commanded for `joint`.
    #[must_use]
    pub fn angle(&self, joint: Joint) -> Option<u8> {
        self.states[joint.index()].commanded
    }

    #[must_use]
    pub fn state(&self, joint: Joint) -> ServoState {
        self.states[joint.index()]
    }

    #[must_use]
    pub fn is_initialized(&self, joint: Joint) -> bool {
        self.initialized[joint.index()]
    }

    /// Moves every joint in `pose` without interpolation, then waits `settle_ms`.
    ///
    /// This is the only way to establish a starting angle for smooth moves.
    ///
    /// # Errors
    ///
    /// The first failed servo write. The other joints are still moved.
    pub fn initialize_pose(&mut self, pose: &Pose, settle_ms: u32) -> Result<(), ArmError> {
        let mut result = Ok(());
        for (joint, angle) in pose.iter() {
            match self.move_to(joint, angle) {
                Ok(()) => self.initialized[joint.index()] = true,
                Err(e) => {
                    warn!(%joint, error = %e, "pose initialization write failed");
                    if result.is_ok() {
                        result = Err(e);
                    }
                }
            }
        }
        self.clock.sleep_ms(settle_ms);
        result
    }

    #[must_use]
    pub fn steps_for(&self, duration_ms: u32) -> u32 {
        (duration_ms / self.step_period_ms).max(1)
    }

    /// Eased single-joint move over `duration_ms`. Blocks for the whole move.
    ///
    /// # Errors
    ///
    /// [`ArmError::UninitializedPose`] before the joint has a known angle, or
    /// the first failed servo write.
    pub fn move_smooth(&mut self, joint: Joint, target: i32, duration_ms: u32) -> Result<(), ArmError> {
        let start = f32::from(self.start_angle(joint)?);
        let target = clamp_angle(target);
        let delta = f32::from(target) - start;
        let steps = self.steps_for(duration_ms);
        debug!(%joint, start, target, steps, "smooth move");

        for step in 1..=steps {
            let eased = ease_in_out((f64::from(step) / f64::from(steps)) as f32);
            self.move_to(joint, (start + delta * eased).round() as i32)?;
            self.clock.sleep_ms(self.step_period_ms);
        }

        // land exactly on the target regardless of interpolation rounding
        self.move_to(joint, i32::from(target))
    }

    /// Eased move of every joint in `pose` on one shared time base.
    ///
    /// # Errors
    ///
    /// As [`ArmController::move_smooth`]. Nothing moves if any joint in the pose
    /// is uninitialized.
    pub fn move_pose_smooth(&mut self, pose: &Pose, duration_ms: u32) -> Result<(), ArmError> {
        let mut plan: Vec<(Joint, f32, f32, u8), { Joint::COUNT }> = Vec::new();
        for (joint, target) in pose.iter() {
            let start = f32::from(self.start_angle(joint)?);
            let target = clamp_angle(target);
            // at most one entry per joint, so the plan cannot overflow
            let _ = plan.push((joint, start, f32::from(target) - start, target));
        }

        let steps = self.steps_for(duration_ms);
        debug!(joints = plan.len(), steps, "smooth pose move");

        for step in 1..=steps {
            let eased = ease_in_out((f64::from(step) / f64::from(steps)) as f32);
            for &(joint, start, delta, _) in &plan {
                self.move_to(joint, (start + delta * eased).round() as i32)?;
            }
            self.clock.sleep_ms(self.step_period_ms);
        }

        for &(joint, _, _, target) in &plan {
            self.move_to(joint, i32::from(target))?;
        }
        Ok(())
    }

    /// Disables every servo output. Never fails; individual errors are logged.
    pub fn stop_all(&mut self) {
        for (joint, servo) in Joint::ALL.into_iter().zip(self.servos.iter_mut()) {
            if let Err(e) = servo.disable() {
                warn!(%joint, error = %e, "failed to disable servo output");
            }
        }
    }

    fn start_angle(&self, joint: Joint) -> Result<u8, ArmError> {
        let index = joint.index();
        match self.states[index].commanded {
            Some(angle) if self.initialized[index] => Ok(angle),
            _ => Err(ArmError::UninitializedPose(joint)),
        }
    }
}
