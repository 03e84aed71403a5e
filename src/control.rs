//! Fixed-cadence control loop.
//!
//! Each tick pops at most one command, dispatches it to the drive or the arm,
//! polls the sensors once, applies the obstacle stop, publishes telemetry and
//! sleeps for whatever is left of the tick budget.
//!
//! Every exit path goes through [`ControlLoop::shutdown`], which leaves the
//! drive stopped and the servo outputs disabled. `Drop` calls it as well, so
//! the outputs are safed even when the loop is dropped while unwinding. This
//! relies on the default `panic = "unwind"` strategy; no profile sets `abort`.

use core::sync::atomic::{AtomicBool, Ordering};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::hal::{Clock, HalError, OutputLine, ServoOutput};
use crate::protocol::Command;
use crate::queue::CommandReceiver;
use crate::safety::{SafetyMonitor, DEFAULT_OBSTACLE_THRESHOLD_CM};
use crate::subsystems::arm::{ArmController, Pose};
use crate::subsystems::drive::DriveController;
use crate::subsystems::sensors::{SensorError, SensorHub};
use crate::subsystems::Joint;
use crate::telemetry::{TelemetrySample, TelemetrySink};

pub const DEFAULT_TICK_MS: u32 = 100;
pub const DEFAULT_SETTLE_MS: u32 = 1000;
pub const DEFAULT_POSE_DURATION_MS: u32 = 2500;
pub const HOME_ANGLE: i32 = 90;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoopState {
    Idle,
    Running,
    ShuttingDown,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LoopError {
    #[error("drive output fault: {0}")]
    Drive(HalError),
    #[error("control loop is {0:?}")]
    NotRunning(LoopState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LoopStats {
    pub ticks: u64,
    pub overruns: u32,
    pub commands_dispatched: u32,
    pub commands_rejected: u32,
    pub arm_faults: u32,
    pub obstacle_stops: u32,
    pub sensor_timeouts: u32,
    pub sensor_faults: u32,
    pub telemetry_published: u32,
    pub notify_failures: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoopSettings {
    pub tick_ms: u32,
    pub obstacle_threshold_cm: f32,
    pub home_pose: Pose,
    pub settle_ms: u32,
    /// Duration of the eased move triggered by `POSE_<NAME>`.
    pub pose_duration_ms: u32,
    /// Named poses, matched case-insensitively.
    pub poses: BTreeMap<String, Pose>,
}

impl LoopSettings {
    /// Looks up a named pose. `HOME` falls back to the home pose.
    #[must_use]
    pub fn pose(&self, name: &str) -> Option<Pose> {
        self.poses
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, pose)| *pose)
            .or_else(|| name.eq_ignore_ascii_case("home").then_some(self.home_pose))
    }
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            tick_ms: DEFAULT_TICK_MS,
            obstacle_threshold_cm: DEFAULT_OBSTACLE_THRESHOLD_CM,
            home_pose: Pose::uniform(HOME_ANGLE),
            settle_ms: DEFAULT_SETTLE_MS,
            pose_duration_ms: DEFAULT_POSE_DURATION_MS,
            poses: BTreeMap::new(),
        }
    }
}

pub struct ControlLoop<'q, L, S, H, T, C>
where
    L: OutputLine,
    S: ServoOutput,
    H: SensorHub,
    T: TelemetrySink,
    C: Clock,
{
    drive: DriveController<L>,
    arm: ArmController<S, C>,
    sensors: H,
    telemetry: T,
    commands: CommandReceiver<'q>,
    safety: SafetyMonitor,
    clock: C,
    settings: LoopSettings,
    state: LoopState,
    stats: LoopStats,
    last_sample: TelemetrySample,
}

impl<'q, L, S, H, T, C> ControlLoop<'q, L, S, H, T, C>
where
    L: OutputLine,
    S: ServoOutput,
    H: SensorHub,
    T: TelemetrySink,
    C: Clock,
{
    #[must_use]
    pub fn new(
        drive: DriveController<L>,
        arm: ArmController<S, C>,
        sensors: H,
        telemetry: T,
        commands: CommandReceiver<'q>,
        clock: C,
        settings: LoopSettings,
    ) -> Self {
        Self {
            drive,
            arm,
            sensors,
            telemetry,
            commands,
            safety: SafetyMonitor::new(settings.obstacle_threshold_cm),
            clock,
            settings,
            state: LoopState::Idle,
            stats: LoopStats::default(),
            last_sample: TelemetrySample::default(),
        }
    }

    /// Bring-up: drive stopped, power monitor configured, arm parked in the home pose.
    ///
    /// # Errors
    ///
    /// [`LoopError::NotRunning`] unless the loop is idle, or
    /// [`LoopError::Drive`] if the drive cannot be stopped; the loop is shut
    /// down in that case.
    pub fn start(&mut self) -> Result<(), LoopError> {
        if self.state != LoopState::Idle {
            return Err(LoopError::NotRunning(self.state));
        }

        if let Err(e) = self.drive.stop() {
            error!(error = %e, "cannot stop drive at startup");
            self.shutdown();
            return Err(LoopError::Drive(e));
        }

        if let Err(e) = self.sensors.configure() {
            warn!(error = %e, "sensor configuration failed, continuing");
        }

        let home = self.settings.home_pose;
        if let Err(e) = self.arm.initialize_pose(&home, self.settings.settle_ms) {
            warn!(error = %e, "arm did not fully reach the home pose");
        }

        self.state = LoopState::Running;
        info!(tick_ms = self.settings.tick_ms, "control loop running");
        Ok(())
    }

    /// Runs one tick.
    ///
    /// # Errors
    ///
    /// [`LoopError::NotRunning`] outside the running state. A drive fault shuts
    /// the loop down before it is returned.
    pub fn tick(&mut self) -> Result<TelemetrySample, LoopError> {
        if self.state != LoopState::Running {
            return Err(LoopError::NotRunning(self.state));
        }

        match self.run_tick() {
            Ok(sample) => Ok(sample),
            Err(e) => {
                error!(error = %e, "fatal fault in control loop");
                self.shutdown();
                Err(e)
            }
        }
    }

    fn run_tick(&mut self) -> Result<TelemetrySample, LoopError> {
        let started = self.clock.now_ms();

        if let Some(token) = self.commands.pop() {
            self.dispatch(&token)?;
        }

        let sample = self.poll_sensors();

        let actions = self.safety.evaluate(started, sample.distance_cm);
        if actions.force_stop {
            self.stats.obstacle_stops = self.stats.obstacle_stops.saturating_add(1);
            self.drive.stop().map_err(LoopError::Drive)?;
        }

        let report = self.telemetry.publish(&sample);
        self.stats.telemetry_published = self.stats.telemetry_published.saturating_add(1);
        self.stats.notify_failures = self.stats.notify_failures.saturating_add(u32::from(report.failed));
        self.last_sample = sample;
        self.stats.ticks = self.stats.ticks.saturating_add(1);

        let elapsed = self.clock.now_ms().saturating_sub(started);
        debug!(
            tick = self.stats.ticks,
            elapsed_ms = elapsed,
            drive = ?self.drive.state(),
            pending = self.commands.len(),
            "tick"
        );
        match u64::from(self.settings.tick_ms).checked_sub(elapsed) {
            Some(remaining) if remaining > 0 => self.clock.sleep_ms(remaining as u32),
            Some(_) => {}
            None => self.stats.overruns = self.stats.overruns.saturating_add(1),
        }

        Ok(sample)
    }

    /// Executes one command token.
    ///
    /// Malformed tokens and arm faults are logged and absorbed.
    ///
    /// # Errors
    ///
    /// Only a drive output failure, as [`LoopError::Drive`].
    pub fn dispatch(&mut self, token: &str) -> Result<(), LoopError> {
        let command = match token.parse::<Command>() {
            Ok(command) => command,
            Err(e) => {
                self.stats.commands_rejected = self.stats.commands_rejected.saturating_add(1);
                warn!(command = token, error = %e, "dropping malformed command");
                return Ok(());
            }
        };

        match command {
            Command::Drive(directive) => {
                self.drive.execute(directive).map_err(LoopError::Drive)?;
            }
            Command::Joint { joint, angle } => {
                if let Err(e) = self.arm.move_to(joint, angle) {
                    self.stats.arm_faults = self.stats.arm_faults.saturating_add(1);
                    warn!(%joint, angle, error = %e, "joint move failed");
                }
            }
            Command::Pose(name) => {
                let Some(pose) = self.settings.pose(&name) else {
                    self.stats.commands_rejected = self.stats.commands_rejected.saturating_add(1);
                    warn!(pose = %name, "unknown pose");
                    return Ok(());
                };
                if let Err(e) = self.arm.move_pose_smooth(&pose, self.settings.pose_duration_ms) {
                    self.stats.arm_faults = self.stats.arm_faults.saturating_add(1);
                    warn!(pose = %name, error = %e, "pose move failed");
                }
            }
        }

        self.stats.commands_dispatched = self.stats.commands_dispatched.saturating_add(1);
        Ok(())
    }

    /// Reads every sensor once. Failed readings become `None` in the sample.
    pub fn poll_sensors(&mut self) -> TelemetrySample {
        let distance_cm = match self.sensors.distance_cm() {
            Ok(distance) => Some(distance),
            Err(SensorError::Timeout) => {
                self.stats.sensor_timeouts = self.stats.sensor_timeouts.saturating_add(1);
                debug!("distance reading timed out");
                None
            }
            Err(e) => {
                self.stats.sensor_faults = self.stats.sensor_faults.saturating_add(1);
                warn!(error = %e, "distance reading failed");
                None
            }
        };
        let voltage = self.reading("voltage", H::voltage);
        let current_ma = self.reading("current", H::current_ma);
        let (line_left, line_right) = match self.sensors.read_line_sensors() {
            Ok(lines) => lines,
            Err(e) => {
                self.stats.sensor_faults = self.stats.sensor_faults.saturating_add(1);
                warn!(error = %e, "line sensor read failed");
                (false, false)
            }
        };

        TelemetrySample {
            distance_cm,
            voltage,
            current_ma,
            line_left,
            line_right,
        }
    }

    fn reading(&mut self, what: &'static str, read: impl FnOnce(&mut H) -> Result<f32, SensorError>) -> Option<f32> {
        match read(&mut self.sensors) {
            Ok(value) => Some(value),
            Err(e) => {
                self.stats.sensor_faults = self.stats.sensor_faults.saturating_add(1);
                warn!(sensor = what, error = %e, "sensor read failed");
                None
            }
        }
    }

    /// Starts if needed, then ticks until `stop` is set or a fatal fault occurs.
    ///
    /// # Errors
    ///
    /// The fault that ended the loop. Outputs are safed either way.
    pub fn run(&mut self, stop: &AtomicBool) -> Result<(), LoopError> {
        if self.state == LoopState::Idle {
            self.start()?;
        }

        let result = loop {
            if stop.load(Ordering::Acquire) {
                info!("stop requested");
                break Ok(());
            }
            if let Err(e) = self.tick() {
                break Err(e);
            }
        };

        self.shutdown();
        result
    }

    /// Drives every actuator to its safe state. Safe to call repeatedly.
    pub fn shutdown(&mut self) {
        if matches!(self.state, LoopState::ShuttingDown | LoopState::Stopped) {
            return;
        }
        self.state = LoopState::ShuttingDown;
        info!("control loop shutting down");

        if let Err(e) = self.drive.stop() {
            error!(error = %e, "failed to stop drive during shutdown");
        }
        self.arm.stop_all();

        self.state = LoopState::Stopped;
        info!(
            ticks = self.stats.ticks,
            commands = self.stats.commands_dispatched,
            rejected = self.stats.commands_rejected,
            dropped = self.commands.dropped(),
            "control loop stopped"
        );
    }

    #[must_use]
    pub fn state(&self) -> LoopState {
        self.state
    }

    #[must_use]
    pub fn stats(&self) -> &LoopStats {
        &self.stats
    }

    #[must_use]
    pub fn settings(&self) -> &LoopSettings {
        &self.settings
    }

    #[must_use]
    pub fn drive(&self) -> &DriveController<L> {
        &self.drive
    }

    #[must_use]
    pub fn arm(&self) -> &ArmController<S, C> {
        &self.arm
    }

    pub fn arm_mut(&mut self) -> &mut ArmController<S, C> {
        &mut self.arm
    }

    #[must_use]
    pub fn safety(&self) -> &SafetyMonitor {
        &self.safety
    }

    #[must_use]
    pub fn joint_angle(&self, joint: Joint) -> Option<u8> {
        self.arm.angle(joint)
    }

    #[must_use]
    pub fn last_sample(&self) -> &TelemetrySample {
        &self.last_sample
    }

    #[must_use]
    pub fn pending_commands(&self) -> usize {
        self.commands.len()
    }
}

impl<L, S, H, T, C> Drop for ControlLoop<'_, L, S, H, T, C>
where
    L: OutputLine,
    S: ServoOutput,
    H: SensorHub,
    T: TelemetrySink,
    C: Clock,
{
    fn drop(&mut self) {
        self.shutdown();
    }
}
