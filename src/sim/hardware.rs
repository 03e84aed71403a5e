//! Host-side peripherals.
//!
//! Every handle is a cheap clone over shared state: give one clone to a
//! controller and keep another to observe or script it.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::config::SensorConfig;
use crate::hal::{Clock, EchoTimer, HalError, InputLine, OutputLine, RegisterBus, ServoOutput};
use crate::subsystems::arm::ArmServos;
use crate::subsystems::drive::DriveLines;
use crate::subsystems::sensors::{
    Ina219, LinePair, Sensors, UltrasonicRanger, INA219_DEFAULT_ADDR, INA219_REG_BUS_VOLTAGE,
    INA219_REG_CURRENT,
};

/// Round-trip echo microseconds per centimetre.
const ECHO_US_PER_CM: f32 = 58.2;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Default)]
pub struct SimLine {
    level: Arc<AtomicBool>,
    writes: Arc<AtomicU32>,
    failing: Arc<AtomicBool>,
}

impl SimLine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn level(&self) -> bool {
        self.level.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn writes(&self) -> u32 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl OutputLine for SimLine {
    fn set_level(&mut self, high: bool) -> Result<(), HalError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(HalError::Write);
        }
        self.level.store(high, Ordering::SeqCst);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct SimInput {
    level: Arc<AtomicBool>,
    failing: Arc<AtomicBool>,
}

impl SimInput {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, high: bool) {
        self.level.store(high, Ordering::SeqCst);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl InputLine for SimInput {
    fn is_high(&mut self) -> Result<bool, HalError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(HalError::Read);
        }
        Ok(self.level.load(Ordering::SeqCst))
    }
}

#[derive(Debug, Default)]
struct ServoState {
    pulse_ns: Option<u32>,
    enabled: bool,
    history: Vec<u32>,
    disables: u32,
    failing: bool,
}

#[derive(Debug, Clone, Default)]
pub struct SimServo {
    state: Arc<Mutex<ServoState>>,
}

impl SimServo {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Last pulse written, kept after the output is disabled.
    #[must_use]
    pub fn pulse_ns(&self) -> Option<u32> {
        lock(&self.state).pulse_ns
    }

    #[must_use]
    pub fn enabled(&self) -> bool {
        lock(&self.state).enabled
    }

    /// Every pulse written, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<u32> {
        lock(&self.state).history.clone()
    }

    pub fn clear_history(&self) {
        lock(&self.state).history.clear();
    }

    #[must_use]
    pub fn disables(&self) -> u32 {
        lock(&self.state).disables
    }

    pub fn set_failing(&self, failing: bool) {
        lock(&self.state).failing = failing;
    }
}

impl ServoOutput for SimServo {
    fn set_pulse_ns(&mut self, pulse_ns: u32) -> Result<(), HalError> {
        let mut state = lock(&self.state);
        if state.failing {
            return Err(HalError::Write);
        }
        state.pulse_ns = Some(pulse_ns);
        state.enabled = true;
        state.history.push(pulse_ns);
        Ok(())
    }

    fn disable(&mut self) -> Result<(), HalError> {
        let mut state = lock(&self.state);
        state.enabled = false;
        state.disables = state.disables.saturating_add(1);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct EchoState {
    distance_cm: Option<f32>,
    armed: bool,
    triggers: u32,
    failing: bool,
}

/// Ultrasonic echo. With no target set it never answers, like an open field.
#[derive(Debug, Clone, Default)]
pub struct SimEcho {
    state: Arc<Mutex<EchoState>>,
}

impl SimEcho {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_distance(distance_cm: f32) -> Self {
        let echo = Self::new();
        echo.set_distance_cm(Some(distance_cm));
        echo
    }

    pub fn set_distance_cm(&self, distance_cm: Option<f32>) {
        lock(&self.state).distance_cm = distance_cm;
    }

    #[must_use]
    pub fn triggers(&self) -> u32 {
        lock(&self.state).triggers
    }

    pub fn set_failing(&self, failing: bool) {
        lock(&self.state).failing = failing;
    }
}

impl EchoTimer for SimEcho {
    fn trigger(&mut self) -> Result<(), HalError> {
        let mut state = lock(&self.state);
        if state.failing {
            return Err(HalError::Write);
        }
        state.armed = true;
        state.triggers = state.triggers.saturating_add(1);
        Ok(())
    }

    fn poll_echo(&mut self) -> nb::Result<u32, HalError> {
        let mut state = lock(&self.state);
        if !state.armed {
            return Err(nb::Error::Other(HalError::Unavailable));
        }
        match state.distance_cm {
            Some(distance) => {
                state.armed = false;
                Ok((distance.max(0.0) * ECHO_US_PER_CM).round() as u32)
            }
            None => Err(nb::Error::WouldBlock),
        }
    }
}

#[derive(Debug, Default)]
struct BusState {
    registers: BTreeMap<(u8, u8), u16>,
    writes: Vec<(u8, u8, u16)>,
    failing: bool,
}

/// Register file shared by every device on the bus. Unset registers read as zero.
#[derive(Debug, Clone, Default)]
pub struct SimRegisterBus {
    state: Arc<Mutex<BusState>>,
}

impl SimRegisterBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_register(&self, addr: u8, reg: u8, value: u16) {
        lock(&self.state).registers.insert((addr, reg), value);
    }

    #[must_use]
    pub fn register(&self, addr: u8, reg: u8) -> Option<u16> {
        lock(&self.state).registers.get(&(addr, reg)).copied()
    }

    #[must_use]
    pub fn writes(&self) -> Vec<(u8, u8, u16)> {
        lock(&self.state).writes.clone()
    }

    pub fn set_failing(&self, failing: bool) {
        lock(&self.state).failing = failing;
    }

    /// Loads INA219 readings as the chip would report them with the default calibration.
    pub fn set_power(&self, addr: u8, volts: f32, milliamps: f32) {
        let bus_raw = ((volts / 0.004).round() as u16) << 3;
        let current_raw = (milliamps * 10.0).round() as i16 as u16;
        self.set_register(addr, INA219_REG_BUS_VOLTAGE, bus_raw);
        self.set_register(addr, INA219_REG_CURRENT, current_raw);
    }
}

impl RegisterBus for SimRegisterBus {
    fn read_register(&mut self, addr: u8, reg: u8) -> Result<u16, HalError> {
        let state = lock(&self.state);
        if state.failing {
            return Err(HalError::Bus { addr });
        }
        Ok(state.registers.get(&(addr, reg)).copied().unwrap_or(0))
    }

    fn write_register(&mut self, addr: u8, reg: u8, value: u16) -> Result<(), HalError> {
        let mut state = lock(&self.state);
        if state.failing {
            return Err(HalError::Bus { addr });
        }
        state.registers.insert((addr, reg), value);
        state.writes.push((addr, reg, value));
        Ok(())
    }
}

/// Virtual time. `sleep_ms` returns immediately and advances the clock.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now_ms: Arc<AtomicU64>,
    slept_ms: Arc<AtomicU64>,
}

impl ManualClock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, ms: u64) {
        self.now_ms.fetch_add(ms, Ordering::SeqCst);
    }

    /// Total time spent in `sleep_ms`.
    #[must_use]
    pub fn slept_ms(&self) -> u64 {
        self.slept_ms.load(Ordering::SeqCst)
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }

    fn sleep_ms(&self, ms: u32) {
        self.now_ms.fetch_add(u64::from(ms), Ordering::SeqCst);
        self.slept_ms.fetch_add(u64::from(ms), Ordering::SeqCst);
    }
}

pub type SimSensors<C> = Sensors<SimEcho, C, SimRegisterBus, SimInput>;

/// A full set of simulated cart peripherals.
#[derive(Debug, Clone, Default)]
pub struct SimHardware {
    pub left_forward: SimLine,
    pub left_reverse: SimLine,
    pub right_forward: SimLine,
    pub right_reverse: SimLine,
    pub base: SimServo,
    pub elbow: SimServo,
    pub wrist: SimServo,
    pub gripper: SimServo,
    pub echo: SimEcho,
    pub bus: SimRegisterBus,
    pub line_left: SimInput,
    pub line_right: SimInput,
}

impl SimHardware {
    /// Battery at 7.4 V drawing 350 mA, nothing in front of the ranger.
    #[must_use]
    pub fn new() -> Self {
        let hardware = Self::default();
        hardware.bus.set_power(INA219_DEFAULT_ADDR, 7.4, 350.0);
        hardware
    }

    #[must_use]
    pub fn drive_lines(&self) -> DriveLines<SimLine> {
        DriveLines {
            left_forward: self.left_forward.clone(),
            left_reverse: self.left_reverse.clone(),
            right_forward: self.right_forward.clone(),
            right_reverse: self.right_reverse.clone(),
        }
    }

    #[must_use]
    pub fn arm_servos(&self) -> ArmServos<SimServo> {
        ArmServos {
            base: self.base.clone(),
            elbow: self.elbow.clone(),
            wrist: self.wrist.clone(),
            gripper: self.gripper.clone(),
        }
    }

    #[must_use]
    pub fn sensors<C: Clock>(&self, clock: C, config: &SensorConfig) -> SimSensors<C> {
        Sensors {
            ranger: UltrasonicRanger::new(self.echo.clone(), clock, config.echo_timeout_us),
            power: Ina219::new(
                self.bus.clone(),
                config.ina219_addr,
                config.shunt_milliohm,
                config.current_lsb_ua,
            ),
            lines: LinePair::new(self.line_left.clone(), self.line_right.clone()),
        }
    }

    /// Levels as `[left_forward, left_reverse, right_forward, right_reverse]`.
    #[must_use]
    pub fn drive_levels(&self) -> [bool; 4] {
        [
            self.left_forward.level(),
            self.left_reverse.level(),
            self.right_forward.level(),
            self.right_reverse.level(),
        ]
    }

    #[must_use]
    pub fn servos(&self) -> [&SimServo; 4] {
        [&self.base, &self.elbow, &self.wrist, &self.gripper]
    }
}
