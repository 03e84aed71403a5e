use static_assertions::const_assert;
use thiserror::Error;
use tracing::debug;

use crate::hal::{Clock, EchoTimer, HalError, InputLine, RegisterBus};

/// Round-trip echo time per centimetre is `2 * 29.1 us`.
const US_PER_CM_ONE_WAY: f32 = 29.1;

pub const DEFAULT_ECHO_TIMEOUT_US: u32 = 30_000;
/// Longest echo wait the control tick can afford.
pub const MAX_ECHO_TIMEOUT_US: u32 = 30_000;
const_assert!(DEFAULT_ECHO_TIMEOUT_US <= MAX_ECHO_TIMEOUT_US);

pub const INA219_DEFAULT_ADDR: u8 = 0x40;
pub const INA219_DEFAULT_SHUNT_MILLIOHM: u32 = 100;
pub const INA219_DEFAULT_CURRENT_LSB_UA: u32 = 100;

pub const INA219_REG_CONFIG: u8 = 0x00;
pub const INA219_REG_BUS_VOLTAGE: u8 = 0x02;
pub const INA219_REG_CURRENT: u8 = 0x04;
pub const INA219_REG_CALIBRATION: u8 = 0x05;
// 32 V range, /8 gain, 12-bit averaging, continuous shunt + bus
const INA219_CONFIG_32V_2A: u16 = 0x399F;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SensorError {
    #[error("no echo within timeout")]
    Timeout,
    #[error(transparent)]
    Hal(#[from] HalError),
}

/// Read side of the cart's sensors, polled once per control tick.
pub trait SensorHub {
    /// # Errors
    ///
    /// [`SensorError::Timeout`] rather than blocking past the echo timeout.
    fn distance_cm(&mut self) -> Result<f32, SensorError>;
    /// # Errors
    ///
    /// [`SensorError::Hal`] when the power monitor cannot be read.
    fn voltage(&mut self) -> Result<f32, SensorError>;
    /// # Errors
    ///
    /// [`SensorError::Hal`] when the power monitor cannot be read.
    fn current_ma(&mut self) -> Result<f32, SensorError>;
    /// # Errors
    ///
    /// [`SensorError::Hal`] when either comparator input cannot be sampled.
    fn read_line_sensors(&mut self) -> Result<(bool, bool), SensorError>;

    /// One-off device setup at loop start.
    ///
    /// # Errors
    ///
    /// [`SensorError::Hal`] when a device rejects its configuration.
    fn configure(&mut self) -> Result<(), SensorError> {
        Ok(())
    }
}

/// HC-SR04 style ultrasonic ranger.
pub struct UltrasonicRanger<E, C> {
    echo: E,
    clock: C,
    timeout_us: u32,
}

impl<E: EchoTimer, C: Clock> UltrasonicRanger<E, C> {
    /// `timeout_us` is capped at [`MAX_ECHO_TIMEOUT_US`].
    #[must_use]
    pub fn new(echo: E, clock: C, timeout_us: u32) -> Self {
        Self {
            echo,
            clock,
            timeout_us: timeout_us.min(MAX_ECHO_TIMEOUT_US),
        }
    }

    #[must_use]
    pub fn timeout_us(&self) -> u32 {
        self.timeout_us
    }

    /// Echo high time in microseconds.
    ///
    /// # Errors
    ///
    /// [`SensorError::Timeout`] when no echo ends within the timeout, or the
    /// trigger/capture fault.
    pub fn measure_us(&mut self) -> Result<u32, SensorError> {
        self.echo.trigger()?;

        let started = self.clock.now_ms();
        let limit_ms = u64::from(self.timeout_us.div_ceil(1000));
        loop {
            match self.echo.poll_echo() {
                Ok(us) if us > self.timeout_us => return Err(SensorError::Timeout),
                Ok(us) => return Ok(us),
                Err(nb::Error::Other(e)) => return Err(e.into()),
                Err(nb::Error::WouldBlock) => {
                    if self.clock.now_ms().saturating_sub(started) >= limit_ms {
                        return Err(SensorError::Timeout);
                    }
                    self.clock.sleep_ms(1);
                }
            }
        }
    }

    /// # Errors
    ///
    /// As [`UltrasonicRanger::measure_us`].
    pub fn distance_cm(&mut self) -> Result<f32, SensorError> {
        self.measure_us()
            .map(|us| (f64::from(us) / 2.0 / f64::from(US_PER_CM_ONE_WAY)) as f32)
    }
}

/// INA219 high-side current / bus voltage monitor.
pub struct Ina219<B> {
    bus: B,
    addr: u8,
    shunt_milliohm: u32,
    current_lsb_ua: u32,
}

impl<B: RegisterBus> Ina219<B> {
    #[must_use]
    pub fn new(bus: B, addr: u8, shunt_milliohm: u32, current_lsb_ua: u32) -> Self {
        Self {
            bus,
            addr,
            shunt_milliohm,
            current_lsb_ua,
        }
    }

    #[must_use]
    pub fn with_defaults(bus: B) -> Self {
        Self::new(
            bus,
            INA219_DEFAULT_ADDR,
            INA219_DEFAULT_SHUNT_MILLIOHM,
            INA219_DEFAULT_CURRENT_LSB_UA,
        )
    }

    /// Calibration register value: `0.04096 / (current_lsb * r_shunt)`.
    #[must_use]
    pub fn calibration_value(&self) -> u16 {
        let divisor = (u64::from(self.current_lsb_ua) * u64::from(self.shunt_milliohm)).max(1);
        (40_960_000 / divisor).min(u64::from(u16::MAX)) as u16
    }

    /// Writes the configuration and calibration registers.
    ///
    /// # Errors
    ///
    /// [`HalError::Bus`] if either write is not acknowledged.
    pub fn configure(&mut self) -> Result<(), HalError> {
        let calibration = self.calibration_value();
        self.bus
            .write_register(self.addr, INA219_REG_CONFIG, INA219_CONFIG_32V_2A)?;
        self.bus
            .write_register(self.addr, INA219_REG_CALIBRATION, calibration)?;
        debug!(addr = self.addr, calibration, "INA219 configured");
        Ok(())
    }

    /// Bus voltage in volts (4 mV per bit, left-aligned by 3).
    ///
    /// # Errors
    ///
    /// [`HalError::Bus`] if the register read fails.
    pub fn bus_voltage(&mut self) -> Result<f32, HalError> {
        let raw = self.bus.read_register(self.addr, INA219_REG_BUS_VOLTAGE)?;
        Ok(f32::from(raw >> 3) * 0.004)
    }

    /// Signed current in milliamps; negative when current flows back through the shunt.
    ///
    /// # Errors
    ///
    /// [`HalError::Bus`] if the register read fails.
    pub fn current_ma(&mut self) -> Result<f32, HalError> {
        let raw = self.bus.read_register(self.addr, INA219_REG_CURRENT)?;
        // two's complement register
        let raw = i16::from_be_bytes(raw.to_be_bytes());
        Ok((f64::from(raw) * f64::from(self.current_lsb_ua) / 1000.0) as f32)
    }
}

/// Left/right LM393 line sensor comparators.
pub struct LinePair<I> {
    pub left: I,
    pub right: I,
}

impl<I: InputLine> LinePair<I> {
    #[must_use]
    pub fn new(left: I, right: I) -> Self {
        Self { left, right }
    }

    /// # Errors
    ///
    /// The first comparator read that failed.
    pub fn read(&mut self) -> Result<(bool, bool), HalError> {
        Ok((self.left.is_high()?, self.right.is_high()?))
    }
}

/// The cart's sensor set as wired on the board.
pub struct Sensors<E, C, B, I> {
    pub ranger: UltrasonicRanger<E, C>,
    pub power: Ina219<B>,
    pub lines: LinePair<I>,
}

impl<E: EchoTimer, C: Clock, B: RegisterBus, I: InputLine> SensorHub for Sensors<E, C, B, I> {
    fn distance_cm(&mut self) -> Result<f32, SensorError> {
        self.ranger.distance_cm()
    }

    fn voltage(&mut self) -> Result<f32, SensorError> {
        Ok(self.power.bus_voltage()?)
    }

    fn current_ma(&mut self) -> Result<f32, SensorError> {
        Ok(self.power.current_ma()?)
    }

    fn read_line_sensors(&mut self) -> Result<(bool, bool), SensorError> {
        Ok(self.lines.read()?)
    }

    fn configure(&mut self) -> Result<(), SensorError> {
        Ok(self.power.configure()?)
    }
}
