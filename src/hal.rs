//! Hardware seams used by the drive, arm and sensor leaves.
//!
//! Every trait here is small enough for a board support crate to implement
//! directly on its GPIO/PWM/I2C peripherals. The [`crate::sim`] module provides
//! host-side implementations for tests and the simulator binary.
//!
//! # Errors
//!
//! Fallible methods return [`HalError`] describing the peripheral access that
//! failed. Callers decide whether that is fatal.

use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HalError {
    #[error("output write failed")]
    Write,
    #[error("input read failed")]
    Read,
    #[error("bus transaction failed (addr {addr:#04x})")]
    Bus { addr: u8 },
    #[error("peripheral not available")]
    Unavailable,
}

/// Push-pull digital output (one H-bridge input).
pub trait OutputLine {
    /// # Errors
    ///
    /// [`HalError::Write`] if the pin could not be driven.
    fn set_level(&mut self, high: bool) -> Result<(), HalError>;

    /// # Errors
    ///
    /// As [`OutputLine::set_level`].
    fn set_high(&mut self) -> Result<(), HalError> {
        self.set_level(true)
    }

    /// # Errors
    ///
    /// As [`OutputLine::set_level`].
    fn set_low(&mut self) -> Result<(), HalError> {
        self.set_level(false)
    }
}

/// Digital input (line sensor comparator output).
pub trait InputLine {
    /// # Errors
    ///
    /// [`HalError::Read`] if the pin could not be sampled.
    fn is_high(&mut self) -> Result<bool, HalError>;
}

/// 50 Hz PWM channel driving one hobby servo.
pub trait ServoOutput {
    /// Sets the high time of each period in nanoseconds, enabling the output if needed.
    ///
    /// # Errors
    ///
    /// [`HalError::Write`] if the PWM peripheral refused the duty cycle.
    fn set_pulse_ns(&mut self, pulse_ns: u32) -> Result<(), HalError>;

    /// Stops emitting pulses. Must be safe to call on an already disabled output.
    ///
    /// # Errors
    ///
    /// [`HalError::Write`] if the channel could not be turned off.
    fn disable(&mut self) -> Result<(), HalError>;
}

/// 16-bit register access on an I2C-style bus.
pub trait RegisterBus {
    /// # Errors
    ///
    /// [`HalError::Bus`] when the device does not acknowledge.
    fn read_register(&mut self, addr: u8, reg: u8) -> Result<u16, HalError>;
    /// # Errors
    ///
    /// [`HalError::Bus`] when the device does not acknowledge.
    fn write_register(&mut self, addr: u8, reg: u8, value: u16) -> Result<(), HalError>;
}

/// Ultrasonic trigger/echo pair.
pub trait EchoTimer {
    /// Emits the trigger pulse and arms the echo capture.
    ///
    /// # Errors
    ///
    /// [`HalError::Write`] if the trigger pin could not be driven.
    fn trigger(&mut self) -> Result<(), HalError>;

    /// Returns the echo high time in microseconds once the falling edge has been seen.
    ///
    /// # Errors
    ///
    /// [`nb::Error::WouldBlock`] until the edge arrives, or the capture fault.
    fn poll_echo(&mut self) -> nb::Result<u32, HalError>;
}

/// Monotonic millisecond time base with a blocking delay.
pub trait Clock {
    fn now_ms(&self) -> u64;
    fn sleep_ms(&self, ms: u32);
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now_ms(&self) -> u64 {
        (**self).now_ms()
    }

    fn sleep_ms(&self, ms: u32) {
        (**self).sleep_ms(ms);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    fn sleep_ms(&self, ms: u32) {
        if ms > 0 {
            std::thread::sleep(Duration::from_millis(u64::from(ms)));
        }
    }
}
