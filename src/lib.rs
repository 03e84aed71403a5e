//! # Cartbot
//!
//! Control core for a small delivery cart: two motor pairs on H-bridges, a
//! four-joint servo arm, an ultrasonic ranger, a power monitor and two line
//! sensors, driven over a BLE command/telemetry service.
//!
//! ## Features
//!
//! - **Command link**: GATT write characteristic for text commands, notify characteristic for telemetry
//! - **Lock-free hand-off**: SPSC command queue between the radio callback and the loop
//! - **Drive state machine**: every transition writes all four bridge inputs
//! - **Eased arm motion**: single joints or whole poses on one shared time base
//! - **Safety**: obstacle stop, and outputs safed on every exit path
//! - **Host simulation**: simulated peripherals and radio for tests and the `cartbot-sim` binary
//!
//! ## Quick Start
//!
//! ```rust
//! use cartbot::sim::{ManualClock, SimHardware};
//! use cartbot::{ArmController, ArmSettings, CommandQueue, CommandToken, ControlLoop, DriveController};
//! use cartbot::{LoopSettings, NotifyReport, TelemetrySample, TelemetrySink};
//! use cartbot::config::SensorConfig;
//!
//! struct Discard;
//! impl TelemetrySink for Discard {
//!     fn publish(&self, _: &TelemetrySample) -> NotifyReport {
//!         NotifyReport::default()
//!     }
//! }
//!
//! let hw = SimHardware::new();
//! let clock = ManualClock::new();
//! let mut queue = CommandQueue::new();
//! let (mut tx, rx) = queue.split();
//!
//! let drive = DriveController::new(hw.drive_lines()).unwrap();
//! let arm = ArmController::new(hw.arm_servos(), clock.clone(), ArmSettings::default());
//! let sensors = hw.sensors(clock.clone(), &SensorConfig::default());
//! let mut cart = ControlLoop::new(drive, arm, sensors, Discard, rx, clock, LoopSettings::default());
//!
//! cart.start().unwrap();
//! tx.push(CommandToken::from("FORWARD").unwrap()).unwrap();
//! cart.tick().unwrap();
//! cart.shutdown();
//! ```
//!
//! ## Architecture
//!
//! - [`channel`] - GATT service, connection set and advertising
//! - [`queue`] - Command hand-off between the radio and the loop
//! - [`control`] - Fixed-cadence control loop
//! - [`subsystems`] - Drive, arm and sensor leaves
//! - [`protocol`] - Command vocabulary and advertising payload framing
//! - [`telemetry`] - Telemetry wire format
//! - [`safety`] - Obstacle stop and safety event history
//! - [`config`] - JSON configuration
//! - [`hal`] - Hardware traits
//! - [`sim`] - Host-side implementations of [`hal`] and the radio

#![deny(warnings)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod channel;
pub mod config;
pub mod control;
pub mod hal;
pub mod protocol;
pub mod queue;
pub mod safety;
pub mod sim;
pub mod subsystems;
pub mod telemetry;

// Re-export main public types for convenience
pub use channel::{BleRadio, ChannelSettings, CommandChannel, ConnectionSet, RadioEvent};
pub use config::CartConfig;
pub use control::{ControlLoop, LoopSettings, LoopState, LoopStats};
pub use protocol::{AdvertisingPayload, Command, CommandToken, Directive, Uuid128};
pub use queue::{CommandQueue, CommandReceiver, CommandSender};
pub use subsystems::{ArmController, ArmSettings, DriveController, DriveState, Joint, Pose};
pub use telemetry::{NotifyReport, TelemetrySample, TelemetrySink};
