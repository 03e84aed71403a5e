//! Simulated peripherals and radio for host builds and tests.

pub mod hardware;
pub mod radio;

pub use hardware::{
    ManualClock, SimEcho, SimHardware, SimInput, SimLine, SimRegisterBus, SimSensors, SimServo,
};
pub use radio::{AdvertisingState, SimRadio, CENTRAL_OUTBOX_DEPTH};
