use arrayvec::ArrayString;
use core::fmt::{self, Write};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const MAX_TELEMETRY_SIZE: usize = 96;

/// Value written in place of a reading that could not be taken this tick.
pub const SENSOR_SENTINEL: f32 = -1.0;

// Real readings go on the wire in `0.0..=WIRE_LIMIT`, so the longest record
// fits a `TelemetryBuffer` and negative values only ever mean the sentinel.
const WIRE_LIMIT: f32 = 99_999.0;

pub type TelemetryBuffer = ArrayString<MAX_TELEMETRY_SIZE>;

/// One tick's worth of sensor readings. `None` marks a timed out or failed read.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub distance_cm: Option<f32>,
    pub voltage: Option<f32>,
    pub current_ma: Option<f32>,
    pub line_left: bool,
    pub line_right: bool,
}

impl TelemetrySample {
    /// Serializes to `dist:<.1>,volt:<.2>,curr:<.0>,line_l:<0|1>,line_r:<0|1>`.
    ///
    /// Missing readings encode as `-1`. Negative readings, such as reverse
    /// current through the shunt, are reported as zero.
    #[must_use]
    pub fn encode(&self) -> TelemetryBuffer {
        let mut buffer = TelemetryBuffer::new();
        if write!(buffer, "{self}").is_err() {
            buffer.clear();
        }
        buffer
    }
}

impl fmt::Display for TelemetrySample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "dist:{:.1},volt:{:.2},curr:{:.0},line_l:{},line_r:{}",
            wire_value(self.distance_cm),
            wire_value(self.voltage),
            wire_value(self.current_ma),
            u8::from(self.line_left),
            u8::from(self.line_right),
        )
    }
}

fn wire_value(reading: Option<f32>) -> f32 {
    match reading {
        // adding 0.0 turns -0.0 into 0.0
        Some(value) if value.is_finite() => value.clamp(0.0, WIRE_LIMIT) + 0.0,
        _ => SENSOR_SENTINEL,
    }
}

/// Outcome of one broadcast to the connected centrals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NotifyReport {
    pub delivered: u8,
    pub failed: u8,
}

/// Destination for the per-tick telemetry sample.
pub trait TelemetrySink {
    fn publish(&self, sample: &TelemetrySample) -> NotifyReport;
}

impl<T: TelemetrySink + ?Sized> TelemetrySink for &T {
    fn publish(&self, sample: &TelemetrySample) -> NotifyReport {
        (**self).publish(sample)
    }
}

impl<T: TelemetrySink + ?Sized> TelemetrySink for Arc<T> {
    fn publish(&self, sample: &TelemetrySample) -> NotifyReport {
        (**self).publish(sample)
    }
}
