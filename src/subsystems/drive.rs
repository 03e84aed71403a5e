use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::hal::{HalError, OutputLine};
use crate::protocol::Directive;

/// Differential drive states over two H-bridges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DriveState {
    #[default]
    Stopped,
    Forward,
    Reverse,
    TurnLeft,
    TurnRight,
}

impl DriveState {
    /// Output levels as `[left_forward, left_reverse, right_forward, right_reverse]`.
    #[must_use]
    pub const fn pattern(self) -> [bool; 4] {
        match self {
            DriveState::Stopped => [false, false, false, false],
            DriveState::Forward => [true, false, true, false],
            DriveState::Reverse => [false, true, false, true],
            DriveState::TurnLeft => [false, true, true, false],
            DriveState::TurnRight => [true, false, false, true],
        }
    }
}

impl From<Directive> for DriveState {
    fn from(directive: Directive) -> Self {
        match directive {
            Directive::Forward => DriveState::Forward,
            Directive::Reverse => DriveState::Reverse,
            Directive::Left => DriveState::TurnLeft,
            Directive::Right => DriveState::TurnRight,
            Directive::Stop => DriveState::Stopped,
        }
    }
}

pub struct DriveLines<L> {
    pub left_forward: L,
    pub left_reverse: L,
    pub right_forward: L,
    pub right_reverse: L,
}

#[derive(Debug)]
pub struct DriveController<L: OutputLine> {
    lines: [L; 4],
    state: DriveState,
    transitions: u32,
}

impl<L: OutputLine> DriveController<L> {
    /// Claims the four bridge inputs and drives them to `Stopped`.
    ///
    /// # Errors
    ///
    /// The first line write that failed.
    pub fn new(lines: DriveLines<L>) -> Result<Self, HalError> {
        let mut controller = Self {
            lines: [
                lines.left_forward,
                lines.left_reverse,
                lines.right_forward,
                lines.right_reverse,
            ],
            state: DriveState::Stopped,
            transitions: 0,
        };
        controller.write_pattern(DriveState::Stopped)?;
        Ok(controller)
    }

    /// # Errors
    ///
    /// As [`DriveController::apply`].
    pub fn execute(&mut self, directive: Directive) -> Result<(), HalError> {
        self.apply(directive.into())
    }

    /// Writes all four lines for `state`, even when some of the writes fail.
    ///
    /// # Errors
    ///
    /// The first line write that failed. The recorded state is left unchanged.
    pub fn apply(&mut self, state: DriveState) -> Result<(), HalError> {
        self.write_pattern(state)?;
        if state != self.state {
            info!(from = ?self.state, to = ?state, "drive state change");
            self.transitions = self.transitions.wrapping_add(1);
        }
        self.state = state;
        Ok(())
    }

    /// # Errors
    ///
    /// As [`DriveController::apply`].
    pub fn stop(&mut self) -> Result<(), HalError> {
        self.apply(DriveState::Stopped)
    }

    #[must_use]
    pub fn state(&self) -> DriveState {
        self.state
    }

    #[must_use]
    pub fn transitions(&self) -> u32 {
        self.transitions
    }

    fn write_pattern(&mut self, state: DriveState) -> Result<(), HalError> {
        let mut result = Ok(());
        for (index, (line, level)) in self.lines.iter_mut().zip(state.pattern()).enumerate() {
            if let Err(e) = line.set_level(level) {
                error!(line = index, ?state, error = %e, "drive output write failed");
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }
}
