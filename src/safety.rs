use heapless::Vec;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

const MAX_SAFETY_EVENTS: usize = 16;

pub const DEFAULT_OBSTACLE_THRESHOLD_CM: f32 = 10.0;

/// Consecutive ranger timeouts before a streak is recorded (half a second at 100 ms ticks).
pub const TIMEOUT_STREAK_TICKS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SafetyLevel {
    Normal,
    Caution,
    Warning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SafetyEvent {
    ObstacleDetected,
    ObstacleCleared,
    RangerTimeoutStreak,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SafetyEventRecord {
    pub event: SafetyEvent,
    pub timestamp: u64,
    pub level: SafetyLevel,
    /// Distance that triggered the event, when one was available.
    pub distance_cm: Option<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SafetyState {
    pub obstacle_active: bool,
    pub obstacle_stops: u32,
    pub consecutive_timeouts: u32,
    pub timeout_streaks: u32,
}

/// What the loop has to do after this tick's evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SafetyActions {
    pub force_stop: bool,
}

#[derive(Debug)]
pub struct SafetyMonitor {
    state: SafetyState,
    event_history: Vec<SafetyEventRecord, MAX_SAFETY_EVENTS>,
    obstacle_threshold_cm: f32,
}

impl SafetyMonitor {
    #[must_use]
    pub fn new(obstacle_threshold_cm: f32) -> Self {
        Self {
            state: SafetyState::default(),
            event_history: Vec::new(),
            obstacle_threshold_cm,
        }
    }

    /// `distance_cm` is `None` when the ranger timed out this tick.
    ///
    /// A missing reading never triggers a stop; it only counts toward a timeout streak.
    pub fn evaluate(&mut self, current_time: u64, distance_cm: Option<f32>) -> SafetyActions {
        let mut actions = SafetyActions::default();

        let Some(distance) = distance_cm else {
            self.state.consecutive_timeouts = self.state.consecutive_timeouts.saturating_add(1);
            if self.state.consecutive_timeouts == TIMEOUT_STREAK_TICKS {
                self.state.timeout_streaks = self.state.timeout_streaks.saturating_add(1);
                warn!(ticks = TIMEOUT_STREAK_TICKS, "distance sensor keeps timing out");
                self.record_event(SafetyEvent::RangerTimeoutStreak, current_time, SafetyLevel::Caution, None);
            }
            return actions;
        };
        self.state.consecutive_timeouts = 0;

        if distance < self.obstacle_threshold_cm {
            actions.force_stop = true;
            self.state.obstacle_stops = self.state.obstacle_stops.saturating_add(1);
            if !self.state.obstacle_active {
                self.state.obstacle_active = true;
                warn!(distance_cm = distance, threshold_cm = self.obstacle_threshold_cm, "obstacle detected, stopping");
                self.record_event(SafetyEvent::ObstacleDetected, current_time, SafetyLevel::Warning, Some(distance));
            }
        } else if self.state.obstacle_active {
            self.state.obstacle_active = false;
            info!(distance_cm = distance, "obstacle cleared");
            self.record_event(SafetyEvent::ObstacleCleared, current_time, SafetyLevel::Normal, Some(distance));
        }

        actions
    }

    fn record_event(&mut self, event: SafetyEvent, timestamp: u64, level: SafetyLevel, distance_cm: Option<f32>) {
        if self.event_history.is_full() {
            self.event_history.remove(0);
        }

        let _ = self.event_history.push(SafetyEventRecord {
            event,
            timestamp,
            level,
            distance_cm,
        });
    }

    #[must_use]
    pub fn obstacle_threshold_cm(&self) -> f32 {
        self.obstacle_threshold_cm
    }

    #[must_use]
    pub fn get_state(&self) -> &SafetyState {
        &self.state
    }

    #[must_use]
    pub fn get_event_history(&self) -> &[SafetyEventRecord] {
        &self.event_history
    }

    pub fn clear_history(&mut self) {
        self.event_history.clear();
    }
}

impl Default for SafetyMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_OBSTACLE_THRESHOLD_CM)
    }
}
