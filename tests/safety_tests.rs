use cartbot::safety::*;

#[test]
fn test_clear_path_needs_no_action() {
    let mut monitor = SafetyMonitor::default();

    let actions = monitor.evaluate(0, Some(120.0));

    assert!(!actions.force_stop);
    assert!(monitor.get_event_history().is_empty());
    assert_eq!(monitor.obstacle_threshold_cm(), DEFAULT_OBSTACLE_THRESHOLD_CM);
}

#[test]
fn test_obstacle_forces_stop_every_tick_but_logs_once() {
    let mut monitor = SafetyMonitor::new(10.0);

    for t in 0..3 {
        assert!(monitor.evaluate(t * 100, Some(8.0)).force_stop);
    }

    let state = monitor.get_state();
    assert!(state.obstacle_active);
    assert_eq!(state.obstacle_stops, 3);

    let history = monitor.get_event_history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].event, SafetyEvent::ObstacleDetected);
    assert_eq!(history[0].level, SafetyLevel::Warning);
    assert_eq!(history[0].distance_cm, Some(8.0));
    assert_eq!(history[0].timestamp, 0);
}

#[test]
fn test_obstacle_clears_above_threshold() {
    let mut monitor = SafetyMonitor::new(10.0);
    monitor.evaluate(0, Some(5.0));

    // Exactly at the threshold is not an obstacle
    assert!(!monitor.evaluate(100, Some(10.0)).force_stop);

    let history = monitor.get_event_history();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].event, SafetyEvent::ObstacleCleared);
    assert_eq!(history[1].timestamp, 100);
    assert!(!monitor.get_state().obstacle_active);
}

#[test]
fn test_timeout_never_stops_and_keeps_obstacle_state() {
    let mut monitor = SafetyMonitor::new(10.0);
    monitor.evaluate(0, Some(5.0));

    assert!(!monitor.evaluate(100, None).force_stop);
    assert!(monitor.get_state().obstacle_active);
    assert_eq!(monitor.get_state().consecutive_timeouts, 1);
}

#[test]
fn test_timeout_streak_is_recorded_once_per_streak() {
    let mut monitor = SafetyMonitor::default();

    for t in 0..(TIMEOUT_STREAK_TICKS as u64 * 2) {
        monitor.evaluate(t, None);
    }
    assert_eq!(monitor.get_state().timeout_streaks, 1);
    assert_eq!(monitor.get_event_history().len(), 1);
    assert_eq!(monitor.get_event_history()[0].event, SafetyEvent::RangerTimeoutStreak);
    assert_eq!(monitor.get_event_history()[0].level, SafetyLevel::Caution);

    // A good reading resets the count
    monitor.evaluate(100, Some(50.0));
    assert_eq!(monitor.get_state().consecutive_timeouts, 0);
    for t in 0..TIMEOUT_STREAK_TICKS as u64 {
        monitor.evaluate(200 + t, None);
    }
    assert_eq!(monitor.get_state().timeout_streaks, 2);
}

#[test]
fn test_event_history_is_bounded() {
    let mut monitor = SafetyMonitor::new(10.0);

    // Each pair records a detect and a clear
    for i in 0..20u64 {
        monitor.evaluate(i * 2, Some(1.0));
        monitor.evaluate(i * 2 + 1, Some(30.0));
    }

    let history = monitor.get_event_history();
    assert_eq!(history.len(), 16);
    // Oldest entries were evicted first
    assert_eq!(history[0].timestamp, 24);
    assert_eq!(history[15].timestamp, 39);

    monitor.clear_history();
    assert!(monitor.get_event_history().is_empty());
    assert_eq!(monitor.get_state().obstacle_stops, 20);
}
