use cartbot::sim::{ManualClock, SimHardware};
use cartbot::subsystems::arm::*;
use cartbot::subsystems::Joint;

fn arm() -> (SimHardware, ManualClock, ArmController<cartbot::sim::SimServo, ManualClock>) {
    let hw = SimHardware::new();
    let clock = ManualClock::new();
    let arm = ArmController::new(hw.arm_servos(), clock.clone(), ArmSettings::default());
    (hw, clock, arm)
}

#[test]
fn test_angle_to_pulse_is_monotonic_and_bounded() {
    let mut previous = 0;
    for angle in -20..=200 {
        let pulse = angle_to_pulse(angle);
        assert!(pulse >= MIN_PULSE_NS && pulse <= MAX_PULSE_NS);
        assert!(pulse >= previous, "pulse decreased at {}", angle);
        previous = pulse;
    }

    assert_eq!(angle_to_pulse(0), MIN_PULSE_NS);
    assert_eq!(angle_to_pulse(90), 1_500_000);
    assert_eq!(angle_to_pulse(180), MAX_PULSE_NS);
    assert_eq!(angle_to_pulse(-5), MIN_PULSE_NS);
    assert_eq!(angle_to_pulse(500), MAX_PULSE_NS);
}

#[test]
fn test_custom_pulse_range() {
    let range = PulseRange {
        min_ns: 1_000_000,
        max_ns: 2_000_000,
    };
    assert_eq!(range.angle_to_pulse(0), 1_000_000);
    assert_eq!(range.angle_to_pulse(90), 1_500_000);
    assert_eq!(range.angle_to_pulse(180), 2_000_000);
}

#[test]
fn test_default_calibration_is_identity_after_clamp() {
    let (_hw, _clock, arm) = arm();
    for joint in Joint::ALL {
        for angle in -30..=210 {
            assert_eq!(i32::from(arm.calibrate(joint, angle)), angle.clamp(0, 180));
        }
    }
}

#[test]
fn test_calibration_offset_and_invert() {
    let (_hw, _clock, mut arm) = arm();

    arm.set_calibration(Joint::Base, 10, false);
    assert_eq!(arm.calibrate(Joint::Base, 90), 100);
    assert_eq!(arm.calibrate(Joint::Base, 175), 180);

    arm.set_calibration(Joint::Elbow, 0, true);
    assert_eq!(arm.calibrate(Joint::Elbow, 30), 150);
    assert_eq!(arm.calibrate(Joint::Elbow, 200), 0);

    // Offset applies before inversion
    arm.set_calibration(Joint::Wrist, -20, true);
    assert_eq!(arm.calibrate(Joint::Wrist, 50), 150);
    assert_eq!(arm.calibrate(Joint::Wrist, 10), 180);

    assert_eq!(arm.calibration(Joint::Gripper), Calibration::default());
}

#[test]
fn test_move_records_logical_angle_and_writes_calibrated_pulse() {
    let (hw, _clock, mut arm) = arm();
    arm.set_calibration(Joint::Base, 0, true);

    arm.move_to(Joint::Base, 30).unwrap();

    assert_eq!(arm.angle(Joint::Base), Some(30));
    assert_eq!(hw.base.pulse_ns(), Some(angle_to_pulse(150)));
    assert!(hw.base.enabled());
}

#[test]
fn test_move_clamps_out_of_range_angles() {
    let (hw, _clock, mut arm) = arm();

    arm.move_to(Joint::Gripper, 200).unwrap();
    assert_eq!(arm.angle(Joint::Gripper), Some(180));
    assert_eq!(hw.gripper.pulse_ns(), Some(MAX_PULSE_NS));

    arm.move_to(Joint::Gripper, -40).unwrap();
    assert_eq!(arm.angle(Joint::Gripper), Some(0));
}

#[test]
fn test_recalibration_keeps_commanded_angle() {
    let (hw, _clock, mut arm) = arm();
    arm.move_to(Joint::Elbow, 60).unwrap();

    arm.set_calibration(Joint::Elbow, 15, false);
    assert_eq!(arm.angle(Joint::Elbow), Some(60));

    arm.move_to(Joint::Elbow, arm.angle(Joint::Elbow).map_or(0, i32::from)).unwrap();
    assert_eq!(hw.elbow.pulse_ns(), Some(angle_to_pulse(75)));
}

#[test]
fn test_smooth_move_requires_initialized_pose() {
    let (_hw, _clock, mut arm) = arm();

    assert_eq!(
        arm.move_smooth(Joint::Base, 45, 200),
        Err(ArmError::UninitializedPose(Joint::Base))
    );

    // A plain move does not establish a starting angle either
    arm.move_to(Joint::Base, 90).unwrap();
    assert_eq!(
        arm.move_smooth(Joint::Base, 45, 200),
        Err(ArmError::UninitializedPose(Joint::Base))
    );

    let pose = Pose::new().with(Joint::Base, 90).with(Joint::Elbow, 90);
    assert_eq!(
        arm.move_pose_smooth(&pose, 200),
        Err(ArmError::UninitializedPose(Joint::Base))
    );
}

#[test]
fn test_initialize_pose_moves_without_interpolation_then_settles() {
    let (hw, clock, mut arm) = arm();

    arm.initialize_pose(&Pose::uniform(90), 1000).unwrap();

    for joint in Joint::ALL {
        assert_eq!(arm.angle(joint), Some(90));
        assert!(arm.is_initialized(joint));
    }
    for servo in hw.servos() {
        assert_eq!(servo.history(), vec![angle_to_pulse(90)]);
    }
    assert_eq!(clock.slept_ms(), 1000);
}

#[test]
fn test_initialize_pose_only_covers_listed_joints() {
    let (_hw, _clock, mut arm) = arm();

    arm.initialize_pose(&Pose::new().with(Joint::Wrist, 120), 0).unwrap();

    assert!(arm.is_initialized(Joint::Wrist));
    assert!(!arm.is_initialized(Joint::Base));
    assert_eq!(arm.angle(Joint::Base), None);
}

#[test]
fn test_ease_in_out_curve() {
    assert!(ease_in_out(0.0).abs() < 1e-6);
    assert!((ease_in_out(0.5) - 0.5).abs() < 1e-6);
    assert!((ease_in_out(1.0) - 1.0).abs() < 1e-6);

    // Slow at both ends, fast in the middle
    let start = ease_in_out(0.1) - ease_in_out(0.0);
    let middle = ease_in_out(0.55) - ease_in_out(0.45);
    let end = ease_in_out(1.0) - ease_in_out(0.9);
    assert!(middle > start);
    assert!(middle > end);
}

#[test]
fn test_smooth_move_lands_exactly_on_target() {
    let (hw, clock, mut arm) = arm();
    arm.initialize_pose(&Pose::uniform(90), 0).unwrap();
    hw.base.clear_history();

    // 7 steps of 20 ms; 90 -> 13 does not divide evenly
    arm.move_smooth(Joint::Base, 13, 150).unwrap();

    assert_eq!(arm.angle(Joint::Base), Some(13));
    assert_eq!(hw.base.pulse_ns(), Some(angle_to_pulse(13)));
    assert_eq!(clock.slept_ms(), 7 * u64::from(STEP_PERIOD_MS));

    // One write per step plus the final exact write, never overshooting
    let history = hw.base.history();
    assert_eq!(history.len(), 8);
    assert!(history.windows(2).all(|w| w[1] <= w[0]));
}

#[test]
fn test_smooth_move_clamps_target() {
    let (_hw, _clock, mut arm) = arm();
    arm.initialize_pose(&Pose::uniform(90), 0).unwrap();

    arm.move_smooth(Joint::Elbow, 250, 100).unwrap();
    assert_eq!(arm.angle(Joint::Elbow), Some(180));
}

#[test]
fn test_short_duration_still_takes_one_step() {
    let (hw, clock, mut arm) = arm();
    arm.initialize_pose(&Pose::uniform(90), 0).unwrap();
    hw.wrist.clear_history();

    arm.move_smooth(Joint::Wrist, 100, 5).unwrap();

    assert_eq!(arm.steps_for(5), 1);
    assert_eq!(clock.slept_ms(), u64::from(STEP_PERIOD_MS));
    assert_eq!(hw.wrist.history().len(), 2);
    assert_eq!(arm.angle(Joint::Wrist), Some(100));
}

#[test]
fn test_pose_move_shares_one_time_base() {
    let (hw, clock, mut arm) = arm();
    arm.initialize_pose(&Pose::uniform(90), 0).unwrap();
    for servo in hw.servos() {
        servo.clear_history();
    }

    // Deltas differ only in sign
    let pose = Pose::new().with(Joint::Base, 130).with(Joint::Elbow, 50);
    arm.move_pose_smooth(&pose, 500).unwrap();

    let base = hw.base.history();
    let elbow = hw.elbow.history();
    assert_eq!(base.len(), elbow.len());
    assert_eq!(base.len(), 25 + 1);
    assert_eq!(clock.slept_ms(), 500);

    // Mirror images around 90 degrees at every step (pulse math floors, so allow 1 ns)
    let center = i64::from(angle_to_pulse(90));
    for (b, e) in base.iter().zip(elbow.iter()) {
        let up = i64::from(*b) - center;
        let down = center - i64::from(*e);
        assert!((up - down).abs() <= 1, "step mismatch: {} vs {}", up, down);
    }

    assert_eq!(arm.angle(Joint::Base), Some(130));
    assert_eq!(arm.angle(Joint::Elbow), Some(50));

    // Joints outside the pose are untouched
    assert!(hw.wrist.history().is_empty());
    assert!(hw.gripper.history().is_empty());
}

#[test]
fn test_servo_fault_is_reported_per_joint() {
    let (hw, _clock, mut arm) = arm();
    hw.wrist.set_failing(true);

    assert!(matches!(
        arm.move_to(Joint::Wrist, 45),
        Err(ArmError::Output { joint: Joint::Wrist, .. })
    ));

    // Initialization still reaches the healthy joints
    assert!(arm.initialize_pose(&Pose::uniform(90), 0).is_err());
    assert!(arm.is_initialized(Joint::Base));
    assert!(!arm.is_initialized(Joint::Wrist));
}

#[test]
fn test_stop_all_is_idempotent() {
    let (hw, _clock, mut arm) = arm();
    arm.initialize_pose(&Pose::uniform(90), 0).unwrap();

    arm.stop_all();
    arm.stop_all();

    for servo in hw.servos() {
        assert!(!servo.enabled());
        assert_eq!(servo.disables(), 2);
    }
    // Logical angles survive disabling
    assert_eq!(arm.angle(Joint::Base), Some(90));
}

#[test]
fn test_pose_serde_uses_joint_names() {
    let pose: Pose = serde_json::from_str(r#"{"base": 45, "gripper": 70}"#).unwrap();
    assert_eq!(pose.get(Joint::Base), Some(45));
    assert_eq!(pose.get(Joint::Gripper), Some(70));
    assert_eq!(pose.get(Joint::Elbow), None);

    let json = serde_json::to_string(&pose).unwrap();
    assert_eq!(json, r#"{"base":45,"gripper":70}"#);
}
