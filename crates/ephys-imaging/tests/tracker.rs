//! Pipette tracking against frames rendered by the mock camera.

use ephys_core::{EphysError, Frame};
use ephys_hardware::capabilities::Imager;
use ephys_hardware::drivers::mock::MockRig;
use ephys_hardware::MockRigConfig;
use ephys_imaging::{PipetteTracker, TrackerConfig};
use serial_test::serial;
use std::sync::Arc;
use std::time::Duration;

const UM: f64 = 1e-6;

fn tracker(rig: &MockRig) -> Arc<PipetteTracker> {
    PipetteTracker::new(
        Arc::clone(&rig.pipette),
        Arc::clone(&rig.camera) as Arc<dyn Imager>,
        TrackerConfig::default(),
    )
    .unwrap()
}

fn with_reference(rig: &MockRig) -> Arc<PipetteTracker> {
    let tracker = tracker(rig);
    let config = tracker.config().clone();
    let key = tracker
        .take_reference_frames(config.reference_z_range, config.reference_z_step)
        .unwrap()
        .get_result(Some(Duration::from_secs(10)))
        .unwrap();
    assert_eq!(key, "40x");
    tracker
}

fn snap(rig: &MockRig) -> Frame {
    let mut frames = rig
        .camera
        .acquire_frames(Some(1))
        .get_result(Some(Duration::from_secs(1)))
        .unwrap();
    frames.remove(0)
}

fn assert_near(actual: [f64; 3], expected: [f64; 3], tolerance: f64) {
    for axis in 0..3 {
        assert!(
            (actual[axis] - expected[axis]).abs() <= tolerance,
            "axis {axis}: {actual:?} vs {expected:?}"
        );
    }
}

#[test]
#[serial]
fn test_reference_stack_restores_pipette_and_focus() {
    let rig = MockRig::new(&MockRigConfig::default()).unwrap();
    let tracker = with_reference(&rig);

    assert!(tracker.has_reference());
    let reference = tracker.reference("40x").unwrap();
    assert_eq!(reference.frames.len(), 9);
    assert_eq!(reference.z_offsets.len(), 9);
    assert_eq!(reference.center_index, 4);
    assert!((reference.center_pos.0 - 12.0).abs() < 0.5);
    assert!((reference.center_pos.1 - 12.0).abs() < 0.5);
    assert_eq!(reference.pixel_size, 1e-6);

    assert_near(rig.pipette.global_tip_position(), [0.0; 3], 1e-6);
    assert!(rig.camera.focus_depth().unwrap().abs() < 1e-6);
    rig.shutdown();
}

#[test]
#[serial]
fn test_tip_located_where_reported() {
    let rig = MockRig::new(&MockRigConfig::default()).unwrap();
    let tracker = with_reference(&rig);

    let found = tracker.measure_tip_position(&snap(&rig), None, None).unwrap();
    assert!(found.score > 0.8, "score {}", found.score);
    assert_eq!(found.frame_index, 4);
    assert_near(found.position, rig.pipette.global_tip_position(), 0.5 * UM);
    rig.shutdown();
}

#[test]
#[serial]
fn test_calibration_error_measured_and_corrected() {
    let rig = MockRig::new(&MockRigConfig::default()).unwrap();
    let tracker = with_reference(&rig);
    rig.camera.set_true_tip_offset(Some([3.0 * UM, -2.0 * UM, 0.0]));

    let frame = snap(&rig);
    let error = tracker.measure_error(&frame, None, None).unwrap();
    assert_near(error, [3.0 * UM, -2.0 * UM, 0.0], 0.5 * UM);

    let applied = tracker.find_tip_in_frame(&frame, true).unwrap();
    assert_near(applied, error, 1e-12);
    assert!(rig.pipette.is_calibrated());
    assert_near(rig.pipette.global_tip_position(), [3.0 * UM, -2.0 * UM, 0.0], 0.5 * UM);
    rig.shutdown();
}

#[test]
#[serial]
fn test_missing_tip_fails_detection() {
    let rig = MockRig::new(&MockRigConfig::default()).unwrap();
    let tracker = with_reference(&rig);
    rig.camera.detach_pipette();

    let err = tracker.measure_tip_position(&snap(&rig), None, None).unwrap_err();
    assert!(matches!(err, EphysError::DetectionFailure(_)), "{err}");
    rig.shutdown();
}

#[test]
#[serial]
fn test_no_reference_is_a_configuration_error() {
    let rig = MockRig::new(&MockRigConfig::default()).unwrap();
    let tracker = tracker(&rig);
    assert!(!tracker.has_reference());
    let err = tracker.measure_tip_position(&snap(&rig), None, None).unwrap_err();
    assert!(matches!(err, EphysError::Configuration(_)));
    rig.shutdown();
}
