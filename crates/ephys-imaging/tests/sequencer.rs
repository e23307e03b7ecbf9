//! Sequencer runs against the mock rig.

use ephys_core::{EphysError, Frame, Future, Result};
use ephys_hardware::capabilities::Imager;
use ephys_hardware::drivers::mock::{MockCamera, MockRig};
use ephys_hardware::{DeviceReservations, MockRigConfig, MoveFuture, Speed};
use ephys_imaging::{ImageSequencer, MemoryStorage, SequenceEvent, SequencerConfig, SequencerProtocol};
use parking_lot::Mutex;
use serial_test::serial;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn rig() -> MockRig {
    MockRig::new(&MockRigConfig::default()).unwrap()
}

fn sequencer(rig: &MockRig) -> ImageSequencer {
    ImageSequencer::new(Arc::clone(&rig.camera) as Arc<dyn Imager>, SequencerConfig::default()).unwrap()
}

#[test]
#[serial]
fn test_z_stack_one_frame_per_micron() {
    let rig = rig();
    assert_eq!(rig.camera.estimated_frame_rate(), 100.0);
    let seq = sequencer(&rig);

    let run = seq.start(SequencerProtocol::z_stack(0.0, 100e-6, 1e-6)).unwrap();
    let result = run.get_result(Some(Duration::from_secs(10))).unwrap();

    assert_eq!(result.iterations.len(), 1);
    let stack = &result.iterations[0];
    assert_eq!(stack.len(), 101);
    for (k, frame) in stack.iter().enumerate() {
        let expected = k as f64 * 1e-6;
        assert!(
            (frame.depth - expected).abs() <= 0.5e-6 + 1e-12,
            "frame {k} at {} um",
            frame.depth * 1e6
        );
    }

    // Optics released, focus ended at the far end.
    assert!(!rig.camera.is_shutter_open());
    assert!(!rig.camera.is_focus_held());
    assert_eq!(rig.camera.shutter_log(), vec![true, false]);
    assert!(!rig.camera.is_acquiring());
    assert!((rig.camera.focus_depth().unwrap() - 100e-6).abs() < 1e-9);
    rig.shutdown();
}

#[test]
#[serial]
fn test_descending_z_stack_follows_direction() {
    let rig = rig();
    let seq = sequencer(&rig);
    let run = seq.start(SequencerProtocol::z_stack(10e-6, 0.0, 2e-6)).unwrap();
    let result = run.get_result(Some(Duration::from_secs(10))).unwrap();
    let depths: Vec<f64> = result.frames().map(|f| f.depth).collect();
    assert_eq!(depths.len(), 6);
    for (k, depth) in depths.iter().enumerate() {
        let expected = 10e-6 - k as f64 * 2e-6;
        assert!((depth - expected).abs() <= 1e-6 + 1e-12, "frame {k}: {depth}");
    }
    rig.shutdown();
}

#[test]
#[serial]
fn test_shutter_closed_after_stop() {
    let rig = rig();
    let seq = sequencer(&rig);
    let run = seq.start(SequencerProtocol::z_stack(0.0, 200e-6, 1e-6)).unwrap();
    std::thread::sleep(Duration::from_millis(300));
    seq.stop();

    assert!(run.wait_until_done(Some(Duration::from_secs(2))));
    assert!(run.was_interrupted());
    assert!(!rig.camera.is_shutter_open());
    assert!(!rig.camera.is_focus_held());
    rig.shutdown();
}

#[test]
#[serial]
fn test_timelapse_saves_each_frame() {
    let rig = rig();
    let seq = sequencer(&rig);
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    seq.sequence_event().connect(move |e: &SequenceEvent| sink.lock().push(e.clone()));

    let storage = Arc::new(MemoryStorage::new());
    let protocol = SequencerProtocol {
        save: true,
        storage: Some(Arc::clone(&storage) as _),
        ..SequencerProtocol::timelapse(3, 0.05)
    };
    let started = Instant::now();
    let run = seq.start(protocol).unwrap();
    let result = run.get_result(Some(Duration::from_secs(5))).unwrap();

    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(result.len(), 3);
    assert_eq!(storage.names(), vec!["frame_000", "frame_001", "frame_002"]);
    assert_eq!(storage.info()["timelapseCount"], serde_json::json!(3));

    let events = events.lock();
    assert_eq!(events.first(), Some(&SequenceEvent::Started { iterations: 3 }));
    assert_eq!(events.last(), Some(&SequenceEvent::Finished { interrupted: false }));
    let acquired = events
        .iter()
        .filter(|e| matches!(e, SequenceEvent::FramesAcquired { frames: 1, .. }))
        .count();
    assert_eq!(acquired, 3);
    rig.shutdown();
}

#[test]
#[serial]
fn test_pause_holds_timelapse() {
    let rig = rig();
    let seq = sequencer(&rig);
    let run = seq.start(SequencerProtocol::timelapse(2, 0.0)).unwrap();
    seq.pause(true);
    assert!(seq.is_paused());
    std::thread::sleep(Duration::from_millis(200));
    assert!(!run.is_done());

    seq.pause(false);
    let result = run.get_result(Some(Duration::from_secs(2))).unwrap();
    assert_eq!(result.len(), 2);
    rig.shutdown();
}

#[test]
#[serial]
fn test_second_start_rejected_while_running() {
    let rig = rig();
    let seq = sequencer(&rig);
    let run = seq.start(SequencerProtocol::timelapse(2, 1.0)).unwrap();
    assert!(seq.is_running());
    assert!(matches!(
        seq.start(SequencerProtocol::default()),
        Err(EphysError::ProtocolViolation(_))
    ));
    seq.stop();
    assert!(run.wait_until_done(Some(Duration::from_secs(1))));
    assert!(run.was_interrupted());
    rig.shutdown();
}

#[test]
#[serial]
fn test_reserved_imager_times_out() {
    let rig = rig();
    let reservations = DeviceReservations::default();
    let _held = reservations.reserve(["camera".to_string()], None).unwrap();
    let config = SequencerConfig {
        reservation_timeout_ms: 50,
        ..SequencerConfig::default()
    };
    let seq = ImageSequencer::new(Arc::clone(&rig.camera) as Arc<dyn Imager>, config)
        .unwrap()
        .with_reservations(reservations);

    let run = seq.start(SequencerProtocol::default()).unwrap();
    let err = run.get_result(Some(Duration::from_secs(2))).unwrap_err();
    assert!(matches!(err, EphysError::Timeout { .. }));
    rig.shutdown();
}

/// Camera that has not measured its frame rate yet.
struct UnpacedCamera(Arc<MockCamera>);

impl Imager for UnpacedCamera {
    fn name(&self) -> &str {
        self.0.name()
    }
    fn start_acquisition(&self) -> Result<()> {
        self.0.start_acquisition()
    }
    fn stop_acquisition(&self) -> Result<()> {
        self.0.stop_acquisition()
    }
    fn is_acquiring(&self) -> bool {
        self.0.is_acquiring()
    }
    fn acquire_frames(&self, count: Option<usize>) -> Future<Vec<Frame>> {
        self.0.acquire_frames(count)
    }
    fn focus_depth(&self) -> Result<f64> {
        self.0.focus_depth()
    }
    fn set_focus_depth(&self, depth: f64, speed: Speed) -> Result<MoveFuture> {
        self.0.set_focus_depth(depth, speed)
    }
    fn estimated_frame_rate(&self) -> f64 {
        0.0
    }
    fn optical_state_key(&self) -> String {
        self.0.optical_state_key()
    }
}

#[test]
#[serial]
fn test_z_stack_needs_a_frame_rate() {
    let rig = rig();
    let start_depth = rig.camera.focus_depth().unwrap();
    let imager = Arc::new(UnpacedCamera(Arc::clone(&rig.camera)));
    let seq = ImageSequencer::new(imager as Arc<dyn Imager>, SequencerConfig::default()).unwrap();

    let run = seq.start(SequencerProtocol::z_stack(0.0, 10e-6, 1e-6)).unwrap();
    let err = run.get_result(Some(Duration::from_secs(2))).unwrap_err();
    assert!(matches!(err, EphysError::Configuration(_)), "{err}");
    assert!(err.to_string().contains("frame rate"), "{err}");

    // Rejected before anything moved or opened.
    assert_eq!(rig.camera.focus_depth().unwrap(), start_depth);
    assert!(rig.camera.shutter_log().is_empty());
    assert!(!rig.camera.is_focus_held());
    rig.shutdown();
}

#[test]
#[serial]
fn test_huge_timelapse_interval_rejected() {
    let rig = rig();
    let seq = sequencer(&rig);
    let err = seq.start(SequencerProtocol::timelapse(2, 1e300)).unwrap_err();
    assert!(matches!(err, EphysError::InvalidInput(_)), "{err}");
    rig.shutdown();
}

#[test]
#[serial]
fn test_timelapse_beyond_clock_fails_cleanly() {
    let rig = rig();
    let seq = sequencer(&rig);
    let run = seq.start(SequencerProtocol::timelapse(3, 1e19)).unwrap();
    let err = run.get_result(Some(Duration::from_secs(5))).unwrap_err();
    assert!(matches!(err, EphysError::InvalidInput(_)), "{err}");
    assert!(!rig.camera.is_acquiring());
    rig.shutdown();
}
