//! Mock camera with a motorized focus drive.
//!
//! Frames are produced on the camera clock: frame `k` of an acquisition is
//! exposed at `t0 + k / fps`. Its depth is read from the focus driver's
//! analytic position at that instant, so a z-stack acquired while focus moves
//! carries exact per-frame depths. Each frame is rendered with the pipette tip
//! (when one is attached) blurred according to its distance from focus.

use super::mock_stage::MockStageDriver;
use super::pattern::{render, SensorView, TipScene};
use crate::capabilities::{FocusHold, Imager, ShutterControl};
use crate::config::MockCameraConfig;
use crate::move_future::MoveFuture;
use crate::pipette::Pipette;
use crate::stage::{Speed, Stage};
use chrono::{DateTime, Utc};
use ephys_core::{EphysError, Frame, Future, Position, Result, Transform3};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::{debug, info};

const FRAME_CHANNEL_CAPACITY: usize = 64;

/// Simulated camera looking down through a focus drive.
pub struct MockCamera {
    me: Weak<MockCamera>,
    name: String,
    config: MockCameraConfig,
    focus: Arc<Stage>,
    focus_driver: Arc<MockStageDriver>,
    pipette: RwLock<Option<Weak<Pipette>>>,
    true_tip_offset: RwLock<Option<Position>>,
    clock_anchor: (Instant, DateTime<Utc>),
    acquiring: AtomicBool,
    shutter_open: AtomicBool,
    focus_held: AtomicBool,
    fail_shutter: AtomicBool,
    frame_counter: AtomicU64,
    shutter_log: Mutex<Vec<bool>>,
    frame_tx: broadcast::Sender<Frame>,
}

impl std::fmt::Debug for MockCamera {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockCamera")
            .field("name", &self.name)
            .field("fps", &self.config.fps)
            .field("acquiring", &self.acquiring.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl MockCamera {
    /// Create a camera whose focus is `focus` (z axis), simulated by `focus_driver`.
    pub fn new(
        name: impl Into<String>,
        config: MockCameraConfig,
        focus: Arc<Stage>,
        focus_driver: Arc<MockStageDriver>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let (frame_tx, _) = broadcast::channel(FRAME_CHANNEL_CAPACITY);
        let camera = Arc::new_cyclic(|me| Self {
            me: Weak::clone(me),
            name: name.into(),
            config,
            focus,
            focus_driver,
            pipette: RwLock::new(None),
            true_tip_offset: RwLock::new(None),
            clock_anchor: (Instant::now(), Utc::now()),
            acquiring: AtomicBool::new(false),
            shutter_open: AtomicBool::new(false),
            focus_held: AtomicBool::new(false),
            fail_shutter: AtomicBool::new(false),
            frame_counter: AtomicU64::new(0),
            shutter_log: Mutex::new(Vec::new()),
            frame_tx,
        });
        info!(camera = %camera.name, fps = camera.config.fps, "mock camera ready");
        Ok(camera)
    }

    /// Render `pipette` into subsequent frames.
    pub fn attach_pipette(&self, pipette: &Arc<Pipette>) {
        *self.pipette.write() = Some(Arc::downgrade(pipette));
    }

    /// Stop rendering a pipette.
    pub fn detach_pipette(&self) {
        *self.pipette.write() = None;
    }

    /// Draw the tip at stage position + `offset` (stage-local) instead of where
    /// the pipette reports it, simulating a miscalibrated tip. `None` restores
    /// drawing at the reported tip.
    pub fn set_true_tip_offset(&self, offset: Option<Position>) {
        *self.true_tip_offset.write() = offset;
    }

    /// The focus stage.
    pub fn focus_stage(&self) -> &Arc<Stage> {
        &self.focus
    }

    /// Receive every frame the camera produces.
    pub fn subscribe_frames(&self) -> broadcast::Receiver<Frame> {
        self.frame_tx.subscribe()
    }

    /// Whether the shutter is open.
    pub fn is_shutter_open(&self) -> bool {
        self.shutter_open.load(Ordering::SeqCst)
    }

    /// Every shutter command received, in order.
    pub fn shutter_log(&self) -> Vec<bool> {
        self.shutter_log.lock().clone()
    }

    /// Whether the focus hold is engaged.
    pub fn is_focus_held(&self) -> bool {
        self.focus_held.load(Ordering::SeqCst)
    }

    /// Make shutter commands fail, to exercise cleanup paths.
    pub fn set_shutter_failure(&self, fail: bool) {
        self.fail_shutter.store(fail, Ordering::SeqCst);
    }

    /// Render the frame exposed at `instant`.
    pub fn frame_at(&self, instant: Instant) -> Frame {
        let local = self.focus_driver.position_at(instant);
        let global = self.focus.node().map_to_global(local);
        let depth = global[2];
        let [width, height] = self.config.sensor;
        let ps = self.config.pixel_size;
        let origin = [
            global[0] - width as f64 * ps / 2.0,
            global[1] - height as f64 * ps / 2.0,
        ];

        let true_offset = *self.true_tip_offset.read();
        let scene = self
            .pipette
            .read()
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|pipette| {
                let tip = match true_offset {
                    Some(offset) => {
                        let local = pipette.stage().position(false).unwrap_or([0.0; 3]);
                        pipette
                            .stage()
                            .node()
                            .map_to_global([local[0] + offset[0], local[1] + offset[1], local[2] + offset[2]])
                    }
                    None => pipette.global_tip_position(),
                };
                TipScene {
                    tip,
                    direction: pipette.direction(),
                }
            });
        let view = SensorView {
            width,
            height,
            pixel_size: ps,
            origin,
            depth,
            depth_of_field: self.config.depth_of_field,
            background: self.config.background,
            tip_intensity: self.config.tip_intensity,
        };
        let index = self.frame_counter.fetch_add(1, Ordering::Relaxed);
        let image = render(&view, scene.as_ref(), index);

        let transform = Transform3::from_parts([ps, ps, 1.0], 0.0, [origin[0], origin[1], depth]);
        Frame::new(image, self.timestamp(instant), depth, transform)
            .with_info("camera", self.name.clone())
            .with_info("frameIndex", index)
            .with_info("objective", self.config.objective.clone())
    }

    fn timestamp(&self, instant: Instant) -> DateTime<Utc> {
        let (anchor_instant, anchor_utc) = self.clock_anchor;
        let offset = instant.saturating_duration_since(anchor_instant);
        anchor_utc + chrono::Duration::from_std(offset).unwrap_or_else(|_| chrono::Duration::zero())
    }

    fn emit(&self, frame: &Frame) {
        // No receivers is fine.
        let _ = self.frame_tx.send(frame.clone());
    }
}

impl Imager for MockCamera {
    fn name(&self) -> &str {
        &self.name
    }

    fn start_acquisition(&self) -> Result<()> {
        self.acquiring.store(true, Ordering::SeqCst);
        debug!(camera = %self.name, "acquisition started");
        Ok(())
    }

    fn stop_acquisition(&self) -> Result<()> {
        self.acquiring.store(false, Ordering::SeqCst);
        debug!(camera = %self.name, "acquisition stopped");
        Ok(())
    }

    fn is_acquiring(&self) -> bool {
        self.acquiring.load(Ordering::SeqCst)
    }

    fn acquire_frames(&self, count: Option<usize>) -> Future<Vec<Frame>> {
        let period = self.config.frame_period();
        let camera = Weak::clone(&self.me);
        Future::spawn(format!("{}-acquire", self.name), move |f| {
            let Some(camera) = camera.upgrade() else {
                return Err(EphysError::hardware("mock camera", "camera dropped"));
            };
            let t0 = Instant::now();
            let mut frames = Vec::with_capacity(count.unwrap_or(16));
            let mut k: u32 = 0;
            loop {
                if count.is_some_and(|n| frames.len() >= n) {
                    return Ok(frames);
                }
                let instant = t0 + period * k;
                let now = Instant::now();
                if instant > now {
                    if let Err(stop) = f.sleep(instant - now) {
                        if count.is_some() {
                            return Err(stop);
                        }
                        // Deliver every frame exposed before the stop.
                        let cutoff = Instant::now();
                        while t0 + period * k <= cutoff {
                            let frame = camera.frame_at(t0 + period * k);
                            camera.emit(&frame);
                            frames.push(frame);
                            k += 1;
                        }
                        return Ok(frames);
                    }
                }
                let frame = camera.frame_at(instant);
                camera.emit(&frame);
                frames.push(frame);
                if let Some(n) = count {
                    f.set_percent_done(100.0 * frames.len() as f64 / n.max(1) as f64);
                }
                k += 1;
            }
        })
    }

    fn focus_depth(&self) -> Result<f64> {
        let local = self.focus.position(true)?;
        Ok(self.focus.node().map_to_global(local)[2])
    }

    fn set_focus_depth(&self, depth: f64, speed: Speed) -> Result<MoveFuture> {
        let current = self.focus.global_position();
        let local = self.focus.node().map_from_global([current[0], current[1], depth])?;
        self.focus.move_to([None, None, Some(local[2])], speed, false)
    }

    fn estimated_frame_rate(&self) -> f64 {
        self.config.fps
    }

    fn optical_state_key(&self) -> String {
        self.config.objective.clone()
    }

    fn focus_device_name(&self) -> Option<String> {
        Some(self.focus.name().to_string())
    }

    fn shutter(&self) -> Option<&dyn ShutterControl> {
        self.config.has_shutter.then_some(self as &dyn ShutterControl)
    }

    fn focus_hold(&self) -> Option<&dyn FocusHold> {
        self.config.has_focus_hold.then_some(self as &dyn FocusHold)
    }
}

impl ShutterControl for MockCamera {
    fn open_shutter(&self, open: bool) -> Result<()> {
        self.shutter_log.lock().push(open);
        if self.fail_shutter.load(Ordering::SeqCst) {
            return Err(EphysError::hardware(&self.name, "shutter did not respond"));
        }
        self.shutter_open.store(open, Ordering::SeqCst);
        Ok(())
    }
}

impl FocusHold for MockCamera {
    fn set_holding(&self, hold: bool) -> Result<()> {
        self.focus_held.store(hold, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::StageDriver;
    use crate::config::{MockStageConfig, PollerConfig, StageConfig};
    use std::time::Duration;

    fn camera(fps: f64) -> Arc<MockCamera> {
        let driver = Arc::new(MockStageDriver::new(MockStageConfig {
            axes: [false, false, true],
            max_speed: 1e-3,
            ..MockStageConfig::default()
        }));
        let config = StageConfig {
            poller: PollerConfig {
                enabled: false,
                ..PollerConfig::default()
            },
            ..StageConfig::default()
        };
        let focus = Stage::new("focus", Arc::clone(&driver) as Arc<dyn StageDriver>, config).unwrap();
        MockCamera::new(
            "camera",
            MockCameraConfig {
                fps,
                ..MockCameraConfig::default()
            },
            focus,
            driver,
        )
        .unwrap()
    }

    #[test]
    fn test_counted_acquisition_has_camera_clock_timestamps() {
        let cam = camera(200.0);
        let frames = cam.acquire_frames(Some(5)).get_result(Some(Duration::from_secs(2))).unwrap();
        assert_eq!(frames.len(), 5);
        for pair in frames.windows(2) {
            let dt = (pair[1].timestamp - pair[0].timestamp).num_microseconds().unwrap();
            assert!((dt - 5000).abs() <= 1, "dt = {dt}");
        }
        assert_eq!(frames[0].width(), 64);
    }

    #[test]
    fn test_open_ended_acquisition_returns_frames_on_stop() {
        let cam = camera(200.0);
        let acq = cam.acquire_frames(None);
        std::thread::sleep(Duration::from_millis(60));
        acq.stop("enough");
        let frames = acq.get_result(Some(Duration::from_secs(1))).unwrap();
        assert!(frames.len() >= 5, "got {}", frames.len());
        assert!(!acq.was_interrupted());
    }

    #[test]
    fn test_frame_depth_tracks_focus_motion() {
        let cam = camera(100.0);
        let acq = cam.acquire_frames(None);
        let mv = cam.set_focus_depth(20e-6, Speed::MetersPerSecond(1e-3)).unwrap();
        mv.wait(Some(Duration::from_secs(2))).unwrap();
        std::thread::sleep(Duration::from_millis(30));
        acq.stop("move done");
        let frames = acq.get_result(Some(Duration::from_secs(1))).unwrap();
        let depths: Vec<f64> = frames.iter().map(|f| f.depth).collect();
        assert!(depths.windows(2).all(|w| w[1] >= w[0]));
        assert!((depths[depths.len() - 1] - 20e-6).abs() < 1e-9);
        assert!((cam.focus_depth().unwrap() - 20e-6).abs() < 1e-9);
    }

    #[test]
    fn test_shutter_and_hold_are_optional() {
        let cam = camera(50.0);
        let shutter = cam.shutter().unwrap();
        shutter.open_shutter(true).unwrap();
        assert!(cam.is_shutter_open());
        cam.focus_hold().unwrap().set_holding(true).unwrap();
        assert!(cam.is_focus_held());

        cam.set_shutter_failure(true);
        assert!(cam.shutter().unwrap().open_shutter(false).is_err());
        assert_eq!(cam.shutter_log(), vec![true, false]);
    }

    #[test]
    fn test_frames_are_broadcast() {
        let cam = camera(200.0);
        let mut rx = cam.subscribe_frames();
        cam.acquire_frames(Some(2)).wait(Some(Duration::from_secs(1))).unwrap();
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
    }
}
