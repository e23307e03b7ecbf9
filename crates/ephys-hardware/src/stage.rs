//! Stage abstraction: position model, transforms and move dispatch.
//!
//! A [`Stage`] wraps a [`StageDriver`] and adds everything the rest of the rig
//! relies on:
//!
//! - a cached last-known position, refreshed by an adaptive poller thread
//! - a [`TransformNode`] placing the device in the global frame
//! - partial moves (`None` axes keep their position), symbolic speeds, limits
//! - a single "current move" slot: a new move stops the one in flight
//! - `position_changed` and `move_event` signals
//!
//! # Threading
//!
//! Public operations that talk to the driver hold the stage's reentrant device
//! lock. The poller and move monitors only hold a weak reference to the stage
//! and never call back into it with a lock held. Position notifications are
//! serialized, so observers see one total order per stage.

use crate::capabilities::{StageCapabilities, StageDriver, AXIS_NAMES};
use crate::config::StageConfig;
use crate::move_future::{format_position, DeviceAccess, MoveFuture};
use ephys_core::limits::SHUTDOWN_TIMEOUT;
use ephys_core::{EphysError, Future, Position, Result, Signal, Transform3, TransformNode};
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

// =============================================================================
// Speed
// =============================================================================

/// Requested move speed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "SpeedRepr", into = "SpeedRepr")]
pub enum Speed {
    /// The device's configured fast speed (driver maximum by default).
    Fast,
    /// The device's configured safe speed.
    Slow,
    /// Explicit speed in m/s.
    MetersPerSecond(f64),
}

impl fmt::Display for Speed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fast => write!(f, "fast"),
            Self::Slow => write!(f, "slow"),
            Self::MetersPerSecond(v) => write!(f, "{v} m/s"),
        }
    }
}

impl FromStr for Speed {
    type Err = EphysError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "fast" => Ok(Self::Fast),
            "slow" => Ok(Self::Slow),
            other => other
                .parse::<f64>()
                .map(Self::MetersPerSecond)
                .map_err(|_| EphysError::InvalidInput(format!("invalid speed '{other}'"))),
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum SpeedRepr {
    Value(f64),
    Name(String),
}

impl TryFrom<SpeedRepr> for Speed {
    type Error = EphysError;

    fn try_from(repr: SpeedRepr) -> Result<Self> {
        match repr {
            SpeedRepr::Value(v) => Ok(Self::MetersPerSecond(v)),
            SpeedRepr::Name(name) => name.parse(),
        }
    }
}

impl From<Speed> for SpeedRepr {
    fn from(speed: Speed) -> Self {
        match speed {
            Speed::Fast => Self::Name("fast".into()),
            Speed::Slow => Self::Name("slow".into()),
            Speed::MetersPerSecond(v) => Self::Value(v),
        }
    }
}

// =============================================================================
// Notifications
// =============================================================================

/// Payload of [`Stage::position_changed`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionUpdate {
    /// Device-local position.
    pub local: Position,
    /// Same position in the global frame.
    pub global: Position,
}

/// Payload of [`Stage::move_event`].
#[derive(Debug, Clone, PartialEq)]
pub enum MoveEvent {
    /// A move was requested and passed validation.
    Requested {
        /// Absolute local target.
        target: Position,
        /// Resolved speed in m/s.
        speed: f64,
    },
    /// The driver accepted the move.
    Started {
        /// Absolute local target.
        target: Position,
    },
    /// The move ended.
    Finished {
        /// Final local position, when it could be read.
        position: Option<Position>,
        /// Whether the move ended without reaching its target.
        interrupted: bool,
    },
}

// =============================================================================
// Stage
// =============================================================================

/// A positioning device with a cached position and a place in the transform tree.
pub struct Stage {
    name: String,
    driver: Arc<dyn StageDriver>,
    config: StageConfig,
    capabilities: StageCapabilities,
    device_lock: Arc<ReentrantMutex<()>>,
    node: Arc<TransformNode>,
    position: RwLock<Position>,
    notify: ReentrantMutex<()>,
    limits: RwLock<[Option<[f64; 2]>; 3]>,
    current_move: Mutex<Option<MoveFuture>>,
    poller: Mutex<Option<Future<()>>>,
    position_changed: Signal<PositionUpdate>,
    move_event: Signal<MoveEvent>,
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("position", &*self.position.read())
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}

impl Stage {
    /// Wrap `driver`, read its initial position and start the poller.
    pub fn new(name: impl Into<String>, driver: Arc<dyn StageDriver>, config: StageConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let name = name.into();
        let initial = driver.read_position()?;
        let capabilities = driver.capabilities();

        let stage = Arc::new(Self {
            node: TransformNode::new(name.clone()),
            position_changed: Signal::new(format!("{name}.position_changed")),
            move_event: Signal::new(format!("{name}.move_event")),
            limits: RwLock::new(config.limits),
            name,
            driver,
            capabilities,
            config,
            device_lock: Arc::new(ReentrantMutex::new(())),
            position: RwLock::new(initial),
            notify: ReentrantMutex::new(()),
            current_move: Mutex::new(None),
            poller: Mutex::new(None),
        });

        let weak = Arc::downgrade(&stage);
        stage.node.transform_changed().connect(move |_| {
            if let Some(stage) = weak.upgrade() {
                stage.publish_position();
            }
        });

        if stage.config.poller.enabled {
            let poller = spawn_poller(&stage);
            *stage.poller.lock() = Some(poller);
        }

        info!(stage = %stage.name, position = %format_position(initial), "stage ready");
        Ok(stage)
    }

    /// Device name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Motion configuration.
    pub fn config(&self) -> &StageConfig {
        &self.config
    }

    /// Names of the axes this device uses, in order.
    pub fn axes(&self) -> Vec<&'static str> {
        self.capabilities
            .axes
            .iter()
            .zip(AXIS_NAMES)
            .filter(|(caps, _)| caps.enabled())
            .map(|(_, name)| name)
            .collect()
    }

    /// Capability descriptor.
    pub fn capabilities(&self) -> StageCapabilities {
        self.capabilities
    }

    /// Last-known local position, or a fresh read when `refresh` is set.
    pub fn position(&self, refresh: bool) -> Result<Position> {
        if refresh {
            let fresh = {
                let _lock = self.device_lock.lock();
                self.driver.read_position()?
            };
            self.update_position(fresh);
        }
        Ok(*self.position.read())
    }

    /// Last-known position mapped to the global frame.
    pub fn global_position(&self) -> Position {
        self.node.map_to_global(*self.position.read())
    }

    /// The stage's node in the transform tree.
    pub fn node(&self) -> &Arc<TransformNode> {
        &self.node
    }

    /// Local-to-parent transform.
    pub fn transform(&self) -> Transform3 {
        self.node.device_transform()
    }

    /// Replace the local-to-parent transform. Republishes the global position.
    pub fn set_device_transform(&self, transform: Transform3) {
        self.node.set_device_transform(transform);
    }

    /// Attach the stage under another node (e.g. a manipulator on a microscope stage).
    pub fn set_parent(&self, parent: Option<&Arc<TransformNode>>) -> Result<()> {
        self.node.set_parent(parent)
    }

    /// Set per-axis `[min, max]` limits in local coordinates. `None` clears an axis.
    pub fn set_limits(&self, x: Option<[f64; 2]>, y: Option<[f64; 2]>, z: Option<[f64; 2]>) -> Result<()> {
        let limits = [x, y, z];
        for (axis, limit) in limits.iter().enumerate() {
            if let Some([min, max]) = limit {
                if min > max {
                    return Err(EphysError::InvalidInput(format!(
                        "{} limit for axis {} has min > max",
                        self.name, AXIS_NAMES[axis]
                    )));
                }
                if !self.capabilities.axes[axis].limits {
                    return Err(EphysError::InvalidInput(format!(
                        "{} axis {} does not support limits",
                        self.name, AXIS_NAMES[axis]
                    )));
                }
            }
        }
        *self.limits.write() = limits;
        Ok(())
    }

    /// Current limits.
    pub fn limits(&self) -> [Option<[f64; 2]>; 3] {
        *self.limits.read()
    }

    /// Resolve a symbolic or explicit speed to m/s.
    pub fn interpret_speed(&self, speed: Speed) -> Result<f64> {
        let value = match speed {
            Speed::Fast => self.config.fast_speed.unwrap_or_else(|| self.driver.max_speed()),
            Speed::Slow => self.config.slow_speed,
            Speed::MetersPerSecond(v) => v,
        };
        if value.is_finite() && value > 0.0 {
            Ok(value)
        } else {
            Err(EphysError::InvalidInput(format!(
                "{} speed must be positive, got {value}",
                self.name
            )))
        }
    }

    /// Fill `None` entries with the last-known position.
    pub fn to_absolute_position(&self, target: [Option<f64>; 3]) -> Position {
        let current = *self.position.read();
        [
            target[0].unwrap_or(current[0]),
            target[1].unwrap_or(current[1]),
            target[2].unwrap_or(current[2]),
        ]
    }

    /// The move in flight, if any.
    pub fn current_move(&self) -> Option<MoveFuture> {
        self.current_move.lock().clone().filter(|m| !m.is_done())
    }

    /// Start a move. `None` axes keep their current position.
    ///
    /// A move already in flight is stopped first and completes interrupted.
    pub fn move_to(self: &Arc<Self>, target: [Option<f64>; 3], speed: Speed, linear: bool) -> Result<MoveFuture> {
        let _lock = self.device_lock.lock();
        let start = *self.position.read();
        let absolute = self.to_absolute_position(target);
        let speed = self.interpret_speed(speed)?;
        self.validate_target(start, absolute, linear)?;

        let previous = self.current_move.lock().take();
        if let Some(previous) = previous {
            if !previous.is_done() {
                debug!(stage = %self.name, "stopping previous move");
                previous.stop("Move interrupted by a new move request");
                if let Err(err) = self.driver.halt() {
                    warn!(stage = %self.name, error = %err, "halt before new move failed");
                }
                if !previous.wait_until_done(Some(SHUTDOWN_TIMEOUT)) {
                    return Err(EphysError::hardware(&self.name, "previous move did not stop"));
                }
            }
        }

        self.move_event.emit(&MoveEvent::Requested {
            target: absolute,
            speed,
        });
        self.driver.start_move(absolute, speed, linear)?;
        debug!(
            stage = %self.name,
            target = %format_position(absolute),
            speed,
            "move started"
        );
        self.move_event.emit(&MoveEvent::Started { target: absolute });

        let weak = Arc::downgrade(self);
        let sink_weak = Weak::clone(&weak);
        let access = DeviceAccess {
            driver: Arc::clone(&self.driver),
            lock: Arc::clone(&self.device_lock),
        };
        let mv = MoveFuture::monitor(
            &self.name,
            access,
            start,
            absolute,
            speed,
            self.config.tolerance,
            Box::new(move |p| {
                if let Some(stage) = sink_weak.upgrade() {
                    stage.update_position(p);
                }
            }),
        );
        *self.current_move.lock() = Some(mv.clone());

        mv.on_finish(move |f| {
            if let Some(stage) = weak.upgrade() {
                stage.move_finished(f);
            }
        });
        Ok(mv)
    }

    /// Move so that the stage's global position becomes `target`.
    pub fn move_to_global(self: &Arc<Self>, target: Position, speed: Speed) -> Result<MoveFuture> {
        let local = self.node.map_from_global(target)?;
        self.move_to(local.map(Some), speed, false)
    }

    /// Move by `deltas` from the last-known position.
    pub fn step(self: &Arc<Self>, deltas: Position, speed: Speed) -> Result<MoveFuture> {
        let current = *self.position.read();
        self.move_to(
            [
                Some(current[0] + deltas[0]),
                Some(current[1] + deltas[1]),
                Some(current[2] + deltas[2]),
            ],
            speed,
            false,
        )
    }

    /// Abort the move in flight; its future completes interrupted.
    pub fn stop(&self) -> Result<()> {
        let _lock = self.device_lock.lock();
        let current = self.current_move.lock().clone();
        if let Some(mv) = current {
            mv.stop("Stage stop requested");
        }
        self.driver.halt()
    }

    /// Stop the poller and any move in flight, waiting for both to end.
    pub fn shutdown(&self) {
        let current = self.current_move.lock().take();
        if let Some(mv) = current {
            mv.stop("Stage shut down");
            mv.wait_until_done(Some(SHUTDOWN_TIMEOUT));
        }
        let poller = self.poller.lock().take();
        if let Some(poller) = poller {
            poller.stop("Stage shut down");
            if !poller.wait_until_done(Some(SHUTDOWN_TIMEOUT)) {
                warn!(stage = %self.name, "poller did not stop in time");
            }
        }
    }

    /// Fired whenever the cached position or the global transform changes.
    pub fn position_changed(&self) -> &Signal<PositionUpdate> {
        &self.position_changed
    }

    /// Fired as moves are requested, started and finished.
    pub fn move_event(&self) -> &Signal<MoveEvent> {
        &self.move_event
    }

    fn validate_target(&self, start: Position, target: Position, linear: bool) -> Result<()> {
        if linear && !self.capabilities.linear_motion {
            return Err(EphysError::InvalidInput(format!(
                "{} cannot guarantee linear motion",
                self.name
            )));
        }
        let limits = self.limits.read();
        for axis in 0..3 {
            if !target[axis].is_finite() {
                return Err(EphysError::InvalidInput(format!(
                    "{} target for axis {} is not finite",
                    self.name, AXIS_NAMES[axis]
                )));
            }
            let changed = (target[axis] - start[axis]).abs() > 0.0;
            if changed && !self.capabilities.axes[axis].set {
                return Err(EphysError::InvalidInput(format!(
                    "{} axis {} cannot be moved",
                    self.name, AXIS_NAMES[axis]
                )));
            }
            if let Some([min, max]) = limits[axis] {
                if target[axis] < min || target[axis] > max {
                    return Err(EphysError::InvalidInput(format!(
                        "{} target {} outside limits [{min}, {max}] on axis {}",
                        self.name, target[axis], AXIS_NAMES[axis]
                    )));
                }
            }
        }
        Ok(())
    }

    fn move_finished(&self, mv: &Future<Position>) {
        let position = mv.try_result().and_then(|r| r.ok()).or_else(|| Some(*self.position.read()));
        {
            let mut slot = self.current_move.lock();
            if slot.as_ref().is_some_and(|current| current.as_future().ptr_eq(mv)) {
                *slot = None;
            }
        }
        self.move_event.emit(&MoveEvent::Finished {
            position,
            interrupted: mv.was_interrupted(),
        });
    }

    /// Store a freshly read position and notify observers if it changed.
    pub(crate) fn update_position(&self, position: Position) {
        let _ordered = self.notify.lock();
        {
            let mut cached = self.position.write();
            if *cached == position {
                return;
            }
            *cached = position;
        }
        self.emit_position(position);
    }

    fn publish_position(&self) {
        let _ordered = self.notify.lock();
        let position = *self.position.read();
        self.emit_position(position);
    }

    fn emit_position(&self, local: Position) {
        self.position_changed.emit(&PositionUpdate {
            local,
            global: self.node.map_to_global(local),
        });
    }

    /// One poller iteration. Returns whether the stage is moving.
    fn poll_once(&self) -> Result<bool> {
        let (moving, position) = {
            let _lock = self.device_lock.lock();
            (self.driver.is_moving()?, self.driver.read_position()?)
        };
        self.update_position(position);
        Ok(moving)
    }
}

impl Drop for Stage {
    fn drop(&mut self) {
        if let Some(poller) = self.poller.get_mut().take() {
            poller.stop("Stage dropped");
        }
        if let Some(mv) = self.current_move.get_mut().take() {
            mv.stop("Stage dropped");
        }
    }
}

fn spawn_poller(stage: &Arc<Stage>) -> Future<()> {
    let weak = Arc::downgrade(stage);
    let min = stage.config.poller.min_interval();
    let max = stage.config.poller.max_interval();
    Future::spawn(format!("{}-poller", stage.name), move |f| {
        let mut interval = min;
        loop {
            f.sleep(interval)?;
            let Some(stage) = weak.upgrade() else {
                return Ok(());
            };
            interval = match stage.poll_once() {
                Ok(true) => min,
                Ok(false) => (interval * 2).min(max),
                Err(err) => {
                    warn!(stage = %stage.name, error = %err, "position poll failed");
                    max
                }
            };
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MockStageConfig, PollerConfig};
    use crate::drivers::mock::MockStageDriver;
    use std::time::Duration;

    fn stage_with(config: StageConfig) -> (Arc<Stage>, Arc<MockStageDriver>) {
        let driver = Arc::new(MockStageDriver::new(MockStageConfig {
            max_speed: 1e-2,
            ..MockStageConfig::default()
        }));
        let stage = Stage::new("stage", Arc::clone(&driver) as Arc<dyn StageDriver>, config).unwrap();
        (stage, driver)
    }

    fn quiet() -> StageConfig {
        StageConfig {
            poller: PollerConfig {
                enabled: false,
                ..PollerConfig::default()
            },
            ..StageConfig::default()
        }
    }

    #[test]
    fn test_speed_parsing() {
        assert_eq!("fast".parse::<Speed>().unwrap(), Speed::Fast);
        assert_eq!("slow".parse::<Speed>().unwrap(), Speed::Slow);
        assert_eq!("0.002".parse::<Speed>().unwrap(), Speed::MetersPerSecond(0.002));
        assert!("warp".parse::<Speed>().is_err());
    }

    #[test]
    fn test_interpret_speed() {
        let (stage, _) = stage_with(quiet());
        assert_eq!(stage.interpret_speed(Speed::Fast).unwrap(), 1e-2);
        assert_eq!(stage.interpret_speed(Speed::Slow).unwrap(), 1e-4);
        assert!(stage.interpret_speed(Speed::MetersPerSecond(0.0)).is_err());
    }

    #[test]
    fn test_partial_target_keeps_axes() {
        let (stage, _) = stage_with(quiet());
        let mv = stage.move_to([Some(1e-5), None, None], Speed::Fast, false).unwrap();
        mv.wait(Some(Duration::from_secs(2))).unwrap();
        let mv = stage.move_to([None, Some(2e-5), None], Speed::Fast, false).unwrap();
        assert_eq!(mv.target_position(), [1e-5, 2e-5, 0.0]);
        let end = mv.get_result(Some(Duration::from_secs(2))).unwrap();
        assert!((end[0] - 1e-5).abs() < 1e-9);
        assert!((end[1] - 2e-5).abs() < 1e-9);
    }

    #[test]
    fn test_limits_and_linear_rejected() {
        let (stage, _) = stage_with(quiet());
        stage.set_limits(Some([-1e-3, 1e-3]), None, None).unwrap();
        let err = stage.move_to([Some(2e-3), None, None], Speed::Fast, false).unwrap_err();
        assert!(matches!(err, EphysError::InvalidInput(_)));

        let driver = Arc::new(MockStageDriver::new(MockStageConfig {
            linear_motion: false,
            ..MockStageConfig::default()
        }));
        let stage = Stage::new("curvy", driver, quiet()).unwrap();
        let err = stage.move_to([Some(1e-5), None, None], Speed::Fast, true).unwrap_err();
        assert!(matches!(err, EphysError::InvalidInput(_)));
    }

    #[test]
    fn test_new_move_interrupts_previous() {
        let (stage, _) = stage_with(quiet());
        let first = stage.move_to([Some(1e-2), None, None], Speed::MetersPerSecond(1e-3), false).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        let second = stage.move_to([Some(0.0), None, None], Speed::Fast, false).unwrap();

        assert!(first.is_done());
        assert!(first.was_interrupted());
        second.wait(Some(Duration::from_secs(2))).unwrap();
        assert!(stage.current_move().is_none());
    }

    #[test]
    fn test_stop_interrupts_between_start_and_target() {
        let (stage, _) = stage_with(quiet());
        let target = 1e-2;
        let mv = stage.move_to([Some(target), Some(0.0), Some(0.0)], Speed::MetersPerSecond(1e-3), false).unwrap();
        std::thread::sleep(Duration::from_millis(30));
        stage.stop().unwrap();
        assert!(mv.wait_until_done(Some(Duration::from_secs(1))));
        assert!(mv.was_interrupted());
        let x = stage.position(true).unwrap()[0];
        assert!(x > 0.0 && x < target, "x = {x}");
    }

    #[test]
    fn test_global_position_follows_transform() {
        let (stage, _) = stage_with(quiet());
        let updates = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&updates);
        stage.position_changed().connect(move |u| sink.lock().push(*u));

        stage.set_device_transform(Transform3::from_offset([1.0, 0.0, 0.0]));
        assert_eq!(stage.global_position(), [1.0, 0.0, 0.0]);

        let parent = TransformNode::with_transform("scope", Transform3::from_offset([0.0, 2.0, 0.0]));
        stage.set_parent(Some(&parent)).unwrap();
        assert_eq!(stage.global_position(), [1.0, 2.0, 0.0]);

        let seen = updates.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].global, [1.0, 2.0, 0.0]);
        assert_eq!(seen[1].local, [0.0; 3]);
    }

    #[test]
    fn test_move_to_global_maps_through_transform() {
        let (stage, _) = stage_with(quiet());
        stage.set_device_transform(Transform3::from_offset([1e-3, 0.0, 0.0]));
        let mv = stage.move_to_global([1e-3 + 2e-5, 0.0, 0.0], Speed::Fast).unwrap();
        let target = mv.target_position();
        assert!((target[0] - 2e-5).abs() < 1e-12);
        mv.wait(Some(Duration::from_secs(2))).unwrap();
    }

    #[test]
    fn test_move_events_in_order() {
        let (stage, _) = stage_with(quiet());
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        stage.move_event().connect(move |e| {
            sink.lock().push(match e {
                MoveEvent::Requested { .. } => "requested",
                MoveEvent::Started { .. } => "started",
                MoveEvent::Finished { .. } => "finished",
            })
        });
        stage.step([1e-6, 0.0, 0.0], Speed::Fast).unwrap().wait(Some(Duration::from_secs(2))).unwrap();
        assert_eq!(*events.lock(), vec!["requested", "started", "finished"]);
    }

    #[test]
    fn test_poller_tracks_external_motion() {
        let (stage, driver) = stage_with(StageConfig::default());
        driver.start_move([0.0, 5e-6, 0.0], 1e-2, false).unwrap();
        std::thread::sleep(Duration::from_millis(400));
        assert!((stage.position(false).unwrap()[1] - 5e-6).abs() < 1e-9);
        stage.shutdown();
    }
}
