//! Pipette positioner.
//!
//! A [`Pipette`] is a [`Stage`] carrying a pipette whose tip sits at a fixed
//! offset from the stage origin. The pipette axis is given by pitch (angle below
//! horizontal) and yaw (direction in the xy plane), so "advance" and "retract"
//! move the tip along its own axis in global coordinates.
//!
//! Until a tip offset is set the pipette is uncalibrated; moves by tip position
//! still work but assume a zero offset.

use crate::config::PipetteConfig;
use crate::move_future::MoveFuture;
use crate::stage::{Speed, Stage};
use ephys_core::{EphysError, Observable, Position, Result};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Name of the saved position used by [`Pipette::go_home`].
pub const HOME: &str = "home";

/// A stage-mounted pipette.
#[derive(Debug)]
pub struct Pipette {
    name: String,
    stage: Arc<Stage>,
    config: PipetteConfig,
    tip_offset: RwLock<Position>,
    saved_positions: RwLock<BTreeMap<String, Position>>,
    target: RwLock<Option<Position>>,
    calibrated: Observable<bool>,
}

impl Pipette {
    /// Wrap `stage`. A configured tip offset marks the pipette calibrated.
    pub fn new(name: impl Into<String>, stage: Arc<Stage>, config: PipetteConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let name = name.into();
        let calibrated = Observable::new(format!("{name}.calibrated"), config.tip_offset.is_some())
            .with_description("Tip offset has been measured");
        Ok(Arc::new(Self {
            tip_offset: RwLock::new(config.tip_offset.unwrap_or([0.0; 3])),
            saved_positions: RwLock::new(config.saved_positions.clone()),
            target: RwLock::new(None),
            calibrated,
            name,
            stage,
            config,
        }))
    }

    /// Pipette name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The stage carrying the pipette.
    pub fn stage(&self) -> &Arc<Stage> {
        &self.stage
    }

    /// Geometry and saved-position settings.
    pub fn config(&self) -> &PipetteConfig {
        &self.config
    }

    /// Unit vector (global frame) pointing from the pipette body towards its tip.
    pub fn direction(&self) -> Position {
        let pitch = self.config.pitch_deg.to_radians();
        let yaw = self.config.yaw_deg.to_radians();
        [pitch.cos() * yaw.cos(), pitch.cos() * yaw.sin(), -pitch.sin()]
    }

    /// Tip offset in stage-local coordinates.
    pub fn tip_offset(&self) -> Position {
        *self.tip_offset.read()
    }

    /// Set the tip offset and mark the pipette calibrated.
    pub fn set_tip_offset(&self, offset: Position) {
        *self.tip_offset.write() = offset;
        self.calibrated.set(true);
        info!(pipette = %self.name, offset = ?offset, "tip offset set");
    }

    /// Shift the tip offset so the reported tip moves by `global_delta`.
    pub fn adjust_tip_offset(&self, global_delta: Position) {
        let local_delta = match self.stage.node().global_transform().inverse() {
            Ok(inverse) => inverse.map_vector(global_delta),
            Err(_) => global_delta,
        };
        let current = self.tip_offset();
        self.set_tip_offset([
            current[0] + local_delta[0],
            current[1] + local_delta[1],
            current[2] + local_delta[2],
        ]);
    }

    /// Whether a tip offset has been set.
    pub fn is_calibrated(&self) -> bool {
        self.calibrated.get()
    }

    /// Calibration flag as an observable.
    pub fn calibrated(&self) -> &Observable<bool> {
        &self.calibrated
    }

    /// Forget the calibration (e.g. after swapping the pipette).
    pub fn clear_calibration(&self) {
        *self.tip_offset.write() = [0.0; 3];
        self.calibrated.set(false);
    }

    /// Tip position in global coordinates, from the stage's last-known position.
    pub fn global_tip_position(&self) -> Position {
        let local = self.stage.position(false).unwrap_or([0.0; 3]);
        self.tip_at(local)
    }

    /// Tip position in global coordinates if the stage were at `local`.
    pub fn tip_at(&self, local: Position) -> Position {
        let offset = self.tip_offset();
        self.stage
            .node()
            .map_to_global([local[0] + offset[0], local[1] + offset[1], local[2] + offset[2]])
    }

    /// Move the stage so the tip lands on `target` (global).
    pub fn move_tip_to_global(&self, target: Position, speed: Speed) -> Result<MoveFuture> {
        let local = self.stage.node().map_from_global(target)?;
        let offset = self.tip_offset();
        let stage_target = [local[0] - offset[0], local[1] - offset[1], local[2] - offset[2]];
        debug!(pipette = %self.name, target = ?target, "moving tip");
        self.stage.move_to(stage_target.map(Some), speed, false)
    }

    /// Move the tip `distance` meters forward along the pipette axis.
    pub fn advance(&self, distance: f64, speed: Speed) -> Result<MoveFuture> {
        let tip = self.global_tip_position();
        let d = self.direction();
        self.move_tip_to_global(
            [tip[0] + d[0] * distance, tip[1] + d[1] * distance, tip[2] + d[2] * distance],
            speed,
        )
    }

    /// Move the tip `distance` meters back along the pipette axis.
    pub fn retract(&self, distance: f64, speed: Speed) -> Result<MoveFuture> {
        self.advance(-distance, speed)
    }

    /// Global tip position a saved name refers to.
    pub fn saved_position(&self, name: &str) -> Result<Position> {
        self.saved_positions
            .read()
            .get(name)
            .copied()
            .ok_or_else(|| EphysError::Configuration(format!("{} has no saved position '{name}'", self.name)))
    }

    /// Store the current tip position (or `position`) under `name`.
    pub fn save_position(&self, name: impl Into<String>, position: Option<Position>) {
        let position = position.unwrap_or_else(|| self.global_tip_position());
        self.saved_positions.write().insert(name.into(), position);
    }

    /// Names of all saved positions.
    pub fn saved_position_names(&self) -> Vec<String> {
        self.saved_positions.read().keys().cloned().collect()
    }

    /// Move the tip to a saved position.
    pub fn goto_saved_position(&self, name: &str, speed: Speed) -> Result<MoveFuture> {
        let position = self.saved_position(name)?;
        self.move_tip_to_global(position, speed)
    }

    /// Move the tip to the `home` position.
    pub fn go_home(&self, speed: Speed) -> Result<MoveFuture> {
        self.goto_saved_position(HOME, speed)
    }

    /// Cell target (global), used by the approach and cell-detect states.
    pub fn target(&self) -> Option<Position> {
        *self.target.read()
    }

    /// Set or clear the cell target.
    pub fn set_target(&self, target: Option<Position>) {
        *self.target.write() = target;
    }

    /// Point on the pipette axis `approach_height` back from `target`.
    pub fn approach_position(&self, target: Position) -> Position {
        let d = self.direction();
        let h = self.config.approach_height;
        [target[0] - d[0] * h, target[1] - d[1] * h, target[2] - d[2] * h]
    }
}
