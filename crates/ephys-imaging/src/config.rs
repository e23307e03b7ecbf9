//! Imaging configuration.
//!
//! ```toml
//! [sequencer]
//! over_travel = 20e-6
//! reservation_timeout_ms = 5000
//!
//! [tracker]
//! crop_radius = 12e-6
//! padding = 40e-6
//! threshold = 0.6
//! ```

use ephys_core::{EphysError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Image sequencer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SequencerConfig {
    /// Distance beyond `start` (away from `end`) the focus visits before a
    /// stack, so the traverse always approaches from the same side.
    pub over_travel: f64,

    /// How long to wait for the imager and focus reservation, in milliseconds.
    pub reservation_timeout_ms: u64,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            over_travel: 20e-6,
            reservation_timeout_ms: 5000,
        }
    }
}

impl SequencerConfig {
    /// Reservation timeout as a duration.
    pub fn reservation_timeout(&self) -> Duration {
        Duration::from_millis(self.reservation_timeout_ms)
    }

    /// Check the over-travel distance.
    pub fn validate(&self) -> Result<()> {
        if !(self.over_travel.is_finite() && self.over_travel >= 0.0) {
            return Err(EphysError::Configuration(format!(
                "sequencer.over_travel must be >= 0, got {}",
                self.over_travel
            )));
        }
        Ok(())
    }
}

/// Pipette tracker settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Half-size of the reference crop around the tip, in meters.
    pub crop_radius: f64,

    /// Distance the pipette retracts for background frames, in meters.
    pub retract_distance: f64,

    /// Search margin around the reported tip, in meters.
    pub padding: f64,

    /// Minimum correlation score accepted by `measure_tip_position`.
    pub threshold: f64,

    /// Default z range `[below, above]` of reference stacks, in meters.
    pub reference_z_range: [f64; 2],

    /// Default reference stack step, in meters.
    pub reference_z_step: f64,

    /// Tip length stored with the reference, in meters.
    pub tip_length: f64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            crop_radius: 12e-6,
            retract_distance: 200e-6,
            padding: 40e-6,
            threshold: 0.6,
            reference_z_range: [-8e-6, 8e-6],
            reference_z_step: 2e-6,
            tip_length: 10e-6,
        }
    }
}

impl TrackerConfig {
    /// Check sizes and threshold.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("tracker.crop_radius", self.crop_radius),
            ("tracker.retract_distance", self.retract_distance),
            ("tracker.padding", self.padding),
            ("tracker.reference_z_step", self.reference_z_step),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(EphysError::Configuration(format!("{name} must be positive, got {value}")));
            }
        }
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(EphysError::Configuration(format!(
                "tracker.threshold must be in [0, 1], got {}",
                self.threshold
            )));
        }
        if self.reference_z_range[0] > self.reference_z_range[1] {
            return Err(EphysError::Configuration("tracker.reference_z_range must be ordered".into()));
        }
        Ok(())
    }
}
