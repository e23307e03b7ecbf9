//! Configuration for stages, pipettes and the mock rig.
//!
//! All lengths are in meters, speeds in meters per second, durations in
//! milliseconds (`*_ms`) and pressures in pascals.
//!
//! ```toml
//! [stage]
//! slow_speed = 1e-4
//! tolerance = 5e-7
//!
//! [stage.poller]
//! min_interval_ms = 30
//! max_interval_ms = 300
//!
//! [pipette]
//! pitch_deg = 27.0
//! yaw_deg = 0.0
//!
//! [pipette.saved_positions]
//! home = [0.01, 0.0, 0.005]
//! ```

use crate::stage::Speed;
use ephys_core::limits::{MAX_POLL_INTERVAL, MIN_POLL_INTERVAL};
use ephys_core::{EphysError, Position, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

// =============================================================================
// Stage
// =============================================================================

/// Motion settings for one [`Stage`](crate::stage::Stage).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    /// Speed used for `Speed::Fast`. `None` uses the driver maximum.
    pub fast_speed: Option<f64>,

    /// Speed used for `Speed::Slow`.
    pub slow_speed: f64,

    /// Distance from target within which a finished move counts as arrived.
    pub tolerance: f64,

    /// Per-axis `[min, max]` limits in local coordinates.
    pub limits: [Option<[f64; 2]>; 3],

    /// Position poller settings.
    pub poller: PollerConfig,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            fast_speed: None,
            slow_speed: 1e-4,
            tolerance: 5e-7,
            limits: [None; 3],
            poller: PollerConfig::default(),
        }
    }
}

impl StageConfig {
    /// Check speeds, tolerance, limits and poller bounds.
    pub fn validate(&self) -> Result<()> {
        if let Some(fast) = self.fast_speed {
            positive("stage.fast_speed", fast)?;
        }
        positive("stage.slow_speed", self.slow_speed)?;
        positive("stage.tolerance", self.tolerance)?;
        for (axis, limit) in self.limits.iter().enumerate() {
            if let Some([min, max]) = limit {
                if min > max {
                    return Err(EphysError::Configuration(format!(
                        "stage.limits[{axis}] has min {min} > max {max}"
                    )));
                }
            }
        }
        self.poller.validate()
    }
}

/// Adaptive position poller settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    /// Run a poller thread for this stage.
    pub enabled: bool,

    /// Interval while moving, in milliseconds.
    pub min_interval_ms: u64,

    /// Interval reached by doubling while idle, in milliseconds.
    pub max_interval_ms: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_interval_ms: MIN_POLL_INTERVAL.as_millis() as u64,
            max_interval_ms: MAX_POLL_INTERVAL.as_millis() as u64,
        }
    }
}

impl PollerConfig {
    /// Fastest poll interval.
    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    /// Slowest poll interval.
    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms)
    }

    /// Intervals must be non-zero and ordered.
    pub fn validate(&self) -> Result<()> {
        if self.min_interval_ms == 0 || self.min_interval_ms > self.max_interval_ms {
            return Err(EphysError::Configuration(format!(
                "poller intervals must satisfy 0 < min ({}) <= max ({})",
                self.min_interval_ms, self.max_interval_ms
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Pipette
// =============================================================================

/// Geometry and saved positions of a pipette positioner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipetteConfig {
    /// Angle of the pipette below horizontal, in degrees.
    pub pitch_deg: f64,

    /// Direction of the pipette in the xy plane, in degrees from +x.
    pub yaw_deg: f64,

    /// Tip position relative to the stage origin, in stage-local coordinates.
    /// `None` leaves the pipette uncalibrated.
    pub tip_offset: Option<Position>,

    /// Named global tip positions (`home`, `clean`, `rinse`, ...).
    pub saved_positions: BTreeMap<String, Position>,

    /// Distance above the target used by the approach position.
    pub approach_height: f64,

    /// Speed used when visiting saved positions.
    pub travel_speed: Speed,
}

impl Default for PipetteConfig {
    fn default() -> Self {
        Self {
            pitch_deg: 27.0,
            yaw_deg: 0.0,
            tip_offset: None,
            saved_positions: BTreeMap::new(),
            approach_height: 100e-6,
            travel_speed: Speed::Fast,
        }
    }
}

impl PipetteConfig {
    /// Check angles and distances.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..90.0).contains(&self.pitch_deg) {
            return Err(EphysError::Configuration(format!(
                "pipette.pitch_deg must be in [0, 90), got {}",
                self.pitch_deg
            )));
        }
        positive("pipette.approach_height", self.approach_height)
    }
}

// =============================================================================
// Mock hardware
// =============================================================================

/// Simulated motorized stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MockStageConfig {
    /// Maximum speed in m/s.
    pub max_speed: f64,

    /// Position at power-up.
    pub initial_position: Position,

    /// Whether straight-line moves are guaranteed.
    pub linear_motion: bool,

    /// Axes that exist (`[x, y, z]`).
    pub axes: [bool; 3],
}

impl Default for MockStageConfig {
    fn default() -> Self {
        Self {
            max_speed: 5e-3,
            initial_position: [0.0; 3],
            linear_motion: true,
            axes: [true; 3],
        }
    }
}

/// Simulated camera.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MockCameraConfig {
    /// Frames per second.
    pub fps: f64,

    /// Sensor size `[width, height]` in pixels.
    pub sensor: [usize; 2],

    /// Pixel size in meters at the sample.
    pub pixel_size: f64,

    /// Objective name, used as the optical state key.
    pub objective: String,

    /// Background intensity.
    pub background: f64,

    /// Peak intensity of a rendered pipette tip.
    pub tip_intensity: f64,

    /// Depth of field used to blur out-of-focus tips, in meters.
    pub depth_of_field: f64,

    /// Whether the camera exposes a shutter.
    pub has_shutter: bool,

    /// Whether the focus drive supports holding.
    pub has_focus_hold: bool,
}

impl Default for MockCameraConfig {
    fn default() -> Self {
        Self {
            fps: 100.0,
            sensor: [64, 64],
            pixel_size: 1e-6,
            objective: "40x".to_string(),
            background: 10.0,
            tip_intensity: 200.0,
            depth_of_field: 5e-6,
            has_shutter: true,
            has_focus_hold: true,
        }
    }
}

impl MockCameraConfig {
    /// Check rate and geometry.
    pub fn validate(&self) -> Result<()> {
        positive("camera.fps", self.fps)?;
        positive("camera.pixel_size", self.pixel_size)?;
        positive("camera.depth_of_field", self.depth_of_field)?;
        if self.sensor[0] == 0 || self.sensor[1] == 0 {
            return Err(EphysError::Configuration("camera.sensor must be non-empty".into()));
        }
        Ok(())
    }

    /// Interval between frames.
    pub fn frame_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.fps)
    }
}

/// Simulated amplifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MockClampConfig {
    /// Interval between test pulses, in milliseconds.
    pub test_pulse_interval_ms: u64,

    /// Initial access resistance in ohms.
    pub initial_resistance: f64,
}

impl Default for MockClampConfig {
    fn default() -> Self {
        Self {
            test_pulse_interval_ms: 20,
            initial_resistance: 5e6,
        }
    }
}

/// A complete simulated rig: camera on a focus drive, one pipette on a
/// manipulator, a pressure regulator and an amplifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MockRigConfig {
    /// Camera settings.
    pub camera: MockCameraConfig,

    /// Focus drive simulation (z only by default).
    pub focus_drive: MockStageConfig,

    /// Focus stage motion settings.
    pub focus: StageConfig,

    /// Manipulator simulation.
    pub manipulator_drive: MockStageConfig,

    /// Manipulator motion settings.
    pub manipulator: StageConfig,

    /// Pipette geometry and saved positions.
    pub pipette: PipetteConfig,

    /// Amplifier simulation.
    pub clamp: MockClampConfig,

    /// Regulator range `[min, max]` in pascals.
    pub pressure_range: [f64; 2],
}

impl Default for MockRigConfig {
    fn default() -> Self {
        Self {
            camera: MockCameraConfig::default(),
            focus_drive: MockStageConfig {
                axes: [false, false, true],
                ..MockStageConfig::default()
            },
            focus: StageConfig::default(),
            manipulator_drive: MockStageConfig::default(),
            manipulator: StageConfig::default(),
            pipette: PipetteConfig::default(),
            clamp: MockClampConfig::default(),
            pressure_range: [-100e3, 100e3],
        }
    }
}

impl MockRigConfig {
    /// Validate every section.
    pub fn validate(&self) -> Result<()> {
        self.camera.validate()?;
        self.focus.validate()?;
        self.manipulator.validate()?;
        self.pipette.validate()?;
        positive("focus_drive.max_speed", self.focus_drive.max_speed)?;
        positive("manipulator_drive.max_speed", self.manipulator_drive.max_speed)?;
        if self.pressure_range[0] >= self.pressure_range[1] {
            return Err(EphysError::Configuration(format!(
                "pressure_range must be increasing, got {:?}",
                self.pressure_range
            )));
        }
        Ok(())
    }
}

fn positive(name: &str, value: f64) -> Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(EphysError::Configuration(format!(
            "{name} must be positive and finite, got {value}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        StageConfig::default().validate().unwrap();
        PipetteConfig::default().validate().unwrap();
        MockCameraConfig::default().validate().unwrap();
        MockRigConfig::default().validate().unwrap();
    }

    #[test]
    fn test_stage_config_from_toml() {
        let config: StageConfig = toml::from_str(
            r#"
            slow_speed = 2e-5
            limits = [[-0.01, 0.01], [-0.01, 0.01], [0.0, 0.005]]

            [poller]
            min_interval_ms = 40
            "#,
        )
        .unwrap();
        assert_eq!(config.slow_speed, 2e-5);
        assert_eq!(config.limits[2], Some([0.0, 0.005]));
        assert_eq!(config.poller.min_interval_ms, 40);
        assert_eq!(config.poller.max_interval_ms, 300);
        assert!(config.poller.enabled);
    }

    #[test]
    fn test_invalid_configs_rejected() {
        let mut stage = StageConfig::default();
        stage.limits[0] = Some([1.0, -1.0]);
        assert!(matches!(stage.validate(), Err(EphysError::Configuration(_))));

        let poller = PollerConfig {
            enabled: true,
            min_interval_ms: 500,
            max_interval_ms: 100,
        };
        assert!(poller.validate().is_err());

        let camera = MockCameraConfig {
            fps: 0.0,
            ..MockCameraConfig::default()
        };
        assert!(camera.validate().is_err());
    }

    #[test]
    fn test_pipette_speed_parses_from_string_or_number() {
        let config: PipetteConfig = toml::from_str(r#"travel_speed = "slow""#).unwrap();
        assert_eq!(config.travel_speed, Speed::Slow);
        let config: PipetteConfig = toml::from_str("travel_speed = 0.001").unwrap();
        assert_eq!(config.travel_speed, Speed::MetersPerSecond(0.001));
    }
}
