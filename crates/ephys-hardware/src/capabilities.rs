//! Device capability traits.
//!
//! Each optional device operation is its own trait; a device either implements
//! it or does not. The rig core consumes these traits and never depends on a
//! concrete driver.
//!
//! # Traits
//!
//! - [`StageDriver`] - low-level motion controller behind a [`Stage`](crate::stage::Stage)
//! - [`Imager`] - camera with a focus drive
//! - [`ShutterControl`], [`FocusHold`] - optional imager extras
//! - [`PressureControl`] - pipette pressure regulator
//! - [`PatchClamp`] - amplifier with a test pulse
//!
//! All operations are blocking. Long operations return a
//! [`Future`](ephys_core::Future) and run on their own thread.

use crate::move_future::MoveFuture;
use crate::stage::Speed;
use chrono::{DateTime, Utc};
use ephys_core::{Frame, Future, Position, Result, Signal};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

// =============================================================================
// Motion
// =============================================================================

/// What a single axis supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AxisCapabilities {
    /// Position can be read.
    pub get: bool,
    /// Position can be commanded.
    pub set: bool,
    /// Software limits can be applied.
    pub limits: bool,
}

impl AxisCapabilities {
    /// Readable, writable and limitable.
    pub const FULL: Self = Self {
        get: true,
        set: true,
        limits: true,
    };

    /// Axis does not exist.
    pub const ABSENT: Self = Self {
        get: false,
        set: false,
        limits: false,
    };

    /// Whether the axis is in use at all.
    pub fn enabled(&self) -> bool {
        self.get || self.set
    }
}

/// Capability descriptor of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCapabilities {
    /// Per-axis capabilities, `[x, y, z]`.
    pub axes: [AxisCapabilities; 3],
    /// Whether the controller guarantees straight-line paths.
    pub linear_motion: bool,
}

/// Axis names in order.
pub const AXIS_NAMES: [&str; 3] = ["x", "y", "z"];

/// Low-level motion controller.
///
/// Positions are in device-local meters. Implementations must be safe to call
/// from several threads; the owning [`Stage`](crate::stage::Stage) serializes
/// public operations with its device lock.
pub trait StageDriver: Send + Sync {
    /// Which axes exist and what they support.
    fn capabilities(&self) -> StageCapabilities;

    /// Read the current position from the hardware.
    fn read_position(&self) -> Result<Position>;

    /// Begin moving to `target` at `speed` (m/s) and return without waiting.
    fn start_move(&self, target: Position, speed: f64, linear: bool) -> Result<()>;

    /// Whether the hardware reports motion in progress.
    fn is_moving(&self) -> Result<bool>;

    /// Stop any motion immediately.
    fn halt(&self) -> Result<()>;

    /// Fastest supported speed (m/s).
    fn max_speed(&self) -> f64;
}

// =============================================================================
// Imaging
// =============================================================================

/// Camera with a focus drive.
pub trait Imager: Send + Sync {
    /// Device name.
    fn name(&self) -> &str;

    /// Begin free-running acquisition.
    fn start_acquisition(&self) -> Result<()>;

    /// End free-running acquisition.
    fn stop_acquisition(&self) -> Result<()>;

    /// Whether acquisition is running.
    fn is_acquiring(&self) -> bool;

    /// Collect `count` frames, or with `None` collect until the future is
    /// stopped. Stopping an open-ended acquisition completes the future with
    /// the frames collected so far.
    fn acquire_frames(&self, count: Option<usize>) -> Future<Vec<Frame>>;

    /// Current focus depth (global z) in meters.
    fn focus_depth(&self) -> Result<f64>;

    /// Move focus to `depth`.
    fn set_focus_depth(&self, depth: f64, speed: Speed) -> Result<MoveFuture>;

    /// Frames per second the camera is expected to deliver.
    fn estimated_frame_rate(&self) -> f64;

    /// Key identifying the optical configuration (objective, filter).
    fn optical_state_key(&self) -> String;

    /// Name of the focus device, for reservations.
    fn focus_device_name(&self) -> Option<String> {
        None
    }

    /// Shutter, if the light path has one.
    fn shutter(&self) -> Option<&dyn ShutterControl> {
        None
    }

    /// Focus hold, if the focus drive supports it.
    fn focus_hold(&self) -> Option<&dyn FocusHold> {
        None
    }
}

/// Illumination shutter.
pub trait ShutterControl: Send + Sync {
    /// Open (`true`) or close the shutter.
    fn open_shutter(&self, open: bool) -> Result<()>;
}

/// Focus drive hold (locks out manual focus and drift correction).
pub trait FocusHold: Send + Sync {
    /// Engage or release the hold.
    fn set_holding(&self, hold: bool) -> Result<()>;
}

/// Keeps acquisition running for its lifetime.
///
/// Dropping the guard stops acquisition; failures are logged.
pub struct AcquisitionGuard<'a> {
    imager: &'a dyn Imager,
    started: bool,
}

impl<'a> AcquisitionGuard<'a> {
    /// Start acquisition unless it is already running.
    pub fn start(imager: &'a dyn Imager) -> Result<Self> {
        let started = if imager.is_acquiring() {
            false
        } else {
            imager.start_acquisition()?;
            true
        };
        Ok(Self { imager, started })
    }
}

impl Drop for AcquisitionGuard<'_> {
    fn drop(&mut self) {
        if self.started {
            if let Err(err) = self.imager.stop_acquisition() {
                warn!(imager = %self.imager.name(), error = %err, "failed to stop acquisition");
            }
        }
    }
}

// =============================================================================
// Pressure
// =============================================================================

/// Where the pipette pressure comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PressureSource {
    /// Vented to atmosphere.
    Atmosphere,
    /// Driven by the regulator setpoint.
    Regulator,
    /// Manual control (mouth or syringe).
    User,
}

impl fmt::Display for PressureSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Atmosphere => write!(f, "atmosphere"),
            Self::Regulator => write!(f, "regulator"),
            Self::User => write!(f, "user"),
        }
    }
}

/// Payload of [`PressureControl::pressure_changed`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PressureChange {
    /// Active source.
    pub source: PressureSource,
    /// Regulator setpoint in pascals.
    pub pressure: f64,
}

/// Pipette pressure controller.
pub trait PressureControl: Send + Sync {
    /// Device name.
    fn name(&self) -> &str;

    /// Set the regulator setpoint in pascals.
    fn set_pressure(&self, pascals: f64) -> Result<()>;

    /// Select the pressure source.
    fn set_source(&self, source: PressureSource) -> Result<()>;

    /// Current regulator setpoint.
    fn pressure(&self) -> f64;

    /// Current source.
    fn source(&self) -> PressureSource;

    /// Fired on every setpoint or source change.
    fn pressure_changed(&self) -> &Signal<PressureChange>;

    /// Set the setpoint, then the source.
    fn apply(&self, source: PressureSource, pascals: f64) -> Result<()> {
        self.set_pressure(pascals)?;
        self.set_source(source)
    }
}

// =============================================================================
// Amplifier
// =============================================================================

/// Amplifier clamp mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClampMode {
    /// Voltage clamp.
    #[serde(rename = "VC")]
    VoltageClamp,
    /// Current clamp.
    #[serde(rename = "IC")]
    CurrentClamp,
    /// Current clamp with zero injected current.
    #[serde(rename = "I=0")]
    ZeroCurrent,
}

impl fmt::Display for ClampMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::VoltageClamp => write!(f, "VC"),
            Self::CurrentClamp => write!(f, "IC"),
            Self::ZeroCurrent => write!(f, "I=0"),
        }
    }
}

/// Mode and holding snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClampState {
    /// Active mode.
    pub mode: ClampMode,
    /// Holding value for the active mode (V in VC, A in IC).
    pub holding: f64,
}

/// Result of one test pulse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestPulseAnalysis {
    /// When the pulse was delivered.
    pub timestamp: DateTime<Utc>,
    /// Steady-state resistance in ohms.
    pub steady_state_resistance: f64,
    /// Peak (access) resistance in ohms.
    pub peak_resistance: f64,
    /// Baseline current in amperes.
    pub baseline_current: f64,
    /// Baseline potential in volts.
    pub baseline_potential: f64,
    /// Holding value at the time of the pulse.
    pub holding: f64,
    /// Mode at the time of the pulse.
    pub mode: ClampMode,
}

/// Payload of [`PatchClamp::auto_bias_changed`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AutoBias {
    /// Whether auto bias is active.
    pub enabled: bool,
    /// Target potential in volts.
    pub target: f64,
}

/// Patch-clamp amplifier.
pub trait PatchClamp: Send + Sync {
    /// Device name.
    fn name(&self) -> &str;

    /// Switch clamp mode.
    fn set_mode(&self, mode: ClampMode) -> Result<()>;

    /// Set the holding value used in `mode`.
    fn set_holding(&self, mode: ClampMode, value: f64) -> Result<()>;

    /// Start or stop periodic test pulses.
    fn enable_test_pulse(&self, enable: bool) -> Result<()>;

    /// Whether test pulses are running.
    fn test_pulse_enabled(&self) -> bool;

    /// Enable or disable auto bias in current clamp.
    fn set_auto_bias(&self, enabled: bool, target: f64) -> Result<()>;

    /// Current mode and holding.
    fn state(&self) -> ClampState;

    /// Most recent test pulse, if any.
    fn last_test_pulse(&self) -> Option<TestPulseAnalysis>;

    /// Fired after every test pulse.
    fn test_pulse_finished(&self) -> &Signal<TestPulseAnalysis>;

    /// Fired on mode or holding changes.
    fn clamp_state_changed(&self) -> &Signal<ClampState>;

    /// Fired on auto bias changes.
    fn auto_bias_changed(&self) -> &Signal<AutoBias>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enum_wire_names() {
        assert_eq!(serde_json::to_string(&ClampMode::ZeroCurrent).unwrap(), "\"I=0\"");
        assert_eq!(serde_json::to_string(&PressureSource::Atmosphere).unwrap(), "\"atmosphere\"");
        assert_eq!(PressureSource::Regulator.to_string(), "regulator");
        assert_eq!(ClampMode::VoltageClamp.to_string(), "VC");
    }

    #[test]
    fn test_axis_enabled() {
        assert!(AxisCapabilities::FULL.enabled());
        assert!(!AxisCapabilities::ABSENT.enabled());
        let read_only = AxisCapabilities {
            get: true,
            ..AxisCapabilities::ABSENT
        };
        assert!(read_only.enabled());
    }
}
