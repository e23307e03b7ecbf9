//! Patch state machine configuration.
//!
//! Pressures are in pascals, resistances in ohms, potentials in volts, lengths
//! in meters and durations in milliseconds.
//!
//! ```toml
//! [patch]
//! state_dir = "/var/lib/ephys"
//!
//! [patch.seal]
//! pressure = -1500.0
//! threshold = 1e9
//! sustain_ms = 500
//!
//! [[patch.clean.sequence]]
//! position = "clean"
//! cycles = [[35000.0, 1000], [-35000.0, 1000]]
//! ```

use ephys_core::{EphysError, Result};
use ephys_hardware::stage::Speed;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

/// Everything the patch states read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatchConfig {
    /// Directory for `<pipette>_last_state.toml`. `None` disables persistence.
    pub state_dir: Option<PathBuf>,

    /// How long a state waits for the next test pulse before failing.
    pub test_pulse_timeout_ms: u64,

    /// `out` state.
    pub out: OutConfig,
    /// `bath` state.
    pub bath: BathConfig,
    /// `approach` state.
    pub approach: ApproachConfig,
    /// `cell detect` state.
    pub cell_detect: CellDetectConfig,
    /// `seal` state.
    pub seal: SealConfig,
    /// `break in` state.
    pub break_in: BreakInConfig,
    /// `whole cell` state.
    pub whole_cell: WholeCellConfig,
    /// `reseal` state.
    pub reseal: ResealConfig,
    /// `blowout` state.
    pub blowout: BlowoutConfig,
    /// `clean` state.
    pub clean: CleanConfig,
}

impl Default for PatchConfig {
    fn default() -> Self {
        Self {
            state_dir: None,
            test_pulse_timeout_ms: 2000,
            out: OutConfig::default(),
            bath: BathConfig::default(),
            approach: ApproachConfig::default(),
            cell_detect: CellDetectConfig::default(),
            seal: SealConfig::default(),
            break_in: BreakInConfig::default(),
            whole_cell: WholeCellConfig::default(),
            reseal: ResealConfig::default(),
            blowout: BlowoutConfig::default(),
            clean: CleanConfig::default(),
        }
    }
}

impl PatchConfig {
    /// Test pulse wait as a duration.
    pub fn test_pulse_timeout(&self) -> Duration {
        ms(self.test_pulse_timeout_ms)
    }

    /// Check thresholds and sequences.
    pub fn validate(&self) -> Result<()> {
        if self.test_pulse_timeout_ms == 0 {
            return Err(EphysError::Configuration("patch.test_pulse_timeout_ms must be > 0".into()));
        }
        if self.bath.min_resistance >= self.bath.max_resistance {
            return Err(EphysError::Configuration(format!(
                "patch.bath resistance window [{}, {}] is empty",
                self.bath.min_resistance, self.bath.max_resistance
            )));
        }
        for (name, value) in [
            ("patch.cell_detect.step", self.cell_detect.step),
            ("patch.cell_detect.max_advance", self.cell_detect.max_advance),
            ("patch.cell_detect.resistance_increase", self.cell_detect.resistance_increase),
            ("patch.seal.threshold", self.seal.threshold),
            ("patch.break_in.threshold", self.break_in.threshold),
            ("patch.reseal.threshold", self.reseal.threshold),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(EphysError::Configuration(format!("{name} must be positive, got {value}")));
            }
        }
        if self.break_in.max_attempts == 0 {
            return Err(EphysError::Configuration("patch.break_in.max_attempts must be >= 1".into()));
        }
        if self.clean.sequence.iter().any(|step| step.position.is_empty()) {
            return Err(EphysError::Configuration("patch.clean.sequence has an unnamed position".into()));
        }
        Ok(())
    }
}

/// `out`: pipette out of the bath.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutConfig {
    /// Move to the `home` saved position on entry, if one exists.
    pub go_home: bool,
}

impl Default for OutConfig {
    fn default() -> Self {
        Self { go_home: true }
    }
}

/// `bath`: tip in the bath, watching for a broken or clogged tip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BathConfig {
    /// Positive pressure keeping the tip clean.
    pub pressure: f64,
    /// Below this resistance the tip is broken.
    pub min_resistance: f64,
    /// Above this resistance the tip is fouled.
    pub max_resistance: f64,
}

impl Default for BathConfig {
    fn default() -> Self {
        Self {
            pressure: 3500.0,
            min_resistance: 2e6,
            max_resistance: 20e6,
        }
    }
}

/// `approach`: move to the approach position above the target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApproachConfig {
    /// Positive pressure during the approach.
    pub pressure: f64,
    /// Approach move speed.
    pub speed: Speed,
}

impl Default for ApproachConfig {
    fn default() -> Self {
        Self {
            pressure: 3500.0,
            speed: Speed::Fast,
        }
    }
}

/// `cell detect`: advance in small steps until resistance rises.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CellDetectConfig {
    /// Pressure while advancing.
    pub pressure: f64,
    /// Distance per step.
    pub step: f64,
    /// Pause between steps, to collect test pulses.
    pub step_interval_ms: u64,
    /// Give up after advancing this far; covers the approach height plus overshoot.
    pub max_advance: f64,
    /// Fractional rise over the starting resistance that counts as a cell.
    pub resistance_increase: f64,
    /// Step speed.
    pub speed: Speed,
}

impl Default for CellDetectConfig {
    fn default() -> Self {
        Self {
            pressure: 1000.0,
            step: 1e-6,
            step_interval_ms: 50,
            max_advance: 120e-6,
            resistance_increase: 0.3,
            speed: Speed::Slow,
        }
    }
}

impl CellDetectConfig {
    /// Step pause as a duration.
    pub fn step_interval(&self) -> Duration {
        ms(self.step_interval_ms)
    }
}

/// `seal`: suction until a gigaseal holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SealConfig {
    /// Suction applied while sealing.
    pub pressure: f64,
    /// Voltage-clamp holding potential.
    pub holding: f64,
    /// Seal resistance.
    pub threshold: f64,
    /// How long resistance must stay above `threshold`.
    pub sustain_ms: u64,
    /// Give up (tip fouled) after this long.
    pub timeout_ms: u64,
    /// Fractional drop from the best resistance that counts as a lost seal.
    pub max_drop: f64,
    /// How long a drop must last before the seal is declared lost.
    pub drop_window_ms: u64,
    /// Below this resistance the tip is broken.
    pub broken_resistance: f64,
}

impl Default for SealConfig {
    fn default() -> Self {
        Self {
            pressure: -1000.0,
            holding: -70e-3,
            threshold: 1e9,
            sustain_ms: 500,
            timeout_ms: 60_000,
            max_drop: 0.5,
            drop_window_ms: 2000,
            broken_resistance: 2e6,
        }
    }
}

impl SealConfig {
    /// Sustain window as a duration.
    pub fn sustain(&self) -> Duration {
        ms(self.sustain_ms)
    }

    /// Timeout as a duration.
    pub fn timeout(&self) -> Duration {
        ms(self.timeout_ms)
    }

    /// Drop window as a duration.
    pub fn drop_window(&self) -> Duration {
        ms(self.drop_window_ms)
    }
}

/// `break in`: suction pulses until access is gained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakInConfig {
    /// Pulse pressure.
    pub pressure: f64,
    /// Pulse length.
    pub pulse_ms: u64,
    /// Pulses before giving up.
    pub max_attempts: u32,
    /// Below this resistance the membrane is broken.
    pub threshold: f64,
}

impl Default for BreakInConfig {
    fn default() -> Self {
        Self {
            pressure: -30e3,
            pulse_ms: 200,
            max_attempts: 5,
            threshold: 500e6,
        }
    }
}

impl BreakInConfig {
    /// Pulse length as a duration.
    pub fn pulse(&self) -> Duration {
        ms(self.pulse_ms)
    }
}

/// `whole cell`: recording configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WholeCellConfig {
    /// Voltage-clamp holding potential.
    pub holding: f64,
    /// Enable auto bias at this target when switching to current clamp.
    pub auto_bias_target: f64,
    /// Below this resistance the cell is lost.
    pub lost_resistance: f64,
}

impl Default for WholeCellConfig {
    fn default() -> Self {
        Self {
            holding: -70e-3,
            auto_bias_target: -70e-3,
            lost_resistance: 20e6,
        }
    }
}

/// `reseal`: pull away slowly to form an outside-out patch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResealConfig {
    /// Suction while retracting.
    pub pressure: f64,
    /// Retraction distance.
    pub retract_distance: f64,
    /// Retraction speed.
    pub speed: Speed,
    /// Resistance of a resealed patch.
    pub threshold: f64,
}

impl Default for ResealConfig {
    fn default() -> Self {
        Self {
            pressure: -500.0,
            retract_distance: 50e-6,
            speed: Speed::Slow,
            threshold: 1e9,
        }
    }
}

/// `blowout`: clear the tip after a recording.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlowoutConfig {
    /// Retract this far before blowing out.
    pub retract_distance: f64,
    /// Blowout pressure.
    pub pressure: f64,
    /// Blowout length.
    pub duration_ms: u64,
}

impl Default for BlowoutConfig {
    fn default() -> Self {
        Self {
            retract_distance: 20e-6,
            pressure: 65e3,
            duration_ms: 500,
        }
    }
}

/// One stop on the cleaning path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanStep {
    /// Saved position name.
    pub position: String,
    /// `(pressure, duration_ms)` pairs applied in order at that position.
    pub cycles: Vec<(f64, u64)>,
}

/// `clean`: expel and aspirate cleaning solution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanConfig {
    /// Positions visited in order.
    pub sequence: Vec<CleanStep>,
    /// Travel speed between positions.
    pub speed: Speed,
}

impl Default for CleanConfig {
    fn default() -> Self {
        let alternate = |n: usize, ms: u64| {
            std::iter::repeat([(35e3, ms), (-35e3, ms)])
                .take(n)
                .flatten()
                .collect::<Vec<_>>()
        };
        Self {
            sequence: vec![
                CleanStep {
                    position: "clean".into(),
                    cycles: alternate(3, 1000),
                },
                CleanStep {
                    position: "rinse".into(),
                    cycles: alternate(3, 500),
                },
            ],
            speed: Speed::Fast,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        PatchConfig::default().validate().unwrap();
        let clean = CleanConfig::default();
        assert_eq!(clean.sequence.len(), 2);
        assert_eq!(clean.sequence[0].cycles.len(), 6);
        assert_eq!(clean.sequence[0].cycles[1], (-35e3, 1000));
    }

    #[test]
    fn test_partial_toml() {
        let config: PatchConfig = toml::from_str(
            r#"
            state_dir = "/tmp/ephys"

            [seal]
            threshold = 2e9
            sustain_ms = 100

            [[clean.sequence]]
            position = "clean"
            cycles = [[20000.0, 100], [-20000.0, 100]]
            "#,
        )
        .unwrap();
        assert_eq!(config.state_dir, Some(PathBuf::from("/tmp/ephys")));
        assert_eq!(config.seal.threshold, 2e9);
        assert_eq!(config.seal.pressure, -1000.0);
        assert_eq!(config.clean.sequence.len(), 1);
        assert_eq!(config.bath, BathConfig::default());
    }

    #[test]
    fn test_invalid_rejected() {
        let mut config = PatchConfig::default();
        config.bath.min_resistance = 30e6;
        assert!(config.validate().is_err());

        let mut config = PatchConfig::default();
        config.break_in.max_attempts = 0;
        assert!(matches!(config.validate(), Err(EphysError::Configuration(_))));
    }
}
