//! Rig configuration loaded with Figment.
//!
//! A single TOML file describes the whole simulated rig, merged with
//! environment overrides prefixed `EPHYS_` (nested keys separated by `__`,
//! e.g. `EPHYS_PATCH__SEAL__THRESHOLD=2e9`). Missing tables fall back to
//! their defaults.
//!
//! ```toml
//! [logging]
//! level = "debug"
//! format = "compact"
//!
//! [rig.camera]
//! fps = 50.0
//!
//! [sequencer]
//! over_travel = 20e-6
//!
//! [patch.seal]
//! threshold = 1e9
//! ```

use crate::logging::TracingConfig;
use anyhow::{Context, Result};
use ephys_hardware::MockRigConfig;
use ephys_imaging::{SequencerConfig, TrackerConfig};
use ephys_patch::PatchConfig;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Environment prefix for overrides.
pub const ENV_PREFIX: &str = "EPHYS_";

/// Everything needed to assemble and run a simulated rig.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RigConfig {
    /// Log level and format.
    pub logging: TracingConfig,
    /// Simulated devices.
    pub rig: MockRigConfig,
    /// Image sequencer.
    pub sequencer: SequencerConfig,
    /// Pipette tracker.
    pub tracker: TrackerConfig,
    /// Patch state machine.
    pub patch: PatchConfig,
}

impl RigConfig {
    /// Load `path` merged with `EPHYS_` environment overrides, then validate.
    ///
    /// A missing file is not an error; defaults and the environment still apply.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let config: Self = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .with_context(|| format!("failed to load rig config from {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults merged with `EPHYS_` environment overrides.
    pub fn from_env() -> Result<Self> {
        let config: Self = Figment::from(figment::providers::Serialized::defaults(Self::default()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .context("failed to load rig config from the environment")?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a TOML document, without environment overrides.
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let config: Self = Figment::from(Toml::string(toml))
            .extract()
            .context("failed to parse rig config")?;
        config.validate()?;
        Ok(config)
    }

    /// Check every section.
    pub fn validate(&self) -> Result<()> {
        self.logging.level().context("invalid [logging]")?;
        self.rig.validate().context("invalid [rig]")?;
        self.sequencer.validate().context("invalid [sequencer]")?;
        self.tracker.validate().context("invalid [tracker]")?;
        self.patch.validate().context("invalid [patch]")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::OutputFormat;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_empty_document_is_default() {
        let config = RigConfig::from_toml_str("").unwrap();
        assert_eq!(config, RigConfig::default());
    }

    #[test]
    fn test_partial_sections() {
        let config = RigConfig::from_toml_str(
            r#"
            [logging]
            level = "debug"
            format = "json"

            [rig.camera]
            fps = 50.0

            [patch.seal]
            threshold = 2e9
            "#,
        )
        .unwrap();
        assert_eq!(config.logging.format, OutputFormat::Json);
        assert_eq!(config.rig.camera.fps, 50.0);
        assert_eq!(config.rig.camera.objective, MockRigConfig::default().camera.objective);
        assert_eq!(config.patch.seal.threshold, 2e9);
        assert_eq!(config.patch.bath, PatchConfig::default().bath);
        assert_eq!(config.sequencer, SequencerConfig::default());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = RigConfig::from_toml_str("[logging]\nlevel = \"loud\"").unwrap_err();
        assert!(format!("{err:#}").contains("logging"));

        let err = RigConfig::from_toml_str("[patch]\ntest_pulse_timeout_ms = 0").unwrap_err();
        assert!(format!("{err:#}").contains("patch"));

        assert!(RigConfig::from_toml_str("[rig]\ncamera = 3").is_err());
    }

    #[test]
    #[serial]
    fn test_file_with_env_override() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[patch.seal]\nthreshold = 2e9\n\n[sequencer]\nover_travel = 1e-5").unwrap();

        std::env::set_var("EPHYS_PATCH__SEAL__THRESHOLD", "3e9");
        let loaded = RigConfig::load_from(file.path());
        std::env::remove_var("EPHYS_PATCH__SEAL__THRESHOLD");

        let config = loaded.unwrap();
        assert_eq!(config.patch.seal.threshold, 3e9);
        assert_eq!(config.sequencer.over_travel, 1e-5);
    }

    #[test]
    #[serial]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = RigConfig::load_from(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.patch, PatchConfig::default());
    }
}
