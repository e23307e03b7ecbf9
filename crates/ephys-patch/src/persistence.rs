//! Last-state snapshots.
//!
//! After every state change the pipette writes a small flat TOML file so a
//! restarted process can see where it left off:
//!
//! ```toml
//! state = "seal"
//! active = true
//! calibrated = true
//! broken = false
//! ```
//!
//! Snapshots are informational; nothing resumes from them automatically.

use ephys_core::{EphysError, Result};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Contents of `<pipette>_last_state.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastState {
    /// Active state name.
    pub state: String,
    /// Pipette `active` flag.
    pub active: bool,
    /// Pipette calibration flag.
    pub calibrated: bool,
    /// Pipette `tip_broken` flag.
    pub broken: bool,
}

/// Snapshot path for `pipette` under `dir`.
pub fn last_state_path(dir: &Path, pipette: &str) -> PathBuf {
    dir.join(format!("{pipette}_last_state.toml"))
}

/// Write `state` to `path`, creating parent directories.
///
/// The file is staged as a temporary file in the destination directory and
/// persisted over `path`, so readers never see a partial snapshot.
pub fn save_last_state(path: &Path, state: &LastState) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;
    let content = toml::to_string(state)
        .map_err(|e| EphysError::Configuration(format!("cannot serialize last state: {e}")))?;
    let mut staging = NamedTempFile::new_in(dir)?;
    staging.write_all(content.as_bytes())?;
    staging.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Read a snapshot written by [`save_last_state`].
pub fn load_last_state(path: &Path) -> Result<LastState> {
    let content = std::fs::read_to_string(path)?;
    toml::from_str(&content)
        .map_err(|e| EphysError::Configuration(format!("invalid last state file {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_is_flat_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = last_state_path(dir.path(), "pipette1");
        assert!(path.ends_with("pipette1_last_state.toml"));

        let state = LastState {
            state: "cell detect".into(),
            active: true,
            calibrated: false,
            broken: false,
        };
        save_last_state(&path, &state).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("state = \"cell detect\""));
        assert!(!text.contains('['));
        assert_eq!(load_last_state(&path).unwrap(), state);
    }

    #[test]
    fn test_missing_and_corrupt_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.toml");
        assert!(load_last_state(&path).is_err());

        std::fs::write(&path, "state = ").unwrap();
        assert!(matches!(load_last_state(&path), Err(EphysError::Configuration(_))));
    }

    #[test]
    fn test_rewrite_replaces_snapshot_without_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let path = last_state_path(&dir.path().join("state"), "pipette2");

        let mut state = LastState {
            state: "bath".into(),
            active: false,
            calibrated: true,
            broken: false,
        };
        save_last_state(&path, &state).unwrap();
        state.state = "broken".into();
        state.broken = true;
        save_last_state(&path, &state).unwrap();

        assert_eq!(load_last_state(&path).unwrap(), state);
        let names: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("pipette2_last_state.toml")]);
    }
}
