//! Append-only log of everything that happens to one patch pipette.
//!
//! Device callbacks and the state manager append [`EventEntry`]s from many
//! threads. Entries are ordered by append time under the log's mutex and their
//! timestamps strictly increase, so sorting by timestamp and by position agree.
//!
//! ```text
//! 2026-10-18T09:12:01.002Z  pipette1  state_change     {"old":"out","new":"bath"}
//! 2026-10-18T09:12:01.004Z  pressure  pressure_changed {"source":"regulator","pressure":3500.0}
//! 2026-10-18T09:12:01.021Z  clamp     test_pulse       {"steadyStateResistance":5e6, ...}
//! ```

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use ephys_core::Signal;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// What kind of thing happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// The active state changed (`{old, new}`).
    StateChange,
    /// A state handler failed (`{state, error, fallback}`).
    StateError,
    /// Pressure source or setpoint changed.
    PressureChanged,
    /// A pipette move was requested.
    MoveRequested,
    /// The manipulator started moving.
    MoveStart,
    /// The manipulator stopped.
    MoveStop,
    /// Test pulse analysis.
    TestPulse,
    /// Amplifier auto bias changed.
    AutoBiasChange,
    /// Amplifier mode or holding changed.
    ClampStateChange,
    /// `tip_clean` flag changed.
    TipCleanChanged,
    /// `tip_broken` flag changed.
    TipBrokenChanged,
    /// Pipette calibration changed.
    PipetteCalibrated,
    /// A fresh pipette was mounted.
    NewPipette,
    /// A new patch attempt began.
    NewPatchAttempt,
    /// A patch record was closed.
    PatchRecordFinished,
}

impl EventKind {
    /// Wire name, e.g. `"state_change"`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StateChange => "state_change",
            Self::StateError => "state_error",
            Self::PressureChanged => "pressure_changed",
            Self::MoveRequested => "move_requested",
            Self::MoveStart => "move_start",
            Self::MoveStop => "move_stop",
            Self::TestPulse => "test_pulse",
            Self::AutoBiasChange => "auto_bias_change",
            Self::ClampStateChange => "clamp_state_change",
            Self::TipCleanChanged => "tip_clean_changed",
            Self::TipBrokenChanged => "tip_broken_changed",
            Self::PipetteCalibrated => "pipette_calibrated",
            Self::NewPipette => "new_pipette",
            Self::NewPatchAttempt => "new_patch_attempt",
            Self::PatchRecordFinished => "patch_record_finished",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One logged event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEntry {
    /// Append time, strictly increasing within a log.
    pub timestamp: DateTime<Utc>,
    /// Device the event concerns.
    pub device: String,
    /// Event kind.
    #[serde(rename = "event")]
    pub kind: EventKind,
    /// Kind-specific payload.
    pub payload: Value,
}

struct LogInner {
    entries: Mutex<Vec<EventEntry>>,
    appended: Signal<EventEntry>,
}

/// Shared handle to an event log. Clones append to the same log.
#[derive(Clone)]
pub struct EventLog {
    inner: Arc<LogInner>,
}

impl fmt::Debug for EventLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLog").field("len", &self.len()).finish()
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new("event_log")
    }
}

impl EventLog {
    /// Empty log; `name` labels its signal.
    pub fn new(name: &str) -> Self {
        Self {
            inner: Arc::new(LogInner {
                entries: Mutex::new(Vec::new()),
                appended: Signal::new(format!("{name}.appended")),
            }),
        }
    }

    /// Append an event and notify subscribers. Returns the stored entry.
    pub fn append(&self, device: &str, kind: EventKind, payload: Value) -> EventEntry {
        let entry = {
            let mut entries = self.inner.entries.lock();
            let mut timestamp = Utc::now();
            if let Some(last) = entries.last() {
                if timestamp <= last.timestamp {
                    timestamp = last.timestamp + ChronoDuration::nanoseconds(1);
                }
            }
            let entry = EventEntry {
                timestamp,
                device: device.to_string(),
                kind,
                payload,
            };
            entries.push(entry.clone());
            entry
        };
        self.inner.appended.emit(&entry);
        entry
    }

    /// Append `payload` serialized to JSON. Serialization failures are logged
    /// and recorded as a null payload.
    pub fn append_serialized<P: Serialize>(&self, device: &str, kind: EventKind, payload: &P) -> EventEntry {
        let value = serde_json::to_value(payload).unwrap_or_else(|err| {
            warn!(device = %device, event = %kind, error = %err, "event payload not serializable");
            Value::Null
        });
        self.append(device, kind, value)
    }

    /// Fired after every append.
    pub fn appended(&self) -> &Signal<EventEntry> {
        &self.inner.appended
    }

    /// Snapshot of all entries in append order.
    pub fn entries(&self) -> Vec<EventEntry> {
        self.inner.entries.lock().clone()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    /// Whether nothing was logged yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries of one kind, in append order.
    pub fn entries_of(&self, kind: EventKind) -> Vec<EventEntry> {
        self.inner
            .entries
            .lock()
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }

    /// One JSON object per line.
    pub fn to_json_lines(&self) -> serde_json::Result<String> {
        let entries = self.inner.entries.lock();
        let mut out = String::new();
        for entry in entries.iter() {
            out.push_str(&serde_json::to_string(entry)?);
            out.push('\n');
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_timestamps_strictly_increase() {
        let log = EventLog::default();
        for i in 0..500 {
            log.append("clamp", EventKind::TestPulse, json!({ "i": i }));
        }
        let entries = log.entries();
        assert_eq!(entries.len(), 500);
        assert!(entries.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }

    #[test]
    fn test_concurrent_appends_stay_ordered() {
        let log = EventLog::default();
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let log = log.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        log.append(&format!("dev{t}"), EventKind::MoveStart, json!(i));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let entries = log.entries();
        assert_eq!(entries.len(), 400);
        assert!(entries.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }

    #[test]
    fn test_filter_and_json_lines() {
        let log = EventLog::default();
        log.append("pipette1", EventKind::StateChange, json!({"old": "out", "new": "bath"}));
        log.append("pressure", EventKind::PressureChanged, json!({"source": "atmosphere"}));

        let changes = log.entries_of(EventKind::StateChange);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].payload["new"], "bath");

        let lines = log.to_json_lines().unwrap();
        assert_eq!(lines.lines().count(), 2);
        assert!(lines.contains("\"event\":\"pressure_changed\""));
        assert_eq!(EventKind::AutoBiasChange.to_string(), "auto_bias_change");
    }

    #[test]
    fn test_appended_signal() {
        let log = EventLog::default();
        let mut rx = log.appended().subscribe();
        log.append("pipette1", EventKind::NewPipette, Value::Null);
        let entry = rx.try_recv().unwrap();
        assert_eq!(entry.kind, EventKind::NewPipette);
        assert!(!log.is_empty());
    }
}
