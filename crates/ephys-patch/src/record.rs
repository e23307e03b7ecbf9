//! Per-attempt patch records.
//!
//! A [`PatchRecord`] summarizes one attempt to patch a cell: which steps ran,
//! whether they worked and how long they took. Exactly one record is open per
//! pipette once the first attempt has started; [`RecordSlot::new_patch_attempt`]
//! closes it and opens the next.

use chrono::{DateTime, Utc};
use ephys_core::{Position, Signal};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Summary of one patch attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchRecord {
    /// Unique id of the attempt.
    pub attempt_id: Uuid,
    /// Pipette name.
    pub pipette: String,
    /// When the record was opened.
    pub start_time: DateTime<Utc>,
    /// Tip resistance in the bath.
    pub initial_resistance: Option<f64>,
    /// Baseline current in the bath (pipette offset).
    pub initial_offset: Option<f64>,
    /// `cell detect` ran.
    pub attempted_cell_detect: bool,
    /// A cell was detected.
    pub cell_detected: Option<bool>,
    /// Seconds from entering `cell detect` to detection.
    pub cell_detect_latency: Option<f64>,
    /// `seal` ran.
    pub attempted_seal: bool,
    /// A seal formed.
    pub seal_successful: Option<bool>,
    /// Resistance when the seal was accepted.
    pub seal_resistance: Option<f64>,
    /// Seconds from entering `seal` to a sustained seal.
    pub seal_latency: Option<f64>,
    /// `break in` ran.
    pub attempted_breakin: bool,
    /// Break-in succeeded.
    pub breakin_successful: Option<bool>,
    /// Suction pulses used.
    pub breakin_attempts: u32,
    /// When the whole-cell recording began.
    pub whole_cell_start_time: Option<DateTime<Utc>>,
    /// `reseal` ran.
    pub attempted_reseal: bool,
    /// Reseal succeeded.
    pub reseal_successful: Option<bool>,
    /// Pipette position when the attempt targeted a cell.
    pub target_position: Option<Position>,
    /// The record was closed.
    pub complete: bool,
    /// When the record was closed.
    pub end_time: Option<DateTime<Utc>>,
}

impl PatchRecord {
    /// Fresh record with every key at its default.
    pub fn new(pipette: impl Into<String>) -> Self {
        Self {
            attempt_id: Uuid::new_v4(),
            pipette: pipette.into(),
            start_time: Utc::now(),
            initial_resistance: None,
            initial_offset: None,
            attempted_cell_detect: false,
            cell_detected: None,
            cell_detect_latency: None,
            attempted_seal: false,
            seal_successful: None,
            seal_resistance: None,
            seal_latency: None,
            attempted_breakin: false,
            breakin_successful: None,
            breakin_attempts: 0,
            whole_cell_start_time: None,
            attempted_reseal: false,
            reseal_successful: None,
            target_position: None,
            complete: false,
            end_time: None,
        }
    }

    /// Keys and values in declaration order, as storage consumers expect.
    ///
    /// Keys are the serialized (camelCase) field names.
    pub fn iter(&self) -> impl Iterator<Item = (String, Value)> {
        // Plain fields with string keys always serialize to an object.
        let fields = match serde_json::to_value(self) {
            Ok(Value::Object(fields)) => fields,
            _ => Map::new(),
        };
        fields.into_iter()
    }
}

/// Holder of the open record for one pipette.
pub struct RecordSlot {
    pipette: String,
    current: Mutex<Option<PatchRecord>>,
    finished: Signal<PatchRecord>,
}

impl std::fmt::Debug for RecordSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordSlot")
            .field("pipette", &self.pipette)
            .field("open", &self.current.lock().is_some())
            .finish()
    }
}

impl RecordSlot {
    /// Slot with no open record.
    pub fn new(pipette: impl Into<String>) -> Self {
        let pipette = pipette.into();
        Self {
            finished: Signal::new(format!("{pipette}.patch_record_finished")),
            pipette,
            current: Mutex::new(None),
        }
    }

    /// Copy of the open record, if any.
    pub fn current(&self) -> Option<PatchRecord> {
        self.current.lock().clone()
    }

    /// Close the open record (publishing it with `complete = true`) and open a
    /// fresh one. Returns the closed record.
    pub fn new_patch_attempt(&self) -> Option<PatchRecord> {
        let closed = {
            let mut current = self.current.lock();
            let closed = current.take().map(|mut record| {
                record.complete = true;
                record.end_time = Some(Utc::now());
                record
            });
            *current = Some(PatchRecord::new(self.pipette.clone()));
            closed
        };
        if let Some(record) = &closed {
            self.finished.emit(record);
        }
        closed
    }

    /// Edit the open record. Returns `false` when there is none.
    pub fn update(&self, edit: impl FnOnce(&mut PatchRecord)) -> bool {
        match self.current.lock().as_mut() {
            Some(record) => {
                edit(record);
                true
            }
            None => false,
        }
    }

    /// Fired with each closed record.
    pub fn finished(&self) -> &Signal<PatchRecord> {
        &self.finished
    }
}
