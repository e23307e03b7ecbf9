//! `ephys-patch`
//!
//! Patch pipette state machine for rig automation.
//!
//! A [`PatchPipette`] combines a stage-mounted [`Pipette`](ephys_hardware::Pipette),
//! a [`PressureControl`](ephys_hardware::PressureControl) and a
//! [`PatchClamp`](ephys_hardware::PatchClamp). Its [`StateManager`] runs one
//! [`PatchState`] at a time (`out`, `bath`, `approach`, `cell detect`, `seal`,
//! `break in`, `whole cell`, ...), each as a cancellable task.
//!
//! ## Modules
//!
//! - [`pipette`] - the patch pipette and its flags
//! - [`manager`] - serialized state transitions and failure handling
//! - [`states`] - built-in state handlers and the registry for extensions
//! - [`record`] - per-attempt [`PatchRecord`]s
//! - [`event_log`] - the append-only [`EventLog`]
//! - [`persistence`] - last-state snapshots
//! - [`config`] - thresholds and timings

pub mod config;
pub mod event_log;
pub mod manager;
pub mod persistence;
pub mod pipette;
pub mod record;
pub mod states;

pub use config::{
    ApproachConfig, BathConfig, BlowoutConfig, BreakInConfig, CellDetectConfig, CleanConfig, CleanStep, OutConfig,
    PatchConfig, ResealConfig, SealConfig, WholeCellConfig,
};
pub use event_log::{EventEntry, EventKind, EventLog};
pub use manager::{StateChange, StateManager};
pub use persistence::{last_state_path, load_last_state, save_last_state, LastState};
pub use pipette::PatchPipette;
pub use record::{PatchRecord, RecordSlot};
pub use states::{PatchState, StateFuture, StateRegistry};
