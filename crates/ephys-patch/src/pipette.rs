//! A patch pipette: positioner, pressure line and amplifier driven by a state
//! machine.

use crate::config::PatchConfig;
use crate::event_log::{EventKind, EventLog};
use crate::manager::{StateChange, StateManager};
use crate::persistence::{last_state_path, save_last_state, LastState};
use crate::record::{PatchRecord, RecordSlot};
use crate::states::{PatchState, StateFuture, StateRegistry};
use ephys_core::{Observable, Result, Signal};
use ephys_hardware::{MoveEvent, PatchClamp, Pipette, PressureControl, PressureSource};
use parking_lot::Mutex;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

type Disconnect = Box<dyn FnOnce() + Send>;

/// Pipette plus the devices and bookkeeping needed to patch a cell.
///
/// Device notifications (pressure, motion, amplifier) and flag changes are
/// appended to the [`EventLog`] as they happen. Every state change is logged
/// and, with a `state_dir`, snapshotted to disk.
///
/// ```rust,no_run
/// # use ephys_hardware::drivers::mock::MockRig;
/// # use ephys_hardware::MockRigConfig;
/// # use ephys_patch::{PatchConfig, PatchPipette};
/// # use std::sync::Arc;
/// # fn example() -> ephys_core::Result<()> {
/// let rig = MockRig::new(&MockRigConfig::default())?;
/// let patch = PatchPipette::new(
///     Arc::clone(&rig.pipette),
///     rig.pressure.clone(),
///     rig.clamp.clone(),
///     PatchConfig::default(),
/// )?;
/// patch.new_patch_attempt();
/// patch.set_state("bath")?;
/// # Ok(())
/// # }
/// ```
pub struct PatchPipette {
    name: String,
    pipette: Arc<Pipette>,
    pressure: Arc<dyn PressureControl>,
    clamp: Arc<dyn PatchClamp>,
    config: PatchConfig,
    event_log: EventLog,
    records: RecordSlot,
    active: Observable<bool>,
    tip_clean: Observable<bool>,
    tip_broken: Observable<bool>,
    manager: StateManager,
    subscriptions: Mutex<Vec<Disconnect>>,
}

impl std::fmt::Debug for PatchPipette {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatchPipette")
            .field("name", &self.name)
            .field("state", &self.current_state())
            .field("events", &self.event_log.len())
            .finish_non_exhaustive()
    }
}

impl PatchPipette {
    /// Wire the devices together with the built-in states. The pipette starts
    /// in `out` with no patch record open.
    pub fn new(
        pipette: Arc<Pipette>,
        pressure: Arc<dyn PressureControl>,
        clamp: Arc<dyn PatchClamp>,
        config: PatchConfig,
    ) -> Result<Arc<Self>> {
        Self::with_registry(pipette, pressure, clamp, config, StateRegistry::with_defaults())
    }

    /// Like [`new`](Self::new) with a custom set of states.
    pub fn with_registry(
        pipette: Arc<Pipette>,
        pressure: Arc<dyn PressureControl>,
        clamp: Arc<dyn PatchClamp>,
        config: PatchConfig,
        registry: StateRegistry,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let name = pipette.name().to_string();
        let patch = Arc::new(Self {
            event_log: EventLog::new(&name),
            records: RecordSlot::new(name.clone()),
            active: Observable::new(format!("{name}.active"), false)
                .with_description("pipette is in use"),
            tip_clean: Observable::new(format!("{name}.tip_clean"), false),
            tip_broken: Observable::new(format!("{name}.tip_broken"), false),
            manager: StateManager::new(&name, registry),
            subscriptions: Mutex::new(Vec::new()),
            name,
            pipette,
            pressure,
            clamp,
            config,
        });
        patch.connect_event_sources();
        patch.manager.start(Arc::downgrade(&patch))?;
        info!(pipette = %patch.name, "patch pipette ready");
        Ok(patch)
    }

    fn connect_event_sources(&self) {
        let mut subscriptions = self.subscriptions.lock();

        let log = self.event_log.clone();
        let device = self.pressure.name().to_string();
        let signal = self.pressure.pressure_changed().clone();
        let id = signal.connect(move |change| {
            log.append_serialized(&device, EventKind::PressureChanged, change);
        });
        subscriptions.push(Box::new(move || {
            signal.disconnect(id);
        }));

        let log = self.event_log.clone();
        let device = self.name.clone();
        let signal = self.pipette.stage().move_event().clone();
        let id = signal.connect(move |event| match event {
            MoveEvent::Requested { target, speed } => {
                log.append(&device, EventKind::MoveRequested, json!({ "target": target, "speed": speed }));
            }
            MoveEvent::Started { target } => {
                log.append(&device, EventKind::MoveStart, json!({ "target": target }));
            }
            MoveEvent::Finished { position, interrupted } => {
                log.append(
                    &device,
                    EventKind::MoveStop,
                    json!({ "position": position, "interrupted": interrupted }),
                );
            }
        });
        subscriptions.push(Box::new(move || {
            signal.disconnect(id);
        }));

        let clamp = self.clamp.name().to_string();
        let log = self.event_log.clone();
        let device = clamp.clone();
        let signal = self.clamp.test_pulse_finished().clone();
        let id = signal.connect(move |pulse| {
            log.append_serialized(&device, EventKind::TestPulse, pulse);
        });
        subscriptions.push(Box::new(move || {
            signal.disconnect(id);
        }));

        let log = self.event_log.clone();
        let device = clamp.clone();
        let signal = self.clamp.auto_bias_changed().clone();
        let id = signal.connect(move |bias| {
            log.append_serialized(&device, EventKind::AutoBiasChange, bias);
        });
        subscriptions.push(Box::new(move || {
            signal.disconnect(id);
        }));

        let log = self.event_log.clone();
        let device = clamp;
        let signal = self.clamp.clamp_state_changed().clone();
        let id = signal.connect(move |state| {
            log.append_serialized(&device, EventKind::ClampStateChange, state);
        });
        subscriptions.push(Box::new(move || {
            signal.disconnect(id);
        }));

        let flags = [
            (&self.tip_clean, EventKind::TipCleanChanged, "clean"),
            (&self.tip_broken, EventKind::TipBrokenChanged, "broken"),
        ];
        for (flag, kind, key) in flags {
            let log = self.event_log.clone();
            let device = self.name.clone();
            let signal = flag.changed().clone();
            let id = signal.connect(move |value| {
                log.append(&device, kind, json!({ key: value }));
            });
            subscriptions.push(Box::new(move || {
                signal.disconnect(id);
            }));
        }

        let log = self.event_log.clone();
        let device = self.name.clone();
        let pipette = Arc::downgrade(&self.pipette);
        let signal = self.pipette.calibrated().changed().clone();
        let id = signal.connect(move |calibrated| {
            let offset = pipette.upgrade().map(|p| p.tip_offset());
            log.append(
                &device,
                EventKind::PipetteCalibrated,
                json!({ "calibrated": calibrated, "tipOffset": offset }),
            );
        });
        subscriptions.push(Box::new(move || {
            signal.disconnect(id);
        }));

        let log = self.event_log.clone();
        let device = self.name.clone();
        let signal = self.records.finished().clone();
        let id = signal.connect(move |record| {
            log.append_serialized(&device, EventKind::PatchRecordFinished, record);
        });
        subscriptions.push(Box::new(move || {
            signal.disconnect(id);
        }));
    }

    /// Pipette name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The positioner.
    pub fn pipette(&self) -> &Arc<Pipette> {
        &self.pipette
    }

    /// Pressure controller.
    pub fn pressure(&self) -> &Arc<dyn PressureControl> {
        &self.pressure
    }

    /// Amplifier.
    pub fn clamp(&self) -> &Arc<dyn PatchClamp> {
        &self.clamp
    }

    /// State thresholds and timings.
    pub fn config(&self) -> &PatchConfig {
        &self.config
    }

    /// Everything that happened to this pipette.
    pub fn event_log(&self) -> &EventLog {
        &self.event_log
    }

    /// Pipette is in use.
    pub fn active(&self) -> &Observable<bool> {
        &self.active
    }

    /// Mark the pipette in use or idle.
    pub fn set_active(&self, active: bool) {
        self.active.set_if_changed(active);
    }

    /// Tip is clean.
    pub fn tip_clean(&self) -> &Observable<bool> {
        &self.tip_clean
    }

    /// Tip is broken.
    pub fn tip_broken(&self) -> &Observable<bool> {
        &self.tip_broken
    }

    /// Update the clean flag; changes are logged.
    pub fn set_tip_clean(&self, clean: bool) {
        self.tip_clean.set_if_changed(clean);
    }

    /// Update the broken flag; changes are logged.
    pub fn set_tip_broken(&self, broken: bool) {
        self.tip_broken.set_if_changed(broken);
    }

    /// Select the pressure source and setpoint.
    pub fn set_pressure(&self, source: PressureSource, pascals: f64) -> Result<()> {
        self.pressure.apply(source, pascals)
    }

    /// A fresh pipette was mounted: clean, unbroken and uncalibrated.
    pub fn new_pipette(&self) {
        self.event_log.append(&self.name, EventKind::NewPipette, json!({}));
        self.pipette.clear_calibration();
        self.set_tip_clean(true);
        self.set_tip_broken(false);
        info!(pipette = %self.name, "new pipette");
    }

    /// Close the open patch record and open a new one. Returns the closed
    /// record, which is also published on [`record_finished`](Self::record_finished).
    pub fn new_patch_attempt(&self) -> Option<PatchRecord> {
        let closed = self.records.new_patch_attempt();
        let attempt = self.records.current().map(|record| record.attempt_id);
        self.event_log
            .append(&self.name, EventKind::NewPatchAttempt, json!({ "attemptId": attempt }));
        closed
    }

    /// Copy of the open patch record.
    pub fn patch_record(&self) -> Option<PatchRecord> {
        self.records.current()
    }

    /// Edit the open patch record, if there is one.
    pub fn update_record(&self, edit: impl FnOnce(&mut PatchRecord)) {
        self.records.update(edit);
    }

    /// Fired with each closed patch record.
    pub fn record_finished(&self) -> &Signal<PatchRecord> {
        self.records.finished()
    }

    /// Name of the active state.
    pub fn current_state(&self) -> String {
        self.manager.current_state()
    }

    /// Future of the active state's handler.
    pub fn state_future(&self) -> Option<StateFuture> {
        self.manager.state_future()
    }

    /// Fired after every state change.
    pub fn state_changed(&self) -> &Signal<StateChange> {
        self.manager.state_changed()
    }

    /// Switch state, blocking until the new handler runs. See [`StateManager::set_state`].
    pub fn set_state(&self, name: &str) -> Result<StateFuture> {
        self.manager.set_state(name)
    }

    /// Queue a state change. Safe to call from state handlers.
    pub fn request_state_change(&self, name: &str) -> Result<()> {
        self.manager.request_state_change(name)
    }

    /// Add or replace a state handler.
    pub fn register_state(&self, handler: Arc<dyn PatchState>) {
        self.manager.register(handler);
    }

    /// Names of all known states.
    pub fn state_names(&self) -> Vec<String> {
        self.manager.state_names()
    }

    /// Stop the state machine and disable test pulses.
    pub fn quit(&self) -> Result<()> {
        self.manager.quit()
    }

    /// Where the last-state snapshot is written, if persistence is enabled.
    pub fn last_state_path(&self) -> Option<PathBuf> {
        self.config
            .state_dir
            .as_deref()
            .map(|dir| last_state_path(dir, &self.name))
    }

    /// Log a transition and snapshot it. Called by the state manager.
    pub(crate) fn record_transition(&self, old: &str, new: &str) {
        self.event_log
            .append(&self.name, EventKind::StateChange, json!({ "old": old, "new": new }));
        let Some(path) = self.last_state_path() else {
            return;
        };
        let snapshot = LastState {
            state: new.to_string(),
            active: self.active.get(),
            calibrated: self.pipette.is_calibrated(),
            broken: self.tip_broken.get(),
        };
        if let Err(err) = save_last_state(&path, &snapshot) {
            warn!(pipette = %self.name, path = %path.display(), error = %err, "failed to save last state");
        }
    }
}

impl Drop for PatchPipette {
    fn drop(&mut self) {
        for disconnect in self.subscriptions.get_mut().drain(..) {
            disconnect();
        }
    }
}
