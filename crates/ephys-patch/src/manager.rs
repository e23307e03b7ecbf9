//! State manager: runs one state handler at a time for a patch pipette.
//!
//! A single worker thread owns every transition. Requests and handler
//! completions reach it through one channel, so transitions are serialized:
//!
//! ```text
//!  set_state / request_state_change ──┐
//!                                     ├──▶ worker ──▶ stop old handler, wait
//!  handler finished (on_finish) ──────┘                log state_change, persist
//!                                                       spawn new handler
//! ```
//!
//! A handler that fails triggers the safety path: pressure is vented to
//! atmosphere, `state_error` is logged and the handler's fallback state is
//! entered. A handler stopped from outside the manager is vented and left
//! where it is.

use crate::event_log::EventKind;
use crate::pipette::PatchPipette;
use crate::states::{PatchState, StateFuture, StateRegistry, OUT};
use ephys_core::limits::SHUTDOWN_TIMEOUT;
use ephys_core::{EphysError, Result, Signal, TaskBuilder};
use ephys_hardware::PressureSource;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::{Arc, Weak};
use std::thread::{JoinHandle, ThreadId};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Payload of [`StateManager::state_changed`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    /// State that was left.
    pub old: String,
    /// State that was entered.
    pub new: String,
}

enum Command {
    Request {
        name: String,
        reply: Option<oneshot::Sender<Result<StateFuture>>>,
    },
    Finished {
        generation: u64,
    },
    Quit {
        reply: oneshot::Sender<()>,
    },
}

struct Active {
    name: String,
    future: Option<StateFuture>,
    generation: u64,
    thread: Option<ThreadId>,
}

struct Shared {
    pipette: String,
    active: Mutex<Active>,
    registry: RwLock<StateRegistry>,
    state_changed: Signal<StateChange>,
}

/// Serializes state transitions for one [`PatchPipette`].
pub struct StateManager {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
    pending: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for StateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateManager")
            .field("pipette", &self.shared.pipette)
            .field("state", &self.current_state())
            .finish_non_exhaustive()
    }
}

impl StateManager {
    /// Manager in state `out`. Nothing runs until [`start`](Self::start);
    /// the `out` handler itself only runs when `out` is requested.
    pub(crate) fn new(pipette: &str, registry: StateRegistry) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                pipette: pipette.to_string(),
                active: Mutex::new(Active {
                    name: OUT.to_string(),
                    future: None,
                    generation: 0,
                    thread: None,
                }),
                registry: RwLock::new(registry),
                state_changed: Signal::new(format!("{pipette}.state_changed")),
            }),
            commands,
            pending: Mutex::new(Some(rx)),
            worker: Mutex::new(None),
        }
    }

    /// Spawn the worker thread serving `patch`.
    pub(crate) fn start(&self, patch: Weak<PatchPipette>) -> Result<()> {
        let rx = self
            .pending
            .lock()
            .take()
            .ok_or_else(|| EphysError::ProtocolViolation("state manager started twice".into()))?;
        let worker = Worker {
            shared: Arc::clone(&self.shared),
            patch,
            commands: self.commands.downgrade(),
        };
        let handle = std::thread::Builder::new()
            .name(format!("{}-states", self.shared.pipette))
            .spawn(move || worker.run(rx))?;
        *self.worker.lock() = Some(handle);
        Ok(())
    }

    /// Name of the active state.
    pub fn current_state(&self) -> String {
        self.shared.active.lock().name.clone()
    }

    /// Future of the active state's handler, if one was started.
    pub fn state_future(&self) -> Option<StateFuture> {
        self.shared.active.lock().future.clone()
    }

    /// Fired after every transition.
    pub fn state_changed(&self) -> &Signal<StateChange> {
        &self.shared.state_changed
    }

    /// Add or replace a state handler.
    pub fn register(&self, handler: Arc<dyn PatchState>) {
        self.shared.registry.write().register(handler);
    }

    /// Names of all known states.
    pub fn state_names(&self) -> Vec<String> {
        self.shared.registry.read().names()
    }

    /// Stop the active handler, wait for it to exit, and start `name`.
    ///
    /// Blocks until the new handler is running and returns its future. State
    /// handlers must use [`request_state_change`](Self::request_state_change)
    /// instead; calling this from a handler is a protocol violation.
    pub fn set_state(&self, name: &str) -> Result<StateFuture> {
        if self.on_handler_thread() {
            return Err(EphysError::ProtocolViolation(format!(
                "set_state('{name}') called from inside a state handler; use request_state_change"
            )));
        }
        self.ensure_started()?;
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Request {
                name: name.to_string(),
                reply: Some(reply),
            })
            .map_err(|_| self.quit_error())?;
        response.blocking_recv().map_err(|_| self.quit_error())?
    }

    /// Queue a transition to `name` without waiting.
    ///
    /// The transition happens on the worker after the active handler has been
    /// stopped. Unknown names are logged and ignored.
    pub fn request_state_change(&self, name: &str) -> Result<()> {
        self.commands
            .send(Command::Request {
                name: name.to_string(),
                reply: None,
            })
            .map_err(|_| self.quit_error())
    }

    /// Stop the active handler, disable test pulses and end the worker.
    ///
    /// Calling it again is a no-op.
    pub fn quit(&self) -> Result<()> {
        if self.on_handler_thread() {
            return Err(EphysError::ProtocolViolation(
                "quit() called from inside a state handler".into(),
            ));
        }
        if self.ensure_started().is_err() {
            return Ok(());
        }
        let (reply, done) = oneshot::channel();
        if self.commands.send(Command::Quit { reply }).is_ok() {
            // A closed reply means the worker already exited.
            let _ = done.blocking_recv();
        }
        if let Some(handle) = self.worker.lock().take() {
            if handle.thread().id() != std::thread::current().id() && handle.join().is_err() {
                warn!(pipette = %self.shared.pipette, "state worker panicked");
            }
        }
        Ok(())
    }

    fn ensure_started(&self) -> Result<()> {
        if self.pending.lock().is_some() {
            return Err(EphysError::ProtocolViolation(format!(
                "state manager for {} was never started",
                self.shared.pipette
            )));
        }
        Ok(())
    }

    fn on_handler_thread(&self) -> bool {
        self.shared.active.lock().thread == Some(std::thread::current().id())
    }

    fn quit_error(&self) -> EphysError {
        EphysError::ProtocolViolation(format!("state manager for {} has quit", self.shared.pipette))
    }
}

struct Worker {
    shared: Arc<Shared>,
    patch: Weak<PatchPipette>,
    commands: mpsc::WeakUnboundedSender<Command>,
}

impl Worker {
    fn run(self, mut rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = rx.blocking_recv() {
            let Some(patch) = self.patch.upgrade() else {
                break;
            };
            match command {
                Command::Request { name, reply } => {
                    let entered = self.enter(&patch, &name);
                    match reply {
                        Some(reply) => {
                            let _ = reply.send(entered);
                        }
                        None => {
                            if let Err(err) = entered {
                                warn!(pipette = %self.shared.pipette, state = %name, error = %err, "state change rejected");
                            }
                        }
                    }
                }
                Command::Finished { generation } => self.finished(&patch, generation),
                Command::Quit { reply } => {
                    self.shutdown(&patch);
                    let _ = reply.send(());
                    break;
                }
            }
        }
        debug!(pipette = %self.shared.pipette, "state worker exiting");
    }

    /// Stop the active handler and start `name`.
    fn enter(&self, patch: &Arc<PatchPipette>, name: &str) -> Result<StateFuture> {
        let handler = self.shared.registry.read().get(name)?;

        let previous = self.shared.active.lock().future.clone();
        if let Some(previous) = previous {
            if !previous.is_done() {
                previous.stop(format!("state change to '{name}'"));
                self.wait_stopped(&previous);
            }
        }

        let (old, generation) = {
            let mut active = self.shared.active.lock();
            let old = std::mem::replace(&mut active.name, name.to_string());
            active.generation += 1;
            active.future = None;
            active.thread = None;
            (old, active.generation)
        };
        info!(pipette = %self.shared.pipette, from = %old, to = %name, "state change");
        patch.record_transition(&old, name);
        self.shared.state_changed.emit(&StateChange {
            old,
            new: name.to_string(),
        });

        let future = self.spawn(handler, generation);
        {
            let mut active = self.shared.active.lock();
            if active.generation == generation {
                active.future = Some(future.clone());
            }
        }
        if let Some(commands) = self.commands.upgrade() {
            future.on_finish(move |_| {
                let _ = commands.send(Command::Finished { generation });
            });
        }
        Ok(future)
    }

    fn spawn(&self, handler: Arc<dyn PatchState>, generation: u64) -> StateFuture {
        let shared = Arc::clone(&self.shared);
        let patch = Weak::clone(&self.patch);
        TaskBuilder::new(format!("{}:{}", self.shared.pipette, handler.name())).spawn(move |future| {
            {
                let mut active = shared.active.lock();
                if active.generation == generation {
                    active.thread = Some(std::thread::current().id());
                }
            }
            let patch = patch
                .upgrade()
                .ok_or_else(|| EphysError::ProtocolViolation("patch pipette dropped".into()))?;
            handler.run(future, &patch)
        })
    }

    /// React to a handler that ended on its own.
    fn finished(&self, patch: &Arc<PatchPipette>, generation: u64) {
        let (name, future) = {
            let active = self.shared.active.lock();
            if active.generation != generation {
                return;
            }
            (active.name.clone(), active.future.clone())
        };
        let Some(future) = future else {
            return;
        };
        match future.try_result() {
            None | Some(Ok(None)) => {
                debug!(pipette = %self.shared.pipette, state = %name, "state handler finished");
            }
            Some(Ok(Some(next))) => {
                if let Err(err) = self.enter(patch, &next) {
                    self.fail(patch, &name, &err);
                }
            }
            Some(Err(err)) => match future.error() {
                Some(err) => self.fail(patch, &name, &err),
                None => {
                    warn!(pipette = %self.shared.pipette, state = %name, reason = %err, "state stopped outside the manager");
                    vent(patch);
                }
            },
        }
    }

    /// Safety path for a failed handler.
    fn fail(&self, patch: &Arc<PatchPipette>, state: &str, err: &EphysError) {
        vent(patch);
        let fallback = self
            .shared
            .registry
            .read()
            .get(state)
            .ok()
            .and_then(|handler| handler.fallback_state().map(str::to_string));
        error!(pipette = %self.shared.pipette, state = %state, error = %err, fallback = ?fallback, "state failed");
        patch.event_log().append(
            patch.name(),
            EventKind::StateError,
            json!({ "state": state, "error": err.to_string(), "fallback": fallback }),
        );
        if let Some(next) = fallback.filter(|next| next != state) {
            if let Err(err) = self.enter(patch, &next) {
                error!(pipette = %self.shared.pipette, state = %next, error = %err, "fallback state failed to start");
            }
        }
    }

    fn shutdown(&self, patch: &Arc<PatchPipette>) {
        let current = self.shared.active.lock().future.clone();
        if let Some(future) = current {
            future.stop("pipette quit");
            self.wait_stopped(&future);
        }
        if let Err(err) = patch.clamp().enable_test_pulse(false) {
            warn!(pipette = %self.shared.pipette, error = %err, "failed to disable test pulse");
        }
        info!(pipette = %self.shared.pipette, "state manager stopped");
    }

    fn wait_stopped(&self, future: &StateFuture) {
        while !future.wait_until_done(Some(SHUTDOWN_TIMEOUT)) {
            warn!(pipette = %self.shared.pipette, task = %future.name(), "state handler slow to stop");
        }
    }
}

fn vent(patch: &PatchPipette) {
    if let Err(err) = patch.set_pressure(PressureSource::Atmosphere, 0.0) {
        warn!(pipette = %patch.name(), error = %err, "failed to vent pressure");
    }
}
