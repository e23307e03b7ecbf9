//! Patch state handlers.
//!
//! Each state is a [`PatchState`] whose [`run`](PatchState::run) body executes
//! as a task on its own thread. The body cooperates with its future (sleeping
//! and waiting through it) so that a state change can stop it promptly, and
//! returns the name of the state to enter next, or `None` to stay put.
//!
//! ```text
//!  out ──▶ bath ──▶ approach ──▶ cell detect ──▶ seal ──▶ break in ──▶ whole cell
//!           │                        │             │          │
//!           ▼                        ▼             ▼          ▼
//!         broken                   bath        fouled/broken  fouled
//!
//!  reseal ──▶ out        blowout ──▶ fouled        clean (terminal, tip clean)
//! ```
//!
//! Extra states are added with [`StateRegistry::register`].

mod approach;
mod bath;
mod break_in;
mod cleanup;
mod seal;
mod terminal;

pub use approach::{Approach, CellDetect};
pub use bath::Bath;
pub use break_in::{BreakIn, WholeCell};
pub use cleanup::{Blowout, Clean, Reseal};
pub use seal::Seal;
pub use terminal::{Broken, Fouled, Out};

use crate::pipette::PatchPipette;
use ephys_core::limits::STOP_POLL_INTERVAL;
use ephys_core::{EphysError, Future, Position, Result};
use ephys_hardware::{MoveFuture, TestPulseAnalysis};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::{self, error::TryRecvError};

/// Future a state body runs under. Its result is the next state, if any.
pub type StateFuture = Future<Option<String>>;

/// Out of the bath. Initial state.
pub const OUT: &str = "out";
/// Tip in the bath.
pub const BATH: &str = "bath";
/// Moving to the approach position above the target.
pub const APPROACH: &str = "approach";
/// Advancing onto the cell.
pub const CELL_DETECT: &str = "cell detect";
/// Forming a gigaseal.
pub const SEAL: &str = "seal";
/// Rupturing the membrane.
pub const BREAK_IN: &str = "break in";
/// Recording.
pub const WHOLE_CELL: &str = "whole cell";
/// Pulling an outside-out patch.
pub const RESEAL: &str = "reseal";
/// Clearing the tip after use.
pub const BLOWOUT: &str = "blowout";
/// Cleaning the tip.
pub const CLEAN: &str = "clean";
/// Tip broken. Terminal.
pub const BROKEN: &str = "broken";
/// Tip dirty. Terminal until cleaned.
pub const FOULED: &str = "fouled";

/// One state of the patch state machine.
pub trait PatchState: Send + Sync {
    /// Public state name.
    fn name(&self) -> &str;

    /// State body. Returns the next state to enter, or `None` to remain in
    /// this state once the body ends.
    fn run(&self, future: &StateFuture, patch: &PatchPipette) -> Result<Option<String>>;

    /// State entered when the body fails. `None` stays in place.
    fn fallback_state(&self) -> Option<&str> {
        Some(FOULED)
    }
}

/// Handlers by name.
#[derive(Clone, Default)]
pub struct StateRegistry {
    handlers: HashMap<String, Arc<dyn PatchState>>,
}

impl std::fmt::Debug for StateRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateRegistry").field("states", &self.names()).finish()
    }
}

impl StateRegistry {
    /// The built-in states.
    pub fn with_defaults() -> Self {
        let mut registry = Self::default();
        let defaults: [Arc<dyn PatchState>; 12] = [
            Arc::new(Out),
            Arc::new(Bath),
            Arc::new(Approach),
            Arc::new(CellDetect),
            Arc::new(Seal),
            Arc::new(BreakIn),
            Arc::new(WholeCell),
            Arc::new(Reseal),
            Arc::new(Blowout),
            Arc::new(Clean),
            Arc::new(Broken),
            Arc::new(Fouled),
        ];
        for handler in defaults {
            registry.register(handler);
        }
        registry
    }

    /// Add or replace a handler. Returns the one it replaced.
    pub fn register(&mut self, handler: Arc<dyn PatchState>) -> Option<Arc<dyn PatchState>> {
        self.handlers.insert(handler.name().to_string(), handler)
    }

    /// Handler for `name`.
    pub fn get(&self, name: &str) -> Result<Arc<dyn PatchState>> {
        self.handlers
            .get(name)
            .cloned()
            .ok_or_else(|| EphysError::Configuration(format!("unknown patch state '{name}'")))
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Wait for a move from inside a state, forwarding stops to it.
pub(crate) fn wait_move(future: &StateFuture, movement: Result<MoveFuture>) -> Result<Position> {
    let movement = movement?;
    future.wait_for(movement.as_future(), None)
}

/// Test pulses delivered since the watch was created.
pub(crate) struct TestPulseWatch {
    device: String,
    rx: broadcast::Receiver<TestPulseAnalysis>,
    timeout: Duration,
}

impl TestPulseWatch {
    pub(crate) fn new(patch: &PatchPipette) -> Self {
        Self {
            device: patch.clamp().name().to_string(),
            rx: patch.clamp().test_pulse_finished().subscribe(),
            timeout: patch.config().test_pulse_timeout(),
        }
    }

    /// Drop pulses received so far.
    pub(crate) fn discard(&mut self) -> Result<()> {
        self.drain().map(|_| ())
    }

    /// The newest pulse, waiting for one if none arrived since the last call.
    ///
    /// A silent amplifier is a hardware fault.
    pub(crate) fn next_pulse(&mut self, future: &StateFuture) -> Result<TestPulseAnalysis> {
        let deadline = Instant::now() + self.timeout;
        loop {
            if let Some(pulse) = self.drain()? {
                return Ok(pulse);
            }
            if Instant::now() >= deadline {
                return Err(EphysError::hardware(
                    &self.device,
                    format!("no test pulse within {:?}", self.timeout),
                ));
            }
            future.sleep(STOP_POLL_INTERVAL)?;
        }
    }

    fn drain(&mut self) -> Result<Option<TestPulseAnalysis>> {
        let mut newest = None;
        loop {
            match self.rx.try_recv() {
                Ok(pulse) => newest = Some(pulse),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Empty) => return Ok(newest),
                Err(TryRecvError::Closed) => {
                    return Err(EphysError::hardware(&self.device, "test pulse stream closed"));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Idle;

    impl PatchState for Idle {
        fn name(&self) -> &str {
            "idle"
        }

        fn run(&self, _future: &StateFuture, _patch: &PatchPipette) -> Result<Option<String>> {
            Ok(None)
        }

        fn fallback_state(&self) -> Option<&str> {
            None
        }
    }

    #[test]
    fn test_default_registry() {
        let registry = StateRegistry::with_defaults();
        assert_eq!(registry.names().len(), 12);
        for name in [OUT, BATH, APPROACH, CELL_DETECT, SEAL, BREAK_IN, WHOLE_CELL, RESEAL, BLOWOUT, CLEAN, BROKEN, FOULED] {
            assert_eq!(registry.get(name).unwrap().name(), name);
        }
        assert!(matches!(registry.get("nope"), Err(EphysError::Configuration(_))));
        assert_eq!(registry.get(SEAL).unwrap().fallback_state(), Some(FOULED));
        assert_eq!(registry.get(BROKEN).unwrap().fallback_state(), None);
    }

    #[test]
    fn test_register_extension() {
        let mut registry = StateRegistry::with_defaults();
        assert!(registry.register(Arc::new(Idle)).is_none());
        assert!(registry.names().contains(&"idle".to_string()));
        assert!(registry.register(Arc::new(Idle)).is_some());
    }
}
