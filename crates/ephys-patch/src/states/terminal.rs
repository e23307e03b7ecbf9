use super::{wait_move, PatchState, StateFuture, BROKEN, FOULED, OUT};
use crate::pipette::PatchPipette;
use ephys_core::Result;
use ephys_hardware::pipette::HOME;
use ephys_hardware::{PressureSource, Speed};
use tracing::{debug, info};

/// Pipette out of the bath: vent pressure and park at `home`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Out;

impl PatchState for Out {
    fn name(&self) -> &str {
        OUT
    }

    fn run(&self, future: &StateFuture, patch: &PatchPipette) -> Result<Option<String>> {
        patch.set_pressure(PressureSource::Atmosphere, 0.0)?;
        let pipette = patch.pipette();
        if patch.config().out.go_home && pipette.saved_position_names().iter().any(|n| n == HOME) {
            future.set_state("moving home");
            wait_move(future, pipette.go_home(Speed::Fast))?;
        } else {
            debug!(pipette = %patch.name(), "no home position; staying put");
        }
        Ok(None)
    }

    fn fallback_state(&self) -> Option<&str> {
        None
    }
}

/// Tip broken. Nothing moves until a new pipette is mounted.
#[derive(Debug, Clone, Copy, Default)]
pub struct Broken;

impl PatchState for Broken {
    fn name(&self) -> &str {
        BROKEN
    }

    fn run(&self, _future: &StateFuture, patch: &PatchPipette) -> Result<Option<String>> {
        patch.set_pressure(PressureSource::Atmosphere, 0.0)?;
        patch.set_tip_broken(true);
        info!(pipette = %patch.name(), "tip broken");
        Ok(None)
    }

    fn fallback_state(&self) -> Option<&str> {
        None
    }
}

/// Tip dirty: it must be cleaned or replaced before the next attempt.
#[derive(Debug, Clone, Copy, Default)]
pub struct Fouled;

impl PatchState for Fouled {
    fn name(&self) -> &str {
        FOULED
    }

    fn run(&self, _future: &StateFuture, patch: &PatchPipette) -> Result<Option<String>> {
        patch.set_pressure(PressureSource::Atmosphere, 0.0)?;
        patch.set_tip_clean(false);
        Ok(None)
    }

    fn fallback_state(&self) -> Option<&str> {
        None
    }
}
