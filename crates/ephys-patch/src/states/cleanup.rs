use super::{wait_move, PatchState, StateFuture, TestPulseWatch, BLOWOUT, CLEAN, FOULED, OUT, RESEAL};
use crate::pipette::PatchPipette;
use ephys_core::Result;
use ephys_hardware::pipette::HOME;
use ephys_hardware::{PressureSource, Speed};
use std::time::Duration;
use tracing::info;

/// Pull back slowly under suction so the membrane reseals on the tip.
#[derive(Debug, Clone, Copy, Default)]
pub struct Reseal;

impl PatchState for Reseal {
    fn name(&self) -> &str {
        RESEAL
    }

    fn run(&self, future: &StateFuture, patch: &PatchPipette) -> Result<Option<String>> {
        let config = &patch.config().reseal;
        patch.update_record(|record| record.attempted_reseal = true);
        patch.clamp().enable_test_pulse(true)?;
        patch.set_pressure(PressureSource::Regulator, config.pressure)?;

        future.set_state("retracting");
        wait_move(future, patch.pipette().retract(config.retract_distance, config.speed))?;

        let mut watch = TestPulseWatch::new(patch);
        let resistance = watch.next_pulse(future)?.steady_state_resistance;
        let resealed = resistance >= config.threshold;
        patch.update_record(|record| record.reseal_successful = Some(resealed));
        patch.set_pressure(PressureSource::Atmosphere, 0.0)?;
        info!(pipette = %patch.name(), resistance, resealed, "reseal finished");
        Ok(Some(OUT.into()))
    }
}

/// Back away from the tissue and blow the tip clear.
#[derive(Debug, Clone, Copy, Default)]
pub struct Blowout;

impl PatchState for Blowout {
    fn name(&self) -> &str {
        BLOWOUT
    }

    fn run(&self, future: &StateFuture, patch: &PatchPipette) -> Result<Option<String>> {
        let config = &patch.config().blowout;
        patch.set_pressure(PressureSource::Atmosphere, 0.0)?;
        wait_move(future, patch.pipette().retract(config.retract_distance, Speed::Fast))?;

        future.set_state("blowing out");
        patch.set_pressure(PressureSource::Regulator, config.pressure)?;
        let blown = future.sleep(Duration::from_millis(config.duration_ms));
        patch.set_pressure(PressureSource::Atmosphere, 0.0)?;
        blown?;
        Ok(Some(FOULED.into()))
    }
}

/// Visit each cleaning position, cycling pressure, then return home.
#[derive(Debug, Clone, Copy, Default)]
pub struct Clean;

impl PatchState for Clean {
    fn name(&self) -> &str {
        CLEAN
    }

    fn run(&self, future: &StateFuture, patch: &PatchPipette) -> Result<Option<String>> {
        let config = &patch.config().clean;
        let pipette = patch.pipette();
        patch.set_pressure(PressureSource::Atmosphere, 0.0)?;

        let total = config.sequence.len().max(1) as f64;
        for (index, step) in config.sequence.iter().enumerate() {
            future.set_state(format!("cleaning: {}", step.position));
            wait_move(future, pipette.goto_saved_position(&step.position, config.speed))?;
            for &(pressure, ms) in &step.cycles {
                patch.set_pressure(PressureSource::Regulator, pressure)?;
                if let Err(err) = future.sleep(Duration::from_millis(ms)) {
                    patch.set_pressure(PressureSource::Atmosphere, 0.0)?;
                    return Err(err);
                }
            }
            patch.set_pressure(PressureSource::Atmosphere, 0.0)?;
            future.set_percent_done(100.0 * (index + 1) as f64 / total);
        }

        if pipette.saved_position_names().iter().any(|n| n == HOME) {
            future.set_state("moving home");
            wait_move(future, pipette.go_home(config.speed))?;
        }
        patch.set_tip_clean(true);
        info!(pipette = %patch.name(), "tip cleaned");
        Ok(None)
    }
}
