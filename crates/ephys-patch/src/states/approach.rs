use super::{wait_move, PatchState, StateFuture, TestPulseWatch, APPROACH, BATH, CELL_DETECT, SEAL};
use crate::pipette::PatchPipette;
use ephys_core::{EphysError, Result};
use ephys_hardware::{ClampMode, PressureSource};
use std::time::Instant;
use tracing::info;

/// Move to the approach position above the target cell.
#[derive(Debug, Clone, Copy, Default)]
pub struct Approach;

impl PatchState for Approach {
    fn name(&self) -> &str {
        APPROACH
    }

    fn run(&self, future: &StateFuture, patch: &PatchPipette) -> Result<Option<String>> {
        let config = &patch.config().approach;
        let pipette = patch.pipette();
        let target = pipette
            .target()
            .ok_or_else(|| EphysError::Configuration(format!("{} has no cell target", patch.name())))?;

        patch.set_pressure(PressureSource::Regulator, config.pressure)?;
        patch.update_record(|record| record.target_position = Some(target));

        future.set_state("moving to approach position");
        wait_move(future, pipette.move_tip_to_global(pipette.approach_position(target), config.speed))?;
        Ok(Some(CELL_DETECT.into()))
    }
}

/// Step toward the target until the tip resistance rises.
///
/// The resistance of the first pulse is the baseline; a cell is detected once
/// a pulse exceeds it by `resistance_increase`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CellDetect;

impl PatchState for CellDetect {
    fn name(&self) -> &str {
        CELL_DETECT
    }

    fn run(&self, future: &StateFuture, patch: &PatchPipette) -> Result<Option<String>> {
        let config = &patch.config().cell_detect;
        let started = Instant::now();
        patch.update_record(|record| record.attempted_cell_detect = true);
        patch.set_pressure(PressureSource::Regulator, config.pressure)?;

        let clamp = patch.clamp();
        clamp.set_mode(ClampMode::VoltageClamp)?;
        clamp.enable_test_pulse(true)?;

        let mut watch = TestPulseWatch::new(patch);
        let baseline = watch.next_pulse(future)?.steady_state_resistance;
        let detect_at = baseline * (1.0 + config.resistance_increase);

        let mut advanced = 0.0;
        loop {
            let resistance = watch.next_pulse(future)?.steady_state_resistance;
            if resistance > detect_at {
                let latency = started.elapsed().as_secs_f64();
                patch.update_record(|record| {
                    record.cell_detected = Some(true);
                    record.cell_detect_latency = Some(latency);
                });
                info!(pipette = %patch.name(), resistance, baseline, latency, "cell detected");
                return Ok(Some(SEAL.into()));
            }
            if advanced >= config.max_advance {
                patch.update_record(|record| record.cell_detected = Some(false));
                return Err(EphysError::DetectionFailure(format!(
                    "no cell within {:.1} um of the approach position",
                    advanced * 1e6
                )));
            }
            future.set_percent_done(100.0 * advanced / config.max_advance);
            wait_move(future, patch.pipette().advance(config.step, config.speed))?;
            advanced += config.step;
            watch.discard()?;
            future.sleep(config.step_interval())?;
        }
    }

    fn fallback_state(&self) -> Option<&str> {
        Some(BATH)
    }
}
