use super::{PatchState, StateFuture, TestPulseWatch, BREAK_IN, FOULED, WHOLE_CELL};
use crate::pipette::PatchPipette;
use chrono::Utc;
use ephys_core::Result;
use ephys_hardware::{ClampMode, PressureSource};
use tracing::{info, warn};

/// Rupture the patch with short suction pulses.
///
/// Before every pulse the resistance is checked; once it falls below
/// `threshold` the membrane is open.
#[derive(Debug, Clone, Copy, Default)]
pub struct BreakIn;

impl PatchState for BreakIn {
    fn name(&self) -> &str {
        BREAK_IN
    }

    fn run(&self, future: &StateFuture, patch: &PatchPipette) -> Result<Option<String>> {
        let config = &patch.config().break_in;
        patch.update_record(|record| record.attempted_breakin = true);

        let clamp = patch.clamp();
        clamp.set_mode(ClampMode::VoltageClamp)?;
        clamp.enable_test_pulse(true)?;
        patch.set_pressure(PressureSource::Atmosphere, 0.0)?;

        let mut watch = TestPulseWatch::new(patch);
        for attempt in 0..=config.max_attempts {
            let resistance = watch.next_pulse(future)?.steady_state_resistance;
            if resistance < config.threshold {
                patch.update_record(|record| record.breakin_successful = Some(true));
                info!(pipette = %patch.name(), resistance, pulses = attempt, "broke in");
                return Ok(Some(WHOLE_CELL.into()));
            }
            if attempt == config.max_attempts {
                break;
            }

            future.set_state(format!("suction pulse {}", attempt + 1));
            patch.update_record(|record| record.breakin_attempts = attempt + 1);
            patch.set_pressure(PressureSource::Regulator, config.pressure)?;
            let pulsed = future.sleep(config.pulse());
            patch.set_pressure(PressureSource::Atmosphere, 0.0)?;
            pulsed?;
            watch.discard()?;
        }

        warn!(pipette = %patch.name(), attempts = config.max_attempts, "break-in failed");
        patch.update_record(|record| record.breakin_successful = Some(false));
        Ok(Some(FOULED.into()))
    }
}

/// Whole-cell recording. Watches for the cell being lost.
#[derive(Debug, Clone, Copy, Default)]
pub struct WholeCell;

impl PatchState for WholeCell {
    fn name(&self) -> &str {
        WHOLE_CELL
    }

    fn run(&self, future: &StateFuture, patch: &PatchPipette) -> Result<Option<String>> {
        let config = &patch.config().whole_cell;
        patch.update_record(|record| {
            record.whole_cell_start_time.get_or_insert_with(Utc::now);
        });
        patch.set_pressure(PressureSource::Atmosphere, 0.0)?;

        let clamp = patch.clamp();
        clamp.set_mode(ClampMode::VoltageClamp)?;
        clamp.set_holding(ClampMode::VoltageClamp, config.holding)?;
        clamp.set_auto_bias(true, config.auto_bias_target)?;
        clamp.enable_test_pulse(true)?;

        let mut watch = TestPulseWatch::new(patch);
        loop {
            let resistance = watch.next_pulse(future)?.steady_state_resistance;
            if resistance < config.lost_resistance {
                warn!(pipette = %patch.name(), resistance, "cell lost");
                return Ok(Some(FOULED.into()));
            }
        }
    }
}
