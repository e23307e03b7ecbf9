use super::{PatchState, StateFuture, TestPulseWatch, BATH, BROKEN, FOULED};
use crate::pipette::PatchPipette;
use ephys_core::Result;
use ephys_hardware::{ClampMode, PressureSource};
use tracing::{info, warn};

/// Tip in the bath under positive pressure.
///
/// Records the open-tip resistance and offset of the current attempt, then
/// keeps watching the test pulse for a broken (too low) or clogged (too high)
/// tip until another state is requested.
#[derive(Debug, Clone, Copy, Default)]
pub struct Bath;

impl PatchState for Bath {
    fn name(&self) -> &str {
        BATH
    }

    fn run(&self, future: &StateFuture, patch: &PatchPipette) -> Result<Option<String>> {
        let config = &patch.config().bath;
        patch.set_pressure(PressureSource::Regulator, config.pressure)?;

        let clamp = patch.clamp();
        clamp.set_mode(ClampMode::VoltageClamp)?;
        clamp.set_holding(ClampMode::VoltageClamp, 0.0)?;
        clamp.enable_test_pulse(true)?;

        let mut watch = TestPulseWatch::new(patch);
        let first = watch.next_pulse(future)?;
        patch.update_record(|record| {
            if record.initial_resistance.is_none() {
                record.initial_resistance = Some(first.steady_state_resistance);
                record.initial_offset = Some(first.baseline_current);
            }
        });
        info!(
            pipette = %patch.name(),
            resistance = first.steady_state_resistance,
            "tip resistance in bath"
        );

        let mut pulse = first;
        loop {
            let resistance = pulse.steady_state_resistance;
            if resistance < config.min_resistance {
                warn!(pipette = %patch.name(), resistance, "resistance too low; tip broken");
                return Ok(Some(BROKEN.into()));
            }
            if resistance > config.max_resistance {
                warn!(pipette = %patch.name(), resistance, "resistance too high; tip fouled");
                return Ok(Some(FOULED.into()));
            }
            pulse = watch.next_pulse(future)?;
        }
    }
}
