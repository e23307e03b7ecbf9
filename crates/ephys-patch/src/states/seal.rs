use super::{PatchState, StateFuture, TestPulseWatch, BREAK_IN, BROKEN, FOULED, SEAL};
use crate::pipette::PatchPipette;
use ephys_core::Result;
use ephys_hardware::{ClampMode, PressureSource};
use std::time::Instant;
use tracing::{info, warn};

/// Apply gentle suction until a gigaseal holds.
///
/// Success needs the resistance above `threshold` for a full `sustain`
/// window. A resistance that falls below `broken_resistance` means the tip
/// broke; one that stays `max_drop` below its best for `drop_window`, or a
/// seal that never forms within `timeout`, means the tip is fouled.
#[derive(Debug, Clone, Copy, Default)]
pub struct Seal;

impl PatchState for Seal {
    fn name(&self) -> &str {
        SEAL
    }

    fn run(&self, future: &StateFuture, patch: &PatchPipette) -> Result<Option<String>> {
        let config = &patch.config().seal;
        let started = Instant::now();
        patch.update_record(|record| record.attempted_seal = true);

        let clamp = patch.clamp();
        clamp.set_mode(ClampMode::VoltageClamp)?;
        clamp.set_holding(ClampMode::VoltageClamp, config.holding)?;
        clamp.enable_test_pulse(true)?;
        let mut watch = TestPulseWatch::new(patch);

        patch.set_pressure(PressureSource::Regulator, config.pressure)?;
        future.set_state("sealing");

        let mut best = 0.0_f64;
        let mut above_since: Option<Instant> = None;
        let mut dropped_since: Option<Instant> = None;
        loop {
            let resistance = watch.next_pulse(future)?.steady_state_resistance;
            let now = Instant::now();

            if resistance < config.broken_resistance {
                warn!(pipette = %patch.name(), resistance, "resistance collapsed during seal");
                patch.update_record(|record| record.seal_successful = Some(false));
                return Ok(Some(BROKEN.into()));
            }

            best = best.max(resistance);
            if resistance < best * (1.0 - config.max_drop) {
                let since = *dropped_since.get_or_insert(now);
                if now.duration_since(since) >= config.drop_window() {
                    warn!(pipette = %patch.name(), resistance, best, "seal lost");
                    patch.update_record(|record| record.seal_successful = Some(false));
                    return Ok(Some(FOULED.into()));
                }
            } else {
                dropped_since = None;
            }

            if resistance >= config.threshold {
                let since = *above_since.get_or_insert(now);
                if now.duration_since(since) >= config.sustain() {
                    patch.set_pressure(PressureSource::Atmosphere, 0.0)?;
                    let latency = started.elapsed().as_secs_f64();
                    patch.update_record(|record| {
                        record.seal_successful = Some(true);
                        record.seal_resistance = Some(resistance);
                        record.seal_latency = Some(latency);
                    });
                    info!(pipette = %patch.name(), resistance, latency, "gigaseal formed");
                    return Ok(Some(BREAK_IN.into()));
                }
            } else {
                above_since = None;
            }

            if started.elapsed() >= config.timeout() {
                warn!(pipette = %patch.name(), best, "no seal before timeout");
                patch.update_record(|record| record.seal_successful = Some(false));
                return Ok(Some(FOULED.into()));
            }
            future.set_percent_done((100.0 * best / config.threshold).min(100.0));
        }
    }
}
