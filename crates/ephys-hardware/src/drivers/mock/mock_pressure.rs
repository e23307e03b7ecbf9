//! Mock pressure regulator.

use crate::capabilities::{PressureChange, PressureControl, PressureSource};
use ephys_core::{EphysError, Result, Signal};
use parking_lot::Mutex;
use tracing::debug;

/// Simulated pressure controller.
///
/// Records every change so tests can check the sequence a state produced.
#[derive(Debug)]
pub struct MockPressure {
    name: String,
    state: Mutex<PressureChange>,
    history: Mutex<Vec<PressureChange>>,
    changed: Signal<PressureChange>,
    range: [f64; 2],
}

impl MockPressure {
    /// A regulator venting to atmosphere, accepting setpoints within `range` pascals.
    pub fn new(name: impl Into<String>, range: [f64; 2]) -> Self {
        let name = name.into();
        Self {
            changed: Signal::new(format!("{name}.pressure_changed")),
            name,
            state: Mutex::new(PressureChange {
                source: PressureSource::Atmosphere,
                pressure: 0.0,
            }),
            history: Mutex::new(Vec::new()),
            range,
        }
    }

    /// Every state the regulator passed through, in order.
    pub fn history(&self) -> Vec<PressureChange> {
        self.history.lock().clone()
    }

    fn update(&self, apply: impl FnOnce(&mut PressureChange)) {
        let snapshot = {
            let mut state = self.state.lock();
            apply(&mut state);
            *state
        };
        self.history.lock().push(snapshot);
        debug!(device = %self.name, source = %snapshot.source, pressure = snapshot.pressure, "pressure changed");
        self.changed.emit(&snapshot);
    }
}

impl Default for MockPressure {
    fn default() -> Self {
        Self::new("pressure", [-100e3, 100e3])
    }
}

impl PressureControl for MockPressure {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_pressure(&self, pascals: f64) -> Result<()> {
        if !(self.range[0]..=self.range[1]).contains(&pascals) {
            return Err(EphysError::InvalidInput(format!(
                "{} pressure {pascals} Pa outside [{}, {}]",
                self.name, self.range[0], self.range[1]
            )));
        }
        self.update(|s| s.pressure = pascals);
        Ok(())
    }

    fn set_source(&self, source: PressureSource) -> Result<()> {
        self.update(|s| s.source = source);
        Ok(())
    }

    fn pressure(&self) -> f64 {
        self.state.lock().pressure
    }

    fn source(&self) -> PressureSource {
        self.state.lock().source
    }

    fn pressure_changed(&self) -> &Signal<PressureChange> {
        &self.changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_sets_pressure_then_source() {
        let p = MockPressure::default();
        p.apply(PressureSource::Regulator, -3000.0).unwrap();
        assert_eq!(p.source(), PressureSource::Regulator);
        assert_eq!(p.pressure(), -3000.0);
        let history = p.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].source, PressureSource::Atmosphere);
        assert_eq!(history[1].source, PressureSource::Regulator);
    }

    #[test]
    fn test_out_of_range_rejected() {
        let p = MockPressure::new("p", [-1000.0, 1000.0]);
        assert!(p.set_pressure(5000.0).is_err());
        assert!(p.history().is_empty());
    }
}
