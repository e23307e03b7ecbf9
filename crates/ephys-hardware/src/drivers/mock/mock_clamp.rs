//! Mock patch-clamp amplifier.
//!
//! While enabled, a test-pulse task delivers one [`TestPulseAnalysis`] per
//! interval. The measured resistance comes from a model closure so tests can
//! script seals, break-ins and lost cells.

use crate::capabilities::{AutoBias, ClampMode, ClampState, PatchClamp, TestPulseAnalysis};
use crate::config::MockClampConfig;
use chrono::Utc;
use ephys_core::{Future, Result, Signal};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info};

/// Returns `(steady_state, peak)` resistance in ohms.
pub type ResistanceModel = Arc<dyn Fn() -> (f64, f64) + Send + Sync>;

struct ClampInner {
    mode: ClampMode,
    holding: HashMap<ClampMode, f64>,
    auto_bias: AutoBias,
    last_pulse: Option<TestPulseAnalysis>,
    pulse_count: usize,
}

/// Simulated amplifier.
pub struct MockClamp {
    me: Weak<MockClamp>,
    name: String,
    config: MockClampConfig,
    inner: Mutex<ClampInner>,
    model: RwLock<ResistanceModel>,
    pulse_task: Mutex<Option<Future<()>>>,
    test_pulse_finished: Signal<TestPulseAnalysis>,
    clamp_state_changed: Signal<ClampState>,
    auto_bias_changed: Signal<AutoBias>,
}

impl std::fmt::Debug for MockClamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockClamp")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl MockClamp {
    /// An amplifier in voltage clamp with test pulses off.
    pub fn new(name: impl Into<String>, config: MockClampConfig) -> Arc<Self> {
        let name = name.into();
        let initial = config.initial_resistance;
        Arc::new_cyclic(|me| Self {
            me: Weak::clone(me),
            test_pulse_finished: Signal::new(format!("{name}.test_pulse_finished")),
            clamp_state_changed: Signal::new(format!("{name}.clamp_state_changed")),
            auto_bias_changed: Signal::new(format!("{name}.auto_bias_changed")),
            name,
            config,
            inner: Mutex::new(ClampInner {
                mode: ClampMode::VoltageClamp,
                holding: HashMap::from([(ClampMode::VoltageClamp, 0.0), (ClampMode::CurrentClamp, 0.0)]),
                auto_bias: AutoBias {
                    enabled: false,
                    target: -70e-3,
                },
                last_pulse: None,
                pulse_count: 0,
            }),
            model: RwLock::new(Arc::new(move || (initial, initial))),
            pulse_task: Mutex::new(None),
        })
    }

    /// Report a constant resistance from now on.
    pub fn set_resistance(&self, ohms: f64) {
        self.set_resistance_model(move || (ohms, ohms));
    }

    /// Report resistances computed by `model` on every pulse.
    pub fn set_resistance_model<F>(&self, model: F)
    where
        F: Fn() -> (f64, f64) + Send + Sync + 'static,
    {
        *self.model.write() = Arc::new(model);
    }

    /// Number of test pulses delivered so far.
    pub fn pulse_count(&self) -> usize {
        self.inner.lock().pulse_count
    }

    /// Deliver one pulse now and return its analysis.
    pub fn pulse(&self) -> TestPulseAnalysis {
        let model = Arc::clone(&self.model.read());
        let (steady, peak) = (*model)();
        let analysis = {
            let mut inner = self.inner.lock();
            let holding = inner.holding.get(&inner.mode).copied().unwrap_or(0.0);
            let (baseline_current, baseline_potential) = match inner.mode {
                ClampMode::VoltageClamp => (holding / steady, holding),
                ClampMode::CurrentClamp => (holding, holding * steady),
                ClampMode::ZeroCurrent => (0.0, -65e-3),
            };
            let analysis = TestPulseAnalysis {
                timestamp: Utc::now(),
                steady_state_resistance: steady,
                peak_resistance: peak,
                baseline_current,
                baseline_potential,
                holding,
                mode: inner.mode,
            };
            inner.last_pulse = Some(analysis.clone());
            inner.pulse_count += 1;
            analysis
        };
        self.test_pulse_finished.emit(&analysis);
        analysis
    }

    fn spawn_pulses(&self) -> Future<()> {
        let me = Weak::clone(&self.me);
        let interval = Duration::from_millis(self.config.test_pulse_interval_ms.max(1));
        Future::spawn(format!("{}-test-pulse", self.name), move |f| loop {
            f.sleep(interval)?;
            match me.upgrade() {
                Some(clamp) => {
                    clamp.pulse();
                }
                None => return Ok(()),
            }
        })
    }
}

impl PatchClamp for MockClamp {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_mode(&self, mode: ClampMode) -> Result<()> {
        let state = {
            let mut inner = self.inner.lock();
            if inner.mode == mode {
                return Ok(());
            }
            inner.mode = mode;
            ClampState {
                mode,
                holding: inner.holding.get(&mode).copied().unwrap_or(0.0),
            }
        };
        debug!(device = %self.name, mode = %mode, "clamp mode changed");
        self.clamp_state_changed.emit(&state);
        Ok(())
    }

    fn set_holding(&self, mode: ClampMode, value: f64) -> Result<()> {
        let state = {
            let mut inner = self.inner.lock();
            inner.holding.insert(mode, value);
            (inner.mode == mode).then_some(ClampState { mode, holding: value })
        };
        if let Some(state) = state {
            self.clamp_state_changed.emit(&state);
        }
        Ok(())
    }

    fn enable_test_pulse(&self, enable: bool) -> Result<()> {
        let mut task = self.pulse_task.lock();
        match (enable, task.as_ref()) {
            (true, Some(running)) if !running.is_done() => {}
            (true, _) => {
                *task = Some(self.spawn_pulses());
                info!(device = %self.name, "test pulse enabled");
            }
            (false, _) => {
                if let Some(running) = task.take() {
                    running.stop("test pulse disabled");
                    info!(device = %self.name, "test pulse disabled");
                }
            }
        }
        Ok(())
    }

    fn test_pulse_enabled(&self) -> bool {
        self.pulse_task.lock().as_ref().is_some_and(|t| !t.is_done())
    }

    fn set_auto_bias(&self, enabled: bool, target: f64) -> Result<()> {
        let bias = AutoBias { enabled, target };
        {
            let mut inner = self.inner.lock();
            if inner.auto_bias == bias {
                return Ok(());
            }
            inner.auto_bias = bias;
        }
        self.auto_bias_changed.emit(&bias);
        Ok(())
    }

    fn state(&self) -> ClampState {
        let inner = self.inner.lock();
        ClampState {
            mode: inner.mode,
            holding: inner.holding.get(&inner.mode).copied().unwrap_or(0.0),
        }
    }

    fn last_test_pulse(&self) -> Option<TestPulseAnalysis> {
        self.inner.lock().last_pulse.clone()
    }

    fn test_pulse_finished(&self) -> &Signal<TestPulseAnalysis> {
        &self.test_pulse_finished
    }

    fn clamp_state_changed(&self) -> &Signal<ClampState> {
        &self.clamp_state_changed
    }

    fn auto_bias_changed(&self) -> &Signal<AutoBias> {
        &self.auto_bias_changed
    }
}

impl Drop for MockClamp {
    fn drop(&mut self) {
        if let Some(task) = self.pulse_task.get_mut().take() {
            task.stop("amplifier dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_pulses_follow_resistance_model() {
        let clamp = MockClamp::new("clamp", MockClampConfig::default());
        clamp.set_resistance(1e9);
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        clamp.test_pulse_finished().connect(move |tp| {
            assert_eq!(tp.steady_state_resistance, 1e9);
            counter.fetch_add(1, Ordering::SeqCst);
        });

        clamp.enable_test_pulse(true).unwrap();
        assert!(clamp.test_pulse_enabled());
        std::thread::sleep(Duration::from_millis(120));
        clamp.enable_test_pulse(false).unwrap();
        assert!(seen.load(Ordering::SeqCst) >= 2);
        assert_eq!(clamp.last_test_pulse().unwrap().mode, ClampMode::VoltageClamp);
    }

    #[test]
    fn test_mode_and_holding_signals() {
        let clamp = MockClamp::new("clamp", MockClampConfig::default());
        let states = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&states);
        clamp.clamp_state_changed().connect(move |s| sink.lock().push(*s));

        clamp.set_holding(ClampMode::VoltageClamp, -70e-3).unwrap();
        clamp.set_holding(ClampMode::CurrentClamp, 0.0).unwrap();
        clamp.set_mode(ClampMode::CurrentClamp).unwrap();
        clamp.set_mode(ClampMode::CurrentClamp).unwrap();

        let states = states.lock();
        assert_eq!(states.len(), 2);
        assert_eq!(states[0].holding, -70e-3);
        assert_eq!(states[1].mode, ClampMode::CurrentClamp);
    }

    #[test]
    fn test_baseline_current_from_holding() {
        let clamp = MockClamp::new("clamp", MockClampConfig::default());
        clamp.set_resistance(100e6);
        clamp.set_holding(ClampMode::VoltageClamp, -70e-3).unwrap();
        let tp = clamp.pulse();
        assert!((tp.baseline_current - (-70e-3 / 100e6)).abs() < 1e-18);
        assert_eq!(clamp.pulse_count(), 1);
    }
}
