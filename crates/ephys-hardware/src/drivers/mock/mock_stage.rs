//! Mock motion stage.

use crate::capabilities::{AxisCapabilities, StageCapabilities, StageDriver};
use crate::config::MockStageConfig;
use ephys_core::{EphysError, Position, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

const HISTORY_LEN: usize = 256;

/// One commanded motion. Holds `to` from `start + duration` until the next segment.
#[derive(Debug, Clone, Copy)]
struct Segment {
    from: Position,
    to: Position,
    start: Instant,
    duration: Duration,
}

impl Segment {
    fn stationary(at: Position, start: Instant) -> Self {
        Self {
            from: at,
            to: at,
            start,
            duration: Duration::ZERO,
        }
    }

    fn position_at(&self, t: Instant) -> Position {
        if self.duration.is_zero() || t >= self.start + self.duration {
            return self.to;
        }
        let elapsed = t.saturating_duration_since(self.start).as_secs_f64();
        let s = elapsed / self.duration.as_secs_f64();
        [
            self.from[0] + (self.to[0] - self.from[0]) * s,
            self.from[1] + (self.to[1] - self.from[1]) * s,
            self.from[2] + (self.to[2] - self.from[2]) * s,
        ]
    }

    fn end(&self) -> Instant {
        self.start + self.duration
    }
}

#[derive(Debug)]
struct MotionState {
    history: VecDeque<Segment>,
    pending_stall: Option<f64>,
    moves_started: usize,
}

/// Simulated stage with time-interpolated motion.
///
/// Positions are analytic functions of time, so [`position_at`](Self::position_at)
/// answers for any instant still covered by the segment history. A camera uses
/// this to stamp each frame with the exact focus depth at its exposure time.
#[derive(Debug)]
pub struct MockStageDriver {
    config: MockStageConfig,
    state: Mutex<MotionState>,
}

impl MockStageDriver {
    /// Create a stage resting at `config.initial_position`.
    pub fn new(config: MockStageConfig) -> Self {
        let mut history = VecDeque::with_capacity(HISTORY_LEN);
        history.push_back(Segment::stationary(config.initial_position, Instant::now()));
        Self {
            config,
            state: Mutex::new(MotionState {
                history,
                pending_stall: None,
                moves_started: 0,
            }),
        }
    }

    /// Position at instant `t`.
    ///
    /// Instants older than the retained history report the oldest known position.
    pub fn position_at(&self, t: Instant) -> Position {
        let state = self.state.lock();
        let segment = state
            .history
            .iter()
            .rev()
            .find(|s| s.start <= t)
            .or_else(|| state.history.front());
        match segment {
            Some(segment) if segment.start <= t => segment.position_at(t),
            Some(segment) => segment.from,
            None => self.config.initial_position,
        }
    }

    /// Make the next move stop after `fraction` of its path without reaching the target.
    pub fn inject_stall(&self, fraction: f64) {
        self.state.lock().pending_stall = Some(fraction.clamp(0.0, 1.0));
    }

    /// Number of moves started so far.
    pub fn moves_started(&self) -> usize {
        self.state.lock().moves_started
    }

    /// Teleport to `position` (e.g. a manual move by the user).
    pub fn set_position(&self, position: Position) {
        let mut state = self.state.lock();
        push_segment(&mut state.history, Segment::stationary(position, Instant::now()));
    }

    fn current(&self, now: Instant) -> Position {
        let state = self.state.lock();
        state
            .history
            .back()
            .map_or(self.config.initial_position, |s| s.position_at(now))
    }
}

impl StageDriver for MockStageDriver {
    fn capabilities(&self) -> StageCapabilities {
        let axis = |enabled: bool| {
            if enabled {
                AxisCapabilities::FULL
            } else {
                AxisCapabilities::ABSENT
            }
        };
        StageCapabilities {
            axes: [
                axis(self.config.axes[0]),
                axis(self.config.axes[1]),
                axis(self.config.axes[2]),
            ],
            linear_motion: self.config.linear_motion,
        }
    }

    fn read_position(&self) -> Result<Position> {
        Ok(self.current(Instant::now()))
    }

    fn start_move(&self, target: Position, speed: f64, _linear: bool) -> Result<()> {
        if !(speed.is_finite() && speed > 0.0) {
            return Err(EphysError::hardware("mock stage", format!("invalid speed {speed}")));
        }
        let speed = speed.min(self.config.max_speed);
        let now = Instant::now();
        let from = self.current(now);

        let mut to = target;
        for axis in 0..3 {
            if !self.config.axes[axis] {
                to[axis] = from[axis];
            }
        }

        let mut state = self.state.lock();
        if let Some(fraction) = state.pending_stall.take() {
            for axis in 0..3 {
                to[axis] = from[axis] + (to[axis] - from[axis]) * fraction;
            }
        }
        let distance = (0..3).map(|i| (to[i] - from[i]).powi(2)).sum::<f64>().sqrt();
        push_segment(
            &mut state.history,
            Segment {
                from,
                to,
                start: now,
                duration: Duration::from_secs_f64(distance / speed),
            },
        );
        state.moves_started += 1;
        Ok(())
    }

    fn is_moving(&self) -> Result<bool> {
        let now = Instant::now();
        Ok(self.state.lock().history.back().is_some_and(|s| now < s.end()))
    }

    fn halt(&self) -> Result<()> {
        let now = Instant::now();
        let here = self.current(now);
        let mut state = self.state.lock();
        push_segment(&mut state.history, Segment::stationary(here, now));
        Ok(())
    }

    fn max_speed(&self) -> f64 {
        self.config.max_speed
    }
}

fn push_segment(history: &mut VecDeque<Segment>, segment: Segment) {
    if history.len() == HISTORY_LEN {
        history.pop_front();
    }
    history.push_back(segment);
}
