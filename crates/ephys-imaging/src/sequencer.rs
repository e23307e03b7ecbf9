//! Image sequencer: single frames, timelapse series and z-stacks.
//!
//! A sequence runs as one [`Future`] on its own thread:
//!
//! ```text
//!   start(protocol)
//!        │
//!        ▼
//!   ┌─ iteration i ─────────────────────────────┐
//!   │  wait while paused, check stop            │
//!   │  single frame  or  z-stack sweep          │
//!   │  save (optional), emit FramesAcquired     │
//!   │  sleep until next interval boundary       │
//!   └───────────────────────────────────────────┘
//!        │ × timelapse_count
//!        ▼
//!     Finished
//! ```
//!
//! A z-stack holds focus and opens the shutter, pre-positions focus past
//! `start`, then sweeps to `end` at `fps * |step|` while the camera free-runs.
//! The frames collected during the sweep are reduced to one per step by
//! [`enforce_linear_z_stack`]. Hold and shutter are released on every exit path.

use crate::config::SequencerConfig;
use crate::linear_depth::{enforce_linear_z_stack, ZERO_STEP};
use crate::storage::FrameStorage;
use ephys_core::limits::STOP_POLL_INTERVAL;
use ephys_core::{EphysError, Frame, Future, Result, Signal, TaskBuilder};
use ephys_hardware::capabilities::{AcquisitionGuard, Imager};
use ephys_hardware::reservation::{DeviceLease, DeviceReservations};
use ephys_hardware::stage::Speed;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

// =============================================================================
// Protocol
// =============================================================================

/// What to acquire.
#[derive(Clone)]
pub struct SequencerProtocol {
    /// Acquire a z-stack per iteration instead of a single frame.
    pub z_stack: bool,
    /// `(start, end, step)` in global meters. The direction is `sign(end - start)`.
    pub z_stack_range: (f64, f64, f64),
    /// Number of iterations, at least 1.
    pub timelapse_count: usize,
    /// Seconds between iteration starts.
    pub timelapse_interval: f64,
    /// Hand frames to `storage`.
    pub save: bool,
    /// Output sink, required when `save` is set.
    pub storage: Option<Arc<dyn FrameStorage>>,
}

impl fmt::Debug for SequencerProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SequencerProtocol")
            .field("z_stack", &self.z_stack)
            .field("z_stack_range", &self.z_stack_range)
            .field("timelapse_count", &self.timelapse_count)
            .field("timelapse_interval", &self.timelapse_interval)
            .field("save", &self.save)
            .finish_non_exhaustive()
    }
}

impl Default for SequencerProtocol {
    fn default() -> Self {
        Self {
            z_stack: false,
            z_stack_range: (0.0, 0.0, 1e-6),
            timelapse_count: 1,
            timelapse_interval: 0.0,
            save: false,
            storage: None,
        }
    }
}

impl SequencerProtocol {
    /// One z-stack from `start` to `end`.
    pub fn z_stack(start: f64, end: f64, step: f64) -> Self {
        Self {
            z_stack: true,
            z_stack_range: (start, end, step),
            ..Self::default()
        }
    }

    /// `count` single frames, `interval` seconds apart.
    pub fn timelapse(count: usize, interval: f64) -> Self {
        Self {
            timelapse_count: count,
            timelapse_interval: interval,
            ..Self::default()
        }
    }

    /// Check counts, interval, step and storage.
    pub fn validate(&self) -> Result<()> {
        if self.timelapse_count < 1 {
            return Err(EphysError::InvalidInput("timelapse count must be at least 1".into()));
        }
        timelapse_interval(self.timelapse_interval)?;
        if self.z_stack {
            let (start, end, step) = self.z_stack_range;
            if step == 0.0 {
                return Err(EphysError::InvalidInput(ZERO_STEP.into()));
            }
            if !(start.is_finite() && end.is_finite() && step.is_finite()) {
                return Err(EphysError::InvalidInput("z stack range must be finite".into()));
            }
        }
        if self.save && self.storage.is_none() {
            return Err(EphysError::Configuration("save requested without storage".into()));
        }
        Ok(())
    }

    fn info(&self) -> Map<String, Value> {
        let (start, end, step) = self.z_stack_range;
        let mut info = Map::new();
        info.insert("zStack".into(), json!(self.z_stack));
        if self.z_stack {
            info.insert("zStackRange".into(), json!([start, end, step]));
        }
        info.insert("timelapseCount".into(), json!(self.timelapse_count));
        info.insert("timelapseInterval".into(), json!(self.timelapse_interval));
        info
    }
}

/// Seconds between iterations as a [`Duration`]; negative, NaN and
/// unrepresentably large intervals are rejected.
fn timelapse_interval(seconds: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(seconds)
        .map_err(|err| EphysError::InvalidInput(format!("timelapse interval {seconds} s is not usable: {err}")))
}

// =============================================================================
// Events and results
// =============================================================================

/// Progress notifications, delivered on [`ImageSequencer::sequence_event`].
#[derive(Debug, Clone, PartialEq)]
pub enum SequenceEvent {
    /// A sequence of `iterations` iterations began.
    Started {
        /// Planned iterations.
        iterations: usize,
    },
    /// Iteration `index` began.
    IterationStarted {
        /// Zero-based iteration.
        index: usize,
    },
    /// Iteration `index` produced `frames` frames.
    FramesAcquired {
        /// Zero-based iteration.
        index: usize,
        /// Frames kept for the iteration.
        frames: usize,
    },
    /// Pause state changed.
    Paused(bool),
    /// The sequence ended.
    Finished {
        /// Whether it ended early (stopped or failed).
        interrupted: bool,
    },
}

/// Frames of every completed iteration.
#[derive(Debug, Clone, Default)]
pub struct SequenceResult {
    /// One entry per iteration: a single frame, or a full z-stack.
    pub iterations: Vec<Vec<Frame>>,
}

impl SequenceResult {
    /// All frames in acquisition order.
    pub fn frames(&self) -> impl Iterator<Item = &Frame> {
        self.iterations.iter().flatten()
    }

    /// Total frame count.
    pub fn len(&self) -> usize {
        self.iterations.iter().map(Vec::len).sum()
    }

    /// Whether no frames were kept.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// Sequencer
// =============================================================================

/// Runs [`SequencerProtocol`]s against one imager.
pub struct ImageSequencer {
    imager: Arc<dyn Imager>,
    config: SequencerConfig,
    reservations: Option<DeviceReservations>,
    paused: Arc<AtomicBool>,
    current: Mutex<Option<Future<SequenceResult>>>,
    events: Signal<SequenceEvent>,
}

impl fmt::Debug for ImageSequencer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageSequencer")
            .field("imager", &self.imager.name())
            .field("paused", &self.is_paused())
            .finish_non_exhaustive()
    }
}

impl ImageSequencer {
    /// Sequencer for `imager`.
    pub fn new(imager: Arc<dyn Imager>, config: SequencerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            imager,
            config,
            reservations: None,
            paused: Arc::new(AtomicBool::new(false)),
            current: Mutex::new(None),
            events: Signal::new("sequencer.sequence_event"),
        })
    }

    /// Reserve the imager (and its focus device) from `reservations` while running.
    pub fn with_reservations(mut self, reservations: DeviceReservations) -> Self {
        self.reservations = Some(reservations);
        self
    }

    /// Start a sequence. Fails if one is already running.
    pub fn start(&self, protocol: SequencerProtocol) -> Result<Future<SequenceResult>> {
        protocol.validate()?;
        let mut current = self.current.lock();
        if current.as_ref().is_some_and(|f| !f.is_done()) {
            return Err(EphysError::ProtocolViolation("a sequence is already running".into()));
        }
        self.paused.store(false, Ordering::SeqCst);

        let run = SequenceRun {
            imager: Arc::clone(&self.imager),
            config: self.config.clone(),
            protocol,
            paused: Arc::clone(&self.paused),
            events: self.events.clone(),
            reservations: self.reservations.clone(),
        };
        let future = TaskBuilder::new("image-sequence").spawn(move |f| {
            let outcome = run.execute(f);
            run.events.emit(&SequenceEvent::Finished {
                interrupted: outcome.is_err(),
            });
            outcome
        });
        *current = Some(future.clone());
        Ok(future)
    }

    /// Pause or resume between frames.
    pub fn pause(&self, pause: bool) {
        if self.paused.swap(pause, Ordering::SeqCst) != pause {
            info!(paused = pause, "sequencer pause changed");
            self.events.emit(&SequenceEvent::Paused(pause));
        }
    }

    /// Whether the sequencer is paused.
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Stop the running sequence, if any. Its future completes interrupted.
    pub fn stop(&self) {
        let current = self.current.lock().clone();
        if let Some(future) = current {
            future.stop("Sequence stopped by user");
        }
    }

    /// Whether a sequence is running.
    pub fn is_running(&self) -> bool {
        self.current.lock().as_ref().is_some_and(|f| !f.is_done())
    }

    /// Progress notifications.
    pub fn sequence_event(&self) -> &Signal<SequenceEvent> {
        &self.events
    }
}

struct SequenceRun {
    imager: Arc<dyn Imager>,
    config: SequencerConfig,
    protocol: SequencerProtocol,
    paused: Arc<AtomicBool>,
    events: Signal<SequenceEvent>,
    reservations: Option<DeviceReservations>,
}

impl SequenceRun {
    fn execute(&self, f: &Future<SequenceResult>) -> Result<SequenceResult> {
        let _lease = self.reserve()?;
        let count = self.protocol.timelapse_count;
        let interval = timelapse_interval(self.protocol.timelapse_interval)?;
        info!(
            imager = %self.imager.name(),
            z_stack = self.protocol.z_stack,
            iterations = count,
            "sequence started"
        );
        self.events.emit(&SequenceEvent::Started { iterations: count });

        if self.protocol.save {
            if let Some(storage) = &self.protocol.storage {
                storage.set_info(self.protocol.info())?;
            }
        }

        let started = Instant::now();
        let mut result = SequenceResult::default();
        for index in 0..count {
            self.wait_while_paused(f)?;
            f.check_stop()?;
            f.set_state(format!("iteration {}/{}", index + 1, count));
            self.events.emit(&SequenceEvent::IterationStarted { index });

            let frames = if self.protocol.z_stack {
                let (start, end, step) = self.protocol.z_stack_range;
                self.acquire_z_stack(f, start, end, step)?
            } else {
                self.acquire_single(f)?
            };

            if self.protocol.save {
                if let Some(storage) = &self.protocol.storage {
                    let prefix = if self.protocol.z_stack { "zstack" } else { "frame" };
                    storage.write_frames(&format!("{prefix}_{index:03}"), &frames)?;
                }
            }
            self.events.emit(&SequenceEvent::FramesAcquired {
                index,
                frames: frames.len(),
            });
            result.iterations.push(frames);
            f.set_percent_done(100.0 * (index + 1) as f64 / count as f64);

            if index + 1 < count {
                let boundary = u32::try_from(index + 1)
                    .ok()
                    .and_then(|n| interval.checked_mul(n))
                    .and_then(|offset| started.checked_add(offset))
                    .ok_or_else(|| EphysError::InvalidInput("timelapse schedule overflows the clock".into()))?;
                self.sleep_until(f, boundary)?;
            }
        }
        info!(frames = result.len(), "sequence complete");
        Ok(result)
    }

    fn reserve(&self) -> Result<Option<DeviceLease>> {
        let Some(reservations) = &self.reservations else {
            return Ok(None);
        };
        let mut devices = vec![self.imager.name().to_string()];
        if self.protocol.z_stack {
            devices.extend(self.imager.focus_device_name());
        }
        reservations
            .reserve(devices, Some(self.config.reservation_timeout()))
            .map(Some)
    }

    fn wait_while_paused(&self, f: &Future<SequenceResult>) -> Result<()> {
        while self.paused.load(Ordering::SeqCst) {
            f.sleep(STOP_POLL_INTERVAL)?;
        }
        Ok(())
    }

    fn sleep_until(&self, f: &Future<SequenceResult>, boundary: Instant) -> Result<()> {
        loop {
            self.wait_while_paused(f)?;
            let now = Instant::now();
            if now >= boundary {
                return Ok(());
            }
            f.sleep((boundary - now).min(STOP_POLL_INTERVAL))?;
        }
    }

    fn acquire_single(&self, f: &Future<SequenceResult>) -> Result<Vec<Frame>> {
        let _running = AcquisitionGuard::start(self.imager.as_ref())?;
        f.wait_for(&self.imager.acquire_frames(Some(1)), None)
    }

    fn acquire_z_stack(&self, f: &Future<SequenceResult>, start: f64, end: f64, step: f64) -> Result<Vec<Frame>> {
        let fps = self.imager.estimated_frame_rate();
        if !(fps.is_finite() && fps > 0.0) {
            return Err(EphysError::Configuration(format!(
                "{} reports frame rate {fps}; cannot pace a z-stack sweep",
                self.imager.name()
            )));
        }
        let _optics = StackOptics::engage(self.imager.as_ref())?;
        let imager = self.imager.as_ref();

        // Approach `start` from the side away from `end`.
        let direction = if end >= start { 1.0 } else { -1.0 };
        let pre = start - direction * self.config.over_travel;
        f.wait_for(imager.set_focus_depth(pre, Speed::Fast)?.as_future(), None)?;
        f.wait_for(imager.set_focus_depth(start, Speed::Fast)?.as_future(), None)?;

        let speed = fps * step.abs();
        let settle = Duration::from_secs_f64(2.0 / fps);
        debug!(start, end, step, speed, "z-stack sweep");

        let _running = AcquisitionGuard::start(imager)?;
        let acquisition = imager.acquire_frames(None);
        let swept = f.sleep(settle).and_then(|()| {
            let sweep = imager.set_focus_depth(end, Speed::MetersPerSecond(speed))?;
            f.wait_for(sweep.as_future(), None)?;
            f.sleep(settle)
        });
        acquisition.stop("focus sweep complete");
        let frames = acquisition.get_result(None);
        swept?;
        let frames = frames?;
        debug!(collected = frames.len(), "z-stack frames collected");
        enforce_linear_z_stack(frames, start, end, step)
    }
}

/// Focus hold and open shutter for the length of a stack.
struct StackOptics<'a> {
    imager: &'a dyn Imager,
    held: bool,
    opened: bool,
}

impl<'a> StackOptics<'a> {
    fn engage(imager: &'a dyn Imager) -> Result<Self> {
        let mut optics = Self {
            imager,
            held: false,
            opened: false,
        };
        if let Some(hold) = imager.focus_hold() {
            hold.set_holding(true)?;
            optics.held = true;
        }
        if let Some(shutter) = imager.shutter() {
            shutter.open_shutter(true)?;
            optics.opened = true;
        }
        Ok(optics)
    }
}

impl Drop for StackOptics<'_> {
    fn drop(&mut self) {
        if self.opened {
            if let Some(shutter) = self.imager.shutter() {
                if let Err(err) = shutter.open_shutter(false) {
                    warn!(imager = %self.imager.name(), error = %err, "failed to close shutter");
                }
            }
        }
        if self.held {
            if let Some(hold) = self.imager.focus_hold() {
                if let Err(err) = hold.set_holding(false) {
                    warn!(imager = %self.imager.name(), error = %err, "failed to release focus hold");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_validation() {
        assert!(SequencerProtocol::default().validate().is_ok());
        assert!(SequencerProtocol::timelapse(0, 1.0).validate().is_err());
        assert!(SequencerProtocol::timelapse(2, -1.0).validate().is_err());
        assert!(SequencerProtocol::timelapse(2, f64::NAN).validate().is_err());
        assert!(SequencerProtocol::timelapse(2, 1e300).validate().is_err());
        assert!(SequencerProtocol::timelapse(2, 0.0).validate().is_ok());

        let err = SequencerProtocol::z_stack(0.0, 1e-5, 0.0).validate().unwrap_err();
        assert_eq!(err.to_string(), "Z stack step size must be non-zero.");

        let unsaved = SequencerProtocol {
            save: true,
            ..SequencerProtocol::default()
        };
        assert!(matches!(unsaved.validate(), Err(EphysError::Configuration(_))));
    }

    #[test]
    fn test_protocol_info() {
        let info = SequencerProtocol::z_stack(0.0, 1e-5, 1e-6).info();
        assert_eq!(info["zStack"], json!(true));
        assert_eq!(info["zStackRange"], json!([0.0, 1e-5, 1e-6]));
        assert_eq!(info["timelapseCount"], json!(1));
    }

    #[test]
    fn test_result_counts() {
        let result = SequenceResult::default();
        assert!(result.is_empty());
        assert_eq!(result.frames().count(), 0);
    }
}
