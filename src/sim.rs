//! Procedures run by `ephys-sim` against the mock rig.
//!
//! Each routine builds a fresh [`MockRig`] from the [`RigConfig`], runs one
//! procedure to completion, shuts the rig down and returns a serialisable
//! summary.

use crate::config::RigConfig;
use anyhow::{Context, Result};
use ephys_core::{Frame, Position};
use ephys_hardware::capabilities::Imager;
use ephys_hardware::drivers::mock::MockRig;
use ephys_imaging::{ImageSequencer, PipetteTracker, SequencerProtocol};
use ephys_patch::{PatchPipette, PatchRecord};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// How long any single procedure may take before it is abandoned.
pub const PROCEDURE_TIMEOUT: Duration = Duration::from_secs(60);

/// A z-stack request, in meters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ZStackRequest {
    /// First depth.
    pub start: f64,
    /// Last depth.
    pub end: f64,
    /// Spacing, positive.
    pub step: f64,
}

/// Outcome of [`run_z_stack`].
#[derive(Debug, Clone, Serialize)]
pub struct ZStackSummary {
    /// Camera frame rate used.
    pub fps: f64,
    /// Frame depths in acquisition order.
    pub depths: Vec<f64>,
    /// Largest distance between a frame and its ideal depth.
    pub max_depth_error: f64,
}

/// Acquire one z-stack and report where each frame landed.
pub fn run_z_stack(config: &RigConfig, request: ZStackRequest) -> Result<ZStackSummary> {
    let rig = MockRig::new(&config.rig).context("failed to assemble mock rig")?;
    let outcome = z_stack_on(&rig, config, request);
    rig.shutdown();
    outcome
}

fn z_stack_on(rig: &MockRig, config: &RigConfig, request: ZStackRequest) -> Result<ZStackSummary> {
    let sequencer = ImageSequencer::new(Arc::clone(&rig.camera) as Arc<dyn Imager>, config.sequencer.clone())?;
    let result = sequencer
        .start(SequencerProtocol::z_stack(request.start, request.end, request.step))?
        .get_result(Some(PROCEDURE_TIMEOUT))
        .context("z-stack failed")?;

    let expected = ephys_imaging::expected_depths(request.start, request.end, request.step)?;
    let depths: Vec<f64> = result.frames().map(|frame| frame.depth).collect();
    let max_depth_error = depths
        .iter()
        .zip(&expected)
        .map(|(actual, ideal)| (actual - ideal).abs())
        .fold(0.0, f64::max);
    info!(frames = depths.len(), max_depth_error, "z-stack acquired");
    Ok(ZStackSummary {
        fps: rig.camera.estimated_frame_rate(),
        depths,
        max_depth_error,
    })
}

/// A run of the patch state machine.
#[derive(Debug, Clone, PartialEq)]
pub struct PatchRequest {
    /// States entered in order.
    pub states: Vec<String>,
    /// How long each state may run before the next is entered.
    pub dwell: Duration,
    /// Target for `approach`, in global meters.
    pub target: Option<Position>,
}

/// One state visited by [`run_patch`].
#[derive(Debug, Clone, Serialize)]
pub struct VisitedState {
    /// Requested state.
    pub requested: String,
    /// State the machine was in when the dwell ended.
    pub reached: String,
    /// Whether the requested handler finished within the dwell.
    pub finished: bool,
    /// Handler error, if it failed.
    pub error: Option<String>,
}

/// Outcome of [`run_patch`].
#[derive(Debug, Clone, Serialize)]
pub struct PatchSummary {
    /// Per-state results.
    pub visited: Vec<VisitedState>,
    /// Event counts by kind.
    pub events: BTreeMap<String, usize>,
    /// The attempt's record, closed.
    pub record: Option<PatchRecord>,
}

/// Drive the patch state machine through `request.states`.
pub fn run_patch(config: &RigConfig, request: &PatchRequest) -> Result<PatchSummary> {
    let rig = MockRig::new(&config.rig).context("failed to assemble mock rig")?;
    let outcome = patch_on(&rig, config, request);
    rig.shutdown();
    outcome
}

fn patch_on(rig: &MockRig, config: &RigConfig, request: &PatchRequest) -> Result<PatchSummary> {
    let patch = PatchPipette::new(
        Arc::clone(&rig.pipette),
        rig.pressure.clone(),
        rig.clamp.clone(),
        config.patch.clone(),
    )?;
    rig.pipette.set_target(request.target);
    patch.new_patch_attempt();

    let mut visited = Vec::with_capacity(request.states.len());
    for name in &request.states {
        let future = patch.set_state(name).with_context(|| format!("cannot enter state '{name}'"))?;
        let finished = future.wait_until_done(Some(request.dwell));
        let error = future.error().map(|e| e.to_string());
        if let Some(error) = &error {
            warn!(state = %name, %error, "state failed");
        }
        visited.push(VisitedState {
            requested: name.clone(),
            reached: patch.current_state(),
            finished,
            error,
        });
    }

    patch.quit()?;
    let record = patch.new_patch_attempt();
    let mut events = BTreeMap::new();
    for entry in patch.event_log().entries() {
        *events.entry(entry.kind.as_str().to_string()).or_insert(0) += 1;
    }
    Ok(PatchSummary {
        visited,
        events,
        record,
    })
}

/// Outcome of [`run_tracking`].
#[derive(Debug, Clone, Serialize)]
pub struct TrackingSummary {
    /// Optical state the reference was filed under.
    pub reference_key: String,
    /// Measured minus reported tip position before correction.
    pub error: Position,
    /// Reported tip position after correction.
    pub corrected_tip: Position,
}

/// Take a reference stack, then find a tip drawn `true_offset` away from
/// where the pipette reports it and correct the calibration.
pub fn run_tracking(config: &RigConfig, true_offset: Position) -> Result<TrackingSummary> {
    let rig = MockRig::new(&config.rig).context("failed to assemble mock rig")?;
    let outcome = tracking_on(&rig, config, true_offset);
    rig.shutdown();
    outcome
}

fn tracking_on(rig: &MockRig, config: &RigConfig, true_offset: Position) -> Result<TrackingSummary> {
    let tracker = PipetteTracker::new(
        Arc::clone(&rig.pipette),
        Arc::clone(&rig.camera) as Arc<dyn Imager>,
        config.tracker.clone(),
    )?;
    let reference_key = tracker
        .take_reference_frames(config.tracker.reference_z_range, config.tracker.reference_z_step)?
        .get_result(Some(PROCEDURE_TIMEOUT))
        .context("reference stack failed")?;

    rig.camera.set_true_tip_offset(Some(true_offset));
    let frame = snap(rig)?;
    let error = tracker.find_tip_in_frame(&frame, true)?;
    Ok(TrackingSummary {
        reference_key,
        error,
        corrected_tip: rig.pipette.global_tip_position(),
    })
}

fn snap(rig: &MockRig) -> Result<Frame> {
    rig.camera
        .acquire_frames(Some(1))
        .get_result(Some(PROCEDURE_TIMEOUT))?
        .into_iter()
        .next()
        .context("camera returned no frame")
}
