//! Reduce a continuously acquired focus sweep to one frame per z-step.
//!
//! During a z-stack the focus moves at constant speed while the camera free-runs,
//! so frame depths only approximate the requested grid. [`enforce_linear_z_stack`]
//! picks, for every expected depth, a distinct frame such that the total depth
//! error is minimal.

use crate::assignment::solve_rectangular;
use ephys_core::{EphysError, Frame, Result};
use ndarray::Array2;

/// Tolerance (in steps) for including an endpoint reached by float accumulation.
const ENDPOINT_EPSILON: f64 = 1e-6;

/// Depths closer than this count as the same reported depth.
const DUPLICATE_EPSILON: f64 = 1e-12;

pub(crate) const INSUFFICIENT_FRAMES: &str = "Insufficient frames to have one frame per step.";
pub(crate) const ZERO_STEP: &str = "Z stack step size must be non-zero.";

/// Depths a stack from `start` towards `stop` in steps of `|step|` should hit.
///
/// The direction comes from `stop - start`; `stop` is included when it lies on
/// the grid up to float error.
pub fn expected_depths(start: f64, stop: f64, step: f64) -> Result<Vec<f64>> {
    if step == 0.0 || !step.is_finite() {
        return Err(EphysError::InvalidInput(ZERO_STEP.into()));
    }
    let span = stop - start;
    let step = step.abs() * if span < 0.0 { -1.0 } else { 1.0 };
    let count = (span / step + ENDPOINT_EPSILON).floor().max(0.0) as usize + 1;
    Ok((0..count).map(|i| start + i as f64 * step).collect())
}

/// Pick exactly one frame per expected depth of `(start, stop, step)`.
///
/// Frames are sorted by depth, adjacent frames reporting the same depth are
/// collapsed to one, and the remaining frames are matched to the expected
/// depths by minimum total `|expected - actual|`. The result follows the
/// requested traversal direction.
pub fn enforce_linear_z_stack(frames: Vec<Frame>, start: f64, stop: f64, step: f64) -> Result<Vec<Frame>> {
    if step == 0.0 {
        return Err(EphysError::InvalidInput(ZERO_STEP.into()));
    }
    if frames.is_empty() {
        return Err(EphysError::InvalidInput(INSUFFICIENT_FRAMES.into()));
    }
    let expected = expected_depths(start, stop, step)?;
    if frames.len() < expected.len() {
        return Err(EphysError::InvalidInput(INSUFFICIENT_FRAMES.into()));
    }

    let mut frames = frames;
    frames.sort_by(|a, b| a.depth.total_cmp(&b.depth));
    frames.dedup_by(|later, earlier| (later.depth - earlier.depth).abs() <= DUPLICATE_EPSILON);
    if frames.len() < expected.len() {
        return Err(EphysError::InvalidInput(INSUFFICIENT_FRAMES.into()));
    }

    let cost = Array2::from_shape_fn((expected.len(), frames.len()), |(i, j)| {
        (expected[i] - frames[j].depth).abs()
    });
    let assignment = solve_rectangular(cost.view())?;

    let mut slots: Vec<Option<Frame>> = frames.into_iter().map(Some).collect();
    assignment
        .into_iter()
        .map(|col| {
            slots[col]
                .take()
                .ok_or_else(|| EphysError::ProtocolViolation("frame assigned twice".into()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ephys_core::Transform3;

    fn frames(depths: &[f64]) -> Vec<Frame> {
        depths
            .iter()
            .enumerate()
            .map(|(i, &d)| {
                Frame::new(Array2::zeros((2, 2)), Utc::now(), d, Transform3::identity()).with_info("index", i)
            })
            .collect()
    }

    fn depths(frames: &[Frame]) -> Vec<f64> {
        frames.iter().map(|f| f.depth).collect()
    }

    fn message(err: EphysError) -> String {
        err.to_string()
    }

    #[test]
    fn test_empty_input_rejected() {
        let err = enforce_linear_z_stack(Vec::new(), 0.0, 2.0, 1.0).unwrap_err();
        assert_eq!(message(err), "Insufficient frames to have one frame per step.");
    }

    #[test]
    fn test_zero_step_rejected() {
        let err = enforce_linear_z_stack(frames(&[0.0, 1.0]), 0.0, 2.0, 0.0).unwrap_err();
        assert_eq!(message(err), "Z stack step size must be non-zero.");
    }

    #[test]
    fn test_ascending_exact() {
        let out = enforce_linear_z_stack(frames(&[0.0, 1.0, 2.0]), 0.0, 2.0, 1.0).unwrap();
        assert_eq!(depths(&out), vec![0.0, 1.0, 2.0]);
    }

    #[test]
    fn test_descending_follows_request_direction() {
        let out = enforce_linear_z_stack(frames(&[2.0, 1.0, 0.0]), 2.0, 0.0, -1.0).unwrap();
        assert_eq!(depths(&out), vec![2.0, 1.0, 0.0]);
    }

    #[test]
    fn test_excess_frames_pick_nearest() {
        let out = enforce_linear_z_stack(frames(&[0.0, 0.5, 1.0, 1.5, 2.0]), 0.0, 2.0, 1.0).unwrap();
        assert_eq!(depths(&out), vec![0.0, 1.0, 2.0]);
    }

    #[test]
    fn test_duplicates_pruned_before_assignment() {
        let err = enforce_linear_z_stack(frames(&[0.0, 1.0, 1.0, 1.0]), 0.0, 2.0, 1.0).unwrap_err();
        assert_eq!(message(err), "Insufficient frames to have one frame per step.");

        let out = enforce_linear_z_stack(frames(&[0.0, 0.0, 1.0, 2.0, 2.0]), 0.0, 2.0, 1.0).unwrap();
        assert_eq!(depths(&out), vec![0.0, 1.0, 2.0]);
    }

    #[test]
    fn test_float_rounded_endpoint_included() {
        let out = enforce_linear_z_stack(frames(&[0.1, 0.2, 0.30000000000000004]), 0.1, 0.3, 0.1).unwrap();
        assert_eq!(depths(&out), vec![0.1, 0.2, 0.30000000000000004]);
    }

    #[test]
    fn test_unsorted_input_and_step_sign_ignored() {
        let out = enforce_linear_z_stack(frames(&[1.9, 0.1, 1.1]), 0.0, 2.0, -1.0).unwrap();
        assert_eq!(depths(&out), vec![0.1, 1.1, 1.9]);
        assert_eq!(expected_depths(0.0, 2.0, -1.0).unwrap(), vec![0.0, 1.0, 2.0]);
    }

    #[test]
    fn test_expected_depths_single_point() {
        assert_eq!(expected_depths(5.0, 5.0, 1.0).unwrap(), vec![5.0]);
    }
}
