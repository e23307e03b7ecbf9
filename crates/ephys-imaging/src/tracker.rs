//! Image-based pipette tip localization.
//!
//! The tracker keeps one [`ReferenceSet`] per optical state (objective and
//! filters) of the imager. A reference is a short z-stack of the tip, background
//! subtracted, edge filtered and cropped around the tip. Later frames are
//! searched with every reference frame; the best-matching frame gives the tip's
//! depth relative to focus, the peak location its xy.
//!
//! Apart from [`PipetteTracker::take_reference_frames`], which moves focus and
//! briefly retracts the pipette, the tracker has no hardware side effects.

use crate::config::TrackerConfig;
use crate::image_ops::{
    argmax_subpixel, crop, match_template, morphological_gradient, resample, resampled_to_source, subtract, Region,
};
use crate::linear_depth::expected_depths;
use ephys_core::{EphysError, Frame, Future, Position, Result, TaskBuilder};
use ephys_hardware::capabilities::{AcquisitionGuard, Imager};
use ephys_hardware::pipette::Pipette;
use ephys_hardware::stage::Speed;
use ndarray::{Array2, ArrayView2};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Half-width of the morphological gradient window, in pixels.
const GRADIENT_RADIUS: usize = 1;

/// Key of a reference set: the imager's optical state.
pub type ReferenceKey = String;

/// Reference z-stack of one pipette tip.
#[derive(Debug, Clone)]
pub struct ReferenceSet {
    /// Preprocessed crops, ordered by focus depth.
    pub frames: Vec<Array2<f64>>,
    /// Focus step between frames, in meters.
    pub z_step: f64,
    /// Focus depth of each frame relative to the tip, in meters.
    pub z_offsets: Vec<f64>,
    /// Frame in which the tip is in focus.
    pub center_index: usize,
    /// Sub-pixel tip location `(row, col)` inside the crops.
    pub center_pos: (f64, f64),
    /// Pixel size of the crops, in meters.
    pub pixel_size: f64,
    /// Length of the tip, in meters.
    pub tip_length: f64,
}

/// Tip located in a frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TipMatch {
    /// Global tip position.
    pub position: Position,
    /// Normalized correlation of the best match, in `[-1, 1]`.
    pub score: f64,
    /// Reference frame that matched best.
    pub frame_index: usize,
}

/// Locates the tip of one pipette in frames from one imager.
pub struct PipetteTracker {
    pipette: Arc<Pipette>,
    imager: Arc<dyn Imager>,
    config: TrackerConfig,
    references: RwLock<HashMap<ReferenceKey, Arc<ReferenceSet>>>,
}

impl fmt::Debug for PipetteTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipetteTracker")
            .field("pipette", &self.pipette.name())
            .field("imager", &self.imager.name())
            .field("references", &self.references.read().keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl PipetteTracker {
    /// Tracker for `pipette` as seen by `imager`.
    pub fn new(pipette: Arc<Pipette>, imager: Arc<dyn Imager>, config: TrackerConfig) -> Result<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new(Self {
            pipette,
            imager,
            config,
            references: RwLock::new(HashMap::new()),
        }))
    }

    /// Tracker settings.
    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Reference for `key`, if one was taken.
    pub fn reference(&self, key: &str) -> Option<Arc<ReferenceSet>> {
        self.references.read().get(key).cloned()
    }

    /// Whether a reference exists for the imager's current optical state.
    pub fn has_reference(&self) -> bool {
        self.references.read().contains_key(&self.imager.optical_state_key())
    }

    /// Install a reference directly, e.g. one loaded from disk.
    pub fn insert_reference(&self, key: impl Into<ReferenceKey>, reference: ReferenceSet) {
        self.references.write().insert(key.into(), Arc::new(reference));
    }

    fn current_reference(&self) -> Result<Arc<ReferenceSet>> {
        let key = self.imager.optical_state_key();
        self.reference(&key).ok_or_else(|| {
            EphysError::Configuration(format!(
                "no reference frames for pipette '{}' in optical state '{key}'",
                self.pipette.name()
            ))
        })
    }

    /// Acquire a reference stack spanning `z_range` (relative to the tip) in
    /// steps of `z_step`.
    ///
    /// Takes one stack with the tip in view and one with the pipette retracted,
    /// then returns the pipette and focus to where they were. The reference is
    /// stored under the imager's optical state key, which the future returns.
    pub fn take_reference_frames(self: &Arc<Self>, z_range: [f64; 2], z_step: f64) -> Result<Future<ReferenceKey>> {
        if !(z_step.is_finite() && z_step > 0.0) || z_range[0] > z_range[1] {
            return Err(EphysError::InvalidInput(format!(
                "invalid reference stack {z_range:?} step {z_step}"
            )));
        }
        let tracker = Arc::clone(self);
        Ok(TaskBuilder::new(format!("{}-reference", self.pipette.name()))
            .spawn(move |f| tracker.collect_reference(f, z_range, z_step)))
    }

    fn collect_reference(&self, f: &Future<ReferenceKey>, z_range: [f64; 2], z_step: f64) -> Result<ReferenceKey> {
        let key = self.imager.optical_state_key();
        let tip = self.pipette.global_tip_position();
        let focus = self.imager.focus_depth()?;
        let offsets = expected_depths(z_range[0], z_range[1], z_step)?;
        info!(pipette = %self.pipette.name(), key = %key, frames = offsets.len(), "taking reference frames");

        f.set_state("tip stack");
        let stack = self.acquire_stack(f, tip[2], &offsets);

        f.set_state("background stack");
        let background = stack.and_then(|stack| {
            f.wait_for(
                self.pipette.retract(self.config.retract_distance, Speed::Fast)?.as_future(),
                None,
            )?;
            let background = self.acquire_stack(f, tip[2], &offsets);
            Ok((stack, background))
        });

        // Always put the pipette and focus back.
        f.set_state("restoring");
        self.restore(tip, focus);
        let (stack, background) = background?;
        let background = background?;

        let reference = self.build_reference(&stack, &background, tip, &offsets, z_step)?;
        debug!(
            center = reference.center_index,
            center_pos = ?reference.center_pos,
            "reference built"
        );
        self.references.write().insert(key.clone(), Arc::new(reference));
        Ok(key)
    }

    fn acquire_stack(&self, f: &Future<ReferenceKey>, tip_z: f64, offsets: &[f64]) -> Result<Vec<Frame>> {
        let _running = AcquisitionGuard::start(self.imager.as_ref())?;
        let mut frames = Vec::with_capacity(offsets.len());
        for (i, offset) in offsets.iter().enumerate() {
            f.wait_for(self.imager.set_focus_depth(tip_z + offset, Speed::Fast)?.as_future(), None)?;
            let mut frame = f.wait_for(&self.imager.acquire_frames(Some(1)), None)?;
            frames.push(frame.pop().ok_or_else(|| {
                EphysError::hardware(self.imager.name(), "acquisition returned no frame")
            })?);
            f.set_percent_done(100.0 * (i + 1) as f64 / offsets.len() as f64);
        }
        Ok(frames)
    }

    fn restore(&self, tip: Position, focus: f64) {
        let moved = self
            .pipette
            .move_tip_to_global(tip, Speed::Fast)
            .and_then(|mv| mv.wait(None));
        if let Err(err) = moved {
            warn!(pipette = %self.pipette.name(), error = %err, "failed to restore pipette after reference");
        }
        let focused = self
            .imager
            .set_focus_depth(focus, Speed::Fast)
            .and_then(|mv| mv.wait(None));
        if let Err(err) = focused {
            warn!(imager = %self.imager.name(), error = %err, "failed to restore focus after reference");
        }
    }

    fn build_reference(
        &self,
        stack: &[Frame],
        background: &[Frame],
        tip: Position,
        offsets: &[f64],
        z_step: f64,
    ) -> Result<ReferenceSet> {
        let first = stack
            .first()
            .ok_or_else(|| EphysError::DetectionFailure("empty reference stack".into()))?;
        let pixel_size = first.pixel_size().0;
        let (tip_row, tip_col) = first.map_from_global(tip)?;
        let radius = self.config.crop_radius / pixel_size;
        let region = Region::around((tip_row, tip_col), radius, first.image.dim())
            .ok_or_else(|| EphysError::DetectionFailure("pipette tip is outside the field of view".into()))?;

        let frames = stack
            .iter()
            .zip(background)
            .map(|(fg, bg)| {
                let diff = subtract(fg.image.view(), bg.image.view())?;
                crop(morphological_gradient(diff.view(), GRADIENT_RADIUS).view(), region)
            })
            .collect::<Result<Vec<_>>>()?;

        // Locate the tip neighbourhood of the middle frame in every frame; the
        // sharpest match is the in-focus frame.
        let middle = frames.len() / 2;
        let local_tip = (tip_row - region.row as f64, tip_col - region.col as f64);
        let window = Region::around(local_tip, radius / 2.0, frames[middle].dim())
            .ok_or_else(|| EphysError::DetectionFailure("tip window outside reference crop".into()))?;
        let template = crop(frames[middle].view(), window)?;

        let mut best: Option<(usize, f64, (f64, f64))> = None;
        for (index, frame) in frames.iter().enumerate() {
            let map = match_template(frame.view(), template.view())?;
            if let Some(peak) = argmax_subpixel(map.view()) {
                if best.map_or(true, |(_, score, _)| peak.value > score) {
                    let pos = (
                        peak.row + local_tip.0 - window.row as f64,
                        peak.col + local_tip.1 - window.col as f64,
                    );
                    best = Some((index, peak.value, pos));
                }
            }
        }
        let (center_index, _, center_pos) =
            best.ok_or_else(|| EphysError::DetectionFailure("reference frames carry no signal".into()))?;

        Ok(ReferenceSet {
            frames,
            z_step,
            z_offsets: offsets.to_vec(),
            center_index,
            center_pos,
            pixel_size,
            tip_length: self.config.tip_length,
        })
    }

    /// Locate the tip in `frame`.
    ///
    /// `background` is subtracted first when its shape matches. The search is
    /// limited to the box between `min_img_pos` and `max_img_pos` (global), or
    /// failing that to a box around `expected_pos`; otherwise the whole frame is
    /// searched.
    pub fn find_pipette(
        &self,
        frame: &Frame,
        background: Option<&Frame>,
        min_img_pos: Option<Position>,
        max_img_pos: Option<Position>,
        expected_pos: Option<Position>,
    ) -> Result<TipMatch> {
        let reference = self.current_reference()?;
        let image = match background {
            Some(bg) if bg.image.dim() == frame.image.dim() => subtract(frame.image.view(), bg.image.view())?,
            Some(_) => {
                warn!("background frame shape differs from frame; ignoring it");
                frame.image.as_ref().clone()
            }
            None => frame.image.as_ref().clone(),
        };
        let processed = morphological_gradient(image.view(), GRADIENT_RADIUS);

        let shape = processed.dim();
        let search_radius = self.config.crop_radius + self.config.padding;
        let region = match (min_img_pos, max_img_pos, expected_pos) {
            (Some(min), Some(max), _) => Region::from_bounds(frame.map_from_global(min)?, frame.map_from_global(max)?, shape),
            (_, _, Some(expected)) => {
                let center = frame.map_from_global(expected)?;
                Region::around(center, search_radius / frame.pixel_size().0, shape)
            }
            _ => Some(Region {
                row: 0,
                col: 0,
                rows: shape.0,
                cols: shape.1,
            }),
        }
        .ok_or_else(|| EphysError::DetectionFailure("search region lies outside the frame".into()))?;

        let scale = frame.pixel_size().0 / reference.pixel_size;
        let search = resample(crop(processed.view(), region)?.view(), scale)?;
        let (index, peak) = best_match(search.view(), &reference)?;

        let resampled = (peak.0 + reference.center_pos.0, peak.1 + reference.center_pos.1);
        let (row, col) = resampled_to_source(resampled, scale);
        let global = frame.map_to_global(row + region.row as f64, col + region.col as f64);
        let depth = frame.depth - (index as f64 - reference.center_index as f64) * reference.z_step;
        debug!(score = peak.2, frame_index = index, "pipette match");
        Ok(TipMatch {
            position: [global[0], global[1], depth],
            score: peak.2,
            frame_index: index,
        })
    }

    /// Tip position measured near where the pipette reports it.
    ///
    /// `padding` widens the search box beyond the reference size; results scoring
    /// below `threshold` fail with `DetectionFailure`. `None` uses the configured
    /// values.
    pub fn measure_tip_position(&self, frame: &Frame, padding: Option<f64>, threshold: Option<f64>) -> Result<TipMatch> {
        let padding = padding.unwrap_or(self.config.padding);
        let threshold = threshold.unwrap_or(self.config.threshold);
        let reported = self.pipette.global_tip_position();
        let reach = self.config.crop_radius + padding;
        let min = [reported[0] - reach, reported[1] - reach, reported[2]];
        let max = [reported[0] + reach, reported[1] + reach, reported[2]];
        let found = self.find_pipette(frame, None, Some(min), Some(max), Some(reported))?;
        if found.score < threshold {
            return Err(EphysError::DetectionFailure(format!(
                "pipette '{}' match score {:.3} below threshold {threshold:.3}",
                self.pipette.name(),
                found.score
            )));
        }
        Ok(found)
    }

    /// Measured minus reported tip position.
    pub fn measure_error(&self, frame: &Frame, padding: Option<f64>, threshold: Option<f64>) -> Result<Position> {
        let reported = self.pipette.global_tip_position();
        let measured = self.measure_tip_position(frame, padding, threshold)?.position;
        Ok([
            measured[0] - reported[0],
            measured[1] - reported[1],
            measured[2] - reported[2],
        ])
    }

    /// Measure the tip error in `frame` and, if `update_calibration`, correct the
    /// pipette's tip offset by it. Returns the error.
    pub fn find_tip_in_frame(&self, frame: &Frame, update_calibration: bool) -> Result<Position> {
        let error = self.measure_error(frame, None, None)?;
        if update_calibration {
            self.pipette.adjust_tip_offset(error);
            info!(pipette = %self.pipette.name(), error = ?error, "tip calibration updated from image");
        }
        Ok(error)
    }
}

/// Best `(frame index, (row, col, score))` of all reference frames against `search`.
fn best_match(search: ArrayView2<'_, f64>, reference: &ReferenceSet) -> Result<(usize, (f64, f64, f64))> {
    let mut best: Option<(usize, (f64, f64, f64))> = None;
    for (index, template) in reference.frames.iter().enumerate() {
        if template.nrows() > search.nrows() || template.ncols() > search.ncols() {
            return Err(EphysError::DetectionFailure(
                "search region is smaller than the reference".into(),
            ));
        }
        let map = match_template(search, template.view())?;
        if let Some(peak) = argmax_subpixel(map.view()) {
            if best.map_or(true, |(_, (_, _, score))| peak.value > score) {
                best = Some((index, (peak.row, peak.col, peak.value)));
            }
        }
    }
    best.ok_or_else(|| EphysError::DetectionFailure("no reference frame matched".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ephys_core::Transform3;

    fn gaussian(rows: usize, cols: usize, center: (f64, f64)) -> Array2<f64> {
        Array2::from_shape_fn((rows, cols), |(r, c)| {
            let d2 = (r as f64 - center.0).powi(2) + (c as f64 - center.1).powi(2);
            100.0 * (-d2 / 8.0).exp()
        })
    }

    fn reference(center: (f64, f64)) -> ReferenceSet {
        ReferenceSet {
            frames: vec![gaussian(11, 11, center)],
            z_step: 1e-6,
            z_offsets: vec![0.0],
            center_index: 0,
            center_pos: center,
            pixel_size: 1e-6,
            tip_length: 10e-6,
        }
    }

    #[test]
    fn test_best_match_locates_template() {
        let search = gaussian(40, 40, (20.0, 25.0));
        let (index, (row, col, score)) = best_match(search.view(), &reference((5.0, 5.0))).unwrap();
        assert_eq!(index, 0);
        assert!(score > 0.99);
        assert!((row + 5.0 - 20.0).abs() < 0.1);
        assert!((col + 5.0 - 25.0).abs() < 0.1);
    }

    #[test]
    fn test_small_search_region_rejected() {
        let search = gaussian(5, 5, (2.0, 2.0));
        let err = best_match(search.view(), &reference((5.0, 5.0))).unwrap_err();
        assert!(matches!(err, EphysError::DetectionFailure(_)));
    }

    #[test]
    fn test_frame_coordinates_round_trip() {
        let transform = Transform3::from_parts([1e-6, 1e-6, 1.0], 0.0, [-32e-6, -32e-6, 5e-6]);
        let frame = Frame::new(Array2::zeros((64, 64)), Utc::now(), 5e-6, transform);
        let (row, col) = frame.map_from_global([1e-6, -2e-6, 5e-6]).unwrap();
        assert!((row - 30.0).abs() < 1e-9);
        assert!((col - 33.0).abs() < 1e-9);
    }
}
