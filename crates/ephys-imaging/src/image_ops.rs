//! Small image kernels used by the pipette tracker.
//!
//! All images are `rows x cols` arrays of intensities. Pixel `(row, col)` has
//! its center at coordinate `(row, col)`; fractional coordinates interpolate.

use ephys_core::{EphysError, Result};
use ndarray::{s, Array2, ArrayView2};

/// Rectangular pixel region, half-open: `[row, row + rows) x [col, col + cols)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    /// First row.
    pub row: usize,
    /// First column.
    pub col: usize,
    /// Row count.
    pub rows: usize,
    /// Column count.
    pub cols: usize,
}

impl Region {
    /// Region spanning the fractional bounds `[min, max]`, clipped to `shape`.
    ///
    /// Returns `None` when nothing of it lies inside the image.
    pub fn from_bounds(min: (f64, f64), max: (f64, f64), shape: (usize, usize)) -> Option<Self> {
        let clip = |lo: f64, hi: f64, len: usize| -> Option<(usize, usize)> {
            let (lo, hi) = if lo <= hi { (lo, hi) } else { (hi, lo) };
            let start = lo.floor().max(0.0);
            let end = (hi.ceil() + 1.0).min(len as f64);
            (end > start).then(|| (start as usize, (end - start) as usize))
        };
        let (row, rows) = clip(min.0, max.0, shape.0)?;
        let (col, cols) = clip(min.1, max.1, shape.1)?;
        Some(Self { row, col, rows, cols })
    }

    /// Square region of half-size `radius` around the pixel nearest `center`,
    /// clipped to `shape`.
    pub fn around(center: (f64, f64), radius: f64, shape: (usize, usize)) -> Option<Self> {
        let center = (center.0.round(), center.1.round());
        Self::from_bounds(
            (center.0 - radius, center.1 - radius),
            (center.0 + radius, center.1 + radius),
            shape,
        )
    }
}

/// Copy `region` out of `image`.
pub fn crop(image: ArrayView2<'_, f64>, region: Region) -> Result<Array2<f64>> {
    let (rows, cols) = image.dim();
    if region.rows == 0 || region.cols == 0 || region.row + region.rows > rows || region.col + region.cols > cols {
        return Err(EphysError::InvalidInput(format!(
            "crop region {region:?} outside {rows}x{cols} image"
        )));
    }
    Ok(image
        .slice(s![region.row..region.row + region.rows, region.col..region.col + region.cols])
        .to_owned())
}

/// `a - b`, element-wise.
pub fn subtract(a: ArrayView2<'_, f64>, b: ArrayView2<'_, f64>) -> Result<Array2<f64>> {
    if a.dim() != b.dim() {
        return Err(EphysError::InvalidInput(format!(
            "cannot subtract {:?} image from {:?} image",
            b.dim(),
            a.dim()
        )));
    }
    Ok(&a - &b)
}

/// Dilation minus erosion over a `(2r+1)²` window. Highlights edges regardless of
/// their polarity, so a pipette looks alike on bright and dark backgrounds.
pub fn morphological_gradient(image: ArrayView2<'_, f64>, radius: usize) -> Array2<f64> {
    let (rows, cols) = image.dim();
    Array2::from_shape_fn((rows, cols), |(row, col)| {
        let r0 = row.saturating_sub(radius);
        let r1 = (row + radius + 1).min(rows);
        let c0 = col.saturating_sub(radius);
        let c1 = (col + radius + 1).min(cols);
        let window = image.slice(s![r0..r1, c0..c1]);
        let (lo, hi) = window
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        hi - lo
    })
}

/// Bilinear value at fractional `(row, col)`, clamped at the borders.
fn sample(image: ArrayView2<'_, f64>, row: f64, col: f64) -> f64 {
    let (rows, cols) = image.dim();
    let row = row.clamp(0.0, (rows - 1) as f64);
    let col = col.clamp(0.0, (cols - 1) as f64);
    let r0 = row.floor() as usize;
    let c0 = col.floor() as usize;
    let r1 = (r0 + 1).min(rows - 1);
    let c1 = (c0 + 1).min(cols - 1);
    let fr = row - r0 as f64;
    let fc = col - c0 as f64;
    let top = image[[r0, c0]] * (1.0 - fc) + image[[r0, c1]] * fc;
    let bottom = image[[r1, c0]] * (1.0 - fc) + image[[r1, c1]] * fc;
    top * (1.0 - fr) + bottom * fr
}

/// Scale `image` by `scale` with bilinear interpolation.
///
/// Output pixel `o` samples input coordinate `(o + 0.5) / scale - 0.5`; use
/// [`resampled_to_source`] to map coordinates back.
pub fn resample(image: ArrayView2<'_, f64>, scale: f64) -> Result<Array2<f64>> {
    if !(scale.is_finite() && scale > 0.0) {
        return Err(EphysError::InvalidInput(format!("resample scale must be positive, got {scale}")));
    }
    let (rows, cols) = image.dim();
    if rows == 0 || cols == 0 {
        return Err(EphysError::InvalidInput("cannot resample an empty image".into()));
    }
    if (scale - 1.0).abs() < 1e-9 {
        return Ok(image.to_owned());
    }
    let out_rows = ((rows as f64 * scale).round() as usize).max(1);
    let out_cols = ((cols as f64 * scale).round() as usize).max(1);
    Ok(Array2::from_shape_fn((out_rows, out_cols), |(r, c)| {
        let (sr, sc) = resampled_to_source((r as f64, c as f64), scale);
        sample(image, sr, sc)
    }))
}

/// Source coordinate of a resampled coordinate.
pub fn resampled_to_source(point: (f64, f64), scale: f64) -> (f64, f64) {
    if (scale - 1.0).abs() < 1e-9 {
        return point;
    }
    (
        (point.0 + 0.5) / scale - 0.5,
        (point.1 + 0.5) / scale - 0.5,
    )
}

/// Normalized cross-correlation of `template` at every position inside `image`.
///
/// Entry `(r, c)` scores the template placed with its top-left pixel at
/// `(r, c)`, in `[-1, 1]`. Flat windows score 0.
pub fn match_template(image: ArrayView2<'_, f64>, template: ArrayView2<'_, f64>) -> Result<Array2<f64>> {
    let (ih, iw) = image.dim();
    let (th, tw) = template.dim();
    if th == 0 || tw == 0 || th > ih || tw > iw {
        return Err(EphysError::InvalidInput(format!(
            "template {th}x{tw} does not fit in image {ih}x{iw}"
        )));
    }
    let n = (th * tw) as f64;
    let t_mean = template.sum() / n;
    let t_centered = template.mapv(|v| v - t_mean);
    let t_norm = t_centered.iter().map(|v| v * v).sum::<f64>().sqrt();

    Ok(Array2::from_shape_fn((ih - th + 1, iw - tw + 1), |(r, c)| {
        let window = image.slice(s![r..r + th, c..c + tw]);
        let w_mean = window.sum() / n;
        let mut cross = 0.0;
        let mut w_sq = 0.0;
        for (w, t) in window.iter().zip(t_centered.iter()) {
            let wc = w - w_mean;
            cross += wc * t;
            w_sq += wc * wc;
        }
        let denom = w_sq.sqrt() * t_norm;
        if denom > f64::EPSILON {
            cross / denom
        } else {
            0.0
        }
    }))
}

/// Location and value of a maximum.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Peak {
    /// Sub-pixel row.
    pub row: f64,
    /// Sub-pixel column.
    pub col: f64,
    /// Value at the integer maximum.
    pub value: f64,
}

/// Maximum of `map`, refined to sub-pixel precision by fitting a parabola
/// through the peak and its neighbours along each axis.
pub fn argmax_subpixel(map: ArrayView2<'_, f64>) -> Option<Peak> {
    let ((row, col), &value) = map
        .indexed_iter()
        .filter(|(_, v)| v.is_finite())
        .max_by(|(_, a), (_, b)| a.total_cmp(b))?;
    let (rows, cols) = map.dim();

    let refine = |before: Option<f64>, after: Option<f64>| -> f64 {
        match (before, after) {
            (Some(a), Some(b)) => {
                let curvature = a - 2.0 * value + b;
                if curvature.abs() > f64::EPSILON {
                    (0.5 * (a - b) / curvature).clamp(-0.5, 0.5)
                } else {
                    0.0
                }
            }
            _ => 0.0,
        }
    };
    let dr = refine(
        row.checked_sub(1).map(|r| map[[r, col]]),
        (row + 1 < rows).then(|| map[[row + 1, col]]),
    );
    let dc = refine(
        col.checked_sub(1).map(|c| map[[row, c]]),
        (col + 1 < cols).then(|| map[[row, col + 1]]),
    );
    Some(Peak {
        row: row as f64 + dr,
        col: col as f64 + dc,
        value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    fn blob(rows: usize, cols: usize, center: (f64, f64), sigma: f64) -> Array2<f64> {
        Array2::from_shape_fn((rows, cols), |(r, c)| {
            let d2 = (r as f64 - center.0).powi(2) + (c as f64 - center.1).powi(2);
            (-d2 / (2.0 * sigma * sigma)).exp()
        })
    }

    #[test]
    fn test_region_clipping() {
        let region = Region::around((1.0, 1.0), 3.0, (10, 10)).unwrap();
        assert_eq!(region, Region { row: 0, col: 0, rows: 5, cols: 5 });
        assert!(Region::from_bounds((20.0, 20.0), (30.0, 30.0), (10, 10)).is_none());
    }

    #[test]
    fn test_crop_and_subtract() {
        let image = Array2::from_shape_fn((4, 4), |(r, c)| (r * 4 + c) as f64);
        let cropped = crop(image.view(), Region { row: 1, col: 2, rows: 2, cols: 2 }).unwrap();
        assert_eq!(cropped, array![[6.0, 7.0], [10.0, 11.0]]);
        assert!(crop(image.view(), Region { row: 3, col: 3, rows: 2, cols: 2 }).is_err());

        let diff = subtract(cropped.view(), cropped.view()).unwrap();
        assert!(diff.iter().all(|v| *v == 0.0));
        assert!(subtract(image.view(), cropped.view()).is_err());
    }

    #[test]
    fn test_gradient_marks_edges() {
        let mut image = Array2::zeros((7, 7));
        image.slice_mut(s![.., 4..]).fill(5.0);
        let g = morphological_gradient(image.view(), 1);
        assert_eq!(g[[3, 0]], 0.0);
        assert_eq!(g[[3, 3]], 5.0);
        assert_eq!(g[[3, 4]], 5.0);
        assert_eq!(g[[3, 6]], 0.0);
    }

    #[test]
    fn test_resample_sizes_and_coordinates() {
        let image = blob(20, 20, (10.0, 10.0), 2.0);
        let half = resample(image.view(), 0.5).unwrap();
        assert_eq!(half.dim(), (10, 10));
        let back = resampled_to_source((4.75, 4.75), 0.5);
        assert_relative_eq!(back.0, 10.0);
        assert!(resample(image.view(), 0.0).is_err());
    }

    #[test]
    fn test_template_found_with_subpixel_peak() {
        let image = blob(40, 40, (17.3, 22.6), 2.5);
        let template = blob(11, 11, (5.0, 5.0), 2.5);
        let map = match_template(image.view(), template.view()).unwrap();
        let peak = argmax_subpixel(map.view()).unwrap();
        assert!(peak.value > 0.95);
        assert!((peak.row + 5.0 - 17.3).abs() < 0.15);
        assert!((peak.col + 5.0 - 22.6).abs() < 0.15);
    }

    #[test]
    fn test_flat_window_scores_zero() {
        let image = Array2::from_elem((5, 5), 1.0);
        let template = blob(3, 3, (1.0, 1.0), 1.0);
        let map = match_template(image.view(), template.view()).unwrap();
        assert!(map.iter().all(|v| *v == 0.0));
        assert!(match_template(template.view(), image.view()).is_err());
    }
}
