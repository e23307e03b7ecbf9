use crate::error::Result;
use crate::transform::{Position, Transform3};
use chrono::{DateTime, Utc};
use ndarray::Array2;
use std::sync::Arc;

/// A single acquired image.
///
/// Pixel data is shared behind an `Arc`, so cloning a frame (for broadcast to
/// several consumers) does not copy the image.
///
/// # Coordinates
/// `image[[row, col]]` is the pixel at frame coordinates `(x = col, y = row)`.
/// `transform` maps frame coordinates `(x, y, 0)` to the global frame as it was
/// at capture time.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Pixel intensities, `rows x cols`.
    pub image: Arc<Array2<f64>>,

    /// Acquisition time.
    pub timestamp: DateTime<Utc>,

    /// Focus axis position at capture, in meters.
    pub depth: f64,

    /// Frame-to-global mapping at capture time.
    pub transform: Transform3,

    /// Free-form acquisition metadata (exposure, objective, device name, ...).
    pub info: serde_json::Map<String, serde_json::Value>,
}

impl Frame {
    /// Create a frame with empty metadata.
    pub fn new(image: Array2<f64>, timestamp: DateTime<Utc>, depth: f64, transform: Transform3) -> Self {
        Self {
            image: Arc::new(image),
            timestamp,
            depth,
            transform,
            info: serde_json::Map::new(),
        }
    }

    /// Attach a metadata entry.
    pub fn with_info(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.info.insert(key.into(), value.into());
        self
    }

    /// Width in pixels.
    pub fn width(&self) -> usize {
        self.image.ncols()
    }

    /// Height in pixels.
    pub fn height(&self) -> usize {
        self.image.nrows()
    }

    /// Pixel size `(x, y)` in meters.
    pub fn pixel_size(&self) -> (f64, f64) {
        let scale = self.transform.scale_factors();
        (scale[0], scale[1])
    }

    /// Global position of the pixel at `(row, col)`; fractional values are allowed.
    pub fn map_to_global(&self, row: f64, col: f64) -> Position {
        self.transform.map([col, row, 0.0])
    }

    /// Frame coordinates `(row, col)` of a global point.
    pub fn map_from_global(&self, point: Position) -> Result<(f64, f64)> {
        let local = self.transform.inverse()?.map(point);
        Ok((local[1], local[0]))
    }

    /// Mean pixel value.
    pub fn mean(&self) -> f64 {
        self.image.mean().unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_frame_geometry() {
        let transform = Transform3::from_parts([1e-6, 1e-6, 1.0], 0.0, [0.001, 0.002, 0.0]);
        let frame = Frame::new(Array2::from_elem((4, 6), 2.0), Utc::now(), 5e-6, transform)
            .with_info("device", "camera");

        assert_eq!(frame.width(), 6);
        assert_eq!(frame.height(), 4);
        assert_relative_eq!(frame.pixel_size().0, 1e-6, epsilon = 1e-15);
        assert_relative_eq!(frame.mean(), 2.0);

        let global = frame.map_to_global(2.0, 3.0);
        assert_relative_eq!(global[0], 0.001 + 3e-6, epsilon = 1e-12);
        assert_relative_eq!(global[1], 0.002 + 2e-6, epsilon = 1e-12);

        let (row, col) = frame.map_from_global(global).unwrap();
        assert_relative_eq!(row, 2.0, epsilon = 1e-6);
        assert_relative_eq!(col, 3.0, epsilon = 1e-6);
        assert_eq!(frame.info["device"], "camera");
    }
}
