//! Synthetic image content for the mock camera.

use ndarray::Array2;

/// Pseudo-random generator (glibc LCG) for reproducible per-pixel noise.
#[inline]
fn prng(seed: u64) -> u64 {
    seed.wrapping_mul(1103515245).wrapping_add(12345) & 0x7fffffff
}

/// Geometry of a pipette to render, all in global meters.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TipScene {
    /// Global tip position.
    pub tip: [f64; 3],
    /// Unit vector from the pipette body towards the tip.
    pub direction: [f64; 3],
}

/// What the sensor sees.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SensorView {
    pub width: usize,
    pub height: usize,
    pub pixel_size: f64,
    /// Global xy of the center of pixel (row 0, col 0).
    pub origin: [f64; 2],
    /// Focal plane depth.
    pub depth: f64,
    pub depth_of_field: f64,
    pub background: f64,
    pub tip_intensity: f64,
}

/// Render one frame: noisy background plus an optional pipette shaft.
///
/// The shaft is a tapered ridge ending at the tip. Parts of the shaft away from
/// the focal plane are dimmer and wider, so a z-series of frames differs
/// frame to frame the way a real focus series does.
pub(crate) fn render(view: &SensorView, scene: Option<&TipScene>, frame_seed: u64) -> Array2<f64> {
    let seed = frame_seed.wrapping_mul(2654435761);
    let mut image = Array2::from_shape_fn((view.height, view.width), |(row, col)| {
        let idx = (row * view.width + col) as u64;
        let noise = (prng(seed ^ idx) & 0xff) as f64 / 255.0 - 0.5;
        view.background + noise
    });

    let Some(scene) = scene else {
        return image;
    };

    // Axis of the shaft projected into the image plane, pointing back up the pipette.
    let (bx, by) = (-scene.direction[0], -scene.direction[1]);
    let planar = (bx * bx + by * by).sqrt();
    let (ux, uy) = if planar > 1e-9 { (bx / planar, by / planar) } else { (1.0, 0.0) };
    // Rise in z per meter travelled back along the projected shaft.
    let rise = if planar > 1e-9 { -scene.direction[2] / planar } else { 0.0 };

    let base_width = 1.5 * view.pixel_size;
    let taper = 0.15;
    for ((row, col), value) in image.indexed_iter_mut() {
        let gx = view.origin[0] + col as f64 * view.pixel_size;
        let gy = view.origin[1] + row as f64 * view.pixel_size;
        let dx = gx - scene.tip[0];
        let dy = gy - scene.tip[1];
        let along = dx * ux + dy * uy;
        let across = -dx * uy + dy * ux;

        let shaft_z = scene.tip[2] + along.max(0.0) * rise;
        let defocus = (shaft_z - view.depth) / view.depth_of_field;
        let attenuation = 1.0 / (1.0 + defocus * defocus);
        let sigma = base_width * (1.0 + defocus.abs()) + along.max(0.0) * taper;
        let r2 = if along >= 0.0 {
            across * across
        } else {
            along * along + across * across
        };
        *value += view.tip_intensity * attenuation * (-r2 / (2.0 * sigma * sigma)).exp();
    }
    image
}
