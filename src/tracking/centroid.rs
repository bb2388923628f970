use super::{TrackedPoint, Tracker, Window};
use crate::data::Frame;

/// Relocates each point to the intensity-weighted centroid of its window.
///
/// Pixel `i` covers the continuous interval `[i, i + 1)`, so its centre sits
/// at `i + 0.5`. For an unclamped window around an integer position the
/// geometric centre in window coordinates is `radius - 0.5`; the estimate is
/// reported as an offset from the current position. Points are only moved
/// when the window holds a positive total intensity.
#[derive(Debug, Clone)]
pub struct CentroidTracker {
    radius: u32,
}

/// Result of one centroid evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CentroidEstimate {
    /// Horizontal shift from the current position
    pub dx: f64,
    /// Vertical shift from the current position
    pub dy: f64,
    /// Sum of all pixels in the window
    pub intensity: f64,
}

impl CentroidTracker {
    /// Tracker with a square window of half-width `radius`.
    pub fn new(radius: u32) -> Self {
        Self { radius }
    }

    /// Half-width of the search window.
    pub fn radius(&self) -> u32 {
        self.radius
    }

    /// Centroid of the window around `point`, `None` if the window is empty or dark.
    pub fn estimate(&self, frame: &Frame, point: &TrackedPoint) -> Option<CentroidEstimate> {
        let window = Window::around(point, self.radius, frame)?;
        let (mut total, mut sum_x, mut sum_y) = (0.0_f64, 0.0_f64, 0.0_f64);
        for (y, row) in window.rows(frame) {
            let local_y = (y - window.y0) as f64;
            for (local_x, &value) in row.iter().enumerate() {
                let value = value as f64;
                total += value;
                sum_x += value * local_x as f64;
                sum_y += value * local_y;
            }
        }
        if total <= 0.0 {
            return None;
        }
        let centroid_x = window.x0 as f64 + sum_x / total + 0.5;
        let centroid_y = window.y0 as f64 + sum_y / total + 0.5;
        Some(CentroidEstimate {
            dx: centroid_x - point.x,
            dy: centroid_y - point.y,
            intensity: total,
        })
    }
}

impl Default for CentroidTracker {
    fn default() -> Self {
        Self::new(32)
    }
}

impl Tracker for CentroidTracker {
    fn update(&self, frame: &Frame, points: &mut [TrackedPoint]) {
        for point in points.iter_mut() {
            if let Some(estimate) = self.estimate(frame, point) {
                tracing::trace!(
                    dx = estimate.dx,
                    dy = estimate.dy,
                    intensity = estimate.intensity,
                    "centroid offset"
                );
                point.x += estimate.dx;
                point.y += estimate.dy;
                point.intensity = estimate.intensity;
            }
        }
    }

    fn name(&self) -> &'static str {
        "centroid"
    }
}
