use super::{TrackedPoint, Tracker, Window};
use crate::data::Frame;

/// Relocates each point to the brightest pixel within its search window.
///
/// Ties resolve to the first pixel in row-major order. Points whose window
/// lies entirely outside the frame are left unchanged.
#[derive(Debug, Clone)]
pub struct PeakTracker {
    radius: u32,
}

impl PeakTracker {
    /// Tracker with a square window of half-width `radius`.
    pub fn new(radius: u32) -> Self {
        Self { radius }
    }

    /// Half-width of the search window.
    pub fn radius(&self) -> u32 {
        self.radius
    }
}

impl Default for PeakTracker {
    fn default() -> Self {
        Self::new(30)
    }
}

impl Tracker for PeakTracker {
    fn update(&self, frame: &Frame, points: &mut [TrackedPoint]) {
        for point in points.iter_mut() {
            let Some(window) = Window::around(point, self.radius, frame) else {
                continue;
            };
            let mut best: Option<(u32, u32, u16)> = None;
            for (y, row) in window.rows(frame) {
                for (offset, &value) in row.iter().enumerate() {
                    if best.map_or(true, |(_, _, v)| value > v) {
                        best = Some((window.x0 + offset as u32, y, value));
                    }
                }
            }
            if let Some((x, y, value)) = best {
                point.x = x as f64;
                point.y = y as f64;
                point.intensity = value as f64;
            }
        }
    }

    fn name(&self) -> &'static str {
        "peak"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn moves_to_single_bright_pixel() {
        let mut frame = Frame::zeros(128, 128);
        frame.set(50, 50, 4000);
        let mut points = [TrackedPoint::new(45.0, 45.0)];
        PeakTracker::new(30).update(&frame, &mut points);
        assert_eq!((points[0].x, points[0].y), (50.0, 50.0));
        assert_eq!(points[0].intensity, 4000.0);
    }

    #[test]
    fn pixel_outside_window_is_ignored() {
        let mut frame = Frame::zeros(128, 128);
        frame.set(100, 100, 4000);
        frame.set(12, 10, 7);
        let mut points = [TrackedPoint::new(10.0, 10.0)];
        PeakTracker::new(5).update(&frame, &mut points);
        assert_eq!((points[0].x, points[0].y), (12.0, 10.0));
    }

    #[test]
    fn flat_window_resolves_to_first_pixel() {
        let frame = Frame::zeros(64, 64);
        let mut points = [TrackedPoint::new(20.0, 20.0)];
        PeakTracker::new(4).update(&frame, &mut points);
        assert_eq!((points[0].x, points[0].y), (16.0, 16.0));
    }

    #[test]
    fn point_outside_frame_is_unchanged() {
        let frame = Frame::zeros(32, 32);
        let original = TrackedPoint {
            x: 200.0,
            y: 5.0,
            intensity: 3.0,
        };
        let mut points = [original];
        PeakTracker::new(10).update(&frame, &mut points);
        assert_eq!(points[0], original);
    }
}
