//! Particle tracking state and trackers.
//!
//! [`TrackState`] is the single shared list of monitored coordinates. It is
//! mutated in place by the pipeline's track stage (frame delivery thread), by
//! the control thread (`add_monitor_coordinate` / `clear_monitor_coordinates`)
//! and read by the presentation consumer. All three go through one mutex, so
//! a reader always observes a complete point set.
//!
//! Trackers implement [`Tracker`]: given a frame they relocate each point in
//! place. Two variants exist:
//!
//! - [`PeakTracker`]: moves a point to the brightest pixel of its window.
//! - [`CentroidTracker`]: moves a point to the intensity-weighted centroid of
//!   its window (subpixel) and records the summed intensity.

mod centroid;
mod peak;

pub use centroid::{CentroidEstimate, CentroidTracker};
pub use peak::PeakTracker;

use crate::data::Frame;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A monitored particle position.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TrackedPoint {
    /// Horizontal position in ROI pixel coordinates
    pub x: f64,
    /// Vertical position in ROI pixel coordinates
    pub y: f64,
    /// Intensity estimate from the last update
    pub intensity: f64,
}

impl TrackedPoint {
    /// A new point with zero intensity.
    pub fn new(x: f64, y: f64) -> Self {
        Self {
            x,
            y,
            intensity: 0.0,
        }
    }
}

/// Which tracker the track stage runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackingMethod {
    /// Maximum-intensity pixel
    Peak,
    /// Intensity-weighted centroid
    Centroid,
}

impl TrackingMethod {
    /// Build the tracker for this method.
    pub fn build(self, radius: u32) -> Arc<dyn Tracker> {
        match self {
            TrackingMethod::Peak => Arc::new(PeakTracker::new(radius)),
            TrackingMethod::Centroid => Arc::new(CentroidTracker::new(radius)),
        }
    }
}

/// Relocates tracked points using the pixels of a frame.
pub trait Tracker: Send + Sync {
    /// Update every point in place from `frame`.
    fn update(&self, frame: &Frame, points: &mut [TrackedPoint]);

    /// Name used in logs.
    fn name(&self) -> &'static str;
}

/// Square search window clamped to the frame, as half-open pixel ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Window {
    pub x0: u32,
    pub x1: u32,
    pub y0: u32,
    pub y1: u32,
}

impl Window {
    /// Window `[x - radius, x + radius)` × `[y - radius, y + radius)` clamped
    /// to the frame; `None` when nothing of it remains inside.
    pub(crate) fn around(point: &TrackedPoint, radius: u32, frame: &Frame) -> Option<Self> {
        let clamp = |lo: f64, hi: f64, limit: u32| -> Option<(u32, u32)> {
            if !lo.is_finite() || !hi.is_finite() {
                return None;
            }
            let start = lo.max(0.0) as u32;
            let end = hi.min(limit as f64).max(0.0) as u32;
            (start < end).then_some((start, end))
        };
        let r = radius as f64;
        let (x0, x1) = clamp(point.x - r, point.x + r, frame.width)?;
        let (y0, y1) = clamp(point.y - r, point.y + r, frame.height)?;
        Some(Self { x0, x1, y0, y1 })
    }

    /// Row slices of the window.
    pub(crate) fn rows<'a>(&self, frame: &'a Frame) -> impl Iterator<Item = (u32, &'a [u16])> + 'a {
        let (x0, x1) = (self.x0 as usize, self.x1 as usize);
        (self.y0..self.y1).map(move |y| (y, &frame.row(y)[x0..x1]))
    }
}

#[derive(Debug, Default)]
struct PointList {
    points: Vec<TrackedPoint>,
    generation: u64,
}

/// Shared, index-addressable list of tracked points.
///
/// Cloning the handle shares the same backing list. Every mutation bumps a
/// generation counter so readers can tell whether the list changed since their
/// last snapshot.
#[derive(Debug, Clone, Default)]
pub struct TrackState {
    inner: Arc<Mutex<PointList>>,
}

impl TrackState {
    /// An empty point list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a point to monitor.
    pub fn add(&self, x: f64, y: f64) -> usize {
        let mut list = self.inner.lock();
        list.points.push(TrackedPoint::new(x, y));
        list.generation += 1;
        list.points.len() - 1
    }

    /// Remove all points.
    pub fn clear(&self) {
        let mut list = self.inner.lock();
        list.points.clear();
        list.generation += 1;
    }

    /// Number of monitored points.
    pub fn len(&self) -> usize {
        self.inner.lock().points.len()
    }

    /// Whether no points are monitored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Point at `index`.
    pub fn get(&self, index: usize) -> Option<TrackedPoint> {
        self.inner.lock().points.get(index).copied()
    }

    /// Generation counter, incremented by every mutation.
    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    /// Consistent copy of all points with the generation they belong to.
    pub fn snapshot(&self) -> (u64, Vec<TrackedPoint>) {
        let list = self.inner.lock();
        (list.generation, list.points.clone())
    }

    /// Mutate all points in place under the lock.
    ///
    /// Returns the post-update snapshot, or `None` when the list is empty.
    pub fn update_with<F>(&self, update: F) -> Option<Vec<TrackedPoint>>
    where
        F: FnOnce(&mut [TrackedPoint]),
    {
        let mut list = self.inner.lock();
        if list.points.is_empty() {
            return None;
        }
        update(&mut list.points);
        list.generation += 1;
        Some(list.points.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn handles_share_backing_list() {
        let state = TrackState::new();
        let view = state.clone();
        assert_eq!(state.add(1.0, 2.0), 0);
        assert_eq!(state.add(3.0, 4.0), 1);
        assert_eq!(view.len(), 2);
        assert_eq!(view.get(1), Some(TrackedPoint::new(3.0, 4.0)));
        state.clear();
        assert!(view.is_empty());
        assert_eq!(view.generation(), 3);
    }

    #[test]
    fn update_on_empty_list_yields_nothing() {
        let state = TrackState::new();
        assert!(state.update_with(|_| unreachable!()).is_none());
        assert_eq!(state.generation(), 0);
    }

    #[test]
    fn readers_never_see_partial_updates() {
        let state = TrackState::new();
        for i in 0..16 {
            state.add(i as f64, 0.0);
        }
        let writer = {
            let state = state.clone();
            thread::spawn(move || {
                for round in 1..=500 {
                    state.update_with(|points| {
                        for p in points.iter_mut() {
                            p.y = round as f64;
                        }
                    });
                }
            })
        };
        for _ in 0..500 {
            let (_, points) = state.snapshot();
            let first = points[0].y;
            assert!(points.iter().all(|p| p.y == first), "torn snapshot");
        }
        writer.join().expect("writer thread");
    }

    #[test]
    fn window_clamps_to_frame() {
        let frame = Frame::zeros(100, 80);
        let w = Window::around(&TrackedPoint::new(5.0, 78.0), 10, &frame).expect("inside");
        assert_eq!((w.x0, w.x1, w.y0, w.y1), (0, 15, 68, 80));
        assert!(Window::around(&TrackedPoint::new(-20.0, 10.0), 10, &frame).is_none());
        assert!(Window::around(&TrackedPoint::new(150.0, 10.0), 10, &frame).is_none());
    }
}
