//! Data items flowing through the acquisition pipeline.
//!
//! - [`Frame`]: one 16-bit image delivered by a frame source.
//! - [`Roi`]: the sensor sub-window a frame was read from.
//! - [`TriggerEvent`] / [`SampleBlock`]: items delivered by a signal source.

pub mod frame;
pub mod signal;

pub use frame::{Frame, Roi};
pub use signal::{SampleBlock, TriggerEvent};
