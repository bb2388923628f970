//! Device contracts consumed by the acquisition core.
//!
//! # Design Philosophy
//!
//! - Producer paths are synchronous: a frame source calls [`FrameSink::on_frame`]
//!   on its own delivery thread and a signal source calls the registered
//!   callbacks on its own thread.
//! - Driver errors use `anyhow::Result`; the controller maps them to
//!   [`crate::error::DaqError::HardwareFault`].
//! - Stopping is synchronous: once `stop_stream` (or clearing a callback)
//!   returns, no further delivery for that stream happens.

use crate::data::{Frame, Roi, SampleBlock, TriggerEvent};
use anyhow::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Callback invoked for every trigger edge.
pub type TriggerCallback = Arc<dyn Fn(&TriggerEvent) + Send + Sync>;

/// Callback invoked for every analog sample block.
pub type SampleCallback = Arc<dyn Fn(&SampleBlock) + Send + Sync>;

/// Consumer of streamed frames.
///
/// Called synchronously on the source's delivery thread. The frame is only
/// borrowed for the duration of the call. Implementations must not block on
/// the control thread; failures are handled internally and never propagated
/// back to the source, which would stop the hardware stream uncontrollably.
pub trait FrameSink: Send + Sync {
    /// Handle one frame.
    fn on_frame(&self, frame: &Frame);
}

/// Capability: streaming camera
///
/// # Contract
/// - `set_roi` is only accepted while not streaming
/// - `start_stream` delivers frames to `sink` until `stop_stream` is called or
///   `cancel` fires
/// - `stop_stream` blocks until the delivery thread has exited
pub trait FrameSource: Send + Sync {
    /// Native sensor resolution (width, height).
    fn sensor_size(&self) -> (u32, u32);

    /// Crop the readout to `roi`.
    fn set_roi(&self, roi: Roi) -> Result<()>;

    /// Current frame size (width, height), i.e. the applied ROI.
    fn get_size(&self) -> (u32, u32);

    /// Set the exposure time in seconds.
    fn set_exposure(&self, seconds: f64) -> Result<()>;

    /// Start continuous acquisition into a ring of `buffer_frames` frames.
    fn start_stream(
        &self,
        buffer_frames: usize,
        sink: Arc<dyn FrameSink>,
        cancel: CancellationToken,
    ) -> Result<()>;

    /// Stop continuous acquisition. No-op when not streaming.
    fn stop_stream(&self) -> Result<()>;

    /// Synchronously capture one frame into `buffer`, resizing it to the current ROI.
    fn snap_into(&self, buffer: &mut Frame) -> Result<()>;

    /// Whether a stream is running.
    fn is_streaming(&self) -> bool;

    /// Enable the camera's output trigger (one edge per exposure).
    fn set_output_trigger(&self, enabled: bool) -> Result<()> {
        let _ = enabled;
        Ok(())
    }
}

/// Capability: DAQ with trigger-edge and sample callbacks
///
/// Replacing or clearing a callback waits for an in-flight invocation of the
/// previous callback to finish.
pub trait SignalSource: Send + Sync {
    /// Register (or clear, with `None`) the trigger-edge callback.
    fn set_trigger_processing_function(&self, callback: Option<TriggerCallback>);

    /// Register (or clear, with `None`) the analog sample callback.
    fn set_processing_function(&self, callback: Option<SampleCallback>);

    /// Stop all DAQ tasks and clear every callback.
    fn stop_all(&self) -> Result<()>;
}
