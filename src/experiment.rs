//! Experiment controller: stream and persistence lifecycle.
//!
//! [`Experiment`] owns the camera, the signal source, the [`Pipeline`] and the
//! [`StructuredStore`], and exposes the control surface used by a
//! presentation layer. All control methods take `&mut self`; the caller
//! serializes them on one control thread.
//!
//! # State Machine
//!
//! ```text
//! Stream:  Idle ──start_free_run──> Streaming ──stop_free_run──> Idle
//!                    ▲                   │
//!                    └──── set_roi ──────┘   (stop, resize, restart)
//!
//! Save:    NotSaving ──save_stream──> Saving ──stop_save_stream──> NotSaving
//! ```
//!
//! `finalize` forces both machines back to their initial state and closes the
//! store. It is idempotent and also runs on drop.

use crate::config::{ConfigChange, ExperimentConfig};
use crate::data::{Frame, Roi, SampleBlock, TriggerEvent};
use crate::error::{AppResult, DaqError};
use crate::hardware::{FrameSink, FrameSource, SignalSource};
use crate::pipeline::{
    LiveView, Pipeline, PipelineStats, SaveImageStage, SaveSamplesStage, SaveTracksStage,
    SaveTriggerStage, TrackStage,
};
use crate::storage::{AcquisitionSession, StructuredStore};
use crate::tracking::TrackState;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Bytes of camera ring buffer requested when streaming starts.
pub const STREAM_BUFFER_BYTES: u64 = 128 * 1024 * 1024;

/// Camera streaming state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamState {
    /// Camera not streaming
    Idle,
    /// Frames are delivered to the pipeline
    Streaming,
}

/// Persistence state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SaveState {
    /// No save stages attached
    NotSaving,
    /// Save stages attached to an open session
    Saving,
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamState::Idle => write!(f, "Idle"),
            StreamState::Streaming => write!(f, "Streaming"),
        }
    }
}

impl std::fmt::Display for SaveState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SaveState::NotSaving => write!(f, "NotSaving"),
            SaveState::Saving => write!(f, "Saving"),
        }
    }
}

/// Ring buffer size for a `width × height` stream, at least one frame.
pub fn buffer_frames_for(width: u32, height: u32) -> usize {
    let bytes_per_frame = u64::from(width) * u64::from(height) * 2;
    if bytes_per_frame == 0 {
        return 1;
    }
    (STREAM_BUFFER_BYTES / bytes_per_frame).max(1) as usize
}

/// Top-left corner and extent of a `zoom` sized window centred on `centre`,
/// clamped to `[0, limit)`.
fn zoom_range(centre: u32, zoom: u32, limit: u32) -> (u32, u32) {
    let half = zoom / 2;
    let centre = centre.min(limit.saturating_sub(half));
    let start = centre.saturating_sub(half);
    let end = limit.min(start + zoom);
    (start, end)
}

/// The acquisition controller.
pub struct Experiment {
    config: ExperimentConfig,
    camera: Arc<dyn FrameSource>,
    daq: Arc<dyn SignalSource>,
    pipeline: Arc<Pipeline>,
    store: StructuredStore,
    track_state: TrackState,
    cancel: CancellationToken,
    stream_cancel: Option<CancellationToken>,
    session: Option<AcquisitionSession>,
    tracking: bool,
    finalized: bool,
}

impl Experiment {
    /// Configure the camera from `config` and open the store.
    ///
    /// The store lives at `saving.directory/saving.filename_tracks.acq`; a
    /// missing directory falls back to its nearest existing parent.
    pub fn new(
        config: ExperimentConfig,
        camera: Arc<dyn FrameSource>,
        daq: Arc<dyn SignalSource>,
    ) -> AppResult<Self> {
        config.validate()?;
        camera
            .set_output_trigger(true)
            .map_err(|e| DaqError::hardware("set_output_trigger", e))?;

        let roi = config.camera.roi();
        Self::check_roi(camera.as_ref(), roi)?;
        camera
            .set_roi(roi)
            .map_err(|e| DaqError::hardware("set_roi", e))?;
        camera
            .set_exposure(config.camera.exposure_time.as_secs_f64())
            .map_err(|e| DaqError::hardware("set_exposure", e))?;

        let store = StructuredStore::open(config.saving.store_path())?;
        let pipeline = Arc::new(Pipeline::new(config.camera.save_every_nth_frame));
        let (width, height) = camera.get_size();
        pipeline.live_view().resize(width, height);

        info!(
            model = %config.camera.model,
            width,
            height,
            store = %store.path().display(),
            "Experiment initialized"
        );
        Ok(Self {
            config,
            camera,
            daq,
            pipeline,
            store,
            track_state: TrackState::new(),
            cancel: CancellationToken::new(),
            stream_cancel: None,
            session: None,
            tracking: false,
            finalized: false,
        })
    }

    fn check_roi(camera: &dyn FrameSource, roi: Roi) -> AppResult<()> {
        let (sensor_width, sensor_height) = camera.sensor_size();
        if roi.fits(sensor_width, sensor_height) {
            Ok(())
        } else {
            Err(DaqError::InvalidRoi {
                x: roi.x,
                y: roi.y,
                sensor_width,
                sensor_height,
            })
        }
    }

    fn ensure_active(&self) -> AppResult<()> {
        if self.finalized {
            return Err(DaqError::InvalidState("experiment is finalized".into()));
        }
        Ok(())
    }

    // =========================================================================
    // Stream lifecycle
    // =========================================================================

    /// Start streaming into the pipeline. No-op when already streaming.
    pub fn start_free_run(&mut self) -> AppResult<()> {
        self.ensure_active()?;
        if self.camera.is_streaming() {
            debug!("start_free_run ignored, camera already streaming");
            return Ok(());
        }

        let (width, height) = self.camera.get_size();
        let buffer_frames = buffer_frames_for(width, height);
        self.pipeline.reset_counters();
        self.attach_signal_callbacks();

        let token = self.cancel.child_token();
        let sink: Arc<dyn FrameSink> = self.pipeline.clone();
        if let Err(err) = self.camera.start_stream(buffer_frames, sink, token.clone()) {
            token.cancel();
            if self.session.is_none() {
                self.detach_signal_callbacks();
            }
            let err = DaqError::hardware("start_stream", err);
            error!(error = %err, "Failed to start free run");
            return Err(err);
        }
        self.stream_cancel = Some(token);
        info!(width, height, buffer_frames, "Free run started");
        Ok(())
    }

    /// Stop streaming. When this returns no further frame reaches the pipeline
    /// and no signal callback fires.
    pub fn stop_free_run(&mut self) -> AppResult<()> {
        if let Some(token) = self.stream_cancel.take() {
            token.cancel();
        }
        let result = self
            .camera
            .stop_stream()
            .map_err(|e| DaqError::hardware("stop_stream", e));
        self.detach_signal_callbacks();
        self.pipeline.drain();
        result?;
        info!(stats = ?self.pipeline.stats(), "Free run stopped");
        Ok(())
    }

    /// Capture a single frame while idle; it also becomes the live-view frame.
    pub fn snap(&mut self) -> AppResult<Arc<Frame>> {
        self.ensure_active()?;
        if self.camera.is_streaming() {
            return Err(DaqError::InvalidState(
                "cannot snap while the camera is streaming".into(),
            ));
        }
        let (width, height) = self.camera.get_size();
        let mut buffer = Frame::zeros(width, height);
        self.camera
            .snap_into(&mut buffer)
            .map_err(|e| DaqError::hardware("snap_into", e))?;
        let view = self.pipeline.live_view();
        view.publish(&buffer);
        view.latest()
            .ok_or_else(|| DaqError::InvalidState("live view empty after snap".into()))
    }

    // =========================================================================
    // Region of interest
    // =========================================================================

    /// Apply a new region of interest.
    ///
    /// A running stream is stopped, reconfigured and restarted so no frame of
    /// stale geometry is delivered. The live view is resized to the new ROI.
    pub fn set_roi(&mut self, x: (u32, u32), y: (u32, u32)) -> AppResult<()> {
        self.ensure_active()?;
        let roi = Roi::new(x, y);
        Self::check_roi(self.camera.as_ref(), roi)?;

        let was_streaming = self.camera.is_streaming();
        if was_streaming {
            self.stop_free_run()?;
        }
        self.camera
            .set_roi(roi)
            .map_err(|e| DaqError::hardware("set_roi", e))?;
        let (width, height) = self.camera.get_size();
        self.pipeline.live_view().resize(width, height);
        self.config.camera.set_roi(roi);
        debug!(width, height, "Camera ROI applied");

        if was_streaming {
            self.start_free_run()?;
        }
        Ok(())
    }

    /// Return to the full sensor.
    pub fn clear_roi(&mut self) -> AppResult<()> {
        info!("Clearing ROI settings");
        let (width, height) = self.camera.sensor_size();
        self.set_roi((0, width), (0, height))
    }

    /// Centre a `zoom_width × zoom_height` ROI on `coords`, clamped to the sensor.
    pub fn set_zoom(&mut self, coords: (u32, u32)) -> AppResult<()> {
        let (sensor_width, sensor_height) = self.camera.sensor_size();
        let x = zoom_range(coords.0, self.config.camera.zoom_width, sensor_width);
        let y = zoom_range(coords.1, self.config.camera.zoom_height, sensor_height);
        info!(?x, ?y, "Zooming ROI");
        self.set_roi(x, y)
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Start saving into a fresh acquisition session; returns its id.
    ///
    /// When already saving, the current session id is returned.
    pub fn save_stream(&mut self) -> AppResult<String> {
        self.ensure_active()?;
        if let Some(session) = &self.session {
            warn!(session = session.id(), "save_stream called while already saving");
            return Ok(session.id().to_string());
        }

        let session = self
            .store
            .start_new_acquisition(self.config.to_metadata()?)?;
        let store = self.store.clone();
        let tracking = self.tracking;
        let bound = session.clone();
        self.pipeline.reconfigure(move |set| {
            set.save_image = Some(Arc::new(SaveImageStage::new(store.clone(), bound.clone())));
            set.save_trigger = Some(Arc::new(SaveTriggerStage::new(store.clone(), bound.clone())));
            set.save_samples = Some(Arc::new(SaveSamplesStage::new(store.clone(), bound.clone())));
            if tracking {
                set.save_tracks = Some(Arc::new(SaveTracksStage::new(store, bound)));
            }
        });
        self.attach_signal_callbacks();

        let id = session.id().to_string();
        info!(session = %id, every_nth = self.pipeline.decimation(), "Saving stream");
        self.session = Some(session);
        Ok(id)
    }

    /// Stop saving and mark the session finished.
    ///
    /// Signal callbacks are detached first, then the save stages (waiting for
    /// in-flight frames), and only then the finish marker is written, so no
    /// record can follow it.
    pub fn stop_save_stream(&mut self) -> AppResult<()> {
        let Some(session) = self.session.take() else {
            debug!("stop_save_stream ignored, not saving");
            return Ok(());
        };
        self.detach_signal_callbacks();
        self.pipeline.detach_save_stages();
        let result = self.store.mark_finished(&session);
        if self.camera.is_streaming() {
            self.attach_signal_callbacks();
        }
        result
    }

    /// Persist the current live-view frame as a single-frame session; returns
    /// its id.
    ///
    /// When the live view holds no captured frame of the current geometry
    /// (nothing delivered yet, or the ROI changed since) a fresh frame is
    /// snapped instead.
    pub fn save_snapshot(&mut self) -> AppResult<String> {
        let view = self.pipeline.live_view();
        let frame = match view.latest() {
            Some(frame) if view.has_frame() => frame,
            _ => self.snap()?,
        };
        let id = self
            .store
            .save_snapshot(&frame, self.config.to_metadata()?)?;
        info!(session = %id, "Snapshot saved");
        Ok(id)
    }

    // =========================================================================
    // Tracking
    // =========================================================================

    /// Add a coordinate to monitor; returns its index in the tracked list.
    pub fn add_monitor_coordinate(&self, coord: (f64, f64)) -> usize {
        self.track_state.add(coord.0, coord.1)
    }

    /// Forget all monitored coordinates.
    pub fn clear_monitor_coordinates(&self) {
        self.track_state.clear();
    }

    /// Attach the track stage configured in `tracking`. While saving, track
    /// snapshots are persisted too.
    pub fn start_tracking(&mut self) -> AppResult<()> {
        self.ensure_active()?;
        let tracker = self.config.tracking.method.build(self.config.tracking.radius);
        let name = tracker.name();
        let stage = Arc::new(TrackStage::new(tracker, self.track_state.clone()));
        let saver = self
            .session
            .clone()
            .map(|session| SaveTracksStage::new(self.store.clone(), session));
        self.pipeline.reconfigure(move |set| {
            set.track = Some(stage);
            if let Some(saver) = saver {
                set.save_tracks = Some(Arc::new(saver));
            }
        });
        self.tracking = true;
        info!(tracker = name, radius = self.config.tracking.radius, "Tracking started");
        Ok(())
    }

    /// Detach the track stage and the track saver.
    pub fn stop_tracking(&mut self) {
        self.pipeline.reconfigure(|set| {
            set.track = None;
            set.save_tracks = None;
        });
        self.tracking = false;
        info!("Tracking stopped");
    }

    // =========================================================================
    // Configuration
    // =========================================================================

    /// Apply a partial configuration update.
    ///
    /// A changed `camera` section resyncs the hardware, ROI first and then
    /// exposure; the decimation factor applies from the next frame. The
    /// configuration is only replaced once every step succeeded. When the
    /// hardware rejects a step, the previous ROI and exposure are restored on
    /// a best-effort basis and a stream that was running is restarted.
    pub fn update_config(&mut self, patch: serde_json::Value) -> AppResult<ConfigChange> {
        self.ensure_active()?;
        info!("Updating config");
        debug!(%patch, "Config params");
        let mut updated = self.config.clone();
        let change = updated.update(patch)?;

        if change.camera_changed {
            let roi = updated.camera.roi();
            Self::check_roi(self.camera.as_ref(), roi)?;
            let previous = self.config.clone();
            let was_streaming = self.camera.is_streaming();

            if let Err(err) = self.apply_camera_settings(&updated) {
                warn!(error = %err, "Camera update rejected, restoring previous settings");
                self.restore_camera(previous, was_streaming);
                return Err(err);
            }
        }
        if change.decimation_changed {
            self.pipeline.set_decimation(updated.camera.save_every_nth_frame);
        }
        self.config = updated;
        Ok(change)
    }

    fn apply_camera_settings(&mut self, target: &ExperimentConfig) -> AppResult<()> {
        let roi = target.camera.roi();
        if roi != self.config.camera.roi() {
            self.set_roi(roi.x, roi.y)?;
        }
        self.camera
            .set_exposure(target.camera.exposure_time.as_secs_f64())
            .map_err(|e| DaqError::hardware("set_exposure", e))
    }

    /// Put the camera back to `previous`, restarting the stream if it was running.
    fn restore_camera(&mut self, previous: ExperimentConfig, was_streaming: bool) {
        let roi = previous.camera.roi();
        if self.config.camera.roi() != roi {
            if let Err(err) = self.set_roi(roi.x, roi.y) {
                error!(error = %err, "Failed to restore previous ROI");
            }
        }
        if let Err(err) = self
            .camera
            .set_exposure(previous.camera.exposure_time.as_secs_f64())
        {
            error!(error = %err, "Failed to restore previous exposure");
        }
        if was_streaming && !self.camera.is_streaming() {
            if let Err(err) = self.start_free_run() {
                error!(error = %err, "Failed to restart stream after rejected update");
            }
        }
        self.config = previous;
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Stop streaming and saving, stop the signal source and close the store.
    ///
    /// Every step is attempted; the first failure is returned. Calling it
    /// again is a no-op.
    pub fn finalize(&mut self) -> AppResult<()> {
        if self.finalized {
            return Ok(());
        }
        self.finalized = true;
        info!("Finalizing experiment");

        let mut first_error = None;
        let mut record = |step: &str, result: AppResult<()>| {
            if let Err(err) = result {
                error!(step, error = %err, "Finalize step failed");
                first_error.get_or_insert(err);
            }
        };
        record("stop_free_run", self.stop_free_run());
        record("stop_save_stream", self.stop_save_stream());
        record(
            "stop_all",
            self.daq
                .stop_all()
                .map_err(|e| DaqError::hardware("stop_all", e)),
        );
        self.cancel.cancel();
        record("close_store", self.store.close());

        first_error.map_or(Ok(()), Err)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Current `(stream, save)` state.
    pub fn state(&self) -> (StreamState, SaveState) {
        let stream = if self.camera.is_streaming() {
            StreamState::Streaming
        } else {
            StreamState::Idle
        };
        let save = if self.session.is_some() {
            SaveState::Saving
        } else {
            SaveState::NotSaving
        };
        (stream, save)
    }

    /// Id of the session being saved, if any.
    pub fn current_session(&self) -> Option<String> {
        self.session.as_ref().map(|s| s.id().to_string())
    }

    /// Active configuration.
    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    /// Live-view slot for the presentation consumer.
    pub fn live_view(&self) -> Arc<LiveView> {
        self.pipeline.live_view()
    }

    /// Shared tracked-point list.
    pub fn track_state(&self) -> TrackState {
        self.track_state.clone()
    }

    /// Whether the track stage is attached.
    pub fn is_tracking(&self) -> bool {
        self.tracking
    }

    /// Pipeline counters since the last stream start.
    pub fn pipeline_stats(&self) -> PipelineStats {
        self.pipeline.stats()
    }

    /// The store this experiment writes to.
    pub fn store(&self) -> &StructuredStore {
        &self.store
    }

    fn attach_signal_callbacks(&self) {
        let pipeline = Arc::clone(&self.pipeline);
        self.daq
            .set_trigger_processing_function(Some(Arc::new(move |event: &TriggerEvent| {
                pipeline.on_trigger(event)
            })));
        let pipeline = Arc::clone(&self.pipeline);
        self.daq
            .set_processing_function(Some(Arc::new(move |block: &SampleBlock| {
                pipeline.on_samples(block)
            })));
    }

    fn detach_signal_callbacks(&self) {
        self.daq.set_trigger_processing_function(None);
        self.daq.set_processing_function(None);
    }
}

impl Drop for Experiment {
    fn drop(&mut self) {
        if let Err(err) = self.finalize() {
            error!(error = %err, "Finalize on drop failed");
        }
    }
}
