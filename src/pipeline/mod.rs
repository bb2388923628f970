//! Per-frame processing pipeline.
//!
//! The [`Pipeline`] is the frame sink handed to a [`FrameSource`] and the
//! target of the signal source's trigger and sample callbacks. For every frame
//! it runs, in order:
//!
//! 1. live-view update (single slot, last write wins)
//! 2. decimation check
//! 3. save-image stage, on every Nth frame counted from the first frame the
//!    stage sees
//! 4. track stage
//! 5. save-tracks stage, when the track stage produced points
//!
//! A failing stage ends processing of that frame. Failures never reach the
//! producer; a failing save stage is logged and detached, acquisition goes on.
//!
//! # Reconfiguration
//!
//! The stage slots live in one immutable [`StageSet`] behind a lock and are
//! replaced as a whole, so a frame runs either entirely with the old set or
//! entirely with the new one. Each producer path holds its own busy lock
//! while it runs; the public setters take every busy lock once after the
//! swap, so when a setter returns no call is still running an old stage.
//!
//! [`FrameSource`]: crate::hardware::FrameSource

pub mod stages;

pub use stages::{SaveImageStage, SaveSamplesStage, SaveTracksStage, SaveTriggerStage, TrackStage};

use crate::data::{Frame, SampleBlock, TriggerEvent};
use crate::error::AppResult;
use crate::hardware::FrameSink;
use crate::tracking::TrackedPoint;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// A unary processing step applied to every item of one stream.
///
/// `Out` is `()` for sink stages; the track stage returns the updated points.
pub trait ProcessingStage<In: ?Sized, Out = ()>: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Process one item. Runs on the producer's thread and must not block
    /// beyond a bounded store append.
    fn process(&self, input: &In) -> AppResult<Out>;
}

/// Stage persisting frames.
pub type FrameStage = Arc<dyn ProcessingStage<Frame>>;
/// Stage persisting trigger events.
pub type TriggerStage = Arc<dyn ProcessingStage<TriggerEvent>>;
/// Stage persisting analog sample blocks.
pub type SampleStage = Arc<dyn ProcessingStage<SampleBlock>>;
/// Stage updating tracked points from a frame.
pub type TrackingStage = Arc<dyn ProcessingStage<Frame, Option<Vec<TrackedPoint>>>>;
/// Stage persisting tracked-point snapshots.
pub type TracksStage = Arc<dyn ProcessingStage<[TrackedPoint]>>;

/// The configured stage slots, swapped as a unit.
#[derive(Clone, Default)]
pub struct StageSet {
    /// Decimated image persistence
    pub save_image: Option<FrameStage>,
    /// Trigger timestamp persistence
    pub save_trigger: Option<TriggerStage>,
    /// Analog sample persistence
    pub save_samples: Option<SampleStage>,
    /// Point tracking
    pub track: Option<TrackingStage>,
    /// Tracked-point persistence
    pub save_tracks: Option<TracksStage>,
    /// Frames offered to the current save-image stage; replaced together with it
    save_ordinal: Arc<AtomicU64>,
}

impl StageSet {
    /// Whether any persistence stage is attached.
    pub fn is_saving(&self) -> bool {
        self.save_image.is_some()
            || self.save_trigger.is_some()
            || self.save_samples.is_some()
            || self.save_tracks.is_some()
    }

    fn same_save_image(&self, other: &StageSet) -> bool {
        match (&self.save_image, &other.save_image) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }
}

impl std::fmt::Debug for StageSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageSet")
            .field("save_image", &self.save_image.as_ref().map(|s| s.name().to_string()))
            .field("save_trigger", &self.save_trigger.as_ref().map(|s| s.name().to_string()))
            .field("save_samples", &self.save_samples.as_ref().map(|s| s.name().to_string()))
            .field("track", &self.track.as_ref().map(|s| s.name().to_string()))
            .field("save_tracks", &self.save_tracks.as_ref().map(|s| s.name().to_string()))
            .finish()
    }
}

/// Last delivered frame, for the presentation consumer.
#[derive(Debug, Default)]
pub struct LiveView {
    slot: Mutex<Option<Arc<Frame>>>,
    updates: AtomicU64,
    /// Cleared by `resize` until the next publish
    has_frame: AtomicBool,
}

impl LiveView {
    /// Replace the slot contents with `frame`.
    ///
    /// The existing buffer is reused when no reader holds it and the geometry
    /// matches.
    pub fn publish(&self, frame: &Frame) {
        let mut slot = self.slot.lock();
        match slot.as_mut().and_then(Arc::get_mut) {
            Some(buffer) if buffer.size() == frame.size() => buffer.clone_from(frame),
            _ => *slot = Some(Arc::new(frame.clone())),
        }
        self.has_frame.store(true, Ordering::Release);
        self.updates.fetch_add(1, Ordering::Release);
    }

    /// Reallocate the buffer as a black frame of the new geometry.
    ///
    /// The placeholder is not a captured frame: [`has_frame`](Self::has_frame)
    /// reports `false` until the next publish.
    pub fn resize(&self, width: u32, height: u32) {
        let mut slot = self.slot.lock();
        *slot = Some(Arc::new(Frame::zeros(width, height)));
        self.has_frame.store(false, Ordering::Release);
        debug!(width, height, "Live view resized");
    }

    /// Whether the slot holds a captured frame of the current geometry.
    pub fn has_frame(&self) -> bool {
        let _slot = self.slot.lock();
        self.has_frame.load(Ordering::Acquire)
    }

    /// Most recent frame, if any.
    pub fn latest(&self) -> Option<Arc<Frame>> {
        self.slot.lock().clone()
    }

    /// Geometry of the current buffer.
    pub fn size(&self) -> Option<(u32, u32)> {
        self.slot.lock().as_ref().map(|f| f.size())
    }

    /// Number of frames published so far; lets readers skip unchanged frames.
    pub fn updates(&self) -> u64 {
        self.updates.load(Ordering::Acquire)
    }
}

/// Counters describing pipeline activity since the last reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PipelineStats {
    /// Frames delivered to `on_frame`
    pub frames_received: u64,
    /// Frames the save-image stage persisted
    pub frames_saved: u64,
    /// Trigger events delivered to `on_trigger`
    pub triggers_received: u64,
    /// Trigger events persisted
    pub triggers_saved: u64,
    /// Sample blocks delivered to `on_samples`
    pub sample_blocks: u64,
    /// Stage failures, including the ones that detached a stage
    pub stage_failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    frames_received: AtomicU64,
    frames_saved: AtomicU64,
    triggers_received: AtomicU64,
    triggers_saved: AtomicU64,
    sample_blocks: AtomicU64,
    stage_failures: AtomicU64,
}

/// Routes frames, triggers and sample blocks through the configured stages.
#[derive(Debug)]
pub struct Pipeline {
    stages: RwLock<Arc<StageSet>>,
    frame_busy: Mutex<()>,
    trigger_busy: Mutex<()>,
    samples_busy: Mutex<()>,
    decimation: AtomicU32,
    counters: Counters,
    live_view: Arc<LiveView>,
}

impl Pipeline {
    /// An empty pipeline saving every `save_every_nth_frame`-th frame once a
    /// save-image stage is attached.
    pub fn new(save_every_nth_frame: u32) -> Self {
        Self {
            stages: RwLock::new(Arc::new(StageSet::default())),
            frame_busy: Mutex::new(()),
            trigger_busy: Mutex::new(()),
            samples_busy: Mutex::new(()),
            decimation: AtomicU32::new(save_every_nth_frame.max(1)),
            counters: Counters::default(),
            live_view: Arc::new(LiveView::default()),
        }
    }

    /// Shared handle to the live-view slot.
    pub fn live_view(&self) -> Arc<LiveView> {
        Arc::clone(&self.live_view)
    }

    /// Current stage set.
    pub fn stages(&self) -> Arc<StageSet> {
        self.stages.read().clone()
    }

    /// Set the save-image decimation factor; takes effect on the next frame.
    pub fn set_decimation(&self, n: u32) {
        self.decimation.store(n.max(1), Ordering::Release);
    }

    /// Current save-image decimation factor.
    pub fn decimation(&self) -> u32 {
        self.decimation.load(Ordering::Acquire)
    }

    /// Reset the decimation counter and statistics; called on every stream start.
    pub fn reset_counters(&self) {
        self.stages.read().save_ordinal.store(0, Ordering::Release);
        let c = &self.counters;
        for counter in [
            &c.frames_received,
            &c.frames_saved,
            &c.triggers_received,
            &c.triggers_saved,
            &c.sample_blocks,
            &c.stage_failures,
        ] {
            counter.store(0, Ordering::Release);
        }
    }

    /// Activity counters.
    pub fn stats(&self) -> PipelineStats {
        let c = &self.counters;
        PipelineStats {
            frames_received: c.frames_received.load(Ordering::Acquire),
            frames_saved: c.frames_saved.load(Ordering::Acquire),
            triggers_received: c.triggers_received.load(Ordering::Acquire),
            triggers_saved: c.triggers_saved.load(Ordering::Acquire),
            sample_blocks: c.sample_blocks.load(Ordering::Acquire),
            stage_failures: c.stage_failures.load(Ordering::Acquire),
        }
    }

    /// Apply `change` to a copy of the stage set, install it with a single
    /// replacement and wait for in-flight calls on the old set to finish.
    ///
    /// Installing a different save-image stage restarts the decimation phase,
    /// so the new stage saves the first frame it sees.
    pub fn reconfigure<F>(&self, change: F)
    where
        F: FnOnce(&mut StageSet),
    {
        {
            let mut current = self.stages.write();
            let mut next = StageSet::clone(&current);
            change(&mut next);
            if !next.same_save_image(&current) {
                next.save_ordinal = Arc::new(AtomicU64::new(0));
            }
            debug!(stages = ?next, "Pipeline stages replaced");
            *current = Arc::new(next);
        }
        self.drain();
    }

    /// Attach or replace the save-image stage.
    pub fn set_save_image_stage(&self, stage: Option<FrameStage>) {
        self.reconfigure(|set| set.save_image = stage);
    }

    /// Detach the save-image stage.
    pub fn unset_save_image_stage(&self) {
        self.set_save_image_stage(None);
    }

    /// Attach or replace the save-trigger stage.
    pub fn set_save_trigger_stage(&self, stage: Option<TriggerStage>) {
        self.reconfigure(|set| set.save_trigger = stage);
    }

    /// Detach the save-trigger stage.
    pub fn unset_save_trigger_stage(&self) {
        self.set_save_trigger_stage(None);
    }

    /// Attach or replace the save-samples stage.
    pub fn set_save_samples_stage(&self, stage: Option<SampleStage>) {
        self.reconfigure(|set| set.save_samples = stage);
    }

    /// Attach or replace the track stage.
    pub fn set_track_stage(&self, stage: Option<TrackingStage>) {
        self.reconfigure(|set| set.track = stage);
    }

    /// Detach the track stage.
    pub fn unset_track_stage(&self) {
        self.set_track_stage(None);
    }

    /// Attach or replace the save-tracks stage.
    pub fn set_save_tracks_stage(&self, stage: Option<TracksStage>) {
        self.reconfigure(|set| set.save_tracks = stage);
    }

    /// Detach every persistence stage in one swap.
    pub fn detach_save_stages(&self) {
        self.reconfigure(|set| {
            set.save_image = None;
            set.save_trigger = None;
            set.save_samples = None;
            set.save_tracks = None;
        });
    }

    /// Block until no producer call is running.
    ///
    /// Calls that start afterwards see the current stage set.
    pub fn drain(&self) {
        drop(self.frame_busy.lock());
        drop(self.trigger_busy.lock());
        drop(self.samples_busy.lock());
    }

    /// Process one frame. Called on the camera's delivery thread.
    pub fn on_frame(&self, frame: &Frame) {
        let _busy = self.frame_busy.lock();
        let stages = self.stages();
        let ordinal = self.counters.frames_received.fetch_add(1, Ordering::AcqRel);

        self.live_view.publish(frame);

        if let Some(stage) = &stages.save_image {
            let save_ordinal = stages.save_ordinal.fetch_add(1, Ordering::AcqRel);
            if save_ordinal % u64::from(self.decimation()) == 0 {
                if let Err(err) = stage.process(frame) {
                    self.stage_failed(stage.name(), &err.to_string(), ordinal);
                    self.detach_failed("save_image", |set| {
                        take_if_same(&mut set.save_image, stage)
                    });
                    return;
                }
                self.counters.frames_saved.fetch_add(1, Ordering::AcqRel);
            }
        }

        let Some(track) = &stages.track else {
            return;
        };
        let points = match track.process(frame) {
            Ok(Some(points)) => points,
            Ok(None) => return,
            Err(err) => {
                self.stage_failed(track.name(), &err.to_string(), ordinal);
                return;
            }
        };

        if let Some(stage) = &stages.save_tracks {
            if let Err(err) = stage.process(&points) {
                self.stage_failed(stage.name(), &err.to_string(), ordinal);
                self.detach_failed("save_tracks", |set| take_if_same(&mut set.save_tracks, stage));
            }
        }
        trace!(frame = ordinal, "Frame processed");
    }

    /// Process one trigger edge. Called on the signal source's thread.
    pub fn on_trigger(&self, event: &TriggerEvent) {
        let _busy = self.trigger_busy.lock();
        let stages = self.stages();
        self.counters.triggers_received.fetch_add(1, Ordering::AcqRel);

        if let Some(stage) = &stages.save_trigger {
            match stage.process(event) {
                Ok(()) => {
                    self.counters.triggers_saved.fetch_add(1, Ordering::AcqRel);
                }
                Err(err) => {
                    self.stage_failed(stage.name(), &err.to_string(), event.index);
                    self.detach_failed("save_trigger", |set| take_if_same(&mut set.save_trigger, stage));
                }
            }
        }
    }

    /// Process one block of analog samples. Called on the signal source's thread.
    pub fn on_samples(&self, block: &SampleBlock) {
        let _busy = self.samples_busy.lock();
        let stages = self.stages();
        self.counters.sample_blocks.fetch_add(1, Ordering::AcqRel);

        if let Some(stage) = &stages.save_samples {
            if let Err(err) = stage.process(block) {
                self.stage_failed(stage.name(), &err.to_string(), block.first_index);
                self.detach_failed("save_samples", |set| take_if_same(&mut set.save_samples, stage));
            }
        }
    }

    fn stage_failed(&self, stage: &str, error: &str, item: u64) {
        self.counters.stage_failures.fetch_add(1, Ordering::AcqRel);
        warn!(stage, item, error, "Pipeline stage failed");
    }

    /// Remove a stage that failed from inside a producer call.
    ///
    /// Does not drain: the caller holds a busy lock. `detach` only clears the
    /// slot if it still holds the failing stage, so a replacement installed
    /// concurrently by the control thread survives.
    fn detach_failed<F>(&self, slot: &'static str, detach: F)
    where
        F: FnOnce(&mut StageSet) -> bool,
    {
        let mut current = self.stages.write();
        let mut next = StageSet::clone(&current);
        if detach(&mut next) {
            *current = Arc::new(next);
            warn!(slot, "Save stage disabled after failure, acquisition continues unsaved");
        }
    }
}

/// Clear `slot` if it still holds exactly `stage`.
fn take_if_same<T: ?Sized>(slot: &mut Option<Arc<T>>, stage: &Arc<T>) -> bool {
    match slot {
        Some(current) if Arc::ptr_eq(current, stage) => {
            *slot = None;
            true
        }
        _ => false,
    }
}

impl FrameSink for Pipeline {
    fn on_frame(&self, frame: &Frame) {
        Pipeline::on_frame(self, frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DaqError;
    use std::sync::atomic::AtomicBool;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<u16>>,
        fail: AtomicBool,
    }

    impl ProcessingStage<Frame> for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn process(&self, frame: &Frame) -> AppResult<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(DaqError::StoreClosed);
            }
            self.seen.lock().push(frame.get(0, 0).unwrap_or_default());
            Ok(())
        }
    }

    fn numbered(n: u16) -> Frame {
        Frame::from_u16(2, 2, vec![n; 4])
    }

    #[test]
    fn decimation_keeps_every_nth_frame_from_the_first() {
        let pipeline = Pipeline::new(3);
        let recorder = Arc::new(Recorder::default());
        pipeline.set_save_image_stage(Some(recorder.clone()));
        for n in 0..10 {
            pipeline.on_frame(&numbered(n));
        }
        assert_eq!(*recorder.seen.lock(), vec![0, 3, 6, 9]);
        let stats = pipeline.stats();
        assert_eq!(stats.frames_received, 10);
        assert_eq!(stats.frames_saved, 4);
    }

    #[test]
    fn decimation_change_applies_to_next_frame() {
        let pipeline = Pipeline::new(1);
        let recorder = Arc::new(Recorder::default());
        pipeline.set_save_image_stage(Some(recorder.clone()));
        pipeline.on_frame(&numbered(0));
        pipeline.on_frame(&numbered(1));
        pipeline.set_decimation(2);
        pipeline.on_frame(&numbered(2));
        pipeline.on_frame(&numbered(3));
        pipeline.on_frame(&numbered(4));
        assert_eq!(*recorder.seen.lock(), vec![0, 1, 2, 4]);
    }

    #[test]
    fn failing_save_stage_is_detached_and_stream_continues() {
        let pipeline = Pipeline::new(1);
        let recorder = Arc::new(Recorder::default());
        recorder.fail.store(true, Ordering::SeqCst);
        pipeline.set_save_image_stage(Some(recorder.clone()));

        pipeline.on_frame(&numbered(0));
        assert!(pipeline.stages().save_image.is_none());
        pipeline.on_frame(&numbered(1));

        let stats = pipeline.stats();
        assert_eq!(stats.frames_received, 2);
        assert_eq!(stats.stage_failures, 1);
        assert_eq!(pipeline.live_view().latest().unwrap().get(0, 0), Some(1));
    }

    #[test]
    fn replacement_stage_survives_stale_failure() {
        let pipeline = Pipeline::new(1);
        let failing: FrameStage = Arc::new(Recorder::default());
        let replacement: FrameStage = Arc::new(Recorder::default());
        pipeline.set_save_image_stage(Some(replacement.clone()));
        pipeline.detach_failed("save_image", |set| take_if_same(&mut set.save_image, &failing));
        let current = pipeline.stages().save_image.clone().unwrap();
        assert!(Arc::ptr_eq(&current, &replacement));
    }

    #[test]
    fn live_view_keeps_latest_frame_and_resizes() {
        let pipeline = Pipeline::new(1);
        let view = pipeline.live_view();
        assert!(view.latest().is_none());
        pipeline.on_frame(&numbered(7));
        pipeline.on_frame(&numbered(8));
        assert_eq!(view.latest().unwrap().get(1, 1), Some(8));
        assert_eq!(view.updates(), 2);

        view.resize(10, 4);
        assert_eq!(view.size(), Some((10, 4)));
        assert_eq!(view.latest().unwrap().mean(), 0.0);
    }

    #[test]
    fn stage_attached_mid_stream_saves_its_first_frame() {
        let pipeline = Pipeline::new(5);
        pipeline.on_frame(&numbered(0));
        let recorder = Arc::new(Recorder::default());
        pipeline.set_save_image_stage(Some(recorder.clone()));
        for n in 1..=6 {
            pipeline.on_frame(&numbered(n));
        }
        assert_eq!(*recorder.seen.lock(), vec![1, 6]);
        assert_eq!(pipeline.stats().frames_saved, 2);
    }

    #[test]
    fn unrelated_reconfiguration_keeps_decimation_phase() {
        let pipeline = Pipeline::new(3);
        let recorder = Arc::new(Recorder::default());
        pipeline.set_save_image_stage(Some(recorder.clone()));
        pipeline.on_frame(&numbered(0));
        pipeline.on_frame(&numbered(1));
        pipeline.set_track_stage(None);
        for n in 2..=6 {
            pipeline.on_frame(&numbered(n));
        }
        assert_eq!(*recorder.seen.lock(), vec![0, 3, 6]);
    }

    #[test]
    fn resized_live_view_holds_no_frame_until_next_publish() {
        let pipeline = Pipeline::new(1);
        let view = pipeline.live_view();
        assert!(!view.has_frame());
        pipeline.on_frame(&numbered(3));
        assert!(view.has_frame());
        view.resize(4, 4);
        assert!(!view.has_frame());
        pipeline.on_frame(&Frame::from_u16(4, 4, vec![5; 16]));
        assert!(view.has_frame());
    }

    #[test]
    fn reset_restarts_decimation_phase() {
        let pipeline = Pipeline::new(2);
        let recorder = Arc::new(Recorder::default());
        pipeline.set_save_image_stage(Some(recorder.clone()));
        pipeline.on_frame(&numbered(0));
        pipeline.on_frame(&numbered(1));
        pipeline.on_frame(&numbered(2));
        pipeline.reset_counters();
        pipeline.on_frame(&numbered(3));
        assert_eq!(*recorder.seen.lock(), vec![0, 2, 3]);
    }
}
