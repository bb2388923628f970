//! Concrete pipeline stages.
//!
//! Save stages bind one [`StructuredStore`] to one [`AcquisitionSession`];
//! every record they append lands in that session until the stage is
//! detached. The track stage drives a [`Tracker`] over the shared
//! [`TrackState`].

use super::ProcessingStage;
use crate::data::{Frame, SampleBlock, TriggerEvent};
use crate::error::AppResult;
use crate::storage::{AcquisitionSession, StructuredStore};
use crate::tracking::{TrackState, TrackedPoint, Tracker};
use std::sync::Arc;

/// Appends frames to a session.
pub struct SaveImageStage {
    store: StructuredStore,
    session: AcquisitionSession,
}

impl SaveImageStage {
    /// Stage writing into `session` of `store`.
    pub fn new(store: StructuredStore, session: AcquisitionSession) -> Self {
        Self { store, session }
    }
}

impl ProcessingStage<Frame> for SaveImageStage {
    fn name(&self) -> &str {
        "save_image"
    }

    fn process(&self, frame: &Frame) -> AppResult<()> {
        self.store.append_image(&self.session, frame).map(|_| ())
    }
}

/// Appends trigger timestamps to a session.
pub struct SaveTriggerStage {
    store: StructuredStore,
    session: AcquisitionSession,
}

impl SaveTriggerStage {
    /// Stage writing into `session` of `store`.
    pub fn new(store: StructuredStore, session: AcquisitionSession) -> Self {
        Self { store, session }
    }
}

impl ProcessingStage<TriggerEvent> for SaveTriggerStage {
    fn name(&self) -> &str {
        "save_trigger"
    }

    fn process(&self, event: &TriggerEvent) -> AppResult<()> {
        self.store.append_trigger(&self.session, event).map(|_| ())
    }
}

/// Appends analog sample blocks to a session.
pub struct SaveSamplesStage {
    store: StructuredStore,
    session: AcquisitionSession,
}

impl SaveSamplesStage {
    /// Stage writing into `session` of `store`.
    pub fn new(store: StructuredStore, session: AcquisitionSession) -> Self {
        Self { store, session }
    }
}

impl ProcessingStage<SampleBlock> for SaveSamplesStage {
    fn name(&self) -> &str {
        "save_samples"
    }

    fn process(&self, block: &SampleBlock) -> AppResult<()> {
        self.store.append_samples(&self.session, block)
    }
}

/// Appends tracked-point snapshots to a session.
pub struct SaveTracksStage {
    store: StructuredStore,
    session: AcquisitionSession,
}

impl SaveTracksStage {
    /// Stage writing into `session` of `store`.
    pub fn new(store: StructuredStore, session: AcquisitionSession) -> Self {
        Self { store, session }
    }
}

impl ProcessingStage<[TrackedPoint]> for SaveTracksStage {
    fn name(&self) -> &str {
        "save_tracks"
    }

    fn process(&self, points: &[TrackedPoint]) -> AppResult<()> {
        self.store.append_tracks(&self.session, points).map(|_| ())
    }
}

/// Relocates the shared tracked points on every frame.
///
/// Yields the updated points, or `None` while no point is monitored.
pub struct TrackStage {
    tracker: Arc<dyn Tracker>,
    state: TrackState,
}

impl TrackStage {
    /// Stage running `tracker` over `state`.
    pub fn new(tracker: Arc<dyn Tracker>, state: TrackState) -> Self {
        Self { tracker, state }
    }
}

impl ProcessingStage<Frame, Option<Vec<TrackedPoint>>> for TrackStage {
    fn name(&self) -> &str {
        self.tracker.name()
    }

    fn process(&self, frame: &Frame) -> AppResult<Option<Vec<TrackedPoint>>> {
        Ok(self
            .state
            .update_with(|points| self.tracker.update(frame, points)))
    }
}
