//! Session-scoped structured persistence.
//!
//! A [`StructuredStore`] is a directory holding one sub-directory per
//! recording run. Each run is an [`AcquisitionSession`] with an Arrow IPC
//! stream per record kind (images, trigger timestamps, tracked-point
//! snapshots, analog sample blocks) and a JSON metadata document with the
//! configuration snapshot given at open time. See [`format`] for the layout.
//!
//! # Single Writer
//!
//! Opening a store takes an exclusive advisory lock on its `.lock` file; a
//! second open of the same store fails with [`DaqError::StoreLocked`] until
//! the first handle is closed or dropped.
//!
//! # Ordering
//!
//! Every stream of a session has its own lock that is held across the write.
//! Records of one stream are therefore written in the order their appends
//! were serialized, while different streams (camera thread vs. DAQ thread)
//! interleave freely. Locks are always taken in [`StreamKind::ALL`] order.
//!
//! # Example
//! ```no_run
//! use imaging_daq::data::Frame;
//! use imaging_daq::storage::StructuredStore;
//!
//! # fn main() -> imaging_daq::error::AppResult<()> {
//! let store = StructuredStore::open("data/run.acq")?;
//! let session = store.start_new_acquisition(serde_json::json!({ "operator": "lab" }))?;
//! store.append_image(&session, &Frame::zeros(64, 64))?;
//! store.mark_finished(&session)?;
//! store.close()?;
//! # Ok(())
//! # }
//! ```

pub mod format;
pub mod reader;

pub use format::StreamKind;
pub use reader::{SessionSummary, StoreReader};

use crate::data::{Frame, SampleBlock, TriggerEvent};
use crate::error::{AppResult, DaqError};
use crate::tracking::TrackedPoint;
use arrow::datatypes::SchemaRef;
use arrow::error::ArrowError;
use arrow::ipc::writer::StreamWriter;
use arrow::record_batch::RecordBatch;
use format::{SessionFooter, SessionHeader, StoreMarker};
use fs2::FileExt;
use parking_lot::{Mutex, MutexGuard};
use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Prefix of generated session ids.
pub const SESSION_PREFIX: &str = "acquisition_";

/// Writer state of one record stream of a session.
struct StreamSlot {
    kind: StreamKind,
    schema: SchemaRef,
    /// Opened with the first record
    writer: Option<StreamWriter<File>>,
    /// Records written so far
    count: u64,
    /// Set after a failed write; the file may end in a partial batch
    failed: bool,
}

impl StreamSlot {
    fn new(kind: StreamKind, session: &str) -> Self {
        Self {
            kind,
            schema: kind.schema(session),
            writer: None,
            count: 0,
            failed: false,
        }
    }

    /// Write the end-of-stream marker and release the file.
    fn finish(&mut self) -> AppResult<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.finish()?;
        }
        Ok(())
    }
}

struct SessionInner {
    id: String,
    dir: PathBuf,
    writer: Uuid,
    images: Mutex<StreamSlot>,
    triggers: Mutex<StreamSlot>,
    tracks: Mutex<StreamSlot>,
    samples: Mutex<StreamSlot>,
    finished: AtomicBool,
}

impl SessionInner {
    fn slot(&self, kind: StreamKind) -> &Mutex<StreamSlot> {
        match kind {
            StreamKind::Images => &self.images,
            StreamKind::Triggers => &self.triggers,
            StreamKind::Tracks => &self.tracks,
            StreamKind::Samples => &self.samples,
        }
    }

    fn lock_all(&self) -> Vec<MutexGuard<'_, StreamSlot>> {
        StreamKind::ALL.iter().map(|kind| self.slot(*kind).lock()).collect()
    }
}

/// Handle to one recording run inside a [`StructuredStore`].
#[derive(Clone)]
pub struct AcquisitionSession {
    inner: Arc<SessionInner>,
}

impl AcquisitionSession {
    /// Session id, e.g. `acquisition_0003`.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Number of images appended so far; the index the next image receives.
    pub fn frame_counter(&self) -> u64 {
        self.inner.images.lock().count
    }

    /// Number of trigger timestamps appended so far.
    pub fn trigger_counter(&self) -> u64 {
        self.inner.triggers.lock().count
    }

    /// Whether [`StructuredStore::mark_finished`] was called for this session.
    pub fn is_finished(&self) -> bool {
        self.inner.finished.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for AcquisitionSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquisitionSession")
            .field("id", &self.inner.id)
            .field("finished", &self.is_finished())
            .finish()
    }
}

struct StoreInner {
    root: PathBuf,
    writer: Uuid,
    closed: AtomicBool,
    /// Holds the exclusive lock while the store is open
    lock_file: Mutex<Option<File>>,
    session_ids: Mutex<BTreeSet<String>>,
    sessions: Mutex<Vec<Weak<SessionInner>>>,
}

impl StoreInner {
    /// Finish every open stream and release the lock. Returns the first error.
    fn shutdown(&self) -> AppResult<()> {
        let mut first_error = None;
        let sessions: Vec<Arc<SessionInner>> = self
            .sessions
            .lock()
            .drain(..)
            .filter_map(|session| session.upgrade())
            .collect();
        for session in sessions {
            for mut slot in session.lock_all() {
                if let Err(err) = slot.finish() {
                    warn!(
                        session = %session.id,
                        stream = slot.kind.name(),
                        error = %err,
                        "Failed to finish stream"
                    );
                    first_error.get_or_insert(err);
                }
            }
        }
        if let Some(lock) = self.lock_file.lock().take() {
            if let Err(err) = FileExt::unlock(&lock) {
                warn!(path = %self.root.display(), error = %err, "Failed to release store lock");
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            if let Err(err) = self.shutdown() {
                warn!(path = %self.root.display(), error = %err, "Failed to close store on drop");
            }
        }
    }
}

/// Append-only structured store.
///
/// Cloning yields another handle to the same open store; stages hold clones.
#[derive(Clone)]
pub struct StructuredStore {
    inner: Arc<StoreInner>,
}

impl StructuredStore {
    /// Open a store for appending, creating it if needed.
    ///
    /// Session ids already present in an existing store are never reused.
    /// Fails with [`DaqError::StoreLocked`] while another handle has the same
    /// store open, and with [`DaqError::CorruptStore`] when `path` is a file or
    /// a non-empty directory that is not a store.
    pub fn open<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let root = path.as_ref().to_path_buf();
        if root.exists() && !root.is_dir() {
            return Err(DaqError::CorruptStore(format!(
                "{} is not a store directory",
                root.display()
            )));
        }
        fs::create_dir_all(&root)?;
        let is_new = match format::check_marker(&root) {
            Ok(_) => false,
            Err(_) if Self::is_blank(&root)? => true,
            Err(err) => return Err(err),
        };

        let lock = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(root.join(format::LOCK_FILE))?;
        if let Err(err) = FileExt::try_lock_exclusive(&lock) {
            if err.kind() == fs2::lock_contended_error().kind() {
                warn!(path = %root.display(), "Structured store is held by another writer");
                return Err(DaqError::StoreLocked(root));
            }
            return Err(err.into());
        }

        if is_new {
            format::write_json_atomic(&root.join(format::STORE_MARKER), &StoreMarker::current())?;
        }
        let session_ids = format::session_dirs(&root)?;

        info!(
            path = %root.display(),
            existing_sessions = session_ids.len(),
            created = is_new,
            "Structured store opened"
        );
        Ok(Self {
            inner: Arc::new(StoreInner {
                root,
                writer: Uuid::new_v4(),
                closed: AtomicBool::new(false),
                lock_file: Mutex::new(Some(lock)),
                session_ids: Mutex::new(session_ids),
                sessions: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Whether `root` holds nothing but, at most, a lock file left by an
    /// earlier attempt to create the store.
    fn is_blank(root: &Path) -> AppResult<bool> {
        for entry in fs::read_dir(root)? {
            if entry?.file_name() != format::LOCK_FILE {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Path of the store directory.
    pub fn path(&self) -> &Path {
        &self.inner.root
    }

    /// Whether the store still accepts writes.
    pub fn is_open(&self) -> bool {
        !self.inner.closed.load(Ordering::Acquire)
    }

    /// Ids of every session in the store, including ones from earlier runs.
    pub fn session_ids(&self) -> Vec<String> {
        self.inner.session_ids.lock().iter().cloned().collect()
    }

    /// Create a new session named with the first unused `acquisition_NNNN` id.
    ///
    /// `metadata` (typically the configuration snapshot) is stored as the
    /// session's `session.json` document.
    pub fn start_new_acquisition(&self, metadata: serde_json::Value) -> AppResult<AcquisitionSession> {
        let mut ids = self.inner.session_ids.lock();
        self.check_open()?;
        let id = (0u32..)
            .map(|n| format!("{SESSION_PREFIX}{n:04}"))
            .find(|candidate| !ids.contains(candidate))
            .ok_or_else(|| DaqError::InvalidState("session ids exhausted".into()))?;

        let dir = self.inner.root.join(&id);
        fs::create_dir(&dir)?;
        let header = SessionHeader {
            id: id.clone(),
            metadata,
            opened_at: chrono::Utc::now(),
            writer: self.inner.writer,
        };
        format::write_json_atomic(&dir.join(format::SESSION_FILE), &header)?;
        ids.insert(id.clone());

        let inner = Arc::new(SessionInner {
            images: Mutex::new(StreamSlot::new(StreamKind::Images, &id)),
            triggers: Mutex::new(StreamSlot::new(StreamKind::Triggers, &id)),
            tracks: Mutex::new(StreamSlot::new(StreamKind::Tracks, &id)),
            samples: Mutex::new(StreamSlot::new(StreamKind::Samples, &id)),
            id,
            dir,
            writer: self.inner.writer,
            finished: AtomicBool::new(false),
        });
        {
            let mut sessions = self.inner.sessions.lock();
            sessions.retain(|session| session.strong_count() > 0);
            sessions.push(Arc::downgrade(&inner));
        }

        info!(session = %inner.id, "Acquisition session started");
        Ok(AcquisitionSession { inner })
    }

    /// Append one image; returns the index it was stored under.
    pub fn append_image(&self, session: &AcquisitionSession, frame: &Frame) -> AppResult<u64> {
        self.check_owner(session)?;
        let mut slot = session.inner.images.lock();
        let index = slot.count;
        let batch = format::image_batch(&slot.schema, index, frame)?;
        self.write(session, &mut slot, &batch)?;
        Ok(index)
    }

    /// Append one trigger timestamp; returns its index within the session.
    pub fn append_trigger(&self, session: &AcquisitionSession, event: &TriggerEvent) -> AppResult<u64> {
        self.check_owner(session)?;
        let mut slot = session.inner.triggers.lock();
        let index = slot.count;
        let batch = format::trigger_batch(&slot.schema, index, event)?;
        self.write(session, &mut slot, &batch)?;
        Ok(index)
    }

    /// Append a snapshot of tracked points, tagged with the session's current
    /// frame counter. Returns the tag.
    pub fn append_tracks(&self, session: &AcquisitionSession, points: &[TrackedPoint]) -> AppResult<u64> {
        self.check_owner(session)?;
        let images = session.inner.images.lock();
        let mut slot = session.inner.tracks.lock();
        let batch = format::tracks_batch(&slot.schema, images.count, points)?;
        self.write(session, &mut slot, &batch)?;
        Ok(images.count)
    }

    /// Append a block of analog samples.
    pub fn append_samples(&self, session: &AcquisitionSession, block: &SampleBlock) -> AppResult<()> {
        self.check_owner(session)?;
        let mut slot = session.inner.samples.lock();
        let batch = format::samples_batch(&slot.schema, block)?;
        self.write(session, &mut slot, &batch)
    }

    /// Close the session's streams and write its clean-termination marker;
    /// the session accepts no further records. Calling it again for the same
    /// session is a no-op.
    pub fn mark_finished(&self, session: &AcquisitionSession) -> AppResult<()> {
        self.check_owner(session)?;
        let mut slots = session.inner.lock_all();
        if session.is_finished() {
            return Ok(());
        }
        self.check_open()?;
        for slot in slots.iter_mut() {
            slot.finish()?;
        }
        let count = |kind: StreamKind| slots.iter().find(|s| s.kind == kind).map_or(0, |s| s.count);
        let footer = SessionFooter {
            finished_at: chrono::Utc::now(),
            frames: count(StreamKind::Images),
            triggers: count(StreamKind::Triggers),
        };
        format::write_json_atomic(&session.inner.dir.join(format::FINISHED_FILE), &footer)?;
        session.inner.finished.store(true, Ordering::Release);
        info!(
            session = %session.inner.id,
            frames = footer.frames,
            triggers = footer.triggers,
            "Acquisition session finished"
        );
        Ok(())
    }

    /// Persist a single frame as its own finished session; returns its id.
    pub fn save_snapshot(&self, frame: &Frame, metadata: serde_json::Value) -> AppResult<String> {
        let session = self.start_new_acquisition(metadata)?;
        self.append_image(&session, frame)?;
        self.mark_finished(&session)?;
        Ok(session.inner.id.clone())
    }

    /// Finish all open streams and release the single-writer lock. Closing a
    /// closed store is a no-op.
    pub fn close(&self) -> AppResult<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            debug!(path = %self.inner.root.display(), "Store already closed");
            return Ok(());
        }
        let result = self.inner.shutdown();
        info!(path = %self.inner.root.display(), "Structured store closed");
        result
    }

    fn check_open(&self) -> AppResult<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(DaqError::StoreClosed);
        }
        Ok(())
    }

    fn check_owner(&self, session: &AcquisitionSession) -> AppResult<()> {
        if session.inner.writer != self.inner.writer {
            return Err(DaqError::InvalidState(format!(
                "session '{}' belongs to a different store",
                session.inner.id
            )));
        }
        Ok(())
    }

    /// Write one batch to `slot`, opening its stream file on first use.
    ///
    /// Runs under the slot lock, so the open and finished checks cannot race
    /// with `close` or `mark_finished`.
    fn write(
        &self,
        session: &AcquisitionSession,
        slot: &mut StreamSlot,
        batch: &RecordBatch,
    ) -> AppResult<()> {
        self.check_open()?;
        if session.is_finished() {
            return Err(DaqError::SessionFinished(session.inner.id.clone()));
        }
        if slot.failed {
            return Err(DaqError::InvalidState(format!(
                "{} stream of session '{}' failed earlier",
                slot.kind.name(),
                session.inner.id
            )));
        }

        let result = if let Some(writer) = slot.writer.as_mut() {
            writer.write(batch)
        } else {
            Self::open_stream(&session.inner.dir, slot, batch)
        };
        if let Err(err) = result {
            slot.failed = true;
            slot.writer = None;
            warn!(
                session = %session.inner.id,
                stream = slot.kind.name(),
                error = %err,
                "Stream write failed, stream disabled"
            );
            return Err(err.into());
        }
        slot.count += 1;
        Ok(())
    }

    /// Create the stream file of `slot` and write its first batch.
    fn open_stream(dir: &Path, slot: &mut StreamSlot, batch: &RecordBatch) -> Result<(), ArrowError> {
        let file = File::create(dir.join(slot.kind.file_name()))?;
        let mut writer = StreamWriter::try_new(file, &slot.schema)?;
        writer.write(batch)?;
        slot.writer = Some(writer);
        Ok(())
    }
}
