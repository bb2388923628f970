//! Read-back of structured stores.
//!
//! The reader summarizes every session once at open time and decodes record
//! streams on demand. A stream cut short by a crash is read up to its last
//! complete batch, so stores from an interrupted run stay readable. Reading
//! does not take the writer lock; a store can be inspected while a writer
//! appends to it.

use super::format::{self, SessionFooter, SessionHeader, StreamKind};
use crate::data::{Frame, SampleBlock, TriggerEvent};
use crate::error::{AppResult, DaqError};
use crate::tracking::TrackedPoint;
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Per-session overview of a store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    /// Session id
    pub id: String,
    /// Metadata attached at open time
    pub metadata: serde_json::Value,
    /// Wall-clock open time
    pub opened_at: DateTime<Utc>,
    /// Number of image records
    pub images: u64,
    /// Number of trigger records
    pub triggers: u64,
    /// Number of tracked-point snapshots
    pub tracks: u64,
    /// Number of sample blocks
    pub samples: u64,
    /// Whether the session carries a clean-termination marker
    pub finished: bool,
    /// Wall-clock finish time, if finished
    pub finished_at: Option<DateTime<Utc>>,
}

/// Read-only view of a store.
pub struct StoreReader {
    root: PathBuf,
    sessions: Vec<SessionSummary>,
    truncated: bool,
}

impl StoreReader {
    /// Open a store and summarize its sessions.
    pub fn open<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let root = path.as_ref().to_path_buf();
        if !fs::metadata(&root)?.is_dir() {
            return Err(DaqError::CorruptStore(format!(
                "{} is not a store directory",
                root.display()
            )));
        }
        format::check_marker(&root)?;

        let mut truncated = false;
        let mut sessions = Vec::new();
        for id in format::session_dirs(&root)? {
            let dir = root.join(&id);
            let Some(header) = format::read_json::<SessionHeader>(&dir.join(format::SESSION_FILE))?
            else {
                // Directory created, header never written
                warn!(session = %id, "Session without header, skipping");
                truncated = true;
                continue;
            };
            let footer = format::read_json::<SessionFooter>(&dir.join(format::FINISHED_FILE))?;

            let mut counts = [0u64; 4];
            for (count, kind) in counts.iter_mut().zip(StreamKind::ALL) {
                // Only the first column is decoded for counting
                let contents = format::read_stream(&dir.join(kind.file_name()), Some(vec![0]))?;
                truncated |= contents.truncated;
                *count = contents.rows();
            }
            let [images, triggers, tracks, samples] = counts;

            sessions.push(SessionSummary {
                id: header.id,
                metadata: header.metadata,
                opened_at: header.opened_at,
                images,
                triggers,
                tracks,
                samples,
                finished: footer.is_some(),
                finished_at: footer.map(|f| f.finished_at),
            });
        }

        debug!(path = %root.display(), sessions = sessions.len(), truncated, "Store indexed");
        Ok(Self {
            root,
            sessions,
            truncated,
        })
    }

    /// Summaries of all sessions in id order.
    pub fn sessions(&self) -> &[SessionSummary] {
        &self.sessions
    }

    /// Summary of one session.
    pub fn session(&self, id: &str) -> Option<&SessionSummary> {
        self.sessions.iter().find(|s| s.id == id)
    }

    /// Whether any session ends in an incomplete record.
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// Images of a session with their indices, in write order.
    pub fn read_images(&self, session: &str) -> AppResult<Vec<(u64, Frame)>> {
        self.collect(session, StreamKind::Images, format::decode_images)
    }

    /// Trigger events of a session as reported by the signal source.
    pub fn read_triggers(&self, session: &str) -> AppResult<Vec<TriggerEvent>> {
        self.collect(session, StreamKind::Triggers, format::decode_triggers)
    }

    /// Tracked-point snapshots of a session, each tagged with its frame counter.
    pub fn read_tracks(&self, session: &str) -> AppResult<Vec<(u64, Vec<TrackedPoint>)>> {
        self.collect(session, StreamKind::Tracks, format::decode_tracks)
    }

    /// Analog sample blocks of a session.
    pub fn read_samples(&self, session: &str) -> AppResult<Vec<SampleBlock>> {
        self.collect(session, StreamKind::Samples, format::decode_samples)
    }

    fn collect<T, F>(&self, session: &str, kind: StreamKind, decode: F) -> AppResult<Vec<T>>
    where
        F: Fn(&RecordBatch) -> AppResult<Vec<T>>,
    {
        if self.session(session).is_none() {
            return Err(DaqError::InvalidState(format!("no session '{session}' in store")));
        }
        let contents = format::read_stream(&self.root.join(session).join(kind.file_name()), None)?;
        let mut records = Vec::new();
        for batch in &contents.batches {
            records.extend(decode(batch)?);
        }
        Ok(records)
    }
}
