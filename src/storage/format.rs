//! On-disk layout of a structured store.
//!
//! A store is a directory. Every acquisition session is a sub-directory
//! holding one Arrow IPC stream per record kind plus small JSON documents
//! for the session attributes:
//!
//! ```text
//! run.acq/
//!   store.json                 format marker
//!   .lock                      single-writer advisory lock
//!   acquisition_0000/
//!     session.json             metadata snapshot, open time, writer id
//!     images.arrows            index, width, height, pixels: large_list<u16>
//!     triggers.arrows          index, source_index, timestamp_s
//!     tracks.arrows            frame_index, x, y, intensity: list<f64>
//!     samples.arrows           first_index, channels, values: list<f64>
//!     finished.json            clean-termination marker
//! ```
//!
//! Each appended record is one record batch. A stream file is created with
//! its first record, so an absent file means "no records of that kind".
//! Streams use the IPC *stream* format: a session cut short by a crash is
//! readable up to its last complete batch.

use super::SESSION_PREFIX;
use crate::data::{Frame, SampleBlock, TriggerEvent};
use crate::error::{AppResult, DaqError};
use crate::tracking::TrackedPoint;
use arrow::array::{
    ArrayRef, AsArray, Float64Array, Float64Builder, LargeListBuilder, ListBuilder,
    PrimitiveArray, UInt16Array, UInt16Builder, UInt32Array, UInt64Array,
};
use arrow::datatypes::{
    ArrowPrimitiveType, DataType, Field, Float64Type, Schema, SchemaRef, UInt16Type, UInt32Type,
    UInt64Type,
};
use arrow::ipc::reader::StreamReader;
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fs::{self, File};
use std::io::{self, BufReader, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

/// Format name recorded in the store marker and in every stream schema
pub const FORMAT_NAME: &str = "imaging-daq/arrow-ipc";

/// Current layout version
pub const FORMAT_VERSION: u16 = 1;

/// Store marker file
pub const STORE_MARKER: &str = "store.json";

/// Advisory lock file held by the writing store
pub const LOCK_FILE: &str = ".lock";

/// Session attribute document
pub const SESSION_FILE: &str = "session.json";

/// Clean-termination marker of a session
pub const FINISHED_FILE: &str = "finished.json";

/// Contents of `store.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreMarker {
    /// Always [`FORMAT_NAME`]
    pub format: String,
    /// Layout version
    pub version: u16,
    /// When the store was created
    pub created_at: DateTime<Utc>,
}

impl StoreMarker {
    /// Marker for a store created now.
    pub fn current() -> Self {
        Self {
            format: FORMAT_NAME.to_string(),
            version: FORMAT_VERSION,
            created_at: Utc::now(),
        }
    }
}

/// Contents of `session.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionHeader {
    /// Session id, unique within the store
    pub id: String,
    /// Configuration snapshot attached at open time
    pub metadata: serde_json::Value,
    /// Wall-clock open time
    pub opened_at: DateTime<Utc>,
    /// Identifies the store handle that wrote the session
    pub writer: Uuid,
}

/// Contents of `finished.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionFooter {
    /// Wall-clock finish time
    pub finished_at: DateTime<Utc>,
    /// Images written
    pub frames: u64,
    /// Trigger timestamps written
    pub triggers: u64,
}

/// The record kinds of a session, one Arrow stream each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Decimated camera frames
    Images,
    /// Trigger edges from the signal source
    Triggers,
    /// Tracked-point snapshots
    Tracks,
    /// Analog sample blocks
    Samples,
}

impl StreamKind {
    /// All kinds, in lock order.
    pub const ALL: [StreamKind; 4] = [
        StreamKind::Images,
        StreamKind::Triggers,
        StreamKind::Tracks,
        StreamKind::Samples,
    ];

    /// Short name used in logs and schema metadata.
    pub fn name(self) -> &'static str {
        match self {
            StreamKind::Images => "images",
            StreamKind::Triggers => "triggers",
            StreamKind::Tracks => "tracks",
            StreamKind::Samples => "samples",
        }
    }

    /// File of this stream inside a session directory.
    pub fn file_name(self) -> String {
        format!("{}.arrows", self.name())
    }

    /// Arrow schema of this stream for `session`.
    pub fn schema(self, session: &str) -> SchemaRef {
        let fields = match self {
            StreamKind::Images => vec![
                Field::new("index", DataType::UInt64, false),
                Field::new("width", DataType::UInt32, false),
                Field::new("height", DataType::UInt32, false),
                Field::new(
                    "pixels",
                    DataType::LargeList(Arc::new(item_field(DataType::UInt16))),
                    false,
                ),
            ],
            StreamKind::Triggers => vec![
                Field::new("index", DataType::UInt64, false),
                Field::new("source_index", DataType::UInt64, false),
                Field::new("timestamp_s", DataType::Float64, false),
            ],
            StreamKind::Tracks => vec![
                Field::new("frame_index", DataType::UInt64, false),
                Field::new("x", f64_list_type(), false),
                Field::new("y", f64_list_type(), false),
                Field::new("intensity", f64_list_type(), false),
            ],
            StreamKind::Samples => vec![
                Field::new("first_index", DataType::UInt64, false),
                Field::new("channels", DataType::UInt16, false),
                Field::new("values", f64_list_type(), false),
            ],
        };
        let metadata = HashMap::from([
            ("format".to_string(), FORMAT_NAME.to_string()),
            ("stream".to_string(), self.name().to_string()),
            ("session".to_string(), session.to_string()),
        ]);
        Arc::new(Schema::new(fields).with_metadata(metadata))
    }
}

/// Child field of list columns, matching what the list builders produce.
fn item_field(data_type: DataType) -> Field {
    Field::new("item", data_type, true)
}

fn f64_list_type() -> DataType {
    DataType::List(Arc::new(item_field(DataType::Float64)))
}

fn f64_list(values: &[f64]) -> ArrayRef {
    let mut builder = ListBuilder::new(Float64Builder::with_capacity(values.len()));
    builder.values().append_slice(values);
    builder.append(true);
    Arc::new(builder.finish())
}

// =============================================================================
// Encoding
// =============================================================================

/// One image as a single-row batch.
pub fn image_batch(schema: &SchemaRef, index: u64, frame: &Frame) -> AppResult<RecordBatch> {
    let mut pixels = LargeListBuilder::new(UInt16Builder::with_capacity(frame.pixels().len()));
    pixels.values().append_slice(frame.pixels());
    pixels.append(true);
    Ok(RecordBatch::try_new(
        Arc::clone(schema),
        vec![
            Arc::new(UInt64Array::from(vec![index])),
            Arc::new(UInt32Array::from(vec![frame.width])),
            Arc::new(UInt32Array::from(vec![frame.height])),
            Arc::new(pixels.finish()),
        ],
    )?)
}

/// One trigger as a single-row batch.
pub fn trigger_batch(schema: &SchemaRef, index: u64, event: &TriggerEvent) -> AppResult<RecordBatch> {
    Ok(RecordBatch::try_new(
        Arc::clone(schema),
        vec![
            Arc::new(UInt64Array::from(vec![index])),
            Arc::new(UInt64Array::from(vec![event.index])),
            Arc::new(Float64Array::from(vec![event.timestamp_s])),
        ],
    )?)
}

/// One tracked-point snapshot as a single-row batch.
pub fn tracks_batch(
    schema: &SchemaRef,
    frame_index: u64,
    points: &[TrackedPoint],
) -> AppResult<RecordBatch> {
    let xs: Vec<f64> = points.iter().map(|p| p.x).collect();
    let ys: Vec<f64> = points.iter().map(|p| p.y).collect();
    let intensities: Vec<f64> = points.iter().map(|p| p.intensity).collect();
    Ok(RecordBatch::try_new(
        Arc::clone(schema),
        vec![
            Arc::new(UInt64Array::from(vec![frame_index])),
            f64_list(&xs),
            f64_list(&ys),
            f64_list(&intensities),
        ],
    )?)
}

/// One sample block as a single-row batch.
pub fn samples_batch(schema: &SchemaRef, block: &SampleBlock) -> AppResult<RecordBatch> {
    Ok(RecordBatch::try_new(
        Arc::clone(schema),
        vec![
            Arc::new(UInt64Array::from(vec![block.first_index])),
            Arc::new(UInt16Array::from(vec![block.channels])),
            f64_list(&block.values),
        ],
    )?)
}

// =============================================================================
// Decoding
// =============================================================================

fn corrupt(what: impl Into<String>) -> DaqError {
    DaqError::CorruptStore(what.into())
}

fn primitive<'a, T: ArrowPrimitiveType>(
    batch: &'a RecordBatch,
    name: &str,
) -> AppResult<&'a PrimitiveArray<T>> {
    batch
        .column_by_name(name)
        .and_then(|column| column.as_primitive_opt::<T>())
        .ok_or_else(|| corrupt(format!("missing or mistyped column '{name}'")))
}

/// Values of row `row` of the `list<f64>` column `name`.
fn f64_row(batch: &RecordBatch, name: &str, row: usize) -> AppResult<Vec<f64>> {
    let list = batch
        .column_by_name(name)
        .and_then(|column| column.as_list_opt::<i32>())
        .ok_or_else(|| corrupt(format!("missing or mistyped column '{name}'")))?;
    let values = list.value(row);
    values
        .as_primitive_opt::<Float64Type>()
        .map(|values| values.values().to_vec())
        .ok_or_else(|| corrupt(format!("column '{name}' does not hold f64 values")))
}

/// Images of a batch with their indices.
pub fn decode_images(batch: &RecordBatch) -> AppResult<Vec<(u64, Frame)>> {
    let index = primitive::<UInt64Type>(batch, "index")?;
    let width = primitive::<UInt32Type>(batch, "width")?;
    let height = primitive::<UInt32Type>(batch, "height")?;
    let pixels = batch
        .column_by_name("pixels")
        .and_then(|column| column.as_list_opt::<i64>())
        .ok_or_else(|| corrupt("missing or mistyped column 'pixels'"))?;

    (0..batch.num_rows())
        .map(|row| {
            let (index, width, height) = (index.value(row), width.value(row), height.value(row));
            let values = pixels.value(row);
            let values = values
                .as_primitive_opt::<UInt16Type>()
                .ok_or_else(|| corrupt("column 'pixels' does not hold u16 values"))?;
            Frame::try_from_pixels(width, height, values.values().to_vec())
                .map(|frame| (index, frame))
                .ok_or_else(|| {
                    corrupt(format!(
                        "image {index} holds {} pixels, expected {width}x{height}",
                        values.values().len()
                    ))
                })
        })
        .collect()
}

/// Trigger events of a batch, as reported by the signal source.
pub fn decode_triggers(batch: &RecordBatch) -> AppResult<Vec<TriggerEvent>> {
    let source_index = primitive::<UInt64Type>(batch, "source_index")?;
    let timestamp = primitive::<Float64Type>(batch, "timestamp_s")?;
    Ok((0..batch.num_rows())
        .map(|row| TriggerEvent {
            index: source_index.value(row),
            timestamp_s: timestamp.value(row),
        })
        .collect())
}

/// Tracked-point snapshots of a batch, each tagged with its frame counter.
pub fn decode_tracks(batch: &RecordBatch) -> AppResult<Vec<(u64, Vec<TrackedPoint>)>> {
    let frame_index = primitive::<UInt64Type>(batch, "frame_index")?;
    (0..batch.num_rows())
        .map(|row| {
            let xs = f64_row(batch, "x", row)?;
            let ys = f64_row(batch, "y", row)?;
            let intensities = f64_row(batch, "intensity", row)?;
            if xs.len() != ys.len() || xs.len() != intensities.len() {
                return Err(corrupt(format!(
                    "tracks at frame {} have ragged coordinate lists",
                    frame_index.value(row)
                )));
            }
            let points = xs
                .into_iter()
                .zip(ys)
                .zip(intensities)
                .map(|((x, y), intensity)| TrackedPoint { x, y, intensity })
                .collect();
            Ok((frame_index.value(row), points))
        })
        .collect()
}

/// Sample blocks of a batch.
pub fn decode_samples(batch: &RecordBatch) -> AppResult<Vec<SampleBlock>> {
    let first_index = primitive::<UInt64Type>(batch, "first_index")?;
    let channels = primitive::<UInt16Type>(batch, "channels")?;
    (0..batch.num_rows())
        .map(|row| {
            Ok(SampleBlock {
                first_index: first_index.value(row),
                channels: channels.value(row),
                values: f64_row(batch, "values", row)?,
            })
        })
        .collect()
}

// =============================================================================
// Files
// =============================================================================

/// Complete batches of a stream file.
#[derive(Debug, Default)]
pub struct StreamContents {
    /// Batches up to the first incomplete one
    pub batches: Vec<RecordBatch>,
    /// Whether the file ends in an incomplete batch
    pub truncated: bool,
}

impl StreamContents {
    /// Total rows over all batches.
    pub fn rows(&self) -> u64 {
        self.batches.iter().map(|b| b.num_rows() as u64).sum()
    }
}

/// Read a stream file. A missing file is an empty stream; reading stops at
/// the first batch that cannot be decoded.
///
/// `projection` limits decoding to the given column indices.
pub fn read_stream(path: &Path, projection: Option<Vec<usize>>) -> AppResult<StreamContents> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(StreamContents::default()),
        Err(err) => return Err(err.into()),
    };
    let reader = match StreamReader::try_new(BufReader::new(file), projection) {
        Ok(reader) => reader,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "Stream has no readable schema");
            return Ok(StreamContents {
                batches: Vec::new(),
                truncated: true,
            });
        }
    };

    let mut contents = StreamContents::default();
    for batch in reader {
        match batch {
            Ok(batch) => contents.batches.push(batch),
            Err(err) => {
                warn!(
                    path = %path.display(),
                    complete_batches = contents.batches.len(),
                    error = %err,
                    "Stream ends in an incomplete record"
                );
                contents.truncated = true;
                break;
            }
        }
    }
    Ok(contents)
}

/// Ids of all session directories under `root`, in id order.
pub fn session_dirs(root: &Path) -> AppResult<BTreeSet<String>> {
    let mut ids = BTreeSet::new();
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if name.starts_with(SESSION_PREFIX) {
                ids.insert(name.to_string());
            }
        }
    }
    Ok(ids)
}

/// Write `value` as JSON so that readers see either nothing or the whole document.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> AppResult<()> {
    let tmp = path.with_extension("json.tmp");
    let mut file = File::create(&tmp)?;
    file.write_all(&serde_json::to_vec_pretty(value)?)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Read a JSON document; `None` when the file does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> AppResult<Option<T>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|err| corrupt(format!("{}: {err}", path.display())))
}

/// Check that `root` carries a marker this version can read.
pub fn check_marker(root: &Path) -> AppResult<StoreMarker> {
    let marker: StoreMarker = read_json(&root.join(STORE_MARKER))?
        .ok_or_else(|| corrupt(format!("{} carries no {STORE_MARKER}", root.display())))?;
    if marker.format != FORMAT_NAME {
        return Err(corrupt(format!("unknown store format '{}'", marker.format)));
    }
    if marker.version > FORMAT_VERSION {
        return Err(corrupt(format!(
            "store version {} is newer than supported version {FORMAT_VERSION}",
            marker.version
        )));
    }
    Ok(marker)
}
