//! # Imaging DAQ Core Library
//!
//! This crate is the acquisition core of a triggered imaging rig: a camera
//! streaming frames, a DAQ device recording trigger edges and analog samples,
//! and a structured store that correlates both streams per recording session
//! while a live view and interactive ROI control run concurrently.
//!
//! ## Crate Structure
//!
//! - **`config`**: `ExperimentConfig` sections (camera, saving, tracking,
//!   logging), loaded with figment from TOML and the environment.
//! - **`data`**: `Frame`, `Roi`, `TriggerEvent` and `SampleBlock`.
//! - **`error`**: The `DaqError` enum for centralized error handling.
//! - **`experiment`**: The `Experiment` controller, owning the stream and
//!   persistence state machines and the control surface.
//! - **`hardware`**: `FrameSource` / `SignalSource` contracts and simulated
//!   devices implementing them.
//! - **`pipeline`**: The per-frame `Pipeline` with hot-swappable stage slots,
//!   decimation and the live-view slot.
//! - **`storage`**: `StructuredStore` and `AcquisitionSession`, the
//!   append-only session-scoped store, plus `StoreReader` for read-back.
//! - **`tracking`**: The shared `TrackState` and the peak / centroid trackers.
//! - **`tracing_init`**: tracing-subscriber setup.

pub mod config;
pub mod data;
pub mod error;
pub mod experiment;
pub mod hardware;
pub mod pipeline;
pub mod storage;
pub mod tracing_init;
pub mod tracking;

pub use config::ExperimentConfig;
pub use error::{AppResult, DaqError};
pub use experiment::{Experiment, SaveState, StreamState};
