//! Custom error types for the acquisition core.
//!
//! This module defines the primary error type, `DaqError`, shared by the pipeline,
//! the persistence layer and the experiment controller. Using the `thiserror` crate,
//! it provides one consistent taxonomy for everything that can go wrong between the
//! camera/DAQ callbacks and the structured store.
//!
//! ## Error Hierarchy
//!
//! - **`HardwareFault`**: a source failed to start, stop or accept a setting. Fatal to
//!   the current stream attempt; the controller stays in its last known safe state.
//! - **`InvalidRoi`**: a geometry request outside the sensor. Rejected before any
//!   hardware is touched.
//! - **`StoreClosed`** / **`SessionFinished`**: an operation on a store or session that
//!   no longer accepts records.
//! - **`StoreLocked`**: another writer holds the store. Only one process (or handle)
//!   may append to a store at a time.
//! - **`StoreIo`** / **`Arrow`**: a write failed mid-session. Surfaced to the save stage, which
//!   disables itself while acquisition continues unsaved.
//! - **`ConfigDirectoryMissing`**: the configured save directory is absent. Recovered
//!   by falling back to the nearest existing parent, logged as a warning.
//!
//! Device drivers report failures with `anyhow::Error`; the controller maps those into
//! `HardwareFault` at the control boundary.

use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias for results using the acquisition error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Primary error type for the acquisition core.
#[derive(Error, Debug)]
pub enum DaqError {
    /// A frame or signal source failed to start, stop or configure.
    #[error("Hardware fault: {0}")]
    HardwareFault(String),

    /// Requested region of interest falls outside the sensor.
    #[error("Invalid ROI x={x:?} y={y:?} for sensor {sensor_width}x{sensor_height}")]
    InvalidRoi {
        /// Requested horizontal range `[start, end)`.
        x: (u32, u32),
        /// Requested vertical range `[start, end)`.
        y: (u32, u32),
        /// Native sensor width in pixels.
        sensor_width: u32,
        /// Native sensor height in pixels.
        sensor_height: u32,
    },

    /// The structured store is closed or was never opened.
    #[error("Structured store is closed")]
    StoreClosed,

    /// Another handle holds the store's single-writer lock.
    #[error("Structured store {0} is locked by another writer")]
    StoreLocked(PathBuf),

    /// Writing to or reading from the structured store failed.
    #[error("Store I/O error: {0}")]
    StoreIo(#[from] std::io::Error),

    /// Encoding or decoding an Arrow IPC record batch failed.
    #[error("Arrow IPC error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    /// The session was already marked finished and accepts no more records.
    #[error("Acquisition session '{0}' is already finished")]
    SessionFinished(String),

    /// The store does not follow the expected session layout.
    #[error("Corrupt store: {0}")]
    CorruptStore(String),

    /// The configured save directory does not exist.
    #[error("Save directory {0} does not exist")]
    ConfigDirectoryMissing(PathBuf),

    /// Configuration file or environment could not be extracted.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration values parsed but are semantically invalid.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Record metadata could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Operation is not valid in the current controller state.
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl DaqError {
    /// Whether acquisition can continue after this error.
    ///
    /// Store write failures and rejected requests leave the stream running;
    /// hardware faults and a corrupt store require operator attention.
    pub fn is_recoverable(&self) -> bool {
        match self {
            DaqError::InvalidRoi { .. }
            | DaqError::StoreIo(_)
            | DaqError::Arrow(_)
            | DaqError::StoreClosed
            | DaqError::SessionFinished(_)
            | DaqError::ConfigDirectoryMissing(_)
            | DaqError::Configuration(_)
            | DaqError::InvalidState(_) => true,
            DaqError::HardwareFault(_)
            | DaqError::StoreLocked(_)
            | DaqError::CorruptStore(_)
            | DaqError::Config(_)
            | DaqError::Serialization(_) => false,
        }
    }

    /// Wraps a driver error as a hardware fault with the failing operation as context.
    pub fn hardware(operation: &str, err: anyhow::Error) -> Self {
        DaqError::HardwareFault(format!("{operation}: {err:#}"))
    }
}

impl From<figment::Error> for DaqError {
    fn from(value: figment::Error) -> Self {
        DaqError::Config(Box::new(value))
    }
}
