//! Experiment configuration using Figment
//!
//! Configuration is loaded from:
//! 1. built-in defaults
//! 2. a TOML file
//! 3. environment variables (prefixed with `IMAGING_DAQ_`, sections separated by `__`)
//!
//! The core consumes the configuration read-only, except for the `camera`
//! section: a change there triggers a hardware resync in the controller.
//!
//! # Example
//! ```no_run
//! use imaging_daq::config::ExperimentConfig;
//!
//! let config = ExperimentConfig::load_from("config/rig.toml")?;
//! println!("Saving every {} frames", config.camera.save_every_nth_frame);
//! # Ok::<(), imaging_daq::error::DaqError>(())
//! ```

use crate::data::Roi;
use crate::error::{AppResult, DaqError};
use crate::tracing_init::OutputFormat;
use crate::tracking::TrackingMethod;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Extension of structured store directories.
pub const STORE_EXTENSION: &str = "acq";

/// Top-level experiment configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ExperimentConfig {
    /// Camera settings
    pub camera: CameraConfig,
    /// Persistence settings
    pub saving: SavingConfig,
    /// Tracking stage settings
    pub tracking: TrackingConfig,
    /// Logging settings
    pub logging: LoggingConfig,
}

/// Camera settings. Changing any of these resyncs the hardware.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Camera model identifier
    pub model: String,
    /// ROI horizontal start (inclusive)
    pub roi_x1: u32,
    /// ROI horizontal end (exclusive)
    pub roi_x2: u32,
    /// ROI vertical start (inclusive)
    pub roi_y1: u32,
    /// ROI vertical end (exclusive)
    pub roi_y2: u32,
    /// Exposure time, e.g. `"10ms"`
    #[serde(with = "humantime_serde")]
    pub exposure_time: Duration,
    /// Width of the ROI used by click-to-zoom
    pub zoom_width: u32,
    /// Height of the ROI used by click-to-zoom
    pub zoom_height: u32,
    /// Save-image decimation: only every Nth frame is persisted
    #[serde(rename = "save_every_Nth_frame", alias = "save_every_nth_frame")]
    pub save_every_nth_frame: u32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            model: "simulated".to_string(),
            roi_x1: 0,
            roi_x2: 2048,
            roi_y1: 0,
            roi_y2: 2048,
            exposure_time: Duration::from_millis(10),
            zoom_width: 256,
            zoom_height: 256,
            save_every_nth_frame: 1,
        }
    }
}

impl CameraConfig {
    /// Configured region of interest.
    pub fn roi(&self) -> Roi {
        Roi::new((self.roi_x1, self.roi_x2), (self.roi_y1, self.roi_y2))
    }

    /// Record an applied region of interest.
    pub fn set_roi(&mut self, roi: Roi) {
        self.roi_x1 = roi.x.0;
        self.roi_x2 = roi.x.1;
        self.roi_y1 = roi.y.0;
        self.roi_y2 = roi.y.1;
    }
}

/// Persistence settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SavingConfig {
    /// Directory holding the store
    pub directory: PathBuf,
    /// Store file name (the `.acq` extension is added when missing)
    pub filename_tracks: String,
}

impl Default for SavingConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("data"),
            filename_tracks: "output".to_string(),
        }
    }
}

impl SavingConfig {
    /// Directory the store is written to.
    ///
    /// Falls back to the nearest existing ancestor of the configured directory
    /// (or the working directory) when it does not exist.
    pub fn resolve_directory(&self) -> PathBuf {
        if self.directory.is_dir() {
            return self.directory.clone();
        }
        let fallback = self
            .directory
            .ancestors()
            .skip(1)
            .find(|p| !p.as_os_str().is_empty() && p.is_dir())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let missing = DaqError::ConfigDirectoryMissing(self.directory.clone());
        tracing::warn!(
            error = %missing,
            fallback = %fallback.display(),
            "Save directory does not exist, falling back to parent directory"
        );
        fallback
    }

    /// Full path of the store directory.
    pub fn store_path(&self) -> PathBuf {
        let mut path = self.resolve_directory().join(&self.filename_tracks);
        if path.extension().is_none() {
            path.set_extension(STORE_EXTENSION);
        }
        path
    }
}

/// Tracking stage settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    /// Which tracker the track stage runs
    pub method: TrackingMethod,
    /// Half-width of the square search window in pixels
    pub radius: u32,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            method: TrackingMethod::Peak,
            radius: 30,
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error)
    pub level: String,
    /// Output format
    pub format: OutputFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: OutputFormat::Pretty,
        }
    }
}

/// What an applied configuration update touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConfigChange {
    /// The camera section differs and the hardware must be resynced
    pub camera_changed: bool,
    /// The save-image decimation factor differs
    pub decimation_changed: bool,
}

impl ExperimentConfig {
    /// Load configuration from a TOML file and environment variables.
    ///
    /// Environment variables override the file with prefix `IMAGING_DAQ_`,
    /// e.g. `IMAGING_DAQ_CAMERA__ZOOM_WIDTH=128`.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("IMAGING_DAQ_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading or updating.
    pub fn validate(&self) -> AppResult<()> {
        let camera = &self.camera;
        if camera.save_every_nth_frame == 0 {
            return Err(DaqError::Configuration(
                "camera.save_every_Nth_frame must be at least 1".into(),
            ));
        }
        if camera.roi_x1 >= camera.roi_x2 || camera.roi_y1 >= camera.roi_y2 {
            return Err(DaqError::Configuration(format!(
                "camera ROI x=[{}, {}) y=[{}, {}) is empty",
                camera.roi_x1, camera.roi_x2, camera.roi_y1, camera.roi_y2
            )));
        }
        if camera.zoom_width == 0 || camera.zoom_height == 0 {
            return Err(DaqError::Configuration(
                "camera.zoom_width and camera.zoom_height must be positive".into(),
            ));
        }
        if self.tracking.radius == 0 {
            return Err(DaqError::Configuration(
                "tracking.radius must be positive".into(),
            ));
        }
        if self.saving.filename_tracks.is_empty() {
            return Err(DaqError::Configuration(
                "saving.filename_tracks cannot be empty".into(),
            ));
        }
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid logging.level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            )));
        }
        Ok(())
    }

    /// Apply a partial update.
    ///
    /// `patch` is a JSON object of sections. Keys given inside a section
    /// replace those keys; omitted keys keep their current values. The merged
    /// result is validated before it replaces the current configuration.
    pub fn update(&mut self, patch: serde_json::Value) -> AppResult<ConfigChange> {
        let serde_json::Value::Object(sections) = patch else {
            return Err(DaqError::Configuration(
                "configuration update must be an object of sections".into(),
            ));
        };

        let mut merged = serde_json::to_value(&*self)?;
        for (section, value) in sections {
            match (merged.get_mut(&section), value) {
                (Some(serde_json::Value::Object(current)), serde_json::Value::Object(fields)) => {
                    current.extend(fields);
                }
                (Some(slot), value) => *slot = value,
                (None, _) => {
                    return Err(DaqError::Configuration(format!(
                        "Unknown configuration section '{section}'"
                    )));
                }
            }
        }

        let updated: Self = serde_json::from_value(merged)?;
        updated.validate()?;

        let change = ConfigChange {
            camera_changed: updated.camera != self.camera,
            decimation_changed: updated.camera.save_every_nth_frame
                != self.camera.save_every_nth_frame,
        };
        *self = updated;
        Ok(change)
    }

    /// Snapshot attached to every acquisition session as metadata.
    pub fn to_metadata(&self) -> AppResult<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}
