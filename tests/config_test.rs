//! Configuration loading from TOML files and environment overrides.

use imaging_daq::config::ExperimentConfig;
use imaging_daq::error::DaqError;
use imaging_daq::tracking::TrackingMethod;
use serial_test::serial;
use std::time::Duration;
use tempfile::tempdir;

const RIG_TOML: &str = r#"
[camera]
model = "prime95b"
roi_x1 = 100
roi_x2 = 612
roi_y1 = 0
roi_y2 = 256
exposure_time = "20ms"
save_every_Nth_frame = 10

[saving]
directory = "/data/beads"
filename_tracks = "session_a"

[tracking]
method = "centroid"
radius = 15

[logging]
level = "debug"
format = "json"
"#;

#[test]
#[serial]
fn test_load_from_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("rig.toml");
    std::fs::write(&path, RIG_TOML).unwrap();

    let config = ExperimentConfig::load_from(&path).unwrap();
    assert_eq!(config.camera.model, "prime95b");
    assert_eq!(config.camera.roi().width(), 512);
    assert_eq!(config.camera.exposure_time, Duration::from_millis(20));
    assert_eq!(config.camera.save_every_nth_frame, 10);
    assert_eq!(config.saving.filename_tracks, "session_a");
    assert_eq!(config.tracking.method, TrackingMethod::Centroid);
    assert_eq!(config.tracking.radius, 15);
    assert_eq!(config.logging.level, "debug");
}

#[test]
#[serial]
fn test_missing_file_uses_defaults() {
    let dir = tempdir().unwrap();
    let config = ExperimentConfig::load_from(dir.path().join("absent.toml")).unwrap();
    assert_eq!(config, ExperimentConfig::default());
}

#[test]
#[serial]
fn test_environment_overrides_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("rig.toml");
    std::fs::write(&path, RIG_TOML).unwrap();

    std::env::set_var("IMAGING_DAQ_CAMERA__ZOOM_WIDTH", "64");
    std::env::set_var("IMAGING_DAQ_TRACKING__RADIUS", "7");
    let result = ExperimentConfig::load_from(&path);
    std::env::remove_var("IMAGING_DAQ_CAMERA__ZOOM_WIDTH");
    std::env::remove_var("IMAGING_DAQ_TRACKING__RADIUS");

    let config = result.unwrap();
    assert_eq!(config.camera.zoom_width, 64);
    assert_eq!(config.tracking.radius, 7);
    assert_eq!(config.camera.model, "prime95b");
}

#[test]
#[serial]
fn test_invalid_values_are_rejected_on_load() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("bad.toml");

    std::fs::write(&path, "[camera]\nsave_every_Nth_frame = 0\n").unwrap();
    let err = ExperimentConfig::load_from(&path).unwrap_err();
    assert!(matches!(err, DaqError::Configuration(_)));
    assert!(err.to_string().contains("save_every_Nth_frame"));

    std::fs::write(&path, "[camera]\nexposure_time = \"soon\"\n").unwrap();
    let err = ExperimentConfig::load_from(&path).unwrap_err();
    assert!(matches!(err, DaqError::Config(_)));
}
