//! End-to-end tests of the experiment controller against the simulated rig.

use imaging_daq::config::ExperimentConfig;
use imaging_daq::error::DaqError;
use imaging_daq::experiment::buffer_frames_for;
use imaging_daq::hardware::{FrameSource, SimulatedCamera, SimulatedDaq};
use imaging_daq::storage::StoreReader;
use imaging_daq::tracking::TrackingMethod;
use imaging_daq::{Experiment, SaveState, StreamState};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::{tempdir, TempDir};
use tracing_test::traced_test;

const WAIT: Duration = Duration::from_secs(10);

struct Rig {
    _dir: TempDir,
    store_path: PathBuf,
    camera: Arc<SimulatedCamera>,
    daq: SimulatedDaq,
    experiment: Experiment,
}

fn config_for(dir: &Path, width: u32, height: u32) -> ExperimentConfig {
    let mut config = ExperimentConfig::default();
    config.camera.roi_x2 = width;
    config.camera.roi_y2 = height;
    config.camera.exposure_time = Duration::from_millis(1);
    config.camera.zoom_width = 32;
    config.camera.zoom_height = 16;
    config.saving.directory = dir.to_path_buf();
    config.saving.filename_tracks = "run".into();
    config
}

fn rig_with(frame_limit: Option<u64>, tune: impl FnOnce(&mut ExperimentConfig)) -> Rig {
    let dir = tempdir().unwrap();
    let mut config = config_for(dir.path(), 128, 96);
    tune(&mut config);
    let daq = SimulatedDaq::new();
    let mut camera = SimulatedCamera::new(128, 96).with_trigger_line(daq.trigger_line());
    if let Some(limit) = frame_limit {
        camera = camera.with_frame_limit(limit);
    }
    let camera = Arc::new(camera);
    let experiment = Experiment::new(config, camera.clone(), Arc::new(daq.clone())).unwrap();
    Rig {
        store_path: dir.path().join("run.acq"),
        _dir: dir,
        camera,
        daq,
        experiment,
    }
}

fn rig(frame_limit: Option<u64>) -> Rig {
    rig_with(frame_limit, |_| {})
}

#[test]
fn test_initial_state_and_store_location() {
    let rig = rig(None);
    assert_eq!(rig.experiment.state(), (StreamState::Idle, SaveState::NotSaving));
    assert_eq!(rig.experiment.store().path(), rig.store_path.as_path());
    assert_eq!(rig.experiment.live_view().size(), Some((128, 96)));
    assert!(rig.experiment.current_session().is_none());
}

#[test]
fn test_roi_sets_camera_and_live_view_size() {
    let mut rig = rig(None);
    for (x, y) in [((0, 128), (0, 96)), ((10, 74), (5, 37)), ((127, 128), (95, 96))] {
        rig.experiment.set_roi(x, y).unwrap();
        let expected = (x.1 - x.0, y.1 - y.0);
        assert_eq!(rig.camera.get_size(), expected);
        assert_eq!(rig.experiment.live_view().size(), Some(expected));
        assert_eq!(rig.experiment.config().camera.roi_x1, x.0);
    }
}

#[test]
fn test_invalid_roi_is_rejected_without_state_change() {
    let mut rig = rig(None);
    rig.experiment.set_roi((0, 64), (0, 64)).unwrap();
    let err = rig.experiment.set_roi((0, 129), (0, 10)).unwrap_err();
    assert!(matches!(err, DaqError::InvalidRoi { sensor_width: 128, .. }));
    assert!(rig.experiment.set_roi((20, 20), (0, 10)).is_err());
    assert_eq!(rig.camera.get_size(), (64, 64));
    assert_eq!(rig.experiment.live_view().size(), Some((64, 64)));
}

#[test]
fn test_roi_change_while_streaming_restarts_stream() {
    let mut rig = rig(None);
    rig.experiment.start_free_run().unwrap();
    assert!(rig.camera.wait_for_frames(3, WAIT));
    rig.experiment.set_roi((0, 64), (0, 32)).unwrap();
    assert_eq!(rig.experiment.state().0, StreamState::Streaming);
    assert_eq!(rig.camera.streams_started(), 2);
    assert_eq!(rig.camera.last_buffer_frames(), buffer_frames_for(64, 32));

    let seen = rig.camera.frames_delivered();
    assert!(rig.camera.wait_for_frames(seen + 3, WAIT));
    let latest = rig.experiment.live_view().latest().unwrap();
    assert_eq!(latest.size(), (64, 32));
    rig.experiment.stop_free_run().unwrap();
}

#[test]
fn test_free_run_requests_128_mib_ring_buffer() {
    let mut rig = rig(Some(1));
    rig.experiment.start_free_run().unwrap();
    rig.experiment.stop_free_run().unwrap();
    assert_eq!(rig.camera.last_buffer_frames(), (128 * 1024 * 1024) / (128 * 96 * 2));
}

#[test]
fn test_stop_free_run_detaches_signal_callbacks() {
    let mut rig = rig(None);
    rig.experiment.start_free_run().unwrap();
    assert!(rig.camera.wait_for_frames(2, WAIT));
    rig.experiment.stop_free_run().unwrap();

    let received = rig.experiment.pipeline_stats().triggers_received;
    rig.daq.trigger_line().pulse();
    rig.daq.push_samples(1, vec![1.0]);
    let stats = rig.experiment.pipeline_stats();
    assert_eq!(stats.triggers_received, received);
    assert_eq!(stats.sample_blocks, 0);

    let delivered = rig.camera.frames_delivered();
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(rig.camera.frames_delivered(), delivered);
    assert_eq!(rig.experiment.pipeline_stats().frames_received, delivered);
}

#[test]
fn test_saved_session_holds_images_and_triggers() {
    let mut rig = rig_with(Some(12), |c| c.camera.save_every_nth_frame = 5);
    let id = rig.experiment.save_stream().unwrap();
    assert_eq!(rig.experiment.state().1, SaveState::Saving);
    rig.experiment.start_free_run().unwrap();
    assert!(rig.camera.wait_for_frames(12, WAIT));
    rig.daq.push_samples(2, vec![0.0; 20]);
    rig.experiment.stop_save_stream().unwrap();
    rig.experiment.finalize().unwrap();

    let reader = StoreReader::open(&rig.store_path).unwrap();
    let summary = reader.session(&id).unwrap();
    // Frames 0, 5 and 10 of twelve
    assert_eq!(summary.images, 3);
    assert_eq!(summary.triggers, 12);
    assert_eq!(summary.samples, 1);
    assert!(summary.finished);
    assert_eq!(summary.metadata["camera"]["save_every_Nth_frame"], 5);

    let triggers = reader.read_triggers(&id).unwrap();
    assert!(triggers.windows(2).all(|w| w[0].index < w[1].index));
}

#[test]
fn test_back_to_back_sessions_are_disjoint() {
    let mut rig = rig(None);
    rig.experiment.start_free_run().unwrap();

    let first = rig.experiment.save_stream().unwrap();
    assert!(rig.camera.wait_for_frames(rig.camera.frames_delivered() + 5, WAIT));
    rig.experiment.stop_save_stream().unwrap();
    let second = rig.experiment.save_stream().unwrap();
    assert_ne!(first, second);
    assert_eq!(rig.experiment.current_session(), Some(second.clone()));
    assert!(rig.camera.wait_for_frames(rig.camera.frames_delivered() + 5, WAIT));
    rig.experiment.stop_save_stream().unwrap();
    rig.experiment.finalize().unwrap();

    let reader = StoreReader::open(&rig.store_path).unwrap();
    for id in [&first, &second] {
        let summary = reader.session(id).unwrap();
        assert!(summary.finished);
        // The frame in flight while saving started may predate the save stages
        assert!(summary.images >= 4);
        let indices: Vec<u64> = reader.read_images(id).unwrap().into_iter().map(|(i, _)| i).collect();
        assert_eq!(indices, (0..summary.images).collect::<Vec<_>>());
    }
}

#[test]
fn test_finalize_twice_is_safe() {
    let mut rig = rig(None);
    rig.experiment.start_free_run().unwrap();
    rig.experiment.save_stream().unwrap();
    rig.experiment.finalize().unwrap();
    rig.experiment.finalize().unwrap();

    assert_eq!(rig.experiment.state(), (StreamState::Idle, SaveState::NotSaving));
    assert!(!rig.experiment.store().is_open());
    assert!(matches!(
        rig.experiment.start_free_run(),
        Err(DaqError::InvalidState(_))
    ));
    let reader = StoreReader::open(&rig.store_path).unwrap();
    assert!(reader.sessions()[0].finished);
}

#[test]
fn test_start_failure_is_a_hardware_fault_and_stays_idle() {
    let mut rig = rig(None);
    rig.camera.fail_next_start();
    let err = rig.experiment.start_free_run().unwrap_err();
    assert!(matches!(err, DaqError::HardwareFault(_)));
    assert!(!err.is_recoverable());
    assert_eq!(rig.experiment.state().0, StreamState::Idle);

    rig.experiment.start_free_run().unwrap();
    assert_eq!(rig.experiment.state().0, StreamState::Streaming);
}

#[test]
fn test_decimation_counter_resets_on_restart() {
    let mut rig = rig_with(Some(3), |c| c.camera.save_every_nth_frame = 2);
    let id = rig.experiment.save_stream().unwrap();
    for _ in 0..2 {
        let target = rig.camera.frames_delivered() + 3;
        rig.experiment.start_free_run().unwrap();
        assert!(rig.camera.wait_for_frames(target, WAIT));
        rig.experiment.stop_free_run().unwrap();
    }
    rig.experiment.stop_save_stream().unwrap();

    // Frames 0 and 2 of each three-frame stream
    assert_eq!(rig.experiment.store().session_ids(), vec![id.clone()]);
    rig.experiment.finalize().unwrap();
    let reader = StoreReader::open(&rig.store_path).unwrap();
    assert_eq!(reader.session(&id).unwrap().images, 4);
}

#[test]
fn test_update_config_changes_decimation_and_roi() {
    let mut rig = rig(None);
    let change = rig
        .experiment
        .update_config(json!({ "camera": { "save_every_Nth_frame": 3, "roi_x2": 64 } }))
        .unwrap();
    assert!(change.camera_changed && change.decimation_changed);
    assert_eq!(rig.camera.get_size(), (64, 96));
    assert_eq!(rig.experiment.config().camera.save_every_nth_frame, 3);

    let err = rig
        .experiment
        .update_config(json!({ "camera": { "roi_y2": 500 } }))
        .unwrap_err();
    assert!(matches!(err, DaqError::InvalidRoi { .. }));
    assert_eq!(rig.experiment.config().camera.roi_y2, 96);

    let change = rig
        .experiment
        .update_config(json!({ "camera": { "exposure_time": "3ms" } }))
        .unwrap();
    assert!(change.camera_changed && !change.decimation_changed);
    assert!((rig.camera.exposure().as_secs_f64() - 0.003).abs() < 1e-9);
}

#[test]
fn test_rejected_camera_update_restores_previous_settings() {
    let mut rig = rig(None);
    rig.experiment.start_free_run().unwrap();
    rig.camera.fail_next_start();

    let err = rig
        .experiment
        .update_config(json!({ "camera": { "roi_x2": 64, "exposure_time": "4ms" } }))
        .unwrap_err();
    assert!(matches!(err, DaqError::HardwareFault(_)));

    assert_eq!(rig.camera.get_size(), (128, 96));
    assert_eq!(rig.experiment.live_view().size(), Some((128, 96)));
    assert_eq!(rig.experiment.config().camera.roi_x2, 128);
    assert_eq!(rig.experiment.config().camera.exposure_time, Duration::from_millis(1));
    assert!((rig.camera.exposure().as_secs_f64() - 0.001).abs() < 1e-9);
    assert_eq!(rig.experiment.state().0, StreamState::Streaming);
}

#[test]
fn test_second_experiment_on_same_store_is_rejected() {
    let rig = rig(None);
    let config = rig.experiment.config().clone();
    let err = Experiment::new(
        config,
        Arc::new(SimulatedCamera::new(128, 96)),
        Arc::new(SimulatedDaq::new()),
    )
    .err()
    .expect("store is already held by the first experiment");
    assert!(matches!(err, DaqError::StoreLocked(_)));
}

#[test]
fn test_zoom_centres_roi_on_click() {
    let mut rig = rig(None);
    rig.experiment.set_zoom((64, 48)).unwrap();
    assert_eq!(rig.experiment.config().camera.roi(), imaging_daq::data::Roi::new((48, 80), (40, 56)));
    rig.experiment.set_zoom((127, 0)).unwrap();
    assert_eq!(rig.experiment.config().camera.roi(), imaging_daq::data::Roi::new((96, 128), (0, 16)));
    rig.experiment.clear_roi().unwrap();
    assert_eq!(rig.camera.get_size(), (128, 96));
}

#[test]
fn test_tracking_follows_spot_and_saves_snapshots() {
    let mut rig = rig_with(Some(10), |c| c.tracking.method = TrackingMethod::Peak);
    // The simulated spot orbits the sensor centre at radius 20
    rig.experiment.add_monitor_coordinate((84.0, 48.0));
    rig.experiment.start_tracking().unwrap();
    let id = rig.experiment.save_stream().unwrap();
    rig.experiment.start_free_run().unwrap();
    assert!(rig.camera.wait_for_frames(10, WAIT));
    rig.experiment.stop_free_run().unwrap();
    rig.experiment.stop_save_stream().unwrap();
    rig.experiment.stop_tracking();

    let point = rig.experiment.track_state().get(0).unwrap();
    assert!(point.intensity > 1000.0);
    assert!((point.x - 84.0).abs() < 10.0);

    rig.experiment.clear_monitor_coordinates();
    assert!(rig.experiment.track_state().is_empty());
    rig.experiment.finalize().unwrap();

    let reader = StoreReader::open(&rig.store_path).unwrap();
    let tracks = reader.read_tracks(&id).unwrap();
    assert_eq!(tracks.len(), 10);
    assert_eq!(tracks[9].0, 10);
}

#[test]
fn test_snapshot_is_its_own_finished_session() {
    let mut rig = rig(None);
    let frame = rig.experiment.snap().unwrap();
    assert_eq!(frame.size(), (128, 96));
    let id = rig.experiment.save_snapshot().unwrap();
    rig.experiment.finalize().unwrap();

    let reader = StoreReader::open(&rig.store_path).unwrap();
    let images = reader.read_images(&id).unwrap();
    assert_eq!(images.len(), 1);
    assert_eq!(&images[0].1, frame.as_ref());
    assert!(reader.session(&id).unwrap().finished);
}

#[test]
fn test_snapshot_after_roi_change_captures_a_fresh_frame() {
    let mut rig = rig(None);
    rig.experiment.snap().unwrap();
    rig.experiment.set_roi((32, 96), (16, 80)).unwrap();
    assert!(!rig.experiment.live_view().has_frame());

    let id = rig.experiment.save_snapshot().unwrap();
    rig.experiment.finalize().unwrap();

    let reader = StoreReader::open(&rig.store_path).unwrap();
    let images = reader.read_images(&id).unwrap();
    let frame = &images[0].1;
    assert_eq!(frame.size(), (64, 64));
    assert!(frame.pixels().iter().copied().max().unwrap_or(0) > 0);
}

#[test]
fn test_snap_while_streaming_is_rejected() {
    let mut rig = rig(None);
    rig.experiment.start_free_run().unwrap();
    assert!(matches!(rig.experiment.snap(), Err(DaqError::InvalidState(_))));
}

#[test]
fn test_drop_finalizes_open_session() {
    let rig = rig(Some(4));
    let Rig {
        _dir,
        store_path,
        camera,
        mut experiment,
        ..
    } = rig;
    let id = experiment.save_stream().unwrap();
    experiment.start_free_run().unwrap();
    assert!(camera.wait_for_frames(4, WAIT));
    drop(experiment);

    assert!(!camera.is_streaming());
    let reader = StoreReader::open(&store_path).unwrap();
    let summary = reader.session(&id).unwrap();
    assert!(summary.finished);
    assert_eq!(summary.images, 4);
}

#[test]
#[traced_test]
fn test_missing_save_directory_falls_back_with_warning() {
    let dir = tempdir().unwrap();
    let mut config = config_for(&dir.path().join("not").join("there"), 32, 32);
    config.saving.filename_tracks = "fallback".into();
    let daq = SimulatedDaq::new();
    let camera = Arc::new(SimulatedCamera::new(32, 32));
    let mut experiment = Experiment::new(config, camera, Arc::new(daq)).unwrap();

    assert_eq!(experiment.store().path(), dir.path().join("fallback.acq"));
    assert!(logs_contain("falling back to parent directory"));
    experiment.finalize().unwrap();
}
