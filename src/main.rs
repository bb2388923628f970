//! CLI Entry Point for imaging-daq
//!
//! Provides command-line interface for:
//! - Running an acquisition against the simulated rig (camera + DAQ)
//! - Inspecting the sessions recorded in a store
//!
//! # Usage
//!
//! Record 500 frames, saving every Nth per config and tracking one particle:
//! ```bash
//! imaging-daq run --config rig.toml --frames 500 --save --track 1024,1024
//! ```
//!
//! List the sessions in a store:
//! ```bash
//! imaging-daq inspect data/output.acq
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use imaging_daq::hardware::{SimulatedCamera, SimulatedDaq};
use imaging_daq::storage::StoreReader;
use imaging_daq::{tracing_init, Experiment, ExperimentConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "imaging-daq")]
#[command(about = "Camera/DAQ acquisition with session-scoped persistence", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Acquire from the simulated rig
    Run {
        /// Configuration file (TOML); missing files fall back to defaults
        #[arg(long, default_value = "imaging_daq.toml")]
        config: PathBuf,

        /// Number of frames to acquire
        #[arg(long, default_value_t = 100)]
        frames: u64,

        /// Persist the stream into a new acquisition session
        #[arg(long)]
        save: bool,

        /// Coordinate to track, as `x,y` (repeatable)
        #[arg(long, value_parser = parse_coordinate)]
        track: Vec<(f64, f64)>,

        /// Simulated sensor size, as `WIDTHxHEIGHT`
        #[arg(long, default_value = "2048x2048", value_parser = parse_sensor)]
        sensor: (u32, u32),
    },

    /// Print the sessions recorded in a store
    Inspect {
        /// Store directory
        file: PathBuf,

        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

fn parse_coordinate(s: &str) -> Result<(f64, f64), String> {
    let (x, y) = s
        .split_once(',')
        .ok_or_else(|| format!("expected x,y but got '{s}'"))?;
    let x = x.trim().parse().map_err(|e| format!("bad x '{x}': {e}"))?;
    let y = y.trim().parse().map_err(|e| format!("bad y '{y}': {e}"))?;
    Ok((x, y))
}

fn parse_sensor(s: &str) -> Result<(u32, u32), String> {
    let (w, h) = s
        .split_once('x')
        .ok_or_else(|| format!("expected WIDTHxHEIGHT but got '{s}'"))?;
    let w = w.trim().parse().map_err(|e| format!("bad width '{w}': {e}"))?;
    let h = h.trim().parse().map_err(|e| format!("bad height '{h}': {e}"))?;
    Ok((w, h))
}

fn main() {
    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Run {
            config,
            frames,
            save,
            track,
            sensor,
        } => run(config, frames, save, track, sensor),
        Commands::Inspect { file, json } => inspect(file, json),
    };

    // Resources owned by `run` were released (Experiment::drop finalizes) before we get here
    if let Err(err) = result {
        error!(error = ?err, "Unhandled error, exiting");
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}

fn run(
    config_path: PathBuf,
    frames: u64,
    save: bool,
    track: Vec<(f64, f64)>,
    sensor: (u32, u32),
) -> Result<()> {
    let config = ExperimentConfig::load_from(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    tracing_init::init_from_config(&config).map_err(anyhow::Error::msg)?;
    info!(config = %config_path.display(), frames, save, "Starting acquisition");

    let daq = SimulatedDaq::new();
    let camera = Arc::new(
        SimulatedCamera::new(sensor.0, sensor.1)
            .with_frame_limit(frames)
            .with_trigger_line(daq.trigger_line()),
    );
    let exposure = config.camera.exposure_time;
    let mut experiment = Experiment::new(config, camera.clone(), Arc::new(daq.clone()))?;

    for coord in &track {
        experiment.add_monitor_coordinate(*coord);
    }
    if !track.is_empty() {
        experiment.start_tracking()?;
    }
    if save {
        let session = experiment.save_stream()?;
        info!(session = %session, "Recording");
    }

    experiment.start_free_run()?;
    // Two exposures per frame plus slack; `None` when the budget exceeds the clock's range
    let exposures = u32::try_from(frames.saturating_mul(2)).unwrap_or(u32::MAX);
    let deadline = Instant::now()
        .checked_add(exposure.saturating_mul(exposures).saturating_add(Duration::from_secs(5)));
    let mut block = 0u64;
    while camera.frames_delivered() < frames {
        if deadline.is_some_and(|deadline| Instant::now() > deadline) {
            warn!(
                delivered = camera.frames_delivered(),
                expected = frames,
                "Timed out waiting for frames"
            );
            break;
        }
        let values = (0..32)
            .map(|i| ((block * 16 + i / 2) as f64 * 0.1).sin())
            .collect();
        daq.push_samples(2, values);
        block += 1;
        std::thread::sleep(Duration::from_millis(10));
    }

    experiment.stop_save_stream()?;
    let stats = experiment.pipeline_stats();
    if let Some(tracked) = experiment.track_state().snapshot().1.first() {
        info!(x = tracked.x, y = tracked.y, intensity = tracked.intensity, "Last tracked position");
    }
    experiment.finalize()?;
    info!(
        frames_received = stats.frames_received,
        frames_saved = stats.frames_saved,
        triggers_saved = stats.triggers_saved,
        "Acquisition complete"
    );
    Ok(())
}

fn inspect(file: PathBuf, json: bool) -> Result<()> {
    let reader = StoreReader::open(&file).with_context(|| format!("opening {}", file.display()))?;
    if json {
        println!("{}", serde_json::to_string_pretty(reader.sessions())?);
        return Ok(());
    }

    println!("{}", file.display());
    if reader.is_truncated() {
        println!("  (a session stream ends in an incomplete record)");
    }
    println!(
        "  {:<18} {:>8} {:>9} {:>7} {:>8}  {}",
        "session", "images", "triggers", "tracks", "samples", "state"
    );
    for s in reader.sessions() {
        println!(
            "  {:<18} {:>8} {:>9} {:>7} {:>8}  {}",
            s.id,
            s.images,
            s.triggers,
            s.tracks,
            s.samples,
            if s.finished { "finished" } else { "open" }
        );
    }
    Ok(())
}
