//! Simulated Hardware
//!
//! Provides simulated devices for running the acquisition core without a rig.
//!
//! # Available Simulators
//!
//! - `SimulatedCamera` - streaming camera rendering a moving gaussian spot,
//!   optionally pulsing a `TriggerLine` once per exposure
//! - `SimulatedDaq` - signal source delivering trigger edges and sample blocks
//!   to registered callbacks
//!
//! Streaming runs on a dedicated named thread (`sim-camera`); `stop_stream`
//! joins it, so no frame is delivered after it returns.

use crate::data::{Frame, Roi, SampleBlock, TriggerEvent};
use crate::hardware::capabilities::{
    FrameSink, FrameSource, SampleCallback, SignalSource, TriggerCallback,
};
use anyhow::{anyhow, bail, Result};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Longest single sleep of the delivery thread, bounds stop latency.
const POLL_SLICE: Duration = Duration::from_millis(2);

// =============================================================================
// SpotPattern - Synthetic Image Content
// =============================================================================

/// Gaussian spot orbiting the sensor centre on a flat background.
#[derive(Debug, Clone)]
pub struct SpotPattern {
    /// Peak height above background
    pub amplitude: f64,
    /// Gaussian width in pixels
    pub sigma: f64,
    /// Flat background level
    pub background: u16,
    /// Orbit radius in pixels (0 keeps the spot still)
    pub orbit_radius: f64,
    /// Uniform noise amplitude added to every pixel (0 disables noise)
    pub noise: u16,
}

impl Default for SpotPattern {
    fn default() -> Self {
        Self {
            amplitude: 3000.0,
            sigma: 3.0,
            background: 100,
            orbit_radius: 20.0,
            noise: 0,
        }
    }
}

impl SpotPattern {
    /// Spot centre in sensor coordinates for frame `frame_nr`.
    pub fn centre(&self, sensor: (u32, u32), frame_nr: u64) -> (f64, f64) {
        let angle = frame_nr as f64 * 0.05;
        (
            sensor.0 as f64 / 2.0 + self.orbit_radius * angle.cos(),
            sensor.1 as f64 / 2.0 + self.orbit_radius * angle.sin(),
        )
    }

    /// Render the part of the sensor covered by `roi`.
    pub fn render(&self, sensor: (u32, u32), roi: Roi, frame_nr: u64, rng: &mut StdRng) -> Frame {
        let (width, height) = (roi.width(), roi.height());
        let mut pixels = vec![self.background; width as usize * height as usize];
        if self.noise > 0 {
            for p in pixels.iter_mut() {
                *p = p.saturating_add(rng.gen_range(0..=self.noise));
            }
        }

        let (cx, cy) = self.centre(sensor, frame_nr);
        let reach = (self.sigma * 4.0).ceil();
        let x_lo = ((cx - reach).max(roi.x.0 as f64)) as u32;
        let x_hi = ((cx + reach).min(roi.x.1 as f64)).max(0.0) as u32;
        let y_lo = ((cy - reach).max(roi.y.0 as f64)) as u32;
        let y_hi = ((cy + reach).min(roi.y.1 as f64)).max(0.0) as u32;
        let two_sigma_sq = 2.0 * self.sigma * self.sigma;
        for y in y_lo..y_hi {
            for x in x_lo..x_hi {
                let dx = x as f64 + 0.5 - cx;
                let dy = y as f64 + 0.5 - cy;
                let value = self.amplitude * (-(dx * dx + dy * dy) / two_sigma_sq).exp();
                let idx = (y - roi.y.0) as usize * width as usize + (x - roi.x.0) as usize;
                pixels[idx] = pixels[idx].saturating_add(value as u16);
            }
        }
        Frame::from_u16(width, height, pixels)
    }
}

// =============================================================================
// SimulatedCamera
// =============================================================================

#[derive(Debug)]
struct CameraState {
    roi: Roi,
    exposure: Duration,
    output_trigger: bool,
    fail_next_start: bool,
    last_buffer_frames: usize,
    frames_rendered: u64,
}

struct StreamHandle {
    cancel: CancellationToken,
    thread: JoinHandle<()>,
}

/// Simulated streaming camera.
///
/// # Example
///
/// ```rust,ignore
/// let daq = SimulatedDaq::new();
/// let camera = SimulatedCamera::new(512, 512)
///     .with_frame_limit(100)
///     .with_trigger_line(daq.trigger_line());
/// camera.start_stream(64, sink, CancellationToken::new())?;
/// ```
pub struct SimulatedCamera {
    sensor: (u32, u32),
    pattern: SpotPattern,
    frame_limit: Option<u64>,
    trigger_line: Option<TriggerLine>,
    state: Arc<Mutex<CameraState>>,
    stream: Mutex<Option<StreamHandle>>,
    delivered: Arc<AtomicU64>,
    streams_started: AtomicU64,
}

impl SimulatedCamera {
    /// Camera with a `width × height` sensor, full-frame ROI and 1 ms exposure.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            sensor: (width, height),
            pattern: SpotPattern::default(),
            frame_limit: None,
            trigger_line: None,
            state: Arc::new(Mutex::new(CameraState {
                roi: Roi::full(width, height),
                exposure: Duration::from_millis(1),
                output_trigger: true,
                fail_next_start: false,
                last_buffer_frames: 0,
                frames_rendered: 0,
            })),
            stream: Mutex::new(None),
            delivered: Arc::new(AtomicU64::new(0)),
            streams_started: AtomicU64::new(0),
        }
    }

    /// Deliver at most `limit` frames per stream, then idle until stopped.
    pub fn with_frame_limit(mut self, limit: u64) -> Self {
        self.frame_limit = Some(limit);
        self
    }

    /// Pulse `line` at the start of every exposure.
    pub fn with_trigger_line(mut self, line: TriggerLine) -> Self {
        self.trigger_line = Some(line);
        self
    }

    /// Replace the synthetic image content.
    pub fn with_pattern(mut self, pattern: SpotPattern) -> Self {
        self.pattern = pattern;
        self
    }

    /// Make the next `start_stream` fail with a hardware error.
    pub fn fail_next_start(&self) {
        self.state.lock().fail_next_start = true;
    }

    /// Total frames delivered to sinks across all streams.
    pub fn frames_delivered(&self) -> u64 {
        self.delivered.load(Ordering::Acquire)
    }

    /// Number of successfully started streams.
    pub fn streams_started(&self) -> u64 {
        self.streams_started.load(Ordering::Acquire)
    }

    /// Ring buffer size requested by the last `start_stream`.
    pub fn last_buffer_frames(&self) -> usize {
        self.state.lock().last_buffer_frames
    }

    /// Current exposure time.
    pub fn exposure(&self) -> Duration {
        self.state.lock().exposure
    }

    /// Block until at least `count` frames were delivered in total, or `timeout` elapses.
    pub fn wait_for_frames(&self, count: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.frames_delivered() < count {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
        true
    }

    /// Sleep for `duration` in short slices, returning early on cancellation.
    fn sleep_cancellable(duration: Duration, cancel: &CancellationToken) {
        let deadline = Instant::now() + duration;
        while !cancel.is_cancelled() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep((deadline - now).min(POLL_SLICE));
        }
    }
}

impl FrameSource for SimulatedCamera {
    fn sensor_size(&self) -> (u32, u32) {
        self.sensor
    }

    fn set_roi(&self, roi: Roi) -> Result<()> {
        if self.is_streaming() {
            bail!("Cannot change ROI while streaming");
        }
        if !roi.fits(self.sensor.0, self.sensor.1) {
            bail!(
                "ROI x={:?} y={:?} exceeds sensor {}x{}",
                roi.x,
                roi.y,
                self.sensor.0,
                self.sensor.1
            );
        }
        self.state.lock().roi = roi;
        tracing::debug!(?roi, "SimulatedCamera ROI applied");
        Ok(())
    }

    fn get_size(&self) -> (u32, u32) {
        let roi = self.state.lock().roi;
        (roi.width(), roi.height())
    }

    fn set_exposure(&self, seconds: f64) -> Result<()> {
        if !seconds.is_finite() || seconds <= 0.0 {
            bail!("Exposure must be positive, got {seconds}");
        }
        self.state.lock().exposure = Duration::from_secs_f64(seconds);
        Ok(())
    }

    fn start_stream(
        &self,
        buffer_frames: usize,
        sink: Arc<dyn FrameSink>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut stream = self.stream.lock();
        if stream.is_some() {
            bail!("Camera is already streaming");
        }
        {
            let mut state = self.state.lock();
            if std::mem::take(&mut state.fail_next_start) {
                bail!("Simulated start failure");
            }
            state.last_buffer_frames = buffer_frames;
        }

        let sensor = self.sensor;
        let pattern = self.pattern.clone();
        let frame_limit = self.frame_limit;
        let trigger_line = self.trigger_line.clone();
        let state = Arc::clone(&self.state);
        let delivered = Arc::clone(&self.delivered);
        let thread_cancel = cancel.clone();

        let thread = thread::Builder::new()
            .name("sim-camera".into())
            .spawn(move || {
                let mut rng = StdRng::seed_from_u64(0x5eed);
                let mut stream_frames = 0u64;
                while !thread_cancel.is_cancelled() {
                    if frame_limit.is_some_and(|limit| stream_frames >= limit) {
                        Self::sleep_cancellable(POLL_SLICE, &thread_cancel);
                        continue;
                    }
                    let (roi, exposure, output_trigger, frame_nr) = {
                        let mut s = state.lock();
                        s.frames_rendered += 1;
                        (s.roi, s.exposure, s.output_trigger, s.frames_rendered - 1)
                    };
                    if output_trigger {
                        if let Some(line) = &trigger_line {
                            line.pulse();
                        }
                    }
                    let frame = pattern.render(sensor, roi, frame_nr, &mut rng);
                    sink.on_frame(&frame);
                    stream_frames += 1;
                    delivered.fetch_add(1, Ordering::AcqRel);
                    Self::sleep_cancellable(exposure, &thread_cancel);
                }
                tracing::debug!(frames = stream_frames, "SimulatedCamera delivery thread exiting");
            })
            .map_err(|e| anyhow!("Failed to spawn camera thread: {e}"))?;

        *stream = Some(StreamHandle { cancel, thread });
        self.streams_started.fetch_add(1, Ordering::AcqRel);
        tracing::info!(buffer_frames, "SimulatedCamera streaming started");
        Ok(())
    }

    fn stop_stream(&self) -> Result<()> {
        let Some(handle) = self.stream.lock().take() else {
            return Ok(());
        };
        handle.cancel.cancel();
        handle
            .thread
            .join()
            .map_err(|_| anyhow!("Camera delivery thread panicked"))?;
        tracing::info!("SimulatedCamera streaming stopped");
        Ok(())
    }

    fn snap_into(&self, buffer: &mut Frame) -> Result<()> {
        if self.is_streaming() {
            bail!("Cannot snap while streaming");
        }
        let (roi, frame_nr) = {
            let mut s = self.state.lock();
            s.frames_rendered += 1;
            (s.roi, s.frames_rendered - 1)
        };
        let mut rng = StdRng::seed_from_u64(frame_nr);
        *buffer = self.pattern.render(self.sensor, roi, frame_nr, &mut rng);
        Ok(())
    }

    fn is_streaming(&self) -> bool {
        self.stream.lock().is_some()
    }

    fn set_output_trigger(&self, enabled: bool) -> Result<()> {
        self.state.lock().output_trigger = enabled;
        Ok(())
    }
}

impl Drop for SimulatedCamera {
    fn drop(&mut self) {
        let _ = self.stop_stream();
    }
}

// =============================================================================
// SimulatedDaq
// =============================================================================

struct DaqInner {
    epoch: Instant,
    trigger_fn: Mutex<Option<TriggerCallback>>,
    sample_fn: Mutex<Option<SampleCallback>>,
    next_trigger: AtomicU64,
    next_sample: AtomicU64,
}

/// Simulated DAQ signal source.
///
/// Callbacks are held in mutexes that stay locked during delivery: events are
/// delivered strictly in sequence order, and replacing a callback waits for
/// the in-flight delivery to complete.
#[derive(Clone)]
pub struct SimulatedDaq {
    inner: Arc<DaqInner>,
}

/// Handle to the DAQ's trigger input, e.g. wired to a camera output trigger.
#[derive(Clone)]
pub struct TriggerLine {
    inner: Arc<DaqInner>,
}

impl SimulatedDaq {
    /// DAQ with no callbacks registered.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DaqInner {
                epoch: Instant::now(),
                trigger_fn: Mutex::new(None),
                sample_fn: Mutex::new(None),
                next_trigger: AtomicU64::new(0),
                next_sample: AtomicU64::new(0),
            }),
        }
    }

    /// Trigger input handle.
    pub fn trigger_line(&self) -> TriggerLine {
        TriggerLine {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Number of trigger edges seen so far, delivered or not.
    pub fn triggers_seen(&self) -> u64 {
        self.inner.next_trigger.load(Ordering::Acquire)
    }

    /// Deliver a block of interleaved samples to the registered callback.
    pub fn push_samples(&self, channels: u16, values: Vec<f64>) -> SampleBlock {
        let guard = self.inner.sample_fn.lock();
        let per_channel = if channels == 0 {
            0
        } else {
            (values.len() / channels as usize) as u64
        };
        let block = SampleBlock {
            first_index: self.inner.next_sample.fetch_add(per_channel, Ordering::AcqRel),
            channels,
            values,
        };
        if let Some(callback) = guard.as_ref() {
            callback(&block);
        }
        block
    }
}

impl Default for SimulatedDaq {
    fn default() -> Self {
        Self::new()
    }
}

impl TriggerLine {
    /// Register one trigger edge and deliver it to the registered callback.
    pub fn pulse(&self) -> TriggerEvent {
        let guard = self.inner.trigger_fn.lock();
        let event = TriggerEvent {
            index: self.inner.next_trigger.fetch_add(1, Ordering::AcqRel),
            timestamp_s: self.inner.epoch.elapsed().as_secs_f64(),
        };
        if let Some(callback) = guard.as_ref() {
            callback(&event);
        }
        event
    }
}

impl SignalSource for SimulatedDaq {
    fn set_trigger_processing_function(&self, callback: Option<TriggerCallback>) {
        *self.inner.trigger_fn.lock() = callback;
    }

    fn set_processing_function(&self, callback: Option<SampleCallback>) {
        *self.inner.sample_fn.lock() = callback;
    }

    fn stop_all(&self) -> Result<()> {
        self.set_trigger_processing_function(None);
        self.set_processing_function(None);
        tracing::info!("SimulatedDaq stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingSink {
        frames: AtomicUsize,
        size: Mutex<(u32, u32)>,
    }

    impl FrameSink for CountingSink {
        fn on_frame(&self, frame: &Frame) {
            *self.size.lock() = frame.size();
            self.frames.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counting_sink() -> Arc<CountingSink> {
        Arc::new(CountingSink {
            frames: AtomicUsize::new(0),
            size: Mutex::new((0, 0)),
        })
    }

    #[test]
    fn stream_respects_frame_limit_and_stops_synchronously() {
        let camera = SimulatedCamera::new(64, 48).with_frame_limit(5);
        let sink = counting_sink();
        camera
            .start_stream(16, sink.clone(), CancellationToken::new())
            .unwrap();
        assert!(camera.is_streaming());
        assert!(camera.wait_for_frames(5, Duration::from_secs(5)));
        camera.stop_stream().unwrap();
        assert!(!camera.is_streaming());

        let seen = sink.frames.load(Ordering::SeqCst);
        assert_eq!(seen, 5);
        assert_eq!(*sink.size.lock(), (64, 48));
        thread::sleep(Duration::from_millis(10));
        assert_eq!(sink.frames.load(Ordering::SeqCst), seen);
        assert_eq!(camera.last_buffer_frames(), 16);
    }

    #[test]
    fn cancellation_token_ends_delivery() {
        let camera = SimulatedCamera::new(16, 16);
        let sink = counting_sink();
        let cancel = CancellationToken::new();
        camera.start_stream(4, sink, cancel.clone()).unwrap();
        cancel.cancel();
        // Joining after cancellation returns promptly
        camera.stop_stream().unwrap();
    }

    #[test]
    fn roi_rejected_while_streaming_or_out_of_bounds() {
        let camera = SimulatedCamera::new(100, 100);
        assert!(camera.set_roi(Roi::new((0, 101), (0, 10))).is_err());
        camera.set_roi(Roi::new((10, 60), (20, 40))).unwrap();
        assert_eq!(camera.get_size(), (50, 20));

        camera
            .start_stream(1, counting_sink(), CancellationToken::new())
            .unwrap();
        assert!(camera.set_roi(Roi::full(100, 100)).is_err());
        assert!(camera
            .start_stream(1, counting_sink(), CancellationToken::new())
            .is_err());
        camera.stop_stream().unwrap();
    }

    #[test]
    fn injected_start_failure_is_one_shot() {
        let camera = SimulatedCamera::new(8, 8);
        camera.fail_next_start();
        assert!(camera
            .start_stream(1, counting_sink(), CancellationToken::new())
            .is_err());
        assert!(!camera.is_streaming());
        camera
            .start_stream(1, counting_sink(), CancellationToken::new())
            .unwrap();
        camera.stop_stream().unwrap();
    }

    #[test]
    fn snap_renders_current_roi() {
        let camera = SimulatedCamera::new(200, 100);
        camera.set_roi(Roi::new((50, 150), (0, 100))).unwrap();
        let mut frame = Frame::zeros(1, 1);
        camera.snap_into(&mut frame).unwrap();
        assert_eq!(frame.size(), (100, 100));
        // Spot orbits the sensor centre (100, 50) and lies inside this ROI
        assert!(frame.pixels().iter().any(|&v| v > 1000));
    }

    #[test]
    fn trigger_pulses_are_sequenced_and_timestamped() {
        let daq = SimulatedDaq::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        daq.set_trigger_processing_function(Some(Arc::new(move |e: &TriggerEvent| {
            sink.lock().push(*e);
        })));

        let line = daq.trigger_line();
        for _ in 0..3 {
            line.pulse();
        }
        daq.set_trigger_processing_function(None);
        line.pulse();

        let events = seen.lock().clone();
        assert_eq!(events.len(), 3);
        assert_eq!(
            events.iter().map(|e| e.index).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert!(events.windows(2).all(|w| w[0].timestamp_s <= w[1].timestamp_s));
        assert_eq!(daq.triggers_seen(), 4);
    }

    #[test]
    fn sample_blocks_track_first_index() {
        let daq = SimulatedDaq::new();
        let first = daq.push_samples(2, vec![0.0; 8]);
        let second = daq.push_samples(2, vec![0.0; 6]);
        assert_eq!(first.first_index, 0);
        assert_eq!(second.first_index, 4);
        assert_eq!(second.len(), 3);
    }
}
