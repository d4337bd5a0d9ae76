//! `CapturePipeline`: microphone to base64 PCM16 frames.
//!
//! ## Threading
//!
//! ```text
//! device callback ──push_slice──► SPSC ring ──pop_slice──► capture thread
//!                                                            │ RateConverter (device rate → 16 kHz)
//!                                                            │ Framer (4096 samples, level, PCM16, base64)
//!                                                            ▼
//!                                                      CaptureSink::on_chunk
//! ```
//!
//! The microphone stream is `!Send` on most hosts, so it is opened *inside*
//! the capture thread. A sync oneshot channel reports the open result back to
//! `start()`, which blocks until the device is confirmed open or has failed.

pub mod framer;

pub use framer::{CaptureChunk, Framer};

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    mpsc, Arc,
};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::{
    audio::resample::RateConverter,
    buffering::{create_audio_ring, AudioConsumer, Consumer},
    config::AudioConfig,
    error::{Result, SadaError},
    platform::{AudioPlatform, InputRequest, MicrophoneClaim, OpenedInput},
};

/// Samples drained from the ring per iteration (20 ms at 48 kHz).
const DRAIN_CHUNK: usize = 960;

/// Input frames per resampler call.
const RESAMPLE_CHUNK: usize = 1024;

/// Sleep when the ring is empty, so the thread does not spin.
const SLEEP_EMPTY: Duration = Duration::from_millis(5);

/// Receives frames from the capture thread.
///
/// Both methods run on the capture thread. Returning an error from
/// `on_chunk` ends the capture; `on_error` is then called with it.
pub trait CaptureSink: Send + 'static {
    fn on_chunk(&mut self, chunk: CaptureChunk) -> Result<()>;

    /// Called once when capture ends abnormally.
    fn on_error(&mut self, error: SadaError) {
        error!("capture ended with error: {error}");
    }
}

impl<F> CaptureSink for F
where
    F: FnMut(CaptureChunk) -> Result<()> + Send + 'static,
{
    fn on_chunk(&mut self, chunk: CaptureChunk) -> Result<()> {
        self(chunk)
    }
}

#[derive(Default)]
pub struct CaptureDiagnostics {
    pub samples_in: AtomicUsize,
    pub samples_resampled: AtomicUsize,
    pub frames_sent: AtomicUsize,
    pub frames_speaking: AtomicUsize,
}

impl CaptureDiagnostics {
    pub fn reset(&self) {
        self.samples_in.store(0, Ordering::Relaxed);
        self.samples_resampled.store(0, Ordering::Relaxed);
        self.frames_sent.store(0, Ordering::Relaxed);
        self.frames_speaking.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CaptureSnapshot {
        CaptureSnapshot {
            samples_in: self.samples_in.load(Ordering::Relaxed),
            samples_resampled: self.samples_resampled.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_speaking: self.frames_speaking.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureSnapshot {
    pub samples_in: usize,
    pub samples_resampled: usize,
    pub frames_sent: usize,
    pub frames_speaking: usize,
}

/// Capture settings taken from [`AudioConfig`].
#[derive(Debug, Clone)]
struct CaptureSettings {
    sample_rate: u32,
    frame_size: usize,
    threshold: f32,
    preferred_device: Option<String>,
}

/// Owns the microphone while running. At most one pipeline per platform
/// holds it at a time.
pub struct CapturePipeline {
    platform: Arc<dyn AudioPlatform>,
    settings: CaptureSettings,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    diagnostics: Arc<CaptureDiagnostics>,
}

impl CapturePipeline {
    pub fn new(platform: Arc<dyn AudioPlatform>, config: &AudioConfig) -> Self {
        Self {
            platform,
            settings: CaptureSettings {
                sample_rate: config.capture_sample_rate,
                frame_size: config.capture_frame_size.max(1),
                threshold: config.speaking_threshold,
                preferred_device: config.preferred_input_device.clone(),
            },
            running: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
            diagnostics: Arc::new(CaptureDiagnostics::default()),
        }
    }

    /// Open the microphone and start framing into `sink`.
    ///
    /// Blocks until the device is open. Returns the device sample rate.
    ///
    /// # Errors
    /// - `AlreadyRunning` if this pipeline is capturing.
    /// - `DeviceBusy` if another pipeline holds the microphone.
    /// - `PermissionDenied` / `DeviceUnavailable` from the platform.
    pub fn start(&self, sink: impl CaptureSink) -> Result<u32> {
        let mut worker = self.worker.lock();
        if self.running.load(Ordering::SeqCst) {
            return Err(SadaError::AlreadyRunning);
        }
        // A previous run may have ended on its own; reap it.
        if let Some(handle) = worker.take() {
            join_worker(handle);
        }

        let claim = self.platform.microphone().try_claim()?;
        self.diagnostics.reset();
        self.running.store(true, Ordering::SeqCst);

        let (producer, consumer) = create_audio_ring();
        let platform = Arc::clone(&self.platform);
        let settings = self.settings.clone();
        let running = Arc::clone(&self.running);
        let diagnostics = Arc::clone(&self.diagnostics);
        let (open_tx, open_rx) = mpsc::channel::<Result<u32>>();

        let spawned = thread::Builder::new()
            .name("sada-capture".into())
            .spawn(move || {
                let request = InputRequest {
                    sample_rate: settings.sample_rate,
                    preferred_device: settings.preferred_device.clone(),
                };
                // Open on THIS thread: the host stream is !Send.
                let opened = platform
                    .open_input(&request, producer, Arc::clone(&running))
                    .and_then(|input| {
                        let converter = RateConverter::new(
                            input.sample_rate,
                            settings.sample_rate,
                            RESAMPLE_CHUNK,
                        )?;
                        Ok((input, converter))
                    });
                let (input, converter) = match opened {
                    Ok(pair) => {
                        let _ = open_tx.send(Ok(pair.0.sample_rate));
                        pair
                    }
                    Err(e) => {
                        running.store(false, Ordering::SeqCst);
                        let _ = open_tx.send(Err(e));
                        return;
                    }
                };

                run(CaptureLoop {
                    settings,
                    consumer,
                    converter,
                    input,
                    running,
                    diagnostics,
                    sink: Box::new(sink),
                    _claim: claim,
                });
            });

        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };

        match open_rx.recv() {
            Ok(Ok(device_rate)) => {
                *worker = Some(handle);
                info!(
                    device_rate,
                    target_rate = self.settings.sample_rate,
                    "capture started"
                );
                Ok(device_rate)
            }
            Ok(Err(e)) => {
                join_worker(handle);
                warn!("capture failed to start: {e}");
                Err(e)
            }
            Err(_) => {
                self.running.store(false, Ordering::SeqCst);
                join_worker(handle);
                Err(SadaError::Other(anyhow::anyhow!(
                    "capture thread died unexpectedly"
                )))
            }
        }
    }

    /// Release the microphone and halt framing. Idempotent; a no-op when
    /// never started.
    pub fn stop(&self) {
        let was_running = self.running.swap(false, Ordering::SeqCst);
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                // Called from a sink; the loop exits on its own.
                return;
            }
            join_worker(handle);
        }
        if was_running {
            info!("capture stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn diagnostics(&self) -> CaptureSnapshot {
        self.diagnostics.snapshot()
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

fn join_worker(handle: JoinHandle<()>) {
    if handle.join().is_err() {
        error!("capture thread panicked");
    }
}

/// Everything the capture thread owns, passed as one struct.
struct CaptureLoop {
    settings: CaptureSettings,
    consumer: AudioConsumer,
    converter: RateConverter,
    /// Dropped when the loop returns, releasing the device on this thread.
    input: OpenedInput,
    running: Arc<AtomicBool>,
    diagnostics: Arc<CaptureDiagnostics>,
    sink: Box<dyn CaptureSink>,
    _claim: MicrophoneClaim,
}

/// Run the framing loop until `running` clears or the sink/stream fails.
fn run(mut ctx: CaptureLoop) {
    info!(
        frame_size = ctx.settings.frame_size,
        threshold = ctx.settings.threshold,
        "capture loop started"
    );
    let mut framer = Framer::new(
        ctx.settings.frame_size,
        ctx.settings.threshold,
        ctx.settings.sample_rate,
    );
    let mut raw = vec![0f32; DRAIN_CHUNK];

    let failure = loop {
        if !ctx.running.load(Ordering::Relaxed) {
            break None;
        }
        if let Ok(message) = ctx.input.errors.try_recv() {
            break Some(SadaError::AudioStream(message));
        }

        let n = ctx.consumer.pop_slice(&mut raw);
        if n == 0 {
            thread::sleep(SLEEP_EMPTY);
            continue;
        }
        ctx.diagnostics.samples_in.fetch_add(n, Ordering::Relaxed);

        let resampled = ctx.converter.process(&raw[..n]);
        if resampled.is_empty() {
            continue;
        }
        ctx.diagnostics
            .samples_resampled
            .fetch_add(resampled.len(), Ordering::Relaxed);

        let mut sink_error = None;
        for chunk in framer.push(&resampled) {
            let speaking = chunk.is_speaking;
            let seq = chunk.seq;
            if let Err(e) = ctx.sink.on_chunk(chunk) {
                sink_error = Some(e);
                break;
            }
            ctx.diagnostics.frames_sent.fetch_add(1, Ordering::Relaxed);
            if speaking {
                ctx.diagnostics.frames_speaking.fetch_add(1, Ordering::Relaxed);
            }
            if seq % 50 == 0 {
                debug!(seq, speaking, "capture frame sent");
            }
        }
        if sink_error.is_some() {
            break sink_error;
        }
    };

    ctx.running.store(false, Ordering::SeqCst);
    if let Some(e) = failure {
        warn!("capture loop aborted: {e}");
        ctx.sink.on_error(e);
    }
    info!(pending = framer.pending(), "capture loop exited");
}
