//! `LiveSession`: bidirectional voice session over an injected transport.
//!
//! ## Lifecycle
//!
//! ```text
//! LiveSession::new()        → Connecting
//!     └─► start(platform)   → output opened, setup sent, capture running → Active
//!         ├─► handle_message(Audio)        schedule at max(cursor, now)
//!         ├─► handle_message(Interrupted)  cursor reset (+ stop queued, by policy)
//!         ├─► capture / transport error    → Error, everything released
//!         └─► close() / remote Closed      → Disconnected, everything released
//! ```
//!
//! Error and Disconnected are terminal. There is no automatic retry: the
//! microphone prompt needs a fresh user gesture, so the host opens a new
//! session instead.
//!
//! ## Threading
//!
//! Outbound audio is sent from the capture thread. Inbound messages are
//! handed in by whatever thread reads the transport. Release is idempotent
//! and may run on either.

pub mod scheduler;

pub use scheduler::{Slot, StreamCursor};

use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    Arc, Weak,
};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::{
    capture::{CaptureChunk, CapturePipeline, CaptureSink},
    codec,
    config::{AudioConfig, InterruptPolicy},
    error::{Result, SadaError},
    ipc::events::{
        SessionStatus, SessionStatusEvent, SpeakingEvent, TranscriptEvent, TranscriptKind,
    },
    output::{GainStage, OutputContext, SourceNode},
    platform::AudioPlatform,
    protocol::{InboundMessage, OutboundMessage, SetupMessage},
};

/// Broadcast channel capacity for session events.
const BROADCAST_CAP: usize = 256;

/// The remote side of a live session.
///
/// Implementations forward outbound messages to the service and feed
/// everything they receive back through [`LiveSession::handle_message`].
pub trait LiveTransport: Send + Sync + 'static {
    /// Send one message. Called from the capture thread for audio.
    fn send(&self, message: OutboundMessage) -> Result<()>;

    /// Release the channel. Called at most once per session.
    fn close(&self);
}

#[derive(Default)]
pub struct LiveDiagnostics {
    pub chunks_sent: AtomicUsize,
    pub chunks_received: AtomicUsize,
    pub decode_errors: AtomicUsize,
    pub interruptions: AtomicUsize,
    pub underruns: AtomicUsize,
    pub nodes_stopped: AtomicUsize,
}

impl LiveDiagnostics {
    pub fn snapshot(&self) -> LiveSnapshot {
        LiveSnapshot {
            chunks_sent: self.chunks_sent.load(Ordering::Relaxed),
            chunks_received: self.chunks_received.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            interruptions: self.interruptions.load(Ordering::Relaxed),
            underruns: self.underruns.load(Ordering::Relaxed),
            nodes_stopped: self.nodes_stopped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LiveSnapshot {
    pub chunks_sent: usize,
    pub chunks_received: usize,
    pub decode_errors: usize,
    pub interruptions: usize,
    /// Chunks that arrived after the previous one had finished playing.
    pub underruns: usize,
    /// Queued chunks stopped by an interruption.
    pub nodes_stopped: usize,
}

/// Where one inbound chunk was placed on the output clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledChunk {
    pub start: f64,
    pub duration: f64,
    /// Silence before this chunk, `0.0` when it followed on seamlessly.
    pub gap: f64,
}

struct SessionOutput {
    context: OutputContext,
    gain: Arc<GainStage>,
    cursor: StreamCursor,
    /// Chunks that may still be queued or playing.
    scheduled: Vec<SourceNode>,
}

struct SessionShared {
    config: AudioConfig,
    transport: Arc<dyn LiveTransport>,
    status: Mutex<SessionStatus>,
    status_tx: broadcast::Sender<SessionStatusEvent>,
    speaking_tx: broadcast::Sender<SpeakingEvent>,
    transcript_tx: broadcast::Sender<TranscriptEvent>,
    seq: AtomicU64,
    output: Mutex<Option<SessionOutput>>,
    capture: Mutex<Option<CapturePipeline>>,
    closed: AtomicBool,
    transport_closed: AtomicBool,
    diagnostics: LiveDiagnostics,
}

impl SessionShared {
    fn set_status(&self, status: SessionStatus, detail: Option<String>) {
        *self.status.lock() = status;
        let _ = self.status_tx.send(SessionStatusEvent { status, detail });
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Enter a terminal state and release everything. Only the first call
    /// has any effect.
    fn shutdown(&self, status: SessionStatus, detail: Option<String>) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.set_status(status, detail);
        self.release();
        info!(?status, "live session ended");
    }

    fn fail(&self, error: &SadaError) {
        warn!("live session failed: {error}");
        self.shutdown(SessionStatus::Error, Some(error.to_string()));
    }

    fn release(&self) {
        let capture = self.capture.lock().take();
        if let Some(capture) = capture {
            capture.stop();
        }
        let output = self.output.lock().take();
        if let Some(output) = output {
            output.context.stop_all();
            output.context.close();
        }
        if !self.transport_closed.swap(true, Ordering::AcqRel) {
            self.transport.close();
        }
    }
}

/// Forwards capture frames to the transport.
struct SessionSink {
    shared: Weak<SessionShared>,
}

impl CaptureSink for SessionSink {
    fn on_chunk(&mut self, chunk: CaptureChunk) -> Result<()> {
        let Some(shared) = self.shared.upgrade() else {
            return Err(SadaError::RemoteChannel("session dropped".into()));
        };
        if shared.is_closed() {
            return Ok(());
        }
        let _ = shared.speaking_tx.send(SpeakingEvent {
            seq: shared.next_seq(),
            level: chunk.level,
            is_speaking: chunk.is_speaking,
        });
        shared.transport.send(OutboundMessage::audio(&chunk))?;
        shared.diagnostics.chunks_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn on_error(&mut self, error: SadaError) {
        if let Some(shared) = self.shared.upgrade() {
            shared.fail(&error);
        }
    }
}

/// One live voice conversation.
///
/// Dropping the session closes it.
pub struct LiveSession {
    shared: Arc<SessionShared>,
}

impl LiveSession {
    /// Create a session in the `Connecting` state. Subscribe to events, then
    /// call [`start`](Self::start).
    pub fn new(config: AudioConfig, transport: Arc<dyn LiveTransport>) -> Self {
        let (status_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (speaking_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (transcript_tx, _) = broadcast::channel(BROADCAST_CAP);
        Self {
            shared: Arc::new(SessionShared {
                config,
                transport,
                status: Mutex::new(SessionStatus::Connecting),
                status_tx,
                speaking_tx,
                transcript_tx,
                seq: AtomicU64::new(0),
                output: Mutex::new(None),
                capture: Mutex::new(None),
                closed: AtomicBool::new(false),
                transport_closed: AtomicBool::new(false),
                diagnostics: LiveDiagnostics::default(),
            }),
        }
    }

    /// `new` followed by `start`.
    pub fn open(
        platform: Arc<dyn AudioPlatform>,
        config: AudioConfig,
        transport: Arc<dyn LiveTransport>,
    ) -> Result<Self> {
        let session = Self::new(config, transport);
        session.start(platform)?;
        Ok(session)
    }

    /// Open the output device, send the setup message and start streaming
    /// the microphone.
    ///
    /// # Errors
    /// Any device or transport failure. The session is then in the terminal
    /// `Error` state with every resource released.
    pub fn start(&self, platform: Arc<dyn AudioPlatform>) -> Result<()> {
        let shared = &self.shared;
        if shared.is_closed() {
            return Err(SadaError::RemoteChannel("session is closed".into()));
        }
        if shared.output.lock().is_some() {
            return Err(SadaError::AlreadyRunning);
        }
        shared.set_status(SessionStatus::Connecting, None);

        match self.connect(platform) {
            Ok(()) if shared.is_closed() => Err(SadaError::RemoteChannel(
                "session ended during setup".into(),
            )),
            Ok(()) => {
                shared.set_status(SessionStatus::Active, None);
                info!("live session active");
                Ok(())
            }
            Err(e) => {
                shared.fail(&e);
                Err(e)
            }
        }
    }

    fn connect(&self, platform: Arc<dyn AudioPlatform>) -> Result<()> {
        let shared = &self.shared;
        let config = &shared.config;

        let context = platform.open_output(config.playback_sample_rate)?;
        let gain = context.create_gain(1.0);
        *shared.output.lock() = Some(SessionOutput {
            context,
            gain,
            cursor: StreamCursor::new(),
            scheduled: Vec::new(),
        });

        shared.transport.send(OutboundMessage::Setup(SetupMessage::audio(
            &config.voice_name,
            config.system_instruction.clone(),
        )))?;

        let capture = CapturePipeline::new(platform, config);
        capture.start(SessionSink {
            shared: Arc::downgrade(shared),
        })?;
        *shared.capture.lock() = Some(capture);

        // A capture failure racing setup may already have released; make
        // sure the pipeline stored above does not outlive it.
        if shared.is_closed() {
            shared.release();
        }
        Ok(())
    }

    /// Apply one inbound message.
    ///
    /// # Errors
    /// Codec errors for a bad audio payload (the session keeps running), or
    /// the remote error that ended the session.
    pub fn handle_message(&self, message: InboundMessage) -> Result<()> {
        let shared = &self.shared;
        if shared.is_closed() {
            debug!(?message, "message after close ignored");
            return Ok(());
        }
        match message {
            InboundMessage::Audio { data, sample_rate } => {
                self.schedule_audio(&data, sample_rate).map(|_| ())
            }
            InboundMessage::Text(text) => {
                let _ = shared.transcript_tx.send(TranscriptEvent {
                    seq: shared.next_seq(),
                    kind: TranscriptKind::Text,
                    text,
                });
                Ok(())
            }
            InboundMessage::Interrupted => {
                self.interrupt();
                Ok(())
            }
            InboundMessage::TurnComplete => {
                if let Some(output) = shared.output.lock().as_mut() {
                    output.cursor.mark_idle();
                }
                let _ = shared.transcript_tx.send(TranscriptEvent {
                    seq: shared.next_seq(),
                    kind: TranscriptKind::TurnComplete,
                    text: String::new(),
                });
                Ok(())
            }
            InboundMessage::Error(detail) => {
                let error = SadaError::RemoteChannel(detail);
                shared.fail(&error);
                Err(error)
            }
            InboundMessage::Closed => {
                shared.shutdown(SessionStatus::Disconnected, Some("remote closed".into()));
                Ok(())
            }
        }
    }

    /// Decode one base64 PCM16 chunk and queue it right after the previous
    /// one, or now if the queue has drained.
    pub fn schedule_audio(&self, base64_audio: &str, sample_rate: u32) -> Result<ScheduledChunk> {
        let shared = &self.shared;
        let clip = match codec::decode_clip(base64_audio, sample_rate, shared.config.channels) {
            Ok(clip) => clip,
            Err(e) => {
                shared.diagnostics.decode_errors.fetch_add(1, Ordering::Relaxed);
                warn!("dropping undecodable model audio: {e}");
                return Err(e);
            }
        };

        let mut guard = shared.output.lock();
        let Some(output) = guard.as_mut() else {
            return Err(SadaError::ContextClosed);
        };
        output.scheduled.retain(|node| !node.has_finished());

        let duration = clip.duration();
        let now = output.context.current_time();
        let slot = output.cursor.schedule(now, duration);
        let node = output
            .context
            .start_source(Arc::new(clip), &output.gain, slot.start, 0.0, None)?;
        output.scheduled.push(node);

        shared.diagnostics.chunks_received.fetch_add(1, Ordering::Relaxed);
        if slot.gap > 0.0 {
            shared.diagnostics.underruns.fetch_add(1, Ordering::Relaxed);
            debug!(gap = slot.gap, "model audio underrun");
        }
        debug!(start = slot.start, duration, cursor = slot.end, "model audio scheduled");
        Ok(ScheduledChunk {
            start: slot.start,
            duration,
            gap: slot.gap,
        })
    }

    /// Barge-in: the next chunk plays immediately. With
    /// [`InterruptPolicy::StopScheduled`] queued chunks are also silenced.
    pub fn interrupt(&self) {
        let shared = &self.shared;
        shared.diagnostics.interruptions.fetch_add(1, Ordering::Relaxed);
        let policy = shared.config.interrupt_policy;
        let mut guard = shared.output.lock();
        let Some(output) = guard.as_mut() else {
            return;
        };
        match policy {
            InterruptPolicy::ResetCursor => {
                output.scheduled.retain(|node| !node.has_finished());
            }
            InterruptPolicy::StopScheduled => {
                let mut stopped = 0;
                for node in output.scheduled.drain(..) {
                    if !node.has_finished() {
                        output.context.stop_source(&node);
                        stopped += 1;
                    }
                }
                shared
                    .diagnostics
                    .nodes_stopped
                    .fetch_add(stopped, Ordering::Relaxed);
            }
        }
        output.cursor.reset();
        info!(?policy, "model interrupted");
    }

    /// Stop capture, release the output device and close the transport.
    /// Idempotent.
    pub fn close(&self) {
        self.shared.shutdown(SessionStatus::Disconnected, None);
    }

    pub fn status(&self) -> SessionStatus {
        *self.shared.status.lock()
    }

    pub fn is_active(&self) -> bool {
        self.status() == SessionStatus::Active
    }

    /// Next free start time on the output clock (`0.0` after a reset).
    pub fn cursor(&self) -> f64 {
        self.shared
            .output
            .lock()
            .as_ref()
            .map_or(0.0, |o| o.cursor.next_start())
    }

    /// Output clock in seconds, `0.0` once released.
    pub fn output_time(&self) -> f64 {
        self.shared
            .output
            .lock()
            .as_ref()
            .map_or(0.0, |o| o.context.current_time())
    }

    /// Chunks still queued or playing.
    pub fn queued_chunks(&self) -> usize {
        self.shared.output.lock().as_ref().map_or(0, |o| {
            o.scheduled.iter().filter(|n| !n.has_finished()).count()
        })
    }

    /// Set the model-audio volume.
    pub fn set_volume(&self, volume: f32) {
        if let Some(output) = self.shared.output.lock().as_ref() {
            output.gain.set(volume.clamp(0.0, 1.0));
        }
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<SessionStatusEvent> {
        self.shared.status_tx.subscribe()
    }

    pub fn subscribe_speaking(&self) -> broadcast::Receiver<SpeakingEvent> {
        self.shared.speaking_tx.subscribe()
    }

    pub fn subscribe_transcripts(&self) -> broadcast::Receiver<TranscriptEvent> {
        self.shared.transcript_tx.subscribe()
    }

    pub fn diagnostics(&self) -> LiveSnapshot {
        self.shared.diagnostics.snapshot()
    }
}

impl Drop for LiveSession {
    fn drop(&mut self) {
        self.close();
    }
}
