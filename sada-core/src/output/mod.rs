//! Output device context: clock, gain stages and scheduled sources.
//!
//! ## Model
//!
//! ```text
//!  control thread                         render thread (device callback)
//!  ──────────────                         ───────────────────────────────
//!  OutputContext::start_source ──cmd──►  Mixer::render(&mut [f32])
//!  SourceNode::stop (atomic flag) ─────►    mixes voices × GainStage
//!  GainStage::set (atomic) ────────────►    advances frames_rendered
//!  OutputContext::dispatch_ended ◄─ended─   reports natural ends
//! ```
//!
//! The context clock is the render position: `current_time() =
//! frames_rendered / sample_rate`. It only advances when the device (or a
//! test) pulls audio, so scheduling arithmetic is sample-accurate.
//!
//! Several gain stages may share one context; the mixer sums every voice
//! through its own stage, so playback and live audio never serialise on a lock.

pub mod mixer;

pub use mixer::Mixer;

use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    Arc,
};

use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::{
    buffering::clip::AudioClip,
    error::{Result, SadaError},
};

/// Identifier of one scheduled source within a context.
pub type VoiceId = u64;

/// Callback fired (at most once) when a source reaches its natural end.
pub type EndedHook = Box<dyn FnOnce() + Send + 'static>;

/// Pending start commands buffered between control and render threads.
const COMMAND_CAP: usize = 1024;

/// Volume control shared between the control thread and the mixer.
///
/// The gain is stored as raw `f32` bits in an `AtomicU32`, so setting it
/// takes effect on the next rendered block without locking.
#[derive(Debug)]
pub struct GainStage {
    bits: AtomicU32,
}

impl GainStage {
    pub fn new(gain: f32) -> Arc<Self> {
        Arc::new(Self {
            bits: AtomicU32::new(gain.max(0.0).to_bits()),
        })
    }

    /// Set the linear gain. Negative and NaN values are treated as silence.
    pub fn set(&self, gain: f32) {
        let gain = if gain.is_nan() { 0.0 } else { gain.max(0.0) };
        self.bits.store(gain.to_bits(), Ordering::Relaxed);
    }

    pub fn get(&self) -> f32 {
        f32::from_bits(self.bits.load(Ordering::Relaxed))
    }
}

/// Lifecycle flags shared by a [`SourceNode`] handle and its mixer voice.
#[derive(Debug, Default)]
pub(crate) struct VoiceState {
    /// Set by the control side on an explicit stop; suppresses the ended hook.
    stopped: AtomicBool,
    /// Set by the mixer once the voice has been removed from the mix.
    finished: AtomicBool,
}

/// Handle to one scheduled playback of a clip.
#[derive(Debug, Clone)]
pub struct SourceNode {
    id: VoiceId,
    state: Arc<VoiceState>,
    start_time: f64,
    duration: f64,
}

impl SourceNode {
    pub fn id(&self) -> VoiceId {
        self.id
    }

    /// Context time at which the source was scheduled to begin.
    pub fn start_time(&self) -> f64 {
        self.start_time
    }

    /// Scheduled context time of the natural end.
    pub fn end_time(&self) -> f64 {
        self.start_time + self.duration
    }

    /// True once the mixer has dropped the voice (natural end or stop).
    pub fn has_finished(&self) -> bool {
        self.state.finished.load(Ordering::Acquire)
    }

    /// True if the source was stopped explicitly.
    pub fn was_stopped(&self) -> bool {
        self.state.stopped.load(Ordering::Acquire)
    }
}

/// Realtime-side voice: one clip being read through one gain stage.
pub(crate) struct Voice {
    pub(crate) id: VoiceId,
    pub(crate) clip: Arc<AudioClip>,
    pub(crate) gain: Arc<GainStage>,
    /// Context frame at which the voice becomes audible.
    pub(crate) start_frame: u64,
    /// Read position in clip frames (fractional when rates differ).
    pub(crate) position: f64,
    /// Clip frames advanced per output frame.
    pub(crate) step: f64,
    pub(crate) state: Arc<VoiceState>,
}

pub(crate) enum MixerCommand {
    Start(Voice),
    StopAll,
}

/// Releases the physical device behind a context.
///
/// Implementations must stop rendering synchronously before returning.
pub trait OutputDevice: Send {
    fn release(&mut self);
}

/// State shared between the context, its mixer, and the device thread.
pub(crate) struct ContextShared {
    sample_rate: u32,
    frames_rendered: AtomicU64,
    closed: AtomicBool,
    next_id: AtomicU64,
    /// Every voice not yet finished or stopped, with its ended hook if any.
    voices: Mutex<HashMap<VoiceId, (Arc<VoiceState>, Option<EndedHook>)>>,
    ended_rx: Receiver<VoiceId>,
}

impl ContextShared {
    pub(crate) fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub(crate) fn frames_rendered(&self) -> u64 {
        self.frames_rendered.load(Ordering::Acquire)
    }

    pub(crate) fn advance(&self, frames: u64) {
        self.frames_rendered.fetch_add(frames, Ordering::AcqRel);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn ended_receiver(&self) -> &Receiver<VoiceId> {
        &self.ended_rx
    }

    /// Fire the ended hook registered for `id`, unless it was stopped
    /// manually or the context is closed. Returns whether a hook ran.
    pub(crate) fn fire_ended(&self, id: VoiceId) -> bool {
        let entry = self.voices.lock().remove(&id);
        let Some((state, Some(hook))) = entry else {
            return false;
        };
        if self.is_closed() || state.stopped.load(Ordering::Acquire) {
            debug!(voice_id = id, "ended hook suppressed");
            return false;
        }
        hook();
        true
    }
}

/// An open output device context.
///
/// Dropping the context closes it. `close()` is idempotent and synchronously
/// halts rendering before releasing the device.
pub struct OutputContext {
    shared: Arc<ContextShared>,
    commands: Sender<MixerCommand>,
    device: Mutex<Option<Box<dyn OutputDevice>>>,
}

impl OutputContext {
    /// Create a context and the mixer that renders it.
    ///
    /// The mixer is handed to whatever drives the clock: a device callback or
    /// an offline renderer.
    pub fn pair(sample_rate: u32) -> (Self, Mixer) {
        let (cmd_tx, cmd_rx) = crossbeam_channel::bounded(COMMAND_CAP);
        let (ended_tx, ended_rx) = crossbeam_channel::unbounded();
        let shared = Arc::new(ContextShared {
            sample_rate: sample_rate.max(1),
            frames_rendered: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            voices: Mutex::new(HashMap::new()),
            ended_rx,
        });
        let mixer = Mixer::new(Arc::clone(&shared), cmd_rx, ended_tx);
        let ctx = Self {
            shared,
            commands: cmd_tx,
            device: Mutex::new(None),
        };
        (ctx, mixer)
    }

    /// Attach the device that must be released when this context closes.
    pub fn attach_device(&self, device: Box<dyn OutputDevice>) {
        let mut slot = self.device.lock();
        if let Some(mut old) = slot.replace(device) {
            old.release();
        }
    }

    pub(crate) fn shared(&self) -> Arc<ContextShared> {
        Arc::clone(&self.shared)
    }

    pub fn sample_rate(&self) -> u32 {
        self.shared.sample_rate
    }

    /// Context clock in seconds.
    pub fn current_time(&self) -> f64 {
        self.shared.frames_rendered() as f64 / self.shared.sample_rate as f64
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Create a gain stage for this context.
    pub fn create_gain(&self, gain: f32) -> Arc<GainStage> {
        GainStage::new(gain)
    }

    /// Schedule `clip` to start at context time `when`, reading from `offset`
    /// seconds into the clip. A `when` in the past starts immediately.
    ///
    /// `on_ended` fires at most once, only on natural end, and never after
    /// the source is stopped or the context closed. Hooks run on the device
    /// thread (or inside [`dispatch_ended`](Self::dispatch_ended)) and must
    /// not close this context.
    pub fn start_source(
        &self,
        clip: Arc<AudioClip>,
        gain: &Arc<GainStage>,
        when: f64,
        offset: f64,
        on_ended: Option<EndedHook>,
    ) -> Result<SourceNode> {
        if self.is_closed() {
            return Err(SadaError::ContextClosed);
        }

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let rate = self.shared.sample_rate as f64;
        let offset = offset.clamp(0.0, clip.duration());
        let start_frame = (when.max(0.0) * rate).round() as u64;
        let state = Arc::new(VoiceState::default());
        let node = SourceNode {
            id,
            state: Arc::clone(&state),
            start_time: when.max(self.current_time()),
            duration: clip.duration() - offset,
        };

        self.shared
            .voices
            .lock()
            .insert(id, (Arc::clone(&state), on_ended));

        let voice = Voice {
            id,
            step: clip.sample_rate() as f64 / rate,
            position: offset * clip.sample_rate() as f64,
            clip,
            gain: Arc::clone(gain),
            start_frame,
            state,
        };

        match self.commands.try_send(MixerCommand::Start(voice)) {
            Ok(()) => Ok(node),
            Err(e) => {
                self.shared.voices.lock().remove(&id);
                let reason = match e {
                    TrySendError::Full(_) => "mixer command queue full",
                    TrySendError::Disconnected(_) => "mixer is gone",
                };
                warn!(voice_id = id, reason, "failed to schedule source");
                Err(SadaError::AudioStream(reason.into()))
            }
        }
    }

    /// Stop a source. Its ended hook will not fire. Stopping an already
    /// finished source is a no-op.
    pub fn stop_source(&self, node: &SourceNode) {
        node.state.stopped.store(true, Ordering::Release);
        self.shared.voices.lock().remove(&node.id);
    }

    /// Stop every source scheduled on this context.
    ///
    /// Every tracked voice is flagged stopped directly, so the sources fall
    /// silent on the next rendered block even when the mixer queue is full.
    pub fn stop_all(&self) {
        let stopped: Vec<_> = self.shared.voices.lock().drain().collect();
        for (_, (state, _)) in &stopped {
            state.stopped.store(true, Ordering::Release);
        }
        if let Err(e) = self.commands.try_send(MixerCommand::StopAll) {
            let reason = match e {
                TrySendError::Full(_) => "mixer command queue full",
                TrySendError::Disconnected(_) => "mixer is gone",
            };
            warn!(voices = stopped.len(), reason, "stop-all command not queued");
        }
    }

    /// Run ended hooks for voices the mixer has reported finished.
    ///
    /// Device-backed contexts do this on their device thread; offline
    /// contexts call it after rendering. Returns the number of hooks fired.
    pub fn dispatch_ended(&self) -> usize {
        let mut fired = 0;
        while let Ok(id) = self.shared.ended_rx.try_recv() {
            if self.shared.fire_ended(id) {
                fired += 1;
            }
        }
        fired
    }

    /// Halt all audio and release the device. Idempotent.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.voices.lock().clear();
        let _ = self.commands.try_send(MixerCommand::StopAll);
        if let Some(mut device) = self.device.lock().take() {
            device.release();
        }
        info!(sample_rate = self.shared.sample_rate, "output context closed");
    }
}

impl Drop for OutputContext {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for OutputContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputContext")
            .field("sample_rate", &self.shared.sample_rate)
            .field("current_time", &self.current_time())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn clip(secs: f64, rate: u32) -> Arc<AudioClip> {
        Arc::new(AudioClip::mono(
            vec![0.5; (secs * rate as f64) as usize],
            rate,
        ))
    }

    fn counter_hook(counter: &Arc<AtomicUsize>) -> EndedHook {
        let counter = Arc::clone(counter);
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn clock_follows_rendered_frames() {
        let (ctx, mut mixer) = OutputContext::pair(24_000);
        assert_eq!(ctx.current_time(), 0.0);
        mixer.render_frames(12_000);
        assert!((ctx.current_time() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn gain_stage_clamps_negative_and_nan() {
        let gain = GainStage::new(0.7);
        assert!((gain.get() - 0.7).abs() < 1e-6);
        gain.set(-1.0);
        assert_eq!(gain.get(), 0.0);
        gain.set(f32::NAN);
        assert_eq!(gain.get(), 0.0);
    }

    #[test]
    fn natural_end_fires_hook_once() {
        let (ctx, mut mixer) = OutputContext::pair(1_000);
        let gain = ctx.create_gain(1.0);
        let fired = Arc::new(AtomicUsize::new(0));
        let node = ctx
            .start_source(clip(0.1, 1_000), &gain, 0.0, 0.0, Some(counter_hook(&fired)))
            .unwrap();
        mixer.render_frames(50);
        assert_eq!(ctx.dispatch_ended(), 0);
        mixer.render_frames(100);
        assert_eq!(ctx.dispatch_ended(), 1);
        mixer.render_frames(100);
        assert_eq!(ctx.dispatch_ended(), 0);
        assert!(node.has_finished());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stopped_source_never_fires() {
        let (ctx, mut mixer) = OutputContext::pair(1_000);
        let gain = ctx.create_gain(1.0);
        let fired = Arc::new(AtomicUsize::new(0));
        let node = ctx
            .start_source(clip(0.1, 1_000), &gain, 0.0, 0.0, Some(counter_hook(&fired)))
            .unwrap();
        mixer.render_frames(20);
        ctx.stop_source(&node);
        mixer.render_frames(200);
        ctx.dispatch_ended();
        assert!(node.was_stopped());
        assert!(node.has_finished());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn closed_context_rejects_sources_and_close_is_idempotent() {
        let (ctx, _mixer) = OutputContext::pair(24_000);
        let gain = ctx.create_gain(1.0);
        ctx.close();
        ctx.close();
        let err = ctx
            .start_source(clip(0.1, 24_000), &gain, 0.0, 0.0, None)
            .unwrap_err();
        assert!(matches!(err, SadaError::ContextClosed));
    }

    #[test]
    fn stop_all_silences_voices_when_queue_is_full() {
        let (ctx, mut mixer) = OutputContext::pair(1_000);
        let gain = ctx.create_gain(1.0);
        let nodes: Vec<SourceNode> = (0..COMMAND_CAP)
            .map(|_| {
                ctx.start_source(clip(0.5, 1_000), &gain, 0.0, 0.0, None)
                    .unwrap()
            })
            .collect();
        assert!(ctx
            .start_source(clip(0.5, 1_000), &gain, 0.0, 0.0, None)
            .is_err());

        ctx.stop_all();
        let out = mixer.render_frames(100);
        assert!(out.iter().all(|&s| s == 0.0));
        assert_eq!(mixer.active_voices(), 0);
        assert!(nodes.iter().all(|n| n.was_stopped() && n.has_finished()));
    }

    #[test]
    fn voices_without_hooks_leave_the_registry_on_natural_end() {
        let (ctx, mut mixer) = OutputContext::pair(1_000);
        let gain = ctx.create_gain(1.0);
        ctx.start_source(clip(0.05, 1_000), &gain, 0.0, 0.0, None)
            .unwrap();
        assert_eq!(ctx.shared.voices.lock().len(), 1);
        mixer.render_frames(100);
        assert_eq!(ctx.dispatch_ended(), 0);
        assert!(ctx.shared.voices.lock().is_empty());
    }

    struct FlagDevice(Arc<AtomicUsize>);

    impl OutputDevice for FlagDevice {
        fn release(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn device_released_exactly_once_on_drop() {
        let released = Arc::new(AtomicUsize::new(0));
        {
            let (ctx, _mixer) = OutputContext::pair(24_000);
            ctx.attach_device(Box::new(FlagDevice(Arc::clone(&released))));
            ctx.close();
        }
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }
}
