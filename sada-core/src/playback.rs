//! `PlaybackEngine`: single-clip transport over an output context.
//!
//! ## Lifecycle
//!
//! ```text
//! PlaybackEngine::new()          → Empty (no device opened yet)
//!     └─► load(b64)              → Loaded, output context opened on first use
//!         └─► play(on_ended)     → Playing
//!             ├─► pause()        → Paused ──play()──► Playing
//!             ├─► seek(t)        → Playing (gapless restart at t)
//!             ├─► natural end    → Loaded, on_ended fires once
//!             └─► stop()         → Loaded, offset 0
//! close() from any state         → Empty, device released
//! ```
//!
//! ## Timeline
//!
//! While playing, `current_time = context_now - anchor` where
//! `anchor = context_now_at_play - resume_offset`. While paused or loaded the
//! stored offset is reported. Both are clamped to `[0, duration]`.
//!
//! ## Ended callback
//!
//! Every node start bumps a generation counter, and so does every manual
//! stop. The natural-end hook captures the generation it was started under
//! and does nothing if it no longer matches, so a pause, seek, stop or close
//! that races the device thread still suppresses the callback.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    buffering::clip::AudioClip,
    codec,
    config::AudioConfig,
    error::Result,
    output::{EndedHook, GainStage, OutputContext, SourceNode},
    platform::AudioPlatform,
    service::SpeechSynthesizer,
};

/// Transport state of a [`PlaybackEngine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    /// Nothing loaded (initial state and after `close()`).
    Empty,
    /// A clip is loaded and not playing.
    Loaded,
    Playing,
    Paused,
}

struct EngineInner {
    context: Option<OutputContext>,
    gain: Option<Arc<GainStage>>,
    clip: Option<Arc<AudioClip>>,
    state: PlaybackState,
    /// Context time corresponding to clip offset 0 while playing.
    anchor: f64,
    /// Resume offset while paused or loaded.
    offset: f64,
    active: Option<SourceNode>,
    on_ended: Option<EndedHook>,
    generation: u64,
    volume: f32,
    muted: bool,
}

impl EngineInner {
    fn duration(&self) -> f64 {
        self.clip.as_ref().map_or(0.0, |c| c.duration())
    }

    fn current_time(&self) -> f64 {
        let t = match (self.state, self.context.as_ref()) {
            (PlaybackState::Playing, Some(ctx)) => ctx.current_time() - self.anchor,
            (PlaybackState::Empty, _) => 0.0,
            _ => self.offset,
        };
        t.clamp(0.0, self.duration())
    }

    fn effective_gain(&self) -> f32 {
        if self.muted {
            0.0
        } else {
            self.volume
        }
    }

    /// Stop the active node without firing its hook.
    fn halt_active(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        if let Some(node) = self.active.take() {
            if let Some(ctx) = self.context.as_ref() {
                ctx.stop_source(&node);
            }
            debug!(voice_id = node.id(), "playback node stopped");
        }
    }
}

/// Plays one decoded clip at a time with pause, seek and volume control.
///
/// `PlaybackEngine` is `Send + Sync`; all state sits behind one mutex that is
/// never held while a device is released or a user callback runs.
pub struct PlaybackEngine {
    platform: Arc<dyn AudioPlatform>,
    sample_rate: u32,
    channels: usize,
    inner: Arc<Mutex<EngineInner>>,
}

impl PlaybackEngine {
    /// Create an engine. No device is opened until the first `load`.
    pub fn new(platform: Arc<dyn AudioPlatform>, config: &AudioConfig) -> Self {
        Self {
            platform,
            sample_rate: config.playback_sample_rate,
            channels: config.channels.max(1),
            inner: Arc::new(Mutex::new(EngineInner {
                context: None,
                gain: None,
                clip: None,
                state: PlaybackState::Empty,
                anchor: 0.0,
                offset: 0.0,
                active: None,
                on_ended: None,
                generation: 0,
                volume: config.default_volume.clamp(0.0, 1.0),
                muted: false,
            })),
        }
    }

    /// Decode base64 PCM16 at the configured playback rate and make it the
    /// current clip. Returns its duration in seconds.
    ///
    /// # Errors
    /// `Decode` / `MalformedBuffer` from the codec (the previous clip is kept),
    /// or a device error if the output context cannot be opened.
    pub fn load(&self, base64_audio: &str) -> Result<f64> {
        let clip = codec::decode_clip(base64_audio, self.sample_rate, self.channels)?;
        self.load_clip(clip)
    }

    /// Synthesize `text` and load the resulting speech.
    ///
    /// # Errors
    /// Whatever the synthesizer reports, then the same errors as [`load`](Self::load).
    pub fn load_synthesized(&self, synthesizer: &dyn SpeechSynthesizer, text: &str) -> Result<f64> {
        let audio = synthesizer.synthesize(text)?;
        debug!(chars = text.len(), bytes = audio.len(), "speech synthesized");
        self.load(audio.trim())
    }

    /// Replace the current clip with an already decoded one.
    pub fn load_clip(&self, clip: AudioClip) -> Result<f64> {
        let mut inner = self.inner.lock();
        if inner.context.as_ref().map_or(true, OutputContext::is_closed) {
            let ctx = self.platform.open_output(self.sample_rate)?;
            let gain = ctx.create_gain(inner.effective_gain());
            info!(sample_rate = ctx.sample_rate(), "playback output opened");
            inner.context = Some(ctx);
            inner.gain = Some(gain);
        }

        inner.halt_active();
        inner.on_ended = None;
        let duration = clip.duration();
        inner.clip = Some(Arc::new(clip));
        inner.offset = 0.0;
        inner.state = PlaybackState::Loaded;
        info!(duration, "clip loaded");
        Ok(duration)
    }

    /// Start or resume playback from the stored offset.
    ///
    /// `on_ended` fires at most once, when this play reaches the natural end
    /// of the clip. A no-op when nothing is loaded. Calling `play` while
    /// already playing restarts from the current position with the new
    /// callback.
    pub fn play(&self, on_ended: Option<EndedHook>) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            PlaybackState::Empty => {
                debug!("play ignored: nothing loaded");
                return Ok(());
            }
            PlaybackState::Playing => {
                inner.offset = inner.current_time();
            }
            PlaybackState::Loaded | PlaybackState::Paused => {}
        }
        inner.on_ended = on_ended;
        self.start_node(&mut inner)
    }

    /// Freeze the timeline at the current position. Suppresses the ended
    /// callback. No-op unless playing.
    pub fn pause(&self) {
        let mut inner = self.inner.lock();
        if inner.state != PlaybackState::Playing {
            return;
        }
        inner.offset = inner.current_time();
        inner.halt_active();
        inner.state = PlaybackState::Paused;
        debug!(offset = inner.offset, "playback paused");
    }

    /// Move to `time` seconds, clamped to `[0, duration]`.
    ///
    /// While playing the active node is replaced by one starting at the new
    /// offset. The pending ended callback is dropped; the next `play` may
    /// register a new one.
    pub fn seek(&self, time: f64) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state == PlaybackState::Empty {
            return Ok(());
        }
        let time = if time.is_nan() { 0.0 } else { time };
        inner.offset = time.clamp(0.0, inner.duration());
        inner.on_ended = None;
        if inner.state == PlaybackState::Playing {
            return self.start_node(&mut inner);
        }
        Ok(())
    }

    /// Set the volume, clamped to `[0, 1]`. Applies immediately and persists
    /// across plays and loads.
    pub fn set_volume(&self, volume: f32) {
        let mut inner = self.inner.lock();
        inner.volume = if volume.is_nan() { 0.0 } else { volume.clamp(0.0, 1.0) };
        let gain = inner.effective_gain();
        if let Some(stage) = inner.gain.as_ref() {
            stage.set(gain);
        }
    }

    /// Stored volume, independent of mute.
    pub fn volume(&self) -> f32 {
        self.inner.lock().volume
    }

    /// Silence output without forgetting the stored volume.
    pub fn set_muted(&self, muted: bool) {
        let mut inner = self.inner.lock();
        inner.muted = muted;
        let gain = inner.effective_gain();
        if let Some(stage) = inner.gain.as_ref() {
            stage.set(gain);
        }
    }

    pub fn is_muted(&self) -> bool {
        self.inner.lock().muted
    }

    /// Stop playback and rewind to 0. The clip stays loaded.
    pub fn stop(&self) {
        let mut inner = self.inner.lock();
        if inner.state == PlaybackState::Empty {
            return;
        }
        inner.halt_active();
        inner.on_ended = None;
        inner.offset = 0.0;
        inner.state = PlaybackState::Loaded;
    }

    /// Playback position in seconds. Never blocks on the device.
    pub fn current_time(&self) -> f64 {
        self.inner.lock().current_time()
    }

    /// Duration of the loaded clip, `0.0` when empty.
    pub fn duration(&self) -> f64 {
        self.inner.lock().duration()
    }

    pub fn state(&self) -> PlaybackState {
        self.inner.lock().state
    }

    pub fn is_playing(&self) -> bool {
        self.state() == PlaybackState::Playing
    }

    /// Stop any playing node, drop the clip and release the output device.
    /// Idempotent.
    pub fn close(&self) {
        let context = {
            let mut inner = self.inner.lock();
            inner.halt_active();
            inner.on_ended = None;
            inner.clip = None;
            inner.gain = None;
            inner.offset = 0.0;
            inner.state = PlaybackState::Empty;
            inner.context.take()
        };
        if let Some(ctx) = context {
            ctx.close();
            info!("playback output released");
        }
    }

    /// Replace the active node with a new one reading from `inner.offset`.
    ///
    /// If the context refuses the new node, a playing engine falls back to
    /// `Paused` at `inner.offset` so the timeline stops with the audio.
    fn start_node(&self, inner: &mut EngineInner) -> Result<()> {
        inner.halt_active();
        let (Some(ctx), Some(gain), Some(clip)) =
            (inner.context.as_ref(), inner.gain.as_ref(), inner.clip.as_ref())
        else {
            return Ok(());
        };

        let now = ctx.current_time();
        let hook = natural_end_hook(Arc::downgrade(&self.inner), inner.generation);
        let node = match ctx.start_source(Arc::clone(clip), gain, now, inner.offset, Some(hook)) {
            Ok(node) => node,
            Err(e) => {
                inner.on_ended = None;
                if inner.state == PlaybackState::Playing {
                    inner.state = PlaybackState::Paused;
                }
                warn!(offset = inner.offset, error = %e, "playback node not started");
                return Err(e);
            }
        };
        debug!(voice_id = node.id(), offset = inner.offset, "playback node started");

        inner.anchor = now - inner.offset;
        inner.active = Some(node);
        inner.state = PlaybackState::Playing;
        Ok(())
    }
}

/// Hook run by the output context when a playback node ends naturally.
fn natural_end_hook(inner: Weak<Mutex<EngineInner>>, generation: u64) -> EndedHook {
    Box::new(move || {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let callback = {
            let mut guard = inner.lock();
            if guard.generation != generation || guard.state != PlaybackState::Playing {
                return;
            }
            guard.active = None;
            guard.offset = 0.0;
            guard.state = PlaybackState::Loaded;
            guard.on_ended.take()
        };
        debug!("playback reached natural end");
        if let Some(callback) = callback {
            callback();
        }
    })
}

impl Drop for PlaybackEngine {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for PlaybackEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("PlaybackEngine")
            .field("state", &inner.state)
            .field("offset", &inner.offset)
            .field("volume", &inner.volume)
            .field("muted", &inner.muted)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::OfflinePlatform;
    use approx::assert_abs_diff_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn engine() -> (OfflinePlatform, PlaybackEngine) {
        let platform = OfflinePlatform::new();
        let engine = PlaybackEngine::new(Arc::new(platform.clone()), &AudioConfig::default());
        (platform, engine)
    }

    fn tone_b64(secs: f64) -> String {
        let frames = (secs * 24_000.0) as usize;
        let samples: Vec<f32> = (0..frames).map(|i| ((i as f32) * 0.05).sin() * 0.4).collect();
        codec::encode_frame(&samples)
    }

    fn counter() -> (Arc<AtomicUsize>, EndedHook) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        (
            count,
            Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        )
    }

    #[test]
    fn empty_engine_reports_zero_and_ignores_play() {
        let (platform, engine) = engine();
        assert_eq!(engine.state(), PlaybackState::Empty);
        assert_eq!(engine.duration(), 0.0);
        engine.play(None).unwrap();
        assert_eq!(engine.state(), PlaybackState::Empty);
        assert_eq!(platform.outputs_opened(), 0);
    }

    #[test]
    fn load_opens_output_once_and_resets_offset() {
        let (platform, engine) = engine();
        assert_abs_diff_eq!(engine.load(&tone_b64(1.0)).unwrap(), 1.0, epsilon = 1e-9);
        engine.seek(0.5).unwrap();
        assert_abs_diff_eq!(engine.current_time(), 0.5, epsilon = 1e-9);
        engine.load(&tone_b64(0.5)).unwrap();
        assert_eq!(engine.current_time(), 0.0);
        assert_eq!(platform.outputs_opened(), 1);
    }

    struct ToneSynthesizer;

    impl SpeechSynthesizer for ToneSynthesizer {
        fn synthesize(&self, text: &str) -> Result<String> {
            if text.trim().is_empty() {
                return Err(crate::SadaError::EmptyResponse);
            }
            // Ten milliseconds per character, with a trailing newline as
            // services often send.
            Ok(format!("{}\n", tone_b64(text.len() as f64 * 0.01)))
        }
    }

    #[test]
    fn synthesized_speech_loads_and_plays() {
        let (platform, engine) = engine();
        let duration = engine.load_synthesized(&ToneSynthesizer, &"a".repeat(50)).unwrap();
        assert_abs_diff_eq!(duration, 0.5, epsilon = 1e-9);
        let (fired, hook) = counter();
        engine.play(Some(hook)).unwrap();
        platform.advance(0.6);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(engine.state(), PlaybackState::Loaded);
    }

    #[test]
    fn synthesis_failure_keeps_previous_clip() {
        let (_platform, engine) = engine();
        engine.load(&tone_b64(1.0)).unwrap();
        assert!(matches!(
            engine.load_synthesized(&ToneSynthesizer, "  "),
            Err(crate::SadaError::EmptyResponse)
        ));
        assert_abs_diff_eq!(engine.duration(), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn bad_payload_keeps_previous_clip() {
        let (_platform, engine) = engine();
        engine.load(&tone_b64(1.0)).unwrap();
        assert!(engine.load("AAA").is_err());
        assert_abs_diff_eq!(engine.duration(), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn pause_suppresses_callback_and_freezes_time() {
        let (platform, engine) = engine();
        engine.load(&tone_b64(0.5)).unwrap();
        let (fired, hook) = counter();
        engine.play(Some(hook)).unwrap();
        platform.advance(0.2);
        engine.pause();
        let paused_at = engine.current_time();
        assert_abs_diff_eq!(paused_at, 0.2, epsilon = 0.02);
        platform.advance(1.0);
        assert_eq!(engine.current_time(), paused_at);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn seek_while_playing_suppresses_callback() {
        let (platform, engine) = engine();
        engine.load(&tone_b64(1.0)).unwrap();
        let (fired, hook) = counter();
        engine.play(Some(hook)).unwrap();
        platform.advance(0.1);
        engine.seek(0.8).unwrap();
        assert!(engine.is_playing());
        assert_abs_diff_eq!(engine.current_time(), 0.8, epsilon = 1e-3);
        platform.advance(0.5);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(engine.state(), PlaybackState::Loaded);
    }

    #[test]
    fn failed_restart_pauses_at_requested_offset() {
        let (platform, engine) = engine();
        engine.load(&tone_b64(1.0)).unwrap();
        engine.play(None).unwrap();
        // Without rendering, every restart queues another mixer command.
        let mut failed = false;
        for _ in 0..2_000 {
            if engine.seek(0.5).is_err() {
                failed = true;
                break;
            }
        }
        assert!(failed);
        assert_eq!(engine.state(), PlaybackState::Paused);
        assert_abs_diff_eq!(engine.current_time(), 0.5, epsilon = 1e-9);

        let out = platform.advance(0.2);
        assert!(out.iter().all(|&s| s == 0.0));
        assert_abs_diff_eq!(engine.current_time(), 0.5, epsilon = 1e-9);

        engine.play(None).unwrap();
        let out = platform.advance(0.1);
        assert!(out.iter().any(|&s| s != 0.0));
        assert!(engine.is_playing());
        assert_abs_diff_eq!(engine.current_time(), 0.6, epsilon = 0.02);
    }

    #[test]
    fn seek_is_clamped() {
        let (_platform, engine) = engine();
        engine.load(&tone_b64(1.0)).unwrap();
        engine.seek(5.0).unwrap();
        assert_abs_diff_eq!(engine.current_time(), 1.0, epsilon = 1e-9);
        engine.seek(-2.0).unwrap();
        assert_eq!(engine.current_time(), 0.0);
    }

    #[test]
    fn volume_is_clamped_and_survives_mute() {
        let (_platform, engine) = engine();
        engine.set_volume(1.7);
        assert_eq!(engine.volume(), 1.0);
        engine.set_volume(-0.3);
        assert_eq!(engine.volume(), 0.0);
        engine.set_volume(0.4);
        engine.set_muted(true);
        assert!(engine.is_muted());
        assert_abs_diff_eq!(engine.volume(), 0.4);
    }

    #[test]
    fn volume_applies_to_rendered_output() {
        let (platform, engine) = engine();
        let ones = codec::encode_frame(&vec![0.5; 2_400]);
        engine.load(&ones).unwrap();
        engine.set_volume(0.5);
        engine.play(None).unwrap();
        let out = platform.advance(0.01);
        assert_abs_diff_eq!(out[10], 0.25, epsilon = 1e-3);
        engine.set_muted(true);
        let out = platform.advance(0.01);
        assert_eq!(out[10], 0.0);
    }

    #[test]
    fn stop_rewinds_and_keeps_clip() {
        let (platform, engine) = engine();
        engine.load(&tone_b64(1.0)).unwrap();
        let (fired, hook) = counter();
        engine.play(Some(hook)).unwrap();
        platform.advance(0.3);
        engine.stop();
        assert_eq!(engine.state(), PlaybackState::Loaded);
        assert_eq!(engine.current_time(), 0.0);
        platform.advance(1.0);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn close_twice_releases_output() {
        let (platform, engine) = engine();
        engine.load(&tone_b64(0.2)).unwrap();
        engine.play(None).unwrap();
        engine.close();
        engine.close();
        assert_eq!(engine.state(), PlaybackState::Empty);
        platform.advance(0.01);
        assert_eq!(platform.open_outputs(), 0);
    }

    #[test]
    fn reload_after_close_reopens_output() {
        let (platform, engine) = engine();
        engine.load(&tone_b64(0.2)).unwrap();
        engine.close();
        engine.load(&tone_b64(0.2)).unwrap();
        assert_eq!(platform.outputs_opened(), 2);
        assert_eq!(engine.state(), PlaybackState::Loaded);
    }
}
