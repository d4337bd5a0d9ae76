//! Render-thread side of an [`OutputContext`](super::OutputContext).
//!
//! # Realtime contract
//!
//! `render` runs inside the device callback. It never blocks: commands arrive
//! over a bounded crossbeam channel drained with `try_recv`, stop requests and
//! gains are atomics, and natural ends are reported with `try_send`.

use std::sync::{atomic::Ordering, Arc};

use crossbeam_channel::{Receiver, Sender};
use tracing::warn;

use super::{ContextShared, MixerCommand, Voice, VoiceId};

/// Voices allocated up front so the first few starts do not reallocate.
const VOICE_CAPACITY: usize = 64;

pub struct Mixer {
    shared: Arc<ContextShared>,
    commands: Receiver<MixerCommand>,
    ended_tx: Sender<VoiceId>,
    voices: Vec<Voice>,
}

impl Mixer {
    pub(crate) fn new(
        shared: Arc<ContextShared>,
        commands: Receiver<MixerCommand>,
        ended_tx: Sender<VoiceId>,
    ) -> Self {
        Self {
            shared,
            commands,
            ended_tx,
            voices: Vec::with_capacity(VOICE_CAPACITY),
        }
    }

    /// Context sample rate this mixer renders at.
    pub fn sample_rate(&self) -> u32 {
        self.shared.sample_rate()
    }

    /// True once the owning context has been closed.
    pub fn is_detached(&self) -> bool {
        self.shared.is_closed()
    }

    /// Number of voices currently mixed (started or waiting to start).
    pub fn active_voices(&self) -> usize {
        self.voices.len()
    }

    /// Render one mono block into `out` and advance the context clock by
    /// `out.len()` frames.
    pub fn render(&mut self, out: &mut [f32]) {
        self.drain_commands();
        out.fill(0.0);

        if self.shared.is_closed() {
            self.voices.clear();
            self.shared.advance(out.len() as u64);
            return;
        }

        let base = self.shared.frames_rendered();
        let block = out.len();

        for voice in &mut self.voices {
            if voice.state.stopped.load(Ordering::Acquire) {
                continue;
            }
            let lead = voice.start_frame.saturating_sub(base);
            if lead >= block as u64 {
                continue;
            }
            let frames = voice.clip.frame_count() as f64;
            let gain = voice.gain.get();
            for slot in out.iter_mut().skip(lead as usize) {
                if voice.position >= frames {
                    break;
                }
                *slot += interpolate(voice) * gain;
                voice.position += voice.step;
            }
        }

        let ended_tx = &self.ended_tx;
        self.voices.retain(|voice| {
            if voice.state.stopped.load(Ordering::Acquire) {
                voice.state.finished.store(true, Ordering::Release);
                return false;
            }
            let started = voice.start_frame < base + block as u64;
            if started && voice.position >= voice.clip.frame_count() as f64 {
                voice.state.finished.store(true, Ordering::Release);
                if ended_tx.try_send(voice.id).is_err() {
                    warn!(voice_id = voice.id, "ended notification dropped");
                }
                return false;
            }
            true
        });

        self.shared.advance(block as u64);
    }

    /// Render and discard `frames` frames. Offline contexts use this to move
    /// the clock forward.
    pub fn render_frames(&mut self, frames: usize) -> Vec<f32> {
        let mut out = vec![0f32; frames];
        self.render(&mut out);
        out
    }

    fn drain_commands(&mut self) {
        while let Ok(cmd) = self.commands.try_recv() {
            match cmd {
                MixerCommand::Start(voice) => self.voices.push(voice),
                MixerCommand::StopAll => {
                    for voice in self.voices.drain(..) {
                        voice.state.stopped.store(true, Ordering::Release);
                        voice.state.finished.store(true, Ordering::Release);
                    }
                }
            }
        }
    }
}

/// Linear interpolation of the voice's clip at its fractional read position.
#[inline]
fn interpolate(voice: &Voice) -> f32 {
    let idx = voice.position.floor();
    let frac = (voice.position - idx) as f32;
    let idx = idx as usize;
    let a = voice.clip.mono_sample(idx);
    if frac == 0.0 {
        return a;
    }
    let b = voice.clip.mono_sample(idx + 1);
    a + (b - a) * frac
}
