//! Deterministic platform with no real devices.
//!
//! Output contexts are rendered on demand by [`OfflinePlatform::advance`],
//! which is the only thing that moves their clocks. Microphone input is
//! whatever the caller feeds through [`OfflinePlatform::feed_input`].

use std::sync::{
    atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
    Arc,
};

use crossbeam_channel::Sender;
use parking_lot::Mutex;

use super::{AudioPlatform, InputRequest, MicrophoneLock, OpenedInput};
use crate::{
    buffering::{AudioProducer, Producer},
    error::{Result, SadaError},
    output::{ContextShared, Mixer, OutputContext},
};

/// Frames rendered per simulated device callback.
pub const BLOCK_FRAMES: usize = 256;

/// Scripted microphone failure returned by `open_input`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputFailure {
    PermissionDenied,
    Unavailable,
}

#[derive(Default)]
struct OfflineInner {
    mixers: Mutex<Vec<(Arc<ContextShared>, Mixer)>>,
    input: Mutex<Option<(AudioProducer, Arc<AtomicBool>)>>,
    input_errors: Mutex<Option<Sender<String>>>,
    input_failure: Mutex<Option<InputFailure>>,
    output_unavailable: AtomicBool,
    /// Device rate reported for input; 0 means "whatever was requested".
    input_rate: AtomicU32,
    outputs_opened: AtomicUsize,
    inputs_opened: AtomicUsize,
    microphone: MicrophoneLock,
}

/// Offline [`AudioPlatform`]. Cheap to clone; clones share devices.
#[derive(Clone, Default)]
pub struct OfflinePlatform {
    inner: Arc<OfflineInner>,
}

struct OfflineInputGuard(Arc<OfflineInner>);

impl Drop for OfflineInputGuard {
    fn drop(&mut self) {
        self.0.input.lock().take();
        self.0.input_errors.lock().take();
    }
}

impl OfflinePlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent microphone opens fail.
    pub fn fail_input_with(&self, failure: Option<InputFailure>) {
        *self.inner.input_failure.lock() = failure;
    }

    /// Make subsequent output opens fail with `DeviceUnavailable`.
    pub fn fail_output(&self, fail: bool) {
        self.inner.output_unavailable.store(fail, Ordering::Release);
    }

    /// Report inputs at `rate` regardless of the requested rate.
    pub fn set_input_rate(&self, rate: u32) {
        self.inner.input_rate.store(rate, Ordering::Release);
    }

    /// Push samples into the open microphone. Returns how many were accepted
    /// (zero when no stream is open or it has been stopped).
    pub fn feed_input(&self, samples: &[f32]) -> usize {
        let mut slot = self.inner.input.lock();
        match slot.as_mut() {
            Some((producer, running)) if running.load(Ordering::Acquire) => {
                producer.push_slice(samples)
            }
            _ => 0,
        }
    }

    /// Simulate an asynchronous stream failure on the open microphone.
    pub fn fail_input_stream(&self, message: &str) -> bool {
        match self.inner.input_errors.lock().as_ref() {
            Some(tx) => tx.try_send(message.to_string()).is_ok(),
            None => false,
        }
    }

    pub fn is_input_open(&self) -> bool {
        self.inner.input.lock().is_some()
    }

    pub fn outputs_opened(&self) -> usize {
        self.inner.outputs_opened.load(Ordering::Acquire)
    }

    pub fn inputs_opened(&self) -> usize {
        self.inner.inputs_opened.load(Ordering::Acquire)
    }

    /// Output contexts that are still open.
    pub fn open_outputs(&self) -> usize {
        self.inner
            .mixers
            .lock()
            .iter()
            .filter(|(shared, _)| !shared.is_closed())
            .count()
    }

    /// Advance every open output context by `secs` seconds of rendered audio,
    /// in device-sized blocks, dispatching ended hooks after each block.
    /// Returns the mono mix of the first open context.
    pub fn advance(&self, secs: f64) -> Vec<f32> {
        let mut captured = Vec::new();
        let mut remaining: Vec<usize> = self
            .inner
            .mixers
            .lock()
            .iter()
            .map(|(shared, _)| (secs.max(0.0) * shared.sample_rate() as f64).round() as usize)
            .collect();

        loop {
            let mut shareds = Vec::new();
            {
                let mut mixers = self.inner.mixers.lock();
                for (idx, (shared, mixer)) in mixers.iter_mut().enumerate() {
                    let Some(left) = remaining.get_mut(idx) else {
                        continue;
                    };
                    if *left == 0 {
                        continue;
                    }
                    let n = (*left).min(BLOCK_FRAMES);
                    let out = mixer.render_frames(n);
                    if idx == 0 {
                        captured.extend_from_slice(&out);
                    }
                    *left -= n;
                    shareds.push(Arc::clone(shared));
                }
            }
            if shareds.is_empty() {
                break;
            }
            for shared in shareds {
                while let Ok(id) = shared.ended_receiver().try_recv() {
                    shared.fire_ended(id);
                }
            }
        }

        self.inner
            .mixers
            .lock()
            .retain(|(shared, _)| !shared.is_closed());
        captured
    }
}

impl AudioPlatform for OfflinePlatform {
    fn open_output(&self, sample_rate: u32) -> Result<OutputContext> {
        if self.inner.output_unavailable.load(Ordering::Acquire) {
            return Err(SadaError::DeviceUnavailable(
                "offline output disabled".into(),
            ));
        }
        let (ctx, mixer) = OutputContext::pair(sample_rate);
        self.inner.mixers.lock().push((ctx.shared(), mixer));
        self.inner.outputs_opened.fetch_add(1, Ordering::AcqRel);
        Ok(ctx)
    }

    fn open_input(
        &self,
        request: &InputRequest,
        producer: AudioProducer,
        running: Arc<AtomicBool>,
    ) -> Result<OpenedInput> {
        match *self.inner.input_failure.lock() {
            Some(InputFailure::PermissionDenied) => {
                return Err(SadaError::PermissionDenied(
                    "offline microphone denied".into(),
                ))
            }
            Some(InputFailure::Unavailable) => {
                return Err(SadaError::DeviceUnavailable(
                    "offline microphone missing".into(),
                ))
            }
            None => {}
        }

        let (err_tx, err_rx) = crossbeam_channel::bounded(8);
        *self.inner.input.lock() = Some((producer, running));
        *self.inner.input_errors.lock() = Some(err_tx);
        self.inner.inputs_opened.fetch_add(1, Ordering::AcqRel);

        let rate = match self.inner.input_rate.load(Ordering::Acquire) {
            0 => request.sample_rate,
            r => r,
        };
        Ok(OpenedInput::new(
            rate,
            err_rx,
            Box::new(OfflineInputGuard(Arc::clone(&self.inner))),
        ))
    }

    fn microphone(&self) -> &MicrophoneLock {
        &self.inner.microphone
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffering::create_audio_ring;

    #[test]
    fn advance_moves_each_context_by_its_own_rate() {
        let platform = OfflinePlatform::new();
        let a = platform.open_output(24_000).unwrap();
        let b = platform.open_output(16_000).unwrap();
        platform.advance(0.5);
        assert!((a.current_time() - 0.5).abs() < 1e-9);
        assert!((b.current_time() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn closed_contexts_are_pruned() {
        let platform = OfflinePlatform::new();
        let ctx = platform.open_output(24_000).unwrap();
        assert_eq!(platform.open_outputs(), 1);
        drop(ctx);
        platform.advance(0.01);
        assert_eq!(platform.open_outputs(), 0);
        assert_eq!(platform.outputs_opened(), 1);
    }

    #[test]
    fn scripted_input_failure() {
        let platform = OfflinePlatform::new();
        platform.fail_input_with(Some(InputFailure::PermissionDenied));
        let (producer, _consumer) = create_audio_ring();
        let err = platform
            .open_input(
                &InputRequest::default(),
                producer,
                Arc::new(AtomicBool::new(true)),
            )
            .err()
            .unwrap();
        assert!(matches!(err, SadaError::PermissionDenied(_)));
    }

    #[test]
    fn dropping_opened_input_releases_microphone() {
        let platform = OfflinePlatform::new();
        let (producer, _consumer) = create_audio_ring();
        let request = InputRequest {
            sample_rate: 16_000,
            preferred_device: None,
        };
        let opened = platform
            .open_input(&request, producer, Arc::new(AtomicBool::new(true)))
            .unwrap();
        assert_eq!(opened.sample_rate, 16_000);
        assert_eq!(platform.feed_input(&[0.1; 10]), 10);
        drop(opened);
        assert!(!platform.is_input_open());
        assert_eq!(platform.feed_input(&[0.1; 10]), 0);
    }
}
