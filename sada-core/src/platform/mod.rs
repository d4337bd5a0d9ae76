//! Platform audio capability.
//!
//! The engine never touches a host audio API directly; it asks an
//! [`AudioPlatform`] for output contexts and microphone streams. Production
//! code uses [`CpalPlatform`]; tests use [`OfflinePlatform`], whose clock only
//! moves when the test renders frames.

pub mod offline;

pub use offline::OfflinePlatform;

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, OnceLock,
};

use crossbeam_channel::Receiver;

use crate::{
    buffering::AudioProducer,
    error::{Result, SadaError},
    output::OutputContext,
};

/// What the capture pipeline asks of a microphone.
#[derive(Debug, Clone, Default)]
pub struct InputRequest {
    /// Rate the pipeline wants to emit. Devices may run at another rate;
    /// the pipeline resamples.
    pub sample_rate: u32,
    /// Input device name to prefer over the system default.
    pub preferred_device: Option<String>,
}

/// A live microphone stream.
///
/// **Not `Send`** on most hosts: the underlying stream is bound to the
/// thread that opened it. Open and drop it on the capture thread.
pub struct OpenedInput {
    /// Rate at which mono samples are pushed into the producer.
    pub sample_rate: u32,
    /// Asynchronous stream failures reported by the host.
    pub errors: Receiver<String>,
    /// Keeps the host stream alive; dropping it releases the device.
    _guard: Box<dyn std::any::Any>,
}

impl OpenedInput {
    pub fn new(sample_rate: u32, errors: Receiver<String>, guard: Box<dyn std::any::Any>) -> Self {
        Self {
            sample_rate,
            errors,
            _guard: guard,
        }
    }
}

/// Exclusive-ownership flag for the microphone.
///
/// At most one capture holds a [`MicrophoneClaim`] per lock; a second
/// `try_claim` fails with `DeviceBusy` instead of opening another stream.
#[derive(Debug, Clone, Default)]
pub struct MicrophoneLock(Arc<AtomicBool>);

impl MicrophoneLock {
    pub fn try_claim(&self) -> Result<MicrophoneClaim> {
        if self
            .0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SadaError::DeviceBusy);
        }
        Ok(MicrophoneClaim(Arc::clone(&self.0)))
    }

    pub fn is_claimed(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// RAII claim on the microphone; released on drop.
#[derive(Debug)]
pub struct MicrophoneClaim(Arc<AtomicBool>);

impl Drop for MicrophoneClaim {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Host audio operations the engine relies on.
pub trait AudioPlatform: Send + Sync + 'static {
    /// Open an output context at (or as close as possible to) `sample_rate`.
    fn open_output(&self, sample_rate: u32) -> Result<OutputContext>;

    /// Open a microphone pushing mono f32 samples into `producer` while
    /// `running` is true. Called on the capture thread.
    fn open_input(
        &self,
        request: &InputRequest,
        producer: AudioProducer,
        running: Arc<AtomicBool>,
    ) -> Result<OpenedInput>;

    /// Exclusive microphone lock shared by all captures on this platform.
    fn microphone(&self) -> &MicrophoneLock;
}

/// The host has one physical microphone, so every [`CpalPlatform`] shares
/// this lock regardless of how many instances the process builds.
fn host_microphone() -> &'static MicrophoneLock {
    static MICROPHONE: OnceLock<MicrophoneLock> = OnceLock::new();
    MICROPHONE.get_or_init(MicrophoneLock::default)
}

/// cpal-backed platform for real devices.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpalPlatform;

impl CpalPlatform {
    pub fn new() -> Self {
        Self
    }
}

#[cfg(feature = "audio-cpal")]
impl AudioPlatform for CpalPlatform {
    fn open_output(&self, sample_rate: u32) -> Result<OutputContext> {
        crate::audio::output::open_default_output(sample_rate)
    }

    fn open_input(
        &self,
        request: &InputRequest,
        producer: AudioProducer,
        running: Arc<AtomicBool>,
    ) -> Result<OpenedInput> {
        let capture = crate::audio::AudioCapture::open_with_preference(
            producer,
            running,
            request.preferred_device.as_deref(),
            request.sample_rate,
        )?;
        Ok(capture.into_opened())
    }

    fn microphone(&self) -> &MicrophoneLock {
        host_microphone()
    }
}

/// Stub when the `audio-cpal` feature is disabled.
#[cfg(not(feature = "audio-cpal"))]
impl AudioPlatform for CpalPlatform {
    fn open_output(&self, _sample_rate: u32) -> Result<OutputContext> {
        Err(SadaError::DeviceUnavailable(
            "compiled without audio-cpal feature".into(),
        ))
    }

    fn open_input(
        &self,
        _request: &InputRequest,
        _producer: AudioProducer,
        _running: Arc<AtomicBool>,
    ) -> Result<OpenedInput> {
        Err(SadaError::DeviceUnavailable(
            "compiled without audio-cpal feature".into(),
        ))
    }

    fn microphone(&self) -> &MicrophoneLock {
        host_microphone()
    }
}
