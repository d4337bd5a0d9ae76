//! cpal device backends.
//!
//! # Design constraints
//!
//! cpal callbacks run on an OS audio thread at elevated priority. They
//! **must not** allocate in steady state, block on a mutex, or perform I/O.
//! Input writes into an SPSC ring producer (`push_slice` is lock-free);
//! output renders through a [`Mixer`](crate::output::Mixer) whose inputs are
//! atomics and a non-blocking channel.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on
//! macOS). Input streams are opened on the capture thread; output streams
//! live on a dedicated device thread owned by the output context.

pub mod device;
#[cfg(feature = "audio-cpal")]
pub mod output;
pub mod resample;
pub mod wav;

#[cfg(feature = "audio-cpal")]
use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    FromSample, SampleFormat, SampleRate, SizedSample, Stream, StreamConfig,
    SupportedStreamConfig, SupportedStreamConfigRange,
};

#[cfg(feature = "audio-cpal")]
use crossbeam_channel::Sender;

#[cfg(feature = "audio-cpal")]
use crate::{
    buffering::{AudioProducer, Producer},
    platform::OpenedInput,
};
use crate::error::SadaError;
#[cfg(feature = "audio-cpal")]
use crate::error::Result;
#[cfg(feature = "audio-cpal")]
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
#[cfg(feature = "audio-cpal")]
use tracing::{error, info, warn};

/// Map a host error message onto the device-access taxonomy.
///
/// cpal has no dedicated permission variant; hosts surface denials as
/// backend-specific text.
pub fn classify_device_error(message: String) -> SadaError {
    let lowered = message.to_ascii_lowercase();
    let denied = ["permission", "denied", "not authorized", "unauthorized"]
        .iter()
        .any(|k| lowered.contains(k));
    if denied {
        SadaError::PermissionDenied(message)
    } else {
        SadaError::DeviceUnavailable(message)
    }
}

/// Pick a supported config that runs natively at `rate`, preferring f32.
#[cfg(feature = "audio-cpal")]
pub(crate) fn pick_native_config(
    ranges: impl Iterator<Item = SupportedStreamConfigRange>,
    rate: u32,
) -> Option<SupportedStreamConfig> {
    let mut candidates: Vec<SupportedStreamConfigRange> = ranges
        .filter(|r| r.min_sample_rate().0 <= rate && rate <= r.max_sample_rate().0)
        .filter(|r| {
            matches!(
                r.sample_format(),
                SampleFormat::F32 | SampleFormat::I16 | SampleFormat::U16
            )
        })
        .collect();
    candidates.sort_by_key(|r| (r.sample_format() != SampleFormat::F32, r.channels()));
    candidates
        .into_iter()
        .next()
        .map(|r| r.with_sample_rate(SampleRate(rate)))
}

/// Handle to an open microphone stream.
///
/// **Not `Send`**. Create and drop on the same OS thread.
#[cfg(feature = "audio-cpal")]
pub struct AudioCapture {
    stream: Stream,
    errors: crossbeam_channel::Receiver<String>,
    /// Rate of the mono samples pushed into the ring (Hz).
    pub sample_rate: u32,
}

#[cfg(feature = "audio-cpal")]
impl AudioCapture {
    /// Open an input device by preferred name, otherwise the default input
    /// device, otherwise the first available one. Runs natively at
    /// `desired_rate` when the device supports it.
    ///
    /// # Errors
    /// `PermissionDenied` / `DeviceUnavailable` when the host refuses or has
    /// no microphone, `AudioStream` if the stream cannot be built.
    pub fn open_with_preference(
        producer: AudioProducer,
        running: Arc<AtomicBool>,
        preferred_device_name: Option<&str>,
        desired_rate: u32,
    ) -> Result<Self> {
        let host = cpal::default_host();

        let preferred = preferred_device_name.and_then(|wanted| {
            let found = host
                .input_devices()
                .ok()?
                .find(|d| d.name().map(|n| n == wanted).unwrap_or(false));
            if found.is_none() {
                warn!(wanted, "preferred input device not found, falling back");
            }
            found
        });

        let device = match preferred.or_else(|| host.default_input_device()) {
            Some(device) => device,
            None => host
                .input_devices()
                .map_err(|e| classify_device_error(e.to_string()))?
                .next()
                .ok_or_else(|| SadaError::DeviceUnavailable("no input device found".into()))?,
        };

        info!(
            device = device.name().unwrap_or_default().as_str(),
            "opening input device"
        );

        let supported = match device
            .supported_input_configs()
            .ok()
            .and_then(|ranges| pick_native_config(ranges, desired_rate))
        {
            Some(native) => native,
            None => device
                .default_input_config()
                .map_err(|e| classify_device_error(e.to_string()))?,
        };

        let sample_rate = supported.sample_rate().0;
        let config = StreamConfig {
            channels: supported.channels(),
            sample_rate: SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };
        info!(sample_rate, channels = config.channels, "input config selected");

        let (err_tx, err_rx) = crossbeam_channel::bounded(8);
        let stream = match supported.sample_format() {
            SampleFormat::F32 => build_mono_input::<f32>(&device, &config, producer, running, err_tx),
            SampleFormat::I16 => build_mono_input::<i16>(&device, &config, producer, running, err_tx),
            SampleFormat::U16 => build_mono_input::<u16>(&device, &config, producer, running, err_tx),
            SampleFormat::U8 => build_mono_input::<u8>(&device, &config, producer, running, err_tx),
            fmt => {
                return Err(SadaError::AudioStream(format!(
                    "unsupported sample format: {fmt:?}"
                )))
            }
        }
        .map_err(map_build_error)?;

        stream
            .play()
            .map_err(|e| classify_device_error(e.to_string()))?;

        Ok(Self {
            stream,
            errors: err_rx,
            sample_rate,
        })
    }

    /// Hand the stream over as a platform-neutral [`OpenedInput`].
    pub fn into_opened(self) -> OpenedInput {
        OpenedInput::new(self.sample_rate, self.errors, Box::new(self.stream))
    }
}

#[cfg(feature = "audio-cpal")]
pub(crate) fn map_build_error(e: cpal::BuildStreamError) -> SadaError {
    match e {
        cpal::BuildStreamError::DeviceNotAvailable => {
            SadaError::DeviceUnavailable("device no longer available".into())
        }
        cpal::BuildStreamError::BackendSpecific { err } => classify_device_error(err.description),
        other => SadaError::AudioStream(other.to_string()),
    }
}

/// Build an input stream that averages interleaved channels down to mono f32
/// and pushes into `producer`.
#[cfg(feature = "audio-cpal")]
fn build_mono_input<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut producer: AudioProducer,
    running: Arc<AtomicBool>,
    errors: Sender<String>,
) -> std::result::Result<Stream, cpal::BuildStreamError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let ch = config.channels.max(1) as usize;
    let mut mono: Vec<f32> = Vec::new();
    device.build_input_stream(
        config,
        move |data: &[T], _info: &cpal::InputCallbackInfo| {
            if !running.load(Ordering::Relaxed) {
                return;
            }
            let frames = data.len() / ch;
            mono.resize(frames, 0.0);
            for (slot, frame) in mono.iter_mut().zip(data.chunks_exact(ch)) {
                let sum: f32 = frame.iter().map(|s| (*s).to_sample::<f32>()).sum();
                *slot = sum / ch as f32;
            }
            let written = producer.push_slice(&mono);
            if written < mono.len() {
                warn!("capture ring full: dropped {} frames", mono.len() - written);
            }
        },
        move |err| {
            error!("input stream error: {err}");
            let _ = errors.try_send(err.to_string());
        },
        None,
    )
}
