//! cpal output device behind an [`OutputContext`].
//!
//! The stream lives on a dedicated `sada-output` thread because
//! `cpal::Stream` is `!Send`. That thread also dispatches ended hooks, so
//! user callbacks never run inside the realtime callback. A sync oneshot
//! reports the open result back to the caller, the same handshake the
//! capture thread uses.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    mpsc, Arc,
};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    FromSample, SampleFormat, SampleRate, SizedSample, Stream, StreamConfig,
};
use crossbeam_channel::RecvTimeoutError;
use tracing::{error, info, warn};

use super::{classify_device_error, map_build_error, pick_native_config};
use crate::{
    error::{Result, SadaError},
    output::{Mixer, OutputContext, OutputDevice},
};

/// How often the device thread wakes to check for shutdown.
const DISPATCH_TICK: Duration = Duration::from_millis(20);

struct CpalOutputDevice {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl OutputDevice for CpalOutputDevice {
    fn release(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            // An ended hook closing its own context would otherwise join itself.
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                error!("output device thread panicked");
            }
        }
    }
}

/// Open the default output device, preferring a native `sample_rate`.
///
/// Blocks until the stream is playing (or failed to open).
pub fn open_default_output(sample_rate: u32) -> Result<OutputContext> {
    let running = Arc::new(AtomicBool::new(true));
    let thread_running = Arc::clone(&running);
    let (open_tx, open_rx) = mpsc::channel::<Result<OutputContext>>();

    let handle = thread::Builder::new()
        .name("sada-output".into())
        .spawn(move || {
            let (stream, shared) = match build_output(sample_rate) {
                Ok((ctx, stream)) => {
                    let shared = ctx.shared();
                    if open_tx.send(Ok(ctx)).is_err() {
                        return;
                    }
                    (stream, shared)
                }
                Err(e) => {
                    let _ = open_tx.send(Err(e));
                    return;
                }
            };

            while thread_running.load(Ordering::Acquire) {
                match shared.ended_receiver().recv_timeout(DISPATCH_TICK) {
                    Ok(id) => {
                        shared.fire_ended(id);
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }

            // Stream drops here, releasing the device on this thread.
            drop(stream);
            info!("output device released");
        })?;

    match open_rx.recv() {
        Ok(Ok(ctx)) => {
            ctx.attach_device(Box::new(CpalOutputDevice {
                running,
                thread: Some(handle),
            }));
            Ok(ctx)
        }
        Ok(Err(e)) => {
            let _ = handle.join();
            Err(e)
        }
        Err(_) => {
            let _ = handle.join();
            Err(SadaError::Other(anyhow::anyhow!(
                "output device thread died unexpectedly"
            )))
        }
    }
}

fn build_output(sample_rate: u32) -> Result<(OutputContext, Stream)> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| SadaError::DeviceUnavailable("no default output device".into()))?;

    info!(
        device = device.name().unwrap_or_default().as_str(),
        "opening output device"
    );

    let supported = match device
        .supported_output_configs()
        .ok()
        .and_then(|ranges| pick_native_config(ranges, sample_rate))
    {
        Some(native) => native,
        None => {
            let fallback = device
                .default_output_config()
                .map_err(|e| classify_device_error(e.to_string()))?;
            warn!(
                requested = sample_rate,
                device_rate = fallback.sample_rate().0,
                "output rate not supported natively, mixer will resample"
            );
            fallback
        }
    };

    let config = StreamConfig {
        channels: supported.channels(),
        sample_rate: SampleRate(supported.sample_rate().0),
        buffer_size: cpal::BufferSize::Default,
    };
    info!(
        sample_rate = config.sample_rate.0,
        channels = config.channels,
        "output config selected"
    );

    let (ctx, mixer) = OutputContext::pair(config.sample_rate.0);
    let stream = match supported.sample_format() {
        SampleFormat::F32 => build_mixer_output::<f32>(&device, &config, mixer),
        SampleFormat::I16 => build_mixer_output::<i16>(&device, &config, mixer),
        SampleFormat::U16 => build_mixer_output::<u16>(&device, &config, mixer),
        fmt => {
            return Err(SadaError::AudioStream(format!(
                "unsupported output sample format: {fmt:?}"
            )))
        }
    }
    .map_err(map_build_error)?;

    stream
        .play()
        .map_err(|e| classify_device_error(e.to_string()))?;

    Ok((ctx, stream))
}

/// Render the mono mix and copy it to every device channel.
fn build_mixer_output<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut mixer: Mixer,
) -> std::result::Result<Stream, cpal::BuildStreamError>
where
    T: SizedSample + FromSample<f32>,
{
    let ch = config.channels.max(1) as usize;
    let mut mono: Vec<f32> = Vec::new();
    device.build_output_stream(
        config,
        move |data: &mut [T], _info: &cpal::OutputCallbackInfo| {
            let frames = data.len() / ch;
            mono.resize(frames, 0.0);
            mixer.render(&mut mono);
            for (frame, sample) in data.chunks_exact_mut(ch).zip(mono.iter()) {
                frame.fill(T::from_sample(*sample));
            }
        },
        |err| error!("output stream error: {err}"),
        None,
    )
}
