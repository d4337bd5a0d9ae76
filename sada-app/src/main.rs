//! Sada command-line host.
//!
//! Plays synthesized speech with transport controls on stdin, exports clips
//! to WAV, lists devices and runs live voice sessions against a local echo
//! transport.

mod settings;

use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use crossbeam_channel::{select, Receiver, Sender};
use sada_core::{
    audio::{device, wav},
    codec,
    protocol::{parse_pcm_rate, InboundMessage},
    AudioClip, AudioConfig, CpalPlatform, LiveSession, LiveTransport, OutboundMessage,
    PlaybackEngine, PlaybackState, SessionStatus,
};
use settings::{default_settings_path, load_settings, save_settings, AppSettings};
use tracing::{debug, info, warn};

#[derive(Parser)]
#[command(name = "sada", version, about = "PCM speech playback and live voice sessions")]
struct Cli {
    /// Settings file (defaults to the user data directory).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List audio input and output devices.
    Devices,
    /// Play a clip: base64 PCM16 text, raw `.pcm` or `.wav`.
    Play {
        file: PathBuf,
        /// Playback volume in [0, 1]; saved to settings.
        #[arg(long)]
        volume: Option<f32>,
    },
    /// Convert a clip to a 16-bit WAV file.
    Export { input: PathBuf, output: PathBuf },
    /// Run a live voice session.
    Live {
        /// Play the microphone back as model audio instead of using a
        /// remote service.
        #[arg(long)]
        echo: bool,
    },
    /// Print the effective settings.
    Settings,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("sada=info")),
        )
        .init();

    let cli = Cli::parse();
    let settings_path = cli.settings.unwrap_or_else(default_settings_path);
    let mut settings = load_settings(&settings_path);
    debug!(path = %settings_path.display(), "settings loaded");

    match cli.command {
        Command::Devices => list_devices(),
        Command::Play { file, volume } => {
            if let Some(volume) = volume {
                settings.volume = volume;
                settings.normalize();
            }
            play(&file, &mut settings)?;
            save_settings(&settings_path, &settings)
                .with_context(|| format!("saving {}", settings_path.display()))?;
            Ok(())
        }
        Command::Export { input, output } => {
            let clip = read_clip(&input, &settings.audio_config())?;
            wav::write_clip(&output, &clip)
                .with_context(|| format!("writing {}", output.display()))?;
            info!(duration = clip.duration(), path = %output.display(), "clip exported");
            Ok(())
        }
        Command::Live { echo } => {
            if !echo {
                bail!("no remote transport is configured; run with --echo for a local loopback");
            }
            run_echo_session(&settings)
        }
        Command::Settings => {
            println!("{}", settings_path.display());
            println!("{}", serde_json::to_string_pretty(&settings)?);
            Ok(())
        }
    }
}

fn list_devices() -> anyhow::Result<()> {
    let mut devices = device::list_devices();
    device::sort_devices(&mut devices);
    if devices.is_empty() {
        warn!("no audio devices found");
    }
    for d in devices {
        println!(
            "{:<6} {}{}{}",
            format!("{:?}", d.direction).to_lowercase(),
            d.name,
            if d.is_default { " (default)" } else { "" },
            if d.is_loopback_like { " [loopback]" } else { "" },
        );
    }
    Ok(())
}

/// Decode a clip file by extension: `.wav`, raw little-endian `.pcm`, or
/// anything else as base64 text.
fn read_clip(path: &Path, config: &AudioConfig) -> anyhow::Result<AudioClip> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    let clip = match ext.as_str() {
        "wav" => {
            let audio = wav::read_pcm16(path)
                .with_context(|| format!("reading {}", path.display()))?;
            let channels = codec::pcm16_to_float(&audio.bytes, audio.channels)?;
            AudioClip::new(channels, audio.sample_rate)
        }
        "pcm" => {
            let bytes =
                std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
            let channels = codec::pcm16_to_float(&bytes, config.channels)?;
            AudioClip::new(channels, config.playback_sample_rate)
        }
        _ => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            codec::decode_clip(text.trim(), config.playback_sample_rate, config.channels)
                .with_context(|| format!("decoding {}", path.display()))?
        }
    };
    Ok(clip)
}

fn stdin_lines() -> Receiver<String> {
    let (tx, rx) = crossbeam_channel::unbounded();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

fn ended_notifier(tx: &Sender<()>) -> sada_core::EndedHook {
    let tx = tx.clone();
    Box::new(move || {
        let _ = tx.send(());
    })
}

fn play(path: &Path, settings: &mut AppSettings) -> anyhow::Result<()> {
    let config = settings.audio_config();
    let clip = read_clip(path, &config)?;

    let engine = PlaybackEngine::new(Arc::new(CpalPlatform::new()), &config);
    let duration = engine.load_clip(clip).context("opening audio output")?;
    engine.set_muted(settings.muted);
    info!(duration, "playing; commands: play, pause, seek <s>, volume <v>, mute, unmute, stop, quit");

    let (ended_tx, ended_rx) = crossbeam_channel::unbounded();
    engine.play(Some(ended_notifier(&ended_tx)))?;
    let lines = stdin_lines();
    let closed_input: Receiver<String> = crossbeam_channel::never();
    let mut stdin_open = true;

    loop {
        let input = if stdin_open { lines.clone() } else { closed_input.clone() };
        select! {
            recv(ended_rx) -> _ => {
                info!("playback finished");
                if !stdin_open {
                    break;
                }
            }
            recv(input) -> line => {
                let Ok(line) = line else {
                    // Piped input: let the clip finish, then exit.
                    stdin_open = false;
                    if engine.state() != PlaybackState::Playing {
                        break;
                    }
                    continue;
                };
                if !run_transport_command(&engine, line.trim(), &ended_tx, settings)? {
                    break;
                }
            }
        }
    }

    engine.close();
    Ok(())
}

/// Apply one stdin command. Returns `false` on `quit`.
fn run_transport_command(
    engine: &PlaybackEngine,
    line: &str,
    ended_tx: &Sender<()>,
    settings: &mut AppSettings,
) -> anyhow::Result<bool> {
    let mut words = line.split_whitespace();
    let arg = |w: Option<&str>| -> anyhow::Result<f64> {
        w.context("missing argument")?
            .parse::<f64>()
            .context("expected a number")
    };
    match words.next() {
        None => {}
        Some("play") => engine.play(Some(ended_notifier(ended_tx)))?,
        Some("pause") => engine.pause(),
        Some("seek") => match arg(words.next()) {
            Ok(t) => {
                engine.seek(t)?;
                // Seeking drops the ended callback; re-arm it.
                if engine.is_playing() {
                    engine.play(Some(ended_notifier(ended_tx)))?;
                }
            }
            Err(e) => warn!("seek: {e:#}"),
        },
        Some("volume") => match arg(words.next()) {
            Ok(v) => {
                engine.set_volume(v as f32);
                settings.volume = engine.volume();
            }
            Err(e) => warn!("volume: {e:#}"),
        },
        Some("mute") | Some("unmute") => {
            let muted = line.starts_with("mute");
            engine.set_muted(muted);
            settings.muted = muted;
        }
        Some("stop") => engine.stop(),
        Some("quit") | Some("exit") => return Ok(false),
        Some(other) => warn!("unknown command: {other}"),
    }
    println!(
        "{:?} {:.2}/{:.2}s volume {:.2}{}",
        engine.state(),
        engine.current_time(),
        engine.duration(),
        engine.volume(),
        if engine.is_muted() { " (muted)" } else { "" },
    );
    Ok(true)
}

/// Loopback transport: every microphone frame comes straight back as model
/// audio.
struct EchoTransport {
    inbound: Sender<InboundMessage>,
}

impl LiveTransport for EchoTransport {
    fn send(&self, message: OutboundMessage) -> sada_core::Result<()> {
        match message {
            OutboundMessage::Setup(_) => {
                debug!("echo transport: setup acknowledged");
                Ok(())
            }
            OutboundMessage::RealtimeInput(input) => {
                for blob in input.media_chunks {
                    let sample_rate = parse_pcm_rate(&blob.mime_type).unwrap_or(16_000);
                    self.inbound
                        .send(InboundMessage::Audio {
                            data: blob.data,
                            sample_rate,
                        })
                        .map_err(|e| sada_core::SadaError::RemoteChannel(e.to_string()))?;
                }
                Ok(())
            }
        }
    }

    fn close(&self) {
        let _ = self.inbound.send(InboundMessage::Closed);
    }
}

fn run_echo_session(settings: &AppSettings) -> anyhow::Result<()> {
    let (inbound_tx, inbound_rx) = crossbeam_channel::unbounded();
    let transport = Arc::new(EchoTransport {
        inbound: inbound_tx,
    });
    let session = LiveSession::new(settings.audio_config(), transport);
    let mut status = session.subscribe_status();
    let mut speaking = session.subscribe_speaking();

    session
        .start(Arc::new(CpalPlatform::new()))
        .context("starting live session")?;
    session.set_volume(if settings.muted { 0.0 } else { settings.volume });
    info!("live echo session running; type `quit` or close stdin to stop");

    let lines = stdin_lines();
    let tick = crossbeam_channel::tick(Duration::from_millis(250));
    let mut was_speaking = false;

    loop {
        select! {
            recv(inbound_rx) -> message => {
                let Ok(message) = message else { break };
                if let Err(e) = session.handle_message(message) {
                    warn!("inbound message rejected: {e}");
                }
            }
            recv(lines) -> line => match line.as_deref().map(str::trim) {
                Ok("interrupt") => session.interrupt(),
                Ok("quit") | Ok("exit") | Err(_) => break,
                Ok(_) => {}
            },
            recv(tick) -> _ => {}
        }

        while let Ok(event) = speaking.try_recv() {
            if event.is_speaking != was_speaking {
                was_speaking = event.is_speaking;
                info!(level = event.level, speaking = was_speaking, "microphone activity");
            }
        }
        while let Ok(event) = status.try_recv() {
            info!(status = ?event.status, detail = ?event.detail, "session status");
        }
        if session.status().is_terminal() {
            break;
        }
    }

    session.close();
    let stats = session.diagnostics();
    info!(
        sent = stats.chunks_sent,
        received = stats.chunks_received,
        underruns = stats.underruns,
        "live session closed"
    );
    if session.status() == SessionStatus::Error {
        bail!("live session ended with an error");
    }
    Ok(())
}
