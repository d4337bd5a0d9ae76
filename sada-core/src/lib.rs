//! # sada-core
//!
//! PCM audio engine for speech playback and live voice sessions.
//!
//! ## Architecture
//!
//! ```text
//! base64 PCM16 ─► codec ─► AudioClip ─► PlaybackEngine ─┐
//!                                                       ├─► OutputContext ─► Mixer (device thread)
//! inbound audio ─► codec ─► LiveSession (StreamCursor) ─┘
//!
//! Microphone ─► SPSC ring ─► CapturePipeline (thread) ─► RateConverter ─► Framer ─► CaptureSink
//! ```
//!
//! Devices are reached only through an [`AudioPlatform`]: [`CpalPlatform`]
//! for real hardware, [`OfflinePlatform`] for deterministic tests. Device
//! callbacks never allocate in steady state; all heap work happens on
//! control and capture threads.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod capture;
pub mod codec;
pub mod config;
pub mod error;
pub mod ipc;
pub mod live;
pub mod output;
pub mod platform;
pub mod playback;
pub mod protocol;
pub mod service;

// Convenience re-exports for downstream crates
pub use buffering::clip::AudioClip;
pub use capture::{CaptureChunk, CapturePipeline, CaptureSink};
pub use config::{AudioConfig, InterruptPolicy};
pub use error::{Result, SadaError};
pub use ipc::events::{
    SessionStatus, SessionStatusEvent, SpeakingEvent, TranscriptEvent, TranscriptKind,
};
pub use live::{LiveSession, LiveTransport, ScheduledChunk};
pub use output::{EndedHook, GainStage, OutputContext, SourceNode};
pub use platform::{AudioPlatform, CpalPlatform, OfflinePlatform};
pub use playback::{PlaybackEngine, PlaybackState};
pub use protocol::{InboundMessage, OutboundMessage};
