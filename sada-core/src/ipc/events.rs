//! Events emitted by a live session.
//!
//! | Event | Subscribe with |
//! |-------|----------------|
//! | `SessionStatusEvent` | `LiveSession::subscribe_status` |
//! | `SpeakingEvent` | `LiveSession::subscribe_speaking` |
//! | `TranscriptEvent` | `LiveSession::subscribe_transcripts` |

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Session status
// ---------------------------------------------------------------------------

/// Emitted when the live session changes state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusEvent {
    pub status: SessionStatus,
    /// Optional human-readable detail (e.g. error message).
    pub detail: Option<String>,
}

/// Lifecycle state of a live session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Opening devices and the remote channel.
    Connecting,
    /// Streaming in both directions.
    Active,
    /// Terminal failure. Resources are released; a new session is required.
    Error,
    /// Closed by the caller or the remote side.
    Disconnected,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Error | SessionStatus::Disconnected)
    }
}

// ---------------------------------------------------------------------------
// Microphone activity
// ---------------------------------------------------------------------------

/// Emitted once per outbound capture frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeakingEvent {
    /// Monotonically increasing event sequence number.
    pub seq: u64,
    /// Mean absolute amplitude of the frame.
    pub level: f32,
    /// Level-threshold decision. Display only; every frame is sent.
    pub is_speaking: bool,
}

// ---------------------------------------------------------------------------
// Model output
// ---------------------------------------------------------------------------

/// Text produced by the remote model, or the end of its turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptEvent {
    pub seq: u64,
    pub kind: TranscriptKind,
    /// Empty for `TurnComplete`.
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TranscriptKind {
    /// A text part of the model turn.
    Text,
    /// The model finished its turn.
    TurnComplete,
}
