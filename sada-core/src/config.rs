//! Engine configuration.

use serde::{Deserialize, Serialize};

/// What the live session does with already-queued model audio when the
/// remote side reports an interruption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InterruptPolicy {
    /// Reset the scheduling cursor only. Chunks already scheduled keep
    /// playing to their end.
    #[default]
    ResetCursor,
    /// Stop every scheduled chunk, then reset the cursor.
    StopScheduled,
}

/// Configuration shared by the playback engine, capture pipeline and live
/// session.
#[derive(Debug, Clone)]
pub struct AudioConfig {
    /// Rate assumed for synthesized speech and model audio (Hz). Default: 24000.
    pub playback_sample_rate: u32,
    /// Rate of outbound microphone chunks (Hz). Default: 16000.
    pub capture_sample_rate: u32,
    /// Channel count of PCM payloads. Default: 1.
    pub channels: usize,
    /// Samples per outbound capture frame. Default: 4096.
    pub capture_frame_size: usize,
    /// Mean absolute level above which a frame counts as speaking. Default: 0.05.
    pub speaking_threshold: f32,
    /// Initial playback volume in [0, 1]. Default: 1.0.
    pub default_volume: f32,
    /// Input device name to prefer over the system default.
    pub preferred_input_device: Option<String>,
    pub interrupt_policy: InterruptPolicy,
    /// Sent to the remote side when a live session opens.
    pub system_instruction: Option<String>,
    /// Prebuilt voice the remote side speaks with.
    pub voice_name: String,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            playback_sample_rate: 24_000,
            capture_sample_rate: 16_000,
            channels: 1,
            capture_frame_size: 4_096,
            speaking_threshold: 0.05,
            default_volume: 1.0,
            preferred_input_device: None,
            interrupt_policy: InterruptPolicy::ResetCursor,
            system_instruction: None,
            voice_name: crate::protocol::DEFAULT_VOICE.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_wire_rates() {
        let cfg = AudioConfig::default();
        assert_eq!(cfg.playback_sample_rate, 24_000);
        assert_eq!(cfg.capture_sample_rate, 16_000);
        assert_eq!(cfg.capture_frame_size, 4_096);
        assert_eq!(cfg.interrupt_policy, InterruptPolicy::ResetCursor);
    }

    #[test]
    fn interrupt_policy_serializes_camel_case() {
        let json = serde_json::to_string(&InterruptPolicy::StopScheduled).unwrap();
        assert_eq!(json, r#""stopScheduled""#);
    }
}
