//! Wire shapes for the live audio channel.
//!
//! Outbound frames are JSON objects with a single camelCase key:
//!
//! ```text
//! {"setup": {"generationConfig": {...}, "systemInstruction": {"parts": [{"text": ...}]}}}
//! {"realtimeInput": {"mediaChunks": [{"mimeType": "audio/pcm;rate=16000", "data": "<b64>"}]}}
//! ```
//!
//! Inbound server messages are converted into the typed [`InboundMessage`]
//! list the live session consumes, so nothing downstream inspects optional
//! JSON fields.

use serde::{Deserialize, Serialize};

use crate::{
    capture::CaptureChunk,
    error::{Result, SadaError},
};

/// Prebuilt voice used when none is configured.
pub const DEFAULT_VOICE: &str = "Kore";

/// Rate assumed for inbound audio whose mime type carries no `rate=`.
pub const DEFAULT_INBOUND_RATE: u32 = 24_000;

// ---------------------------------------------------------------------------
// Shared pieces
// ---------------------------------------------------------------------------

/// Base64 payload tagged with its mime type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<Blob>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    #[serde(default)]
    pub parts: Vec<Part>,
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OutboundMessage {
    Setup(SetupMessage),
    RealtimeInput(RealtimeInput),
}

impl OutboundMessage {
    /// Realtime audio message for one capture frame.
    pub fn audio(chunk: &CaptureChunk) -> Self {
        OutboundMessage::RealtimeInput(RealtimeInput {
            media_chunks: vec![Blob {
                mime_type: chunk.mime_type(),
                data: chunk.data.clone(),
            }],
        })
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| SadaError::InvalidFormat(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<Blob>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupMessage {
    pub generation_config: GenerationConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    pub speech_config: SpeechConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

impl SetupMessage {
    /// Audio-only session with a prebuilt voice.
    pub fn audio(voice_name: &str, system_instruction: Option<String>) -> Self {
        Self {
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".into()],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: voice_name.into(),
                        },
                    },
                },
            },
            system_instruction: system_instruction.map(|text| Content {
                parts: vec![Part {
                    text: Some(text),
                    inline_data: None,
                }],
            }),
        }
    }
}

/// System instruction for a conversation grounded in the user's text.
pub fn build_system_instruction(initial_context: Option<&str>) -> String {
    let context = initial_context
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .unwrap_or("No context provided, just a general chat.");
    format!(
        "You are a helpful and friendly AI assistant.\n\
         Context provided by user: {context}\n\
         Keep answers concise and conversational."
    )
}

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

/// One typed event from the remote side.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// Base64 PCM16 mono model audio.
    Audio { data: String, sample_rate: u32 },
    /// A text part of the model turn.
    Text(String),
    /// The user barged in; queued model audio is stale.
    Interrupted,
    TurnComplete,
    /// Transport-level failure reported by the channel.
    Error(String),
    /// The remote side closed the channel.
    Closed,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default)]
    pub server_content: Option<ServerContent>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<Content>,
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default)]
    pub turn_complete: bool,
}

impl ServerMessage {
    /// Flatten into typed events: audio and text parts in order, then
    /// interruption, then turn completion.
    pub fn into_inbound(self) -> Vec<InboundMessage> {
        let Some(content) = self.server_content else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for part in content.model_turn.map(|t| t.parts).unwrap_or_default() {
            if let Some(blob) = part.inline_data {
                if blob.mime_type.starts_with("audio/") {
                    out.push(InboundMessage::Audio {
                        sample_rate: parse_pcm_rate(&blob.mime_type).unwrap_or(DEFAULT_INBOUND_RATE),
                        data: blob.data,
                    });
                }
            }
            if let Some(text) = part.text.filter(|t| !t.is_empty()) {
                out.push(InboundMessage::Text(text));
            }
        }
        if content.interrupted {
            out.push(InboundMessage::Interrupted);
        }
        if content.turn_complete {
            out.push(InboundMessage::TurnComplete);
        }
        out
    }
}

/// Parse one server JSON frame.
///
/// # Errors
/// `InvalidFormat` if the text is not a JSON object of the expected shape.
pub fn parse_server_message(json: &str) -> Result<Vec<InboundMessage>> {
    let message: ServerMessage =
        serde_json::from_str(json).map_err(|e| SadaError::InvalidFormat(e.to_string()))?;
    Ok(message.into_inbound())
}

/// `rate=N` parameter of a mime type such as `audio/pcm;rate=24000`.
pub fn parse_pcm_rate(mime_type: &str) -> Option<u32> {
    mime_type
        .split(';')
        .skip(1)
        .filter_map(|param| param.trim().split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("rate"))
        .and_then(|(_, value)| value.trim().parse().ok())
        .filter(|rate| *rate > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn realtime_audio_serializes_with_mime_tag() {
        let chunk = CaptureChunk {
            seq: 0,
            data: "AAA=".into(),
            sample_rate: 16_000,
            samples: 1,
            level: 0.0,
            is_speaking: false,
        };
        let json = serde_json::to_value(OutboundMessage::audio(&chunk)).unwrap();
        let blob = &json["realtimeInput"]["mediaChunks"][0];
        assert_eq!(blob["mimeType"], "audio/pcm;rate=16000");
        assert_eq!(blob["data"], "AAA=");
    }

    #[test]
    fn setup_carries_voice_and_instruction() {
        let setup = SetupMessage::audio(DEFAULT_VOICE, Some(build_system_instruction(None)));
        let json = serde_json::to_value(OutboundMessage::Setup(setup)).unwrap();
        assert_eq!(
            json["setup"]["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]
                ["voiceName"],
            "Kore"
        );
        assert_eq!(json["setup"]["generationConfig"]["responseModalities"][0], "AUDIO");
        let text = json["setup"]["systemInstruction"]["parts"][0]["text"]
            .as_str()
            .unwrap();
        assert!(text.contains("general chat"));
    }

    #[test]
    fn instruction_embeds_trimmed_context() {
        let text = build_system_instruction(Some("  photosynthesis notes "));
        assert!(text.contains("Context provided by user: photosynthesis notes\n"));
        assert!(build_system_instruction(Some("   ")).contains("general chat"));
    }

    #[test]
    fn server_message_becomes_typed_events() {
        let json = r#"{
            "serverContent": {
                "modelTurn": {"parts": [
                    {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "AAAA"}},
                    {"text": "hello"}
                ]},
                "interrupted": true,
                "turnComplete": true
            }
        }"#;
        let events = parse_server_message(json).unwrap();
        assert_eq!(
            events,
            vec![
                InboundMessage::Audio {
                    data: "AAAA".into(),
                    sample_rate: 24_000
                },
                InboundMessage::Text("hello".into()),
                InboundMessage::Interrupted,
                InboundMessage::TurnComplete,
            ]
        );
    }

    #[test]
    fn non_audio_blobs_and_empty_messages_are_ignored() {
        let json = r#"{"serverContent": {"modelTurn": {"parts": [
            {"inlineData": {"mimeType": "image/png", "data": "AAAA"}}
        ]}}}"#;
        assert!(parse_server_message(json).unwrap().is_empty());
        assert!(parse_server_message(r#"{"setupComplete": {}}"#).unwrap().is_empty());
        assert!(matches!(
            parse_server_message("not json"),
            Err(SadaError::InvalidFormat(_))
        ));
    }

    #[test]
    fn pcm_rate_parsing() {
        assert_eq!(parse_pcm_rate("audio/pcm;rate=24000"), Some(24_000));
        assert_eq!(parse_pcm_rate("audio/pcm; rate=16000"), Some(16_000));
        assert_eq!(parse_pcm_rate("audio/pcm"), None);
        assert_eq!(parse_pcm_rate("audio/pcm;rate=abc"), None);
        assert_eq!(parse_pcm_rate("audio/pcm;rate=0"), None);
    }
}
