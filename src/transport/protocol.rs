//! # Streaming Endpoint Wire Format
//!
//! JSON envelopes exchanged with the bidirectional generate-content endpoint.
//!
//! ## Client → Server:
//! - **Setup frame**: first message after the socket opens
//! - **Realtime input frame**: base64 PCM @16kHz, one chunk per captured frame
//!
//! ## Server → Client:
//! - **JSON text**: setup acknowledgement, model turns (text and inline audio),
//!   turn completion, interruptions
//! - **Binary**: raw PCM @24kHz mono

use crate::audio::convert;
use crate::config::AppConfig;
use crate::error::{VoiceError, VoiceResult};
use serde::{Deserialize, Serialize};

/// Every frame the session may put on the wire.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum OutboundFrame {
    Setup(SetupFrame),
    RealtimeInput(RealtimeInputFrame),
}

/// Discriminator for logging and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Setup,
    RealtimeAudio,
}

impl OutboundFrame {
    /// Wrap one base64 PCM chunk as a realtime-input frame.
    pub fn audio(base64_pcm: String) -> Self {
        OutboundFrame::RealtimeInput(RealtimeInputFrame {
            realtime_input: RealtimeInput {
                media_chunks: vec![base64_pcm],
            },
        })
    }

    pub fn kind(&self) -> FrameKind {
        match self {
            OutboundFrame::Setup(_) => FrameKind::Setup,
            OutboundFrame::RealtimeInput(_) => FrameKind::RealtimeAudio,
        }
    }

    pub fn to_json(&self) -> VoiceResult<String> {
        serde_json::to_string(self)
            .map_err(|e| VoiceError::Protocol(format!("Failed to encode {:?} frame: {}", self.kind(), e)))
    }
}

/// `{ "setup": { ... } }`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SetupFrame {
    pub setup: Setup,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    pub system_instruction: Content,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    pub max_output_tokens: u32,
    pub temperature: f32,
    pub speech_config: SpeechConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceSelection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VoiceSelection {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Content {
    pub parts: Vec<TextPart>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TextPart {
    pub text: String,
}

impl SetupFrame {
    /// Build the setup frame declared at the start of every voice session:
    /// audio responses, the configured token budget, voice and instruction.
    pub fn from_config(config: &AppConfig) -> Self {
        SetupFrame {
            setup: Setup {
                model: config.voice.model.clone(),
                generation_config: GenerationConfig {
                    response_modalities: vec!["AUDIO".to_string()],
                    max_output_tokens: config.voice.max_output_tokens,
                    temperature: config.voice.temperature,
                    speech_config: SpeechConfig {
                        voice_config: VoiceSelection {
                            prebuilt_voice_config: PrebuiltVoiceConfig {
                                voice_name: config.voice.voice_name.clone(),
                            },
                        },
                    },
                },
                system_instruction: Content {
                    parts: vec![TextPart {
                        text: config.voice.system_instruction.clone(),
                    }],
                },
            },
        }
    }
}

/// `{ "realtimeInput": { "media_chunks": [ "<base64 pcm>" ] } }`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInputFrame {
    pub realtime_input: RealtimeInput,
}

/// The chunk list keeps its snake_case key on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RealtimeInput {
    pub media_chunks: Vec<String>,
}

/// A frame received from the endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// JSON control or response text
    Text(String),
    /// Raw PCM at the receive rate
    Audio(Vec<u8>),
}

/// Server message shape; every field is optional because each message carries
/// only one of them.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerMessage {
    setup_complete: Option<serde_json::Value>,
    server_content: Option<ServerContent>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    model_turn: Option<ModelTurn>,
    #[serde(default)]
    turn_complete: bool,
    #[serde(default)]
    interrupted: bool,
}

#[derive(Debug, Default, Deserialize)]
struct ModelTurn {
    #[serde(default)]
    parts: Vec<ServerPart>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerPart {
    text: Option<String>,
    inline_data: Option<InlineData>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    #[serde(default)]
    mime_type: String,
    data: String,
}

/// What a JSON control message means to the session.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlEvent {
    /// The endpoint accepted the setup frame
    SetupComplete,
    /// Conversational text to append to the chat history
    Text(String),
    /// Inline PCM audio at the receive rate
    Audio(Vec<i16>),
    /// The model finished its turn
    TurnComplete,
    /// The model's turn was cut off by user speech
    Interrupted,
}

/// Interpret one inbound JSON text frame.
///
/// Text that is not a recognisable server message is surfaced verbatim as
/// conversational text so nothing the endpoint says is lost.
pub fn interpret_control(text: &str) -> Vec<ControlEvent> {
    let message: ServerMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(_) => return vec![ControlEvent::Text(text.to_string())],
    };

    let mut events = Vec::new();
    if message.setup_complete.is_some() {
        events.push(ControlEvent::SetupComplete);
    }

    if let Some(content) = message.server_content {
        if let Some(turn) = content.model_turn {
            for part in turn.parts {
                if let Some(text) = part.text.filter(|t| !t.is_empty()) {
                    events.push(ControlEvent::Text(text));
                }
                if let Some(inline) = part.inline_data {
                    if !inline.mime_type.is_empty() && !inline.mime_type.starts_with("audio/pcm") {
                        continue;
                    }
                    match convert::from_base64(&inline.data) {
                        Ok(pcm) => events.push(ControlEvent::Audio(pcm)),
                        Err(err) => tracing::warn!("Dropping inline audio: {}", err),
                    }
                }
            }
        }
        if content.interrupted {
            events.push(ControlEvent::Interrupted);
        }
        if content.turn_complete {
            events.push(ControlEvent::TurnComplete);
        }
    }

    if events.is_empty() {
        tracing::debug!("Ignoring control message without actionable content");
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_setup_frame_shape() {
        let mut config = AppConfig::default();
        config.voice.model = "models/test-model".to_string();
        config.voice.voice_name = "Kore".to_string();
        config.voice.max_output_tokens = 256;
        config.voice.temperature = 0.5;
        config.voice.system_instruction = "Be brief.".to_string();

        let frame = OutboundFrame::Setup(SetupFrame::from_config(&config));
        let value: serde_json::Value = serde_json::from_str(&frame.to_json().unwrap()).unwrap();

        assert_eq!(
            value,
            json!({
                "setup": {
                    "model": "models/test-model",
                    "generationConfig": {
                        "responseModalities": ["AUDIO"],
                        "maxOutputTokens": 256,
                        "temperature": 0.5,
                        "speechConfig": {
                            "voiceConfig": {
                                "prebuiltVoiceConfig": { "voiceName": "Kore" }
                            }
                        }
                    },
                    "systemInstruction": { "parts": [ { "text": "Be brief." } ] }
                }
            })
        );
    }

    #[test]
    fn test_realtime_input_shape() {
        let frame = OutboundFrame::audio("AAEC".to_string());
        assert_eq!(frame.kind(), FrameKind::RealtimeAudio);
        let value: serde_json::Value = serde_json::from_str(&frame.to_json().unwrap()).unwrap();
        assert_eq!(value, json!({ "realtimeInput": { "media_chunks": ["AAEC"] } }));
    }

    #[test]
    fn test_interpret_model_turn() {
        let audio = convert::to_base64(&[1, -1, 300]);
        let message = json!({
            "serverContent": {
                "modelTurn": {
                    "parts": [
                        { "text": "Hello there" },
                        { "inlineData": { "mimeType": "audio/pcm;rate=24000", "data": audio } }
                    ]
                },
                "turnComplete": true
            }
        });

        let events = interpret_control(&message.to_string());
        assert_eq!(
            events,
            vec![
                ControlEvent::Text("Hello there".to_string()),
                ControlEvent::Audio(vec![1, -1, 300]),
                ControlEvent::TurnComplete,
            ]
        );
    }

    #[test]
    fn test_interpret_setup_complete_and_interrupt() {
        assert_eq!(interpret_control(r#"{"setupComplete": {}}"#), vec![ControlEvent::SetupComplete]);
        assert_eq!(
            interpret_control(r#"{"serverContent": {"interrupted": true}}"#),
            vec![ControlEvent::Interrupted]
        );
    }

    #[test]
    fn test_interpret_non_json_is_echoed_as_text() {
        assert_eq!(
            interpret_control("plain words"),
            vec![ControlEvent::Text("plain words".to_string())]
        );
    }

    #[test]
    fn test_interpret_skips_non_pcm_inline_data() {
        let message = json!({
            "serverContent": {
                "modelTurn": { "parts": [ { "inlineData": { "mimeType": "image/png", "data": "AAAA" } } ] }
            }
        });
        assert!(interpret_control(&message.to_string()).is_empty());
    }
}
