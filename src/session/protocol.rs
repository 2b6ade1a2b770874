//! Wire messages for the live `BidiGenerateContent` protocol

use serde::{Deserialize, Serialize};

use super::transport::{MediaInput, TransportEvent, mime_sample_rate};
use crate::config::{Modality, SessionConfig};

/// Message sent from client to server
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    /// First message on the connection
    Setup(Setup),
    /// Streaming media input
    RealtimeInput(RealtimeInput),
}

impl ClientMessage {
    /// Build the setup message for a session
    #[must_use]
    pub fn setup(config: &SessionConfig) -> Self {
        let model = if config.model.starts_with("models/") {
            config.model.clone()
        } else {
            format!("models/{}", config.model)
        };

        Self::Setup(Setup {
            model,
            generation_config: GenerationConfig {
                response_modalities: vec![config.response_modality],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: config.voice.clone(),
                        },
                    },
                },
            },
            system_instruction: Content {
                parts: vec![Part {
                    text: Some(config.system_instruction.clone()),
                    inline_data: None,
                }],
            },
        })
    }

    /// Wrap one media unit
    #[must_use]
    pub fn media(media: MediaInput) -> Self {
        Self::RealtimeInput(RealtimeInput {
            media_chunks: vec![Blob {
                mime_type: media.mime_type,
                data: media.data,
            }],
        })
    }
}

/// Session setup payload
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    model: String,
    generation_config: GenerationConfig,
    system_instruction: Content,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_modalities: Vec<Modality>,
    speech_config: SpeechConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SpeechConfig {
    voice_config: VoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VoiceConfig {
    prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PrebuiltVoiceConfig {
    voice_name: String,
}

/// Streaming input payload
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    media_chunks: Vec<Blob>,
}

/// Inline media
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    /// MIME type
    pub mime_type: String,
    /// Base64 payload
    pub data: String,
}

/// Content made of parts
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Content {
    /// Ordered parts
    #[serde(default)]
    pub parts: Vec<Part>,
}

/// One text or media part
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    /// Text content
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Inline media
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<Blob>,
}

/// Message sent from server to client
///
/// Unknown fields are ignored so new server features don't break parsing.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    /// Present once the setup has been accepted
    pub setup_complete: Option<serde_json::Value>,
    /// Model output
    pub server_content: Option<ServerContent>,
    /// Server is about to close the connection
    pub go_away: Option<GoAway>,
}

/// Model output for one message
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    /// Parts of the model turn
    pub model_turn: Option<Content>,
    /// Prior output should be discarded
    #[serde(default)]
    pub interrupted: bool,
    /// The model finished its turn
    #[serde(default)]
    pub turn_complete: bool,
}

/// Advance notice of a server-side disconnect
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoAway {
    /// Remaining time before the connection is closed
    pub time_left: Option<String>,
}

impl ServerMessage {
    /// Translate into transport events
    ///
    /// An interruption is emitted ahead of any audio in the same message so
    /// stale playback is flushed before the new audio is scheduled.
    #[must_use]
    pub fn into_events(self) -> Vec<TransportEvent> {
        let mut events = Vec::new();

        if self.setup_complete.is_some() {
            events.push(TransportEvent::Opened);
        }

        if let Some(content) = self.server_content {
            if content.interrupted {
                events.push(TransportEvent::Interrupted);
            }

            let parts = content.model_turn.map(|turn| turn.parts).unwrap_or_default();
            for part in parts {
                if let Some(blob) = part.inline_data {
                    if blob.mime_type.starts_with("audio/") {
                        events.push(TransportEvent::AudioReceived {
                            sample_rate: mime_sample_rate(&blob.mime_type),
                            data: blob.data,
                        });
                    } else {
                        tracing::debug!(mime_type = %blob.mime_type, "ignoring non-audio inline data");
                    }
                }
                if let Some(text) = part.text.filter(|t| !t.is_empty()) {
                    events.push(TransportEvent::Text(text));
                }
            }

            if content.turn_complete {
                events.push(TransportEvent::TurnComplete);
            }
        }

        events
    }
}
