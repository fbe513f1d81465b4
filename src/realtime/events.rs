//! Wire types for the OpenAI Realtime API's WebSocket protocol: client
//! events we send and server events we receive.

use serde::{Deserialize, Serialize};

/// Events this bridge sends to the Realtime API.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionConfig },
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend { audio: String },
    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate { item: ConversationItem },
    #[serde(rename = "response.create")]
    ResponseCreate,
    #[serde(rename = "conversation.item.truncate")]
    ConversationItemTruncate {
        item_id: String,
        content_index: u32,
        audio_end_ms: i64,
    },
    #[serde(rename = "response.cancel")]
    ResponseCancel,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionConfig {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub instructions: String,
    pub tools: Vec<serde_json::Value>,
    pub tool_choice: &'static str,
    pub output_modalities: Vec<&'static str>,
    pub voice: String,
    pub audio: AudioSessionConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct AudioSessionConfig {
    pub input: AudioInputConfig,
    pub output: AudioOutputConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct AudioInputConfig {
    pub format: AudioFormatSpec,
    pub transcription: TranscriptionConfig,
    pub noise_reduction: NoiseReductionConfig,
    pub turn_detection: TurnDetectionConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct AudioOutputConfig {
    pub format: AudioFormatSpec,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct AudioFormatSpec {
    #[serde(rename = "type")]
    pub kind: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct TranscriptionConfig {
    pub model: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct NoiseReductionConfig {
    #[serde(rename = "type")]
    pub kind: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct TurnDetectionConfig {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub silence_duration_ms: u32,
    pub threshold: f32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConversationItem {
    Message {
        role: &'static str,
        content: Vec<MessageContent>,
    },
    FunctionCallOutput {
        call_id: String,
        output: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageContent {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub text: String,
}

impl ConversationItem {
    /// The synthetic user turn sent right after session configuration so the
    /// model speaks its configured greeting instead of waiting on the caller.
    pub fn call_connected_marker() -> Self {
        ConversationItem::Message {
            role: "user",
            content: vec![MessageContent {
                kind: "input_text",
                text: "[Call connected]".to_string(),
            }],
        }
    }

    pub fn function_output(call_id: impl Into<String>, output: serde_json::Value) -> Self {
        ConversationItem::FunctionCallOutput {
            call_id: call_id.into(),
            output: output.to_string(),
        }
    }
}

/// Events the Realtime API sends us. Event types this bridge doesn't act on
/// (`response.created`, `rate_limits.updated`, ...) fall through to `Other`
/// rather than failing deserialization.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum RealtimeEvent {
    #[serde(rename = "session.created")]
    SessionCreated { session: serde_json::Value },
    #[serde(rename = "session.updated")]
    SessionUpdated { session: serde_json::Value },
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted,
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    InputTranscriptionCompleted {
        #[serde(default)]
        transcript: String,
    },
    #[serde(rename = "response.output_audio.delta")]
    OutputAudioDelta { delta: String, item_id: String },
    #[serde(rename = "response.output_audio_transcript.delta")]
    OutputTranscriptDelta { delta: String },
    #[serde(rename = "response.output_audio_transcript.done")]
    OutputTranscriptDone {
        #[serde(default)]
        transcript: String,
    },
    #[serde(rename = "response.output_item.done")]
    OutputItemDone { item: OutputItem },
    #[serde(rename = "error")]
    Error { error: RealtimeApiError },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputItem {
    FunctionCall {
        call_id: String,
        name: String,
        #[serde(default)]
        arguments: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RealtimeApiError {
    pub message: String,
    #[serde(default)]
    pub code: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_update_serializes_with_dotted_type_tag() {
        let event = ClientEvent::SessionUpdate {
            session: SessionConfig {
                kind: "realtime",
                instructions: "be helpful".to_string(),
                tools: vec![],
                tool_choice: "auto",
                output_modalities: vec!["audio"],
                voice: "ash".to_string(),
                audio: AudioSessionConfig {
                    input: AudioInputConfig {
                        format: AudioFormatSpec { kind: "audio/pcmu" },
                        transcription: TranscriptionConfig {
                            model: "gpt-4o-mini-transcribe",
                        },
                        noise_reduction: NoiseReductionConfig { kind: "near_field" },
                        turn_detection: TurnDetectionConfig {
                            kind: "server_vad",
                            silence_duration_ms: 500,
                            threshold: 0.6,
                        },
                    },
                    output: AudioOutputConfig {
                        format: AudioFormatSpec { kind: "audio/pcmu" },
                    },
                },
            },
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "session.update");
        assert_eq!(json["session"]["audio"]["input"]["format"]["type"], "audio/pcmu");
        assert_eq!(json["session"]["voice"], "ash");
    }

    #[test]
    fn response_create_has_no_extra_fields() {
        let json = serde_json::to_value(&ClientEvent::ResponseCreate).unwrap();
        assert_eq!(json, serde_json::json!({ "type": "response.create" }));
    }

    #[test]
    fn unknown_server_event_falls_through_to_other() {
        let raw = r#"{"type":"response.created","response":{}}"#;
        let event: RealtimeEvent = serde_json::from_str(raw).unwrap();
        assert!(matches!(event, RealtimeEvent::Other));
    }

    #[test]
    fn function_call_output_item_parses() {
        let raw = r#"{
            "type":"response.output_item.done",
            "item":{"type":"function_call","call_id":"call_1","name":"end_call","arguments":"{\"reason\":\"done\"}"}
        }"#;
        let event: RealtimeEvent = serde_json::from_str(raw).unwrap();
        match event {
            RealtimeEvent::OutputItemDone {
                item: OutputItem::FunctionCall { call_id, name, arguments },
            } => {
                assert_eq!(call_id, "call_1");
                assert_eq!(name, "end_call");
                assert_eq!(arguments, "{\"reason\":\"done\"}");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn error_event_carries_message_and_optional_code() {
        let raw = r#"{"type":"error","error":{"message":"boom","code":"server_error"}}"#;
        let event: RealtimeEvent = serde_json::from_str(raw).unwrap();
        match event {
            RealtimeEvent::Error { error } => {
                assert_eq!(error.message, "boom");
                assert_eq!(error.code.as_deref(), Some("server_error"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
