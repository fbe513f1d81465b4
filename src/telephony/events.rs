//! Wire types for Twilio's Media Streams WebSocket protocol.

use std::collections::HashMap;

use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(tag = "event")]
#[serde(rename_all = "lowercase")]
pub enum TelephonyEvent {
    Connected {
        #[serde(default)]
        #[allow(dead_code)]
        protocol: Option<String>,
    },
    Start {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        start: StartMetadata,
    },
    Media {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        media: MediaPayload,
    },
    Mark {
        #[serde(rename = "streamSid")]
        #[allow(dead_code)]
        stream_sid: String,
        mark: MarkPayload,
    },
    Stop {
        #[serde(rename = "streamSid")]
        #[allow(dead_code)]
        stream_sid: String,
    },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartMetadata {
    pub call_sid: String,
    /// The Call id and agent id allocated by the ingress webhook — the
    /// carrier strips query strings from media-stream URLs, so this bag is
    /// the only reliable channel for per-call context.
    #[serde(default, rename = "customParameters")]
    pub custom_parameters: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct MediaPayload {
    pub payload: String,
    #[serde(deserialize_with = "deserialize_timestamp_ms")]
    pub timestamp: i64,
}

fn deserialize_timestamp_ms<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    // Twilio sends `timestamp` as a decimal string, not a JSON number.
    let raw = String::deserialize(deserializer)?;
    raw.parse().map_err(serde::de::Error::custom)
}

#[derive(Debug, Deserialize)]
pub struct MarkPayload {
    pub name: String,
}
