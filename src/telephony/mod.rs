//! Duplex wrapper around the carrier's media-stream WebSocket.

pub mod events;

use axum::extract::ws::{Message, WebSocket};
use base64::Engine;

pub use events::{MarkPayload, MediaPayload, StartMetadata, TelephonyEvent};

#[derive(Debug, thiserror::Error)]
pub enum TelephonyError {
    #[error("carrier websocket closed")]
    Closed,
    #[error("carrier websocket error: {0}")]
    Socket(#[from] axum::Error),
    #[error("failed to decode carrier event: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("no start envelope after {0} attempts")]
    StartTimeout(u32),
}

pub struct TelephonyLink {
    socket: WebSocket,
    pub stream_sid: String,
}

impl TelephonyLink {
    /// Read envelopes until `start` arrives, bounded by `max_attempts`.
    /// Exceeding it is fatal — the carrier never identified the call.
    pub async fn await_start(
        mut socket: WebSocket,
        max_attempts: u32,
    ) -> Result<(Self, StartMetadata), TelephonyError> {
        for _ in 0..max_attempts {
            let Some(msg) = socket.recv().await else {
                return Err(TelephonyError::Closed);
            };
            let text = match msg? {
                Message::Text(text) => text,
                Message::Close(_) => return Err(TelephonyError::Closed),
                _ => continue,
            };
            if let TelephonyEvent::Start { stream_sid, start } = serde_json::from_str(&text)? {
                let link = Self {
                    socket,
                    stream_sid,
                };
                return Ok((link, start));
            }
        }
        Err(TelephonyError::StartTimeout(max_attempts))
    }

    pub async fn recv(&mut self) -> Option<Result<TelephonyEvent, TelephonyError>> {
        loop {
            let msg = match self.socket.recv().await? {
                Ok(Message::Text(text)) => text,
                Ok(Message::Close(_)) => return Some(Err(TelephonyError::Closed)),
                Ok(_) => continue,
                Err(e) => return Some(Err(TelephonyError::Socket(e))),
            };
            return Some(serde_json::from_str(&msg).map_err(TelephonyError::from));
        }
    }

    pub async fn send(&mut self, msg: Message) -> Result<(), TelephonyError> {
        self.socket.send(msg).await?;
        Ok(())
    }

    pub async fn close(mut self) -> Result<(), TelephonyError> {
        self.socket.send(Message::Close(None)).await?;
        Ok(())
    }
}

/// Free functions rather than `TelephonyLink` methods: the background task
/// that forwards Realtime audio deltas builds these without owning the link
/// (the main task owns the socket and does the actual send).
pub fn media_message(stream_sid: &str, mulaw: &[u8]) -> Message {
    let payload = base64::engine::general_purpose::STANDARD.encode(mulaw);
    let json = serde_json::json!({
        "event": "media",
        "streamSid": stream_sid,
        "media": { "payload": payload }
    });
    Message::Text(json.to_string().into())
}

pub fn clear_message(stream_sid: &str) -> Message {
    let json = serde_json::json!({
        "event": "clear",
        "streamSid": stream_sid,
    });
    Message::Text(json.to_string().into())
}

pub fn mark_message(stream_sid: &str, name: &str) -> Message {
    let json = serde_json::json!({
        "event": "mark",
        "streamSid": stream_sid,
        "mark": { "name": name }
    });
    Message::Text(json.to_string().into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_message_carries_stream_sid_and_base64_payload() {
        let Message::Text(text) = media_message("MZ123", &[0xff, 0x00, 0x80]) else {
            panic!("expected text message");
        };
        let json: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(json["event"], "media");
        assert_eq!(json["streamSid"], "MZ123");
        assert_eq!(
            json["media"]["payload"],
            base64::engine::general_purpose::STANDARD.encode([0xffu8, 0x00, 0x80])
        );
    }

    #[test]
    fn mark_message_names_the_correlator() {
        let Message::Text(text) = mark_message("MZ123", "responsePart") else {
            panic!("expected text message");
        };
        let json: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(json["mark"]["name"], "responsePart");
    }

    #[test]
    fn clear_message_carries_stream_sid() {
        let Message::Text(text) = clear_message("MZ123") else {
            panic!("expected text message");
        };
        let json: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(json["event"], "clear");
        assert_eq!(json["streamSid"], "MZ123");
    }
}
