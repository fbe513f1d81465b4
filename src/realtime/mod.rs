//! Duplex WebSocket link to the OpenAI Realtime API.

pub mod events;

pub use events::{ClientEvent, ConversationItem, OutputItem, RealtimeEvent};

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, thiserror::Error)]
pub enum RealtimeError {
    #[error("failed to build realtime request: {0}")]
    InvalidRequest(String),
    #[error("realtime websocket error: {0}")]
    Socket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("realtime connection closed")]
    Closed,
    #[error("failed to decode realtime event: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Connection to the Realtime API for a single call.
///
/// Outbound sends are serialized behind a mutex because the audio forwarder
/// and the function-call dispatcher both push client events concurrently.
/// Inbound events are read on a dedicated task and handed off over an mpsc
/// channel, so `recv()` never contends with the writer for the socket.
pub struct RealtimeLink {
    writer: Mutex<SplitSink<WsStream, WsMessage>>,
    events: Mutex<mpsc::Receiver<Result<RealtimeEvent, RealtimeError>>>,
}

impl RealtimeLink {
    pub async fn connect(realtime_url: &str, model: &str, api_key: &str) -> Result<Self, RealtimeError> {
        let url = format!("{realtime_url}?model={model}");
        let mut request = url
            .into_client_request()
            .map_err(|e| RealtimeError::InvalidRequest(e.to_string()))?;
        request.headers_mut().insert(
            "Authorization",
            HeaderValue::from_str(&format!("Bearer {api_key}"))
                .map_err(|e| RealtimeError::InvalidRequest(e.to_string()))?,
        );

        let (stream, _response) = connect_async(request).await?;
        tracing::info!(model, "Connected to Realtime API");

        let (writer, mut reader) = stream.split();
        let (tx, rx) = mpsc::channel(128);

        tokio::spawn(async move {
            while let Some(msg) = reader.next().await {
                match msg {
                    Ok(WsMessage::Text(text)) => {
                        let event = serde_json::from_str::<RealtimeEvent>(&text).map_err(RealtimeError::from);
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Ok(WsMessage::Close(_)) | Err(_) => {
                        let _ = tx.send(Err(RealtimeError::Closed)).await;
                        break;
                    }
                    _ => continue,
                }
            }
        });

        Ok(Self {
            writer: Mutex::new(writer),
            events: Mutex::new(rx),
        })
    }

    pub async fn send(&self, event: &ClientEvent) -> Result<(), RealtimeError> {
        let payload = serde_json::to_string(event)?;
        let mut writer = self.writer.lock().await;
        writer.send(WsMessage::Text(payload.into())).await?;
        Ok(())
    }

    /// Await the next inbound event. Returns `None` once the reader task has
    /// exited and the channel has fully drained.
    pub async fn recv(&self) -> Option<Result<RealtimeEvent, RealtimeError>> {
        self.events.lock().await.recv().await
    }

    pub async fn close(&self) -> Result<(), RealtimeError> {
        let mut writer = self.writer.lock().await;
        writer.close().await?;
        Ok(())
    }
}

/// A truncate past the audio actually played is expected whenever the model
/// finishes speaking before the barge-in truncate reaches it — classify it so
/// callers can swallow it instead of surfacing a spurious error.
pub fn is_harmless_truncation_overshoot(message: &str) -> bool {
    message.contains("already shorter than")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_overshoot_is_recognized() {
        assert!(is_harmless_truncation_overshoot(
            "audio_end_ms is already shorter than the item's audio"
        ));
        assert!(!is_harmless_truncation_overshoot("rate limit exceeded"));
    }
}
