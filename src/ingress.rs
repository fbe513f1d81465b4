//! Ingress webhook (C8): translates the carrier's call-setup POST into a
//! TwiML-style reply that opens the media channel, grounded on the
//! teacher's `twilio/webhook.rs` TwiML-building pattern.

use axum::extract::{Form, State};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;

use crate::store::StoreError;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct VoiceWebhookForm {
    #[serde(rename = "From")]
    pub from: String,
    #[serde(rename = "To")]
    pub to: String,
    #[serde(rename = "CallSid")]
    #[allow(dead_code)]
    pub call_sid: String,
}

/// Handle the carrier's inbound call-setup POST.
pub async fn handle_voice(State(state): State<AppState>, Form(form): Form<VoiceWebhookForm>) -> Response {
    let agent_id = match state.store.find_agent_by_phone_number(&form.to).await {
        Ok(id) => id,
        Err(StoreError::PhoneNotFound(number)) => {
            tracing::warn!(number, "no agent bound to dialed number");
            return reject("Sorry, this number isn't configured. Goodbye.");
        }
        Err(e) => {
            tracing::error!("failed to resolve agent by phone number: {e}");
            return reject("Sorry, we're having trouble right now. Goodbye.");
        }
    };

    let snapshot = match state.store.load_agent_config(agent_id).await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            tracing::error!(agent_id, "failed to load agent config: {e}");
            return reject("Sorry, this agent isn't available right now. Goodbye.");
        }
    };

    match state.store.has_active_subscription(snapshot.business_id).await {
        Ok(true) => {}
        Ok(false) => match state.store.completed_minutes(agent_id).await {
            Ok(minutes) if minutes >= state.config.subscription.free_trial_minutes => {
                tracing::info!(agent_id, minutes, "trial exhausted, rejecting call");
                return reject("The free trial for this assistant has ended. Goodbye.");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!("failed to read completed minutes: {e}");
                return reject("Sorry, we're having trouble right now. Goodbye.");
            }
        },
        Err(e) => {
            tracing::error!("failed to read subscription status: {e}");
            return reject("Sorry, we're having trouble right now. Goodbye.");
        }
    }

    let call = match state.store.create_call(agent_id, &form.from).await {
        Ok(call) => call,
        Err(e) => {
            tracing::error!(agent_id, "failed to allocate call row: {e}");
            return reject("Sorry, we're having trouble right now. Goodbye.");
        }
    };

    let ws_url = media_stream_url(&state.config.server.external_url, agent_id, &state.config.server.instance_id);
    let twiml = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<Response>
    <Connect>
        <Stream url="{ws_url}">
            <Parameter name="call_id" value="{call_id}" />
            <Parameter name="agent_id" value="{agent_id}" />
        </Stream>
    </Connect>
</Response>"#,
        call_id = call.id,
    );

    ([("Content-Type", "text/xml")], twiml).into_response()
}

fn reject(spoken_message: &str) -> Response {
    let twiml = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<Response>
    <Say>{spoken_message}</Say>
    <Hangup/>
</Response>"#
    );
    ([("Content-Type", "text/xml")], twiml).into_response()
}

fn media_stream_url(external_url: &str, agent_id: i64, instance_id: &str) -> String {
    let base = external_url.replace("https://", "wss://").replace("http://", "ws://");
    format!("{base}/conversation/{agent_id}/media-stream/{instance_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_stream_url_rewrites_scheme_and_embeds_path() {
        let url = media_stream_url("https://bridge.example.com", 42, "iad-1");
        assert_eq!(url, "wss://bridge.example.com/conversation/42/media-stream/iad-1");
    }
}
