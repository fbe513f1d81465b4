//! Persistence and data-model types for calls, messages, and agent config.
//!
//! Backed by a PostgREST-style REST endpoint over `reqwest`, the same
//! HTTP+JSON shape `original_source` drives through a Supabase client,
//! rather than pulling in a SQL driver this bridge has no other use for.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::StoreConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallResolution {
    Pending,
    Legitimate,
    Spam,
    NoActivity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Call {
    pub id: i64,
    pub agent_id: i64,
    pub caller: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: CallStatus,
    /// Never written by the Bridge itself — left for an external spam
    /// classifier job (see the short-call classification open question).
    pub resolution: Option<CallResolution>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Agent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub call_id: i64,
    pub role: MessageRole,
    pub content: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CalendarSettings {
    #[serde(default = "default_duration")]
    pub default_duration_minutes: u32,
    #[serde(default)]
    pub allow_conflicts: bool,
    #[serde(default = "default_booking_window")]
    pub booking_window_days: i64,
    #[serde(default = "default_business_start")]
    pub business_hours_start: String,
    #[serde(default = "default_business_end")]
    pub business_hours_end: String,
}

fn default_duration() -> u32 {
    30
}
fn default_booking_window() -> i64 {
    30
}
fn default_business_start() -> String {
    "09:00".to_string()
}
fn default_business_end() -> String {
    "17:00".to_string()
}

#[derive(Debug, Clone, Default)]
pub struct BusinessContext {
    pub name: Option<String>,
    pub address: Option<String>,
    pub business_email: Option<String>,
    pub phone_number: Option<String>,
}

/// Immutable per-call view of agent configuration, resolved once at call
/// open and moved between tasks via `Arc` thereafter.
#[derive(Debug, Clone)]
pub struct AgentConfigSnapshot {
    pub agent_id: i64,
    pub business_id: i64,
    pub model: String,
    pub voice: String,
    pub base_prompt: String,
    pub greeting: String,
    pub goodbye: String,
    pub business: BusinessContext,
    pub agent_phone: Option<String>,
    pub calendar: Option<CalendarSettings>,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("store returned {status}: {body}")]
    Api {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("agent {0} not found")]
    AgentNotFound(i64),
    #[error("no agent bound to phone number {0}")]
    PhoneNotFound(String),
}

/// REST client for the config/persistence store (`agent`, `business`,
/// `phone_number`, `conversation`, `message`, `tool_connection` tables).
pub struct Store {
    client: reqwest::Client,
    base_url: String,
    service_key: String,
}

impl Store {
    pub fn new(config: &StoreConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            service_key: config.service_key.clone(),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base_url, path))
            .bearer_auth(&self.service_key)
            .header("apikey", &self.service_key)
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, StoreError> {
        if resp.status().is_success() {
            Ok(resp)
        } else {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            Err(StoreError::Api { status, body })
        }
    }

    /// Resolve an agent id from the number the caller dialed.
    pub async fn find_agent_by_phone_number(&self, to_number: &str) -> Result<i64, StoreError> {
        let resp = self
            .request(reqwest::Method::GET, "/phone_number")
            .query(&[("number", format!("eq.{to_number}")), ("select", "agent_id".to_string())])
            .send()
            .await?;
        let rows: Vec<serde_json::Value> = Self::check(resp).await?.json().await?;
        rows.first()
            .and_then(|r| r.get("agent_id"))
            .and_then(|v| v.as_i64())
            .ok_or_else(|| StoreError::PhoneNotFound(to_number.to_string()))
    }

    pub async fn load_agent_config(&self, agent_id: i64) -> Result<AgentConfigSnapshot, StoreError> {
        let resp = self
            .request(reqwest::Method::GET, "/agent")
            .query(&[("id", format!("eq.{agent_id}")), ("select", "*,business(*)".to_string())])
            .send()
            .await?;
        let rows: Vec<AgentRow> = Self::check(resp).await?.json().await?;
        let row = rows.into_iter().next().ok_or(StoreError::AgentNotFound(agent_id))?;

        let tool_connections = self.load_tool_connections(row.business_id).await?;
        let calendar = tool_connections.get("google-calendar").and_then(|v| {
            serde_json::from_value::<CalendarSettings>(v.get("settings")?.clone()).ok()
        });

        Ok(AgentConfigSnapshot {
            agent_id,
            business_id: row.business_id,
            model: row.model_type.unwrap_or_else(|| "gpt-realtime-1.5".to_string()),
            voice: row.voice_model.unwrap_or_else(|| "ash".to_string()),
            base_prompt: row.prompt.unwrap_or_default(),
            greeting: row.greeting.unwrap_or_else(|| "Hello! How can I help you today?".to_string()),
            goodbye: row.goodbye.unwrap_or_else(|| "Goodbye! Have a great day!".to_string()),
            business: BusinessContext {
                name: row.business.as_ref().and_then(|b| b.name.clone()),
                address: row.business.as_ref().and_then(|b| b.address.clone()),
                business_email: row.business.as_ref().and_then(|b| b.business_email.clone()),
                phone_number: row.business.as_ref().and_then(|b| b.phone_number.clone()),
            },
            agent_phone: row.agent_phone,
            calendar,
        })
    }

    /// Keyed by provider name (e.g. `"google-calendar"`), each value is the
    /// raw `tool_connection` row — enabled providers plus per-provider settings.
    pub async fn load_tool_connections(
        &self,
        business_id: i64,
    ) -> Result<HashMap<String, serde_json::Value>, StoreError> {
        let resp = self
            .request(reqwest::Method::GET, "/tool_connection")
            .query(&[("business_id", format!("eq.{business_id}"))])
            .send()
            .await?;
        let rows: Vec<serde_json::Value> = Self::check(resp).await?.json().await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| Some((row.get("provider")?.as_str()?.to_string(), row)))
            .collect())
    }

    pub async fn create_call(&self, agent_id: i64, caller: &str) -> Result<Call, StoreError> {
        let body = serde_json::json!({
            "agent_id": agent_id,
            "caller": caller,
            "status": "in_progress",
        });
        let resp = self
            .request(reqwest::Method::POST, "/conversation")
            .header("Prefer", "return=representation")
            .json(&body)
            .send()
            .await?;
        let mut rows: Vec<Call> = Self::check(resp).await?.json().await?;
        rows.pop().ok_or_else(|| StoreError::Api {
            status: reqwest::StatusCode::INTERNAL_SERVER_ERROR,
            body: "store returned no row for created call".to_string(),
        })
    }

    pub async fn finalize_call(&self, call_id: i64, status: CallStatus) -> Result<(), StoreError> {
        let body = serde_json::json!({
            "status": status,
            "ended_at": Utc::now(),
        });
        let resp = self
            .request(reqwest::Method::PATCH, "/conversation")
            .query(&[("id", format!("eq.{call_id}"))])
            .json(&body)
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    pub async fn insert_message(&self, message: &Message) -> Result<(), StoreError> {
        let resp = self
            .request(reqwest::Method::POST, "/message")
            .json(message)
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    pub async fn has_active_subscription(&self, business_id: i64) -> Result<bool, StoreError> {
        let resp = self
            .request(reqwest::Method::GET, "/business")
            .query(&[("id", format!("eq.{business_id}")), ("select", "subscription_active".to_string())])
            .send()
            .await?;
        let rows: Vec<serde_json::Value> = Self::check(resp).await?.json().await?;
        Ok(rows
            .first()
            .and_then(|r| r.get("subscription_active"))
            .and_then(|v| v.as_bool())
            .unwrap_or(false))
    }

    pub async fn completed_minutes(&self, agent_id: i64) -> Result<f64, StoreError> {
        let resp = self
            .request(reqwest::Method::GET, "/rpc/completed_minutes")
            .query(&[("agent_id", agent_id.to_string())])
            .send()
            .await?;
        let value: serde_json::Value = Self::check(resp).await?.json().await?;
        Ok(value.as_f64().unwrap_or(0.0))
    }
}

#[derive(Debug, Deserialize)]
struct AgentRow {
    business_id: i64,
    model_type: Option<String>,
    voice_model: Option<String>,
    prompt: Option<String>,
    greeting: Option<String>,
    goodbye: Option<String>,
    agent_phone: Option<String>,
    #[serde(default)]
    business: Option<BusinessRow>,
}

#[derive(Debug, Deserialize)]
struct BusinessRow {
    name: Option<String>,
    address: Option<String>,
    business_email: Option<String>,
    phone_number: Option<String>,
}
