use serde::Deserialize;
use std::path::PathBuf;

use crate::codec::AudioFormat;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub twilio: TwilioConfig,
    pub openai: OpenAiConfig,
    #[serde(default)]
    pub session: SessionConfig,
    pub store: StoreConfig,
    #[serde(default)]
    pub subscription: SubscriptionConfig,
    pub calendar: CalendarProviderConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Public base URL the carrier can reach this instance at, used to build
    /// TwiML `<Stream>` URLs.
    pub external_url: String,
    /// This instance's identity, embedded in media-stream URLs so the
    /// affinity router can tell its own upgrades from a peer's.
    pub instance_id: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TwilioConfig {
    pub account_sid: String,
    pub auth_token: String,
    pub phone_number: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_voice")]
    pub voice: String,
    #[serde(default = "default_realtime_url")]
    pub realtime_url: String,
    #[serde(default)]
    pub audio_format: AudioFormat,
}

fn default_model() -> String {
    "gpt-realtime-1.5".to_string()
}

fn default_voice() -> String {
    "ash".to_string()
}

fn default_realtime_url() -> String {
    "wss://api.openai.com/v1/realtime".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    #[serde(default = "default_max_duration_secs")]
    pub max_duration_secs: u64,
    #[serde(default = "default_goodbye_grace_secs")]
    pub goodbye_grace_secs: u64,
    #[serde(default = "default_start_envelope_attempts")]
    pub start_envelope_attempts: u32,
    #[serde(default = "default_silence_duration_ms")]
    pub turn_detection_silence_ms: u32,
    #[serde(default = "default_turn_detection_threshold")]
    pub turn_detection_threshold: f32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_duration_secs: default_max_duration_secs(),
            goodbye_grace_secs: default_goodbye_grace_secs(),
            start_envelope_attempts: default_start_envelope_attempts(),
            turn_detection_silence_ms: default_silence_duration_ms(),
            turn_detection_threshold: default_turn_detection_threshold(),
        }
    }
}

fn default_max_duration_secs() -> u64 {
    60 * 60
}

fn default_goodbye_grace_secs() -> u64 {
    4
}

fn default_start_envelope_attempts() -> u32 {
    10
}

fn default_silence_duration_ms() -> u32 {
    500
}

fn default_turn_detection_threshold() -> f32 {
    0.6
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    pub base_url: String,
    pub service_key: String,
}

/// The calendar provider is a separate external collaborator from the config
/// store — a proxy the Bridge calls with a single short-lived credential,
/// never the caller's own OAuth tokens (those live and refresh outside the
/// Bridge's scope).
#[derive(Debug, Deserialize, Clone)]
pub struct CalendarProviderConfig {
    pub base_url: String,
    pub access_token: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SubscriptionConfig {
    #[serde(default = "default_free_trial_minutes")]
    pub free_trial_minutes: f64,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            free_trial_minutes: default_free_trial_minutes(),
        }
    }
}

fn default_free_trial_minutes() -> f64 {
    5.0
}

impl Config {
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        // Load .env file from same directory as config.toml
        let env_path = config_dir().join(".env");
        match dotenvy::from_path(&env_path) {
            Ok(()) => tracing::info!("Loaded .env from {}", env_path.display()),
            Err(dotenvy::Error::Io(_)) => {
                tracing::debug!(
                    "No .env file at {}, using environment only",
                    env_path.display()
                );
            }
            Err(e) => tracing::warn!("Failed to parse .env: {e}"),
        }

        let path = config_path();
        tracing::info!("Loading config from {}", path.display());

        let contents = std::fs::read_to_string(&path).map_err(|e| {
            format!(
                "Failed to read config at {}: {}. Copy config.example.toml to {}",
                path.display(),
                e,
                path.display()
            )
        })?;

        let mut config: Config = toml::from_str(&contents)?;

        // Allow env var overrides for secrets
        if let Ok(v) = std::env::var("TWILIO_ACCOUNT_SID") {
            config.twilio.account_sid = v;
        }
        if let Ok(v) = std::env::var("TWILIO_AUTH_TOKEN") {
            config.twilio.auth_token = v;
        }
        if let Ok(v) = std::env::var("OPENAI_API_KEY") {
            config.openai.api_key = v;
        }
        if let Ok(v) = std::env::var("STORE_SERVICE_KEY") {
            config.store.service_key = v;
        }
        if let Ok(v) = std::env::var("CALENDAR_ACCESS_TOKEN") {
            config.calendar.access_token = v;
        }
        if let Ok(v) = std::env::var("SERVER_EXTERNAL_URL") {
            config.server.external_url = v;
        }
        if let Ok(v) = std::env::var("INSTANCE_ID") {
            config.server.instance_id = v;
        }

        Ok(config)
    }
}

fn config_dir() -> PathBuf {
    if let Ok(p) = std::env::var("VOICE_BRIDGE_CONFIG") {
        // If pointing to a file, use its parent directory
        let path = PathBuf::from(p);
        return path.parent().map(|p| p.to_path_buf()).unwrap_or(path);
    }

    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".voice-bridge")
}

fn config_path() -> PathBuf {
    if let Ok(p) = std::env::var("VOICE_BRIDGE_CONFIG") {
        return PathBuf::from(p);
    }

    config_dir().join("config.toml")
}
