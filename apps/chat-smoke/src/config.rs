//! Environment-backed configuration for `chat-smoke`.

use std::{env, time::Duration};

use chat_core::UserId;
use chat_realtime::{ChatRuntimeConfig, DEFAULT_WS_URL};
use thiserror::Error;
use url::Url;

const DEFAULT_API_URL: &str = "http://localhost:8080/api";
const DEFAULT_SMOKE_SECONDS: u64 = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct SmokeConfig {
    /// Persistence API base, e.g. `http://localhost:8080/api`.
    pub api_url: Url,
    /// Push endpoint (raw WebSocket carrying STOMP).
    pub ws_url: Url,
    pub user_id: UserId,
    pub user_name: String,
    pub token: String,
    /// Counterparty to open and optionally message.
    pub peer_id: Option<UserId>,
    /// Sent to `peer_id` once connected.
    pub message: Option<String>,
    /// How long to watch events before disconnecting.
    pub run_for: Duration,
    pub reconnect_base_ms: Option<u64>,
    pub reconnect_max_attempts: Option<u32>,
    pub heartbeat_ms: Option<u64>,
    pub read_receipt_delay_ms: Option<u64>,
}

impl SmokeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let api_url = parse_url("FIXITNOW_API_URL", DEFAULT_API_URL, &mut lookup)?;
        let ws_url = parse_url("FIXITNOW_WS_URL", DEFAULT_WS_URL, &mut lookup)?;
        let user_id = parse_optional::<UserId, _>("FIXITNOW_USER_ID", &mut lookup)?
            .ok_or(ConfigError::Missing {
                key: "FIXITNOW_USER_ID",
            })?;
        let token = optional_trimmed_env("FIXITNOW_TOKEN", &mut lookup).ok_or(
            ConfigError::Missing {
                key: "FIXITNOW_TOKEN",
            },
        )?;
        let user_name = optional_trimmed_env("FIXITNOW_USER_NAME", &mut lookup)
            .unwrap_or_else(|| format!("User {user_id}"));
        let peer_id = parse_optional::<UserId, _>("FIXITNOW_PEER_ID", &mut lookup)?;
        let message = optional_trimmed_env("FIXITNOW_MESSAGE", &mut lookup);
        let smoke_seconds = parse_optional::<u64, _>("FIXITNOW_SMOKE_SECONDS", &mut lookup)?
            .unwrap_or(DEFAULT_SMOKE_SECONDS);

        let reconnect_base_ms = parse_optional("FIXITNOW_RECONNECT_BASE_MS", &mut lookup)?;
        let reconnect_max_attempts =
            parse_optional("FIXITNOW_RECONNECT_MAX_ATTEMPTS", &mut lookup)?;
        let heartbeat_ms = parse_optional("FIXITNOW_HEARTBEAT_MS", &mut lookup)?;
        let read_receipt_delay_ms = parse_optional("FIXITNOW_READ_RECEIPT_DELAY_MS", &mut lookup)?;

        if peer_id == Some(user_id) {
            return Err(ConfigError::InvalidValue {
                key: "FIXITNOW_PEER_ID",
                value: user_id.to_string(),
                reason: "must differ from FIXITNOW_USER_ID".to_owned(),
            });
        }
        if message.is_some() && peer_id.is_none() {
            return Err(ConfigError::Missing {
                key: "FIXITNOW_PEER_ID",
            });
        }

        Ok(Self {
            api_url,
            ws_url,
            user_id,
            user_name,
            token,
            peer_id,
            message,
            run_for: Duration::from_secs(smoke_seconds),
            reconnect_base_ms,
            reconnect_max_attempts,
            heartbeat_ms,
            read_receipt_delay_ms,
        })
    }

    /// Runtime tuning with the environment overrides applied.
    pub fn runtime_config(&self) -> ChatRuntimeConfig {
        let mut config = ChatRuntimeConfig::new(self.user_id, self.user_name.clone());
        if let Some(ms) = self.reconnect_base_ms {
            config.reconnect_base_delay = Duration::from_millis(ms);
        }
        if let Some(attempts) = self.reconnect_max_attempts {
            config.reconnect_max_attempts = attempts;
        }
        if let Some(ms) = self.heartbeat_ms {
            config.heartbeat_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = self.read_receipt_delay_ms {
            config.read_receipt_delay = Duration::from_millis(ms);
        }
        config
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{key} must be set")]
    Missing { key: &'static str },
    #[error("invalid {key}='{value}': {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

fn optional_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_optional<T, F>(key: &'static str, lookup: &mut F) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(None);
    };
    value
        .parse::<T>()
        .map(Some)
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

fn parse_url<F>(key: &'static str, default: &str, lookup: &mut F) -> Result<Url, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let value = optional_trimmed_env(key, lookup).unwrap_or_else(|| default.to_owned());
    Url::parse(&value).map_err(|err| ConfigError::InvalidValue {
        key,
        value,
        reason: err.to_string(),
    })
}
