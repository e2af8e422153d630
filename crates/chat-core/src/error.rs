use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::ConnectionState;

/// Broad error category used for caller feedback and retry behavior.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChatErrorCategory {
    /// Rejected input, recovered locally (for example an empty message).
    Validation,
    /// Connection drop or handshake failure; handled by the reconnect policy.
    Transport,
    /// A request failed after the connection was established.
    Delivery,
    /// Conversation or user lookup failed.
    NotFound,
    /// Bearer credential missing or rejected.
    Auth,
    /// Invalid configuration or unsupported request.
    Config,
    /// Payload could not be encoded or decoded.
    Serialization,
    /// Broken invariant inside the client.
    Internal,
}

/// Stable error payload emitted across the command/event boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{category:?}:{code}: {message}")]
pub struct ChatError {
    /// High-level error category.
    pub category: ChatErrorCategory,
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Optional retry hint in milliseconds.
    pub retry_after_ms: Option<u64>,
}

impl ChatError {
    /// Construct a new error.
    pub fn new(
        category: ChatErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
            retry_after_ms: None,
        }
    }

    pub fn validation(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ChatErrorCategory::Validation, code, message)
    }

    pub fn transport(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ChatErrorCategory::Transport, code, message)
    }

    pub fn delivery(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ChatErrorCategory::Delivery, code, message)
    }

    pub fn not_found(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ChatErrorCategory::NotFound, code, message)
    }

    /// Attach a retry hint to the error.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after_ms = Some(retry_after.as_millis() as u64);
        self
    }

    /// Build the standard error for operations that need a live connection.
    pub fn not_connected(action: impl Into<String>) -> Self {
        let action = action.into();
        Self::transport(
            "not_connected",
            format!("cannot run '{action}' without an active connection"),
        )
    }

    /// Build a standard invalid-state-transition error.
    pub fn invalid_state(current: ConnectionState, action: impl Into<String>) -> Self {
        let action = action.into();
        Self::new(
            ChatErrorCategory::Internal,
            "invalid_state_transition",
            format!("cannot run '{action}' while connection is {current:?}"),
        )
    }

    /// Re-tag a request failure as a delivery failure, keeping auth and
    /// validation errors as they are.
    pub fn into_delivery(self) -> Self {
        match self.category {
            ChatErrorCategory::Transport
            | ChatErrorCategory::Config
            | ChatErrorCategory::Serialization
            | ChatErrorCategory::Internal => Self {
                category: ChatErrorCategory::Delivery,
                ..self
            },
            _ => self,
        }
    }

    /// Whether retrying the same operation later may succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.category,
            ChatErrorCategory::Transport | ChatErrorCategory::Delivery
        )
    }
}

/// Map HTTP status codes from the persistence API to error categories.
pub fn classify_http_status(status: u16) -> ChatErrorCategory {
    match status {
        401 | 403 => ChatErrorCategory::Auth,
        404 => ChatErrorCategory::NotFound,
        408 | 429 => ChatErrorCategory::Transport,
        400..=499 => ChatErrorCategory::Config,
        500..=599 => ChatErrorCategory::Transport,
        _ => ChatErrorCategory::Internal,
    }
}
