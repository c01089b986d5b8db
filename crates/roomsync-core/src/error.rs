use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::SessionLifecycleState;

/// Broad error category used for retry decisions and caller-facing handling.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionErrorCategory {
    /// Request URL could not be built from the configured homeserver.
    Config,
    /// Transport failure or unstructured non-success status.
    Network,
    /// Homeserver asked the client to back off.
    RateLimited,
    /// Structured rejection from the homeserver.
    Server,
    /// Response body did not match the expected schema.
    Serialization,
    /// Internal invariant break.
    Internal,
    /// A required session or context field is absent.
    MissingContext,
    /// Client and homeserver share no protocol version.
    UnsupportedVersion,
}

/// Typed failure surfaced by every remote operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{category:?}:{code}: {message}")]
pub struct SessionError {
    /// High-level error category.
    pub category: SessionErrorCategory,
    /// Stable machine-readable error code (server `errcode` for server errors).
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Optional retry hint in milliseconds.
    pub retry_after_ms: Option<u64>,
}

impl SessionError {
    /// Construct a new session error.
    pub fn new(
        category: SessionErrorCategory,
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

    /// Attach a retry hint to the error.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after_ms = Some(retry_after.as_millis() as u64);
        self
    }

    /// Transport-level failure (connection reset, timeout, ...).
    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(SessionErrorCategory::Network, "transport_error", message)
    }

    /// Build a standard missing-context error for `field`.
    pub fn missing_context(field: &str) -> Self {
        Self::new(
            SessionErrorCategory::MissingContext,
            format!("missing_{field}"),
            format!("session context has no {field}"),
        )
    }

    /// Build the error returned when no protocol version overlaps.
    pub fn unsupported_version(endpoint: &str, server_versions: &[String]) -> Self {
        Self::new(
            SessionErrorCategory::UnsupportedVersion,
            "unsupported_protocol_version",
            format!(
                "no supported protocol version for '{endpoint}' (server advertises {server_versions:?})"
            ),
        )
    }

    /// Build a standard invalid-lifecycle-transition error.
    pub fn invalid_state(state: SessionLifecycleState, action: &str) -> Self {
        Self::new(
            SessionErrorCategory::Internal,
            "invalid_state_transition",
            format!("cannot run '{action}' while runtime is in {state:?}"),
        )
    }

    /// Whether bounded retry may consume budget on this error.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.category,
            SessionErrorCategory::Network | SessionErrorCategory::Serialization
        )
    }

    /// Whether the rate-limit combinator should sleep and retry.
    pub fn is_rate_limited(&self) -> bool {
        self.category == SessionErrorCategory::RateLimited
    }

    /// Retry hint as a duration, if the server supplied one.
    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after_ms.map(Duration::from_millis)
    }
}

/// Map an HTTP status without a structured error body to a category.
pub fn classify_http_status(status: u16) -> SessionErrorCategory {
    match status {
        429 => SessionErrorCategory::RateLimited,
        _ => SessionErrorCategory::Network,
    }
}
