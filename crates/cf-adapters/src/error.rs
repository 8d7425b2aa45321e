//! Item-level adapter failures.

use std::fmt;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

/// Classification of an adapter failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterErrorKind {
    Timeout,
    AuthFailure,
    RateLimited,
    InvalidInput,
    Unknown,
}

impl AdapterErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AdapterErrorKind::Timeout => "timeout",
            AdapterErrorKind::AuthFailure => "auth_failure",
            AdapterErrorKind::RateLimited => "rate_limited",
            AdapterErrorKind::InvalidInput => "invalid_input",
            AdapterErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for AdapterErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed adapter call. Recorded on the item as `"<kind>: <message>"`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct AdapterError {
    pub kind: AdapterErrorKind,
    pub message: String,
}

impl AdapterError {
    pub fn new(kind: AdapterErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(AdapterErrorKind::Timeout, message)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(AdapterErrorKind::InvalidInput, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(AdapterErrorKind::Unknown, message)
    }

    /// Map a non-success HTTP response to an error kind.
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let kind = match status.as_u16() {
            401 | 403 => AdapterErrorKind::AuthFailure,
            429 => AdapterErrorKind::RateLimited,
            400 | 404 | 413 | 415 | 422 => AdapterErrorKind::InvalidInput,
            408 | 504 => AdapterErrorKind::Timeout,
            _ => AdapterErrorKind::Unknown,
        };
        let body = body.trim();
        let message = if body.is_empty() {
            format!("HTTP {status}")
        } else {
            // Provider error bodies can be large; keep the head.
            let head: String = body.chars().take(200).collect();
            format!("HTTP {status}: {head}")
        };
        Self::new(kind, message)
    }

    /// Whether the same call might succeed later without any change.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            AdapterErrorKind::Timeout | AdapterErrorKind::RateLimited
        )
    }
}

impl From<reqwest::Error> for AdapterError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AdapterError::timeout(err.to_string())
        } else if let Some(status) = err.status() {
            AdapterError::from_status(status, "")
        } else if err.is_decode() {
            AdapterError::unknown(format!("malformed provider response: {err}"))
        } else {
            AdapterError::unknown(err.to_string())
        }
    }
}

impl From<cf_core::Error> for AdapterError {
    fn from(err: cf_core::Error) -> Self {
        match err {
            cf_core::Error::Io { source } if source.kind() == std::io::ErrorKind::NotFound => {
                AdapterError::invalid_input(source.to_string())
            }
            cf_core::Error::Validation(msg) => AdapterError::invalid_input(msg),
            timeout @ cf_core::Error::ToolTimeout { .. } => AdapterError::timeout(timeout.to_string()),
            other => AdapterError::unknown(other.to_string()),
        }
    }
}
