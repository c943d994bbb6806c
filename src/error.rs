//! Error types for the Print Sentinel monitoring core.
//!
//! Snapshot and provider errors raised during a scheduled cycle are
//! non-fatal: the monitor records them and reschedules. Configuration
//! errors are surfaced synchronously to whoever tried to start a session.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Umbrella error for operations that can fail in more than one way.
#[derive(Debug, Error)]
pub enum SentinelError {
    /// Webcam snapshot could not be acquired.
    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    /// Vision provider call failed.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Settings are incomplete or out of range.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A command could not be accepted in the current monitor state.
    #[error("Command rejected: {0}")]
    Command(#[from] CommandError),
}

/// Errors raised while fetching a single webcam frame.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// The HTTP request could not be completed (connect failure, timeout, ...).
    #[error("request to '{url}' failed: {reason}")]
    Transport { url: String, reason: String },

    /// The webcam answered with a non-2xx status.
    #[error("'{url}' returned HTTP {status}")]
    Status { url: String, status: u16 },

    /// The body was empty or did not decode as a JPEG image.
    #[error("response from '{url}' is not a valid JPEG image: {reason}")]
    InvalidImage { url: String, reason: String },
}

/// Classification of a provider failure, shared by every backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    /// Credentials were rejected (HTTP 401/403) or are missing.
    Auth,
    /// The backend is throttling requests (HTTP 429).
    RateLimit,
    /// Connect failure, timeout, or an unexpected HTTP status.
    Network,
    /// The reply could not be turned into a strict OK/FAIL verdict.
    MalformedResponse,
    /// The backend or model cannot serve this request (e.g. no vision support).
    Unsupported,
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProviderErrorKind::Auth => "auth",
            ProviderErrorKind::RateLimit => "rate_limit",
            ProviderErrorKind::Network => "network",
            ProviderErrorKind::MalformedResponse => "malformed_response",
            ProviderErrorKind::Unsupported => "unsupported",
        };
        f.write_str(name)
    }
}

/// A failed vision analysis or connectivity probe.
#[derive(Debug, Error)]
#[error("{provider} {kind}: {message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub provider: String,
    pub message: String,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn malformed(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::MalformedResponse, provider, message)
    }

    /// Map an HTTP status returned by a provider to an error kind.
    pub fn from_status(provider: impl Into<String>, status: u16, body: &str) -> Self {
        let kind = match status {
            401 | 403 => ProviderErrorKind::Auth,
            429 => ProviderErrorKind::RateLimit,
            400 | 404 | 415 | 422 => ProviderErrorKind::Unsupported,
            _ => ProviderErrorKind::Network,
        };
        let snippet: String = body.chars().take(200).collect();
        Self::new(kind, provider, format!("HTTP {}: {}", status, snippet))
    }

    /// Map a transport-level reqwest failure to an error kind.
    pub fn from_transport(provider: impl Into<String>, err: &reqwest::Error) -> Self {
        let kind = match err.status().map(|s| s.as_u16()) {
            Some(401) | Some(403) => ProviderErrorKind::Auth,
            Some(429) => ProviderErrorKind::RateLimit,
            _ if err.is_decode() => ProviderErrorKind::MalformedResponse,
            _ => ProviderErrorKind::Network,
        };
        let message = if err.is_timeout() {
            format!("request timed out: {}", err)
        } else {
            err.to_string()
        };
        Self::new(kind, provider, message)
    }
}

/// Errors in the settings used to start a monitoring session.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    /// Required setting is missing or empty.
    #[error("required setting '{name}' is not set")]
    Missing { name: String },

    /// A setting could not be parsed or is out of range.
    #[error("invalid value '{value}' for '{field}': {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    pub fn missing(name: &str) -> Self {
        ConfigError::Missing {
            name: name.to_string(),
        }
    }

    pub fn invalid(field: &str, value: impl ToString, reason: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

/// Rejections from the command surface.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    /// A check is already in flight; cycles never interleave.
    #[error("a check is already in progress")]
    Busy,

    /// A session is already running.
    #[error("monitoring is already active")]
    AlreadyActive,
}
