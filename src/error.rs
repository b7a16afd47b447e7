//! Unified error handling for the route-tracker library.
//!
//! Errors fall into four families: acquisition (the device could not produce a
//! fix), push (the remote location store did not accept an update), routing
//! provider failures, and persistence failures. Only the first two are ever
//! surfaced to callers of the tracking session; provider and persistence errors
//! are logged and absorbed by their owning components.

use thiserror::Error;

/// Reasons a position fix could not be acquired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, serde::Serialize, serde::Deserialize)]
pub enum AcquisitionError {
    #[error("location permission denied")]
    PermissionDenied,
    #[error("position unavailable")]
    PositionUnavailable,
    #[error("position request timed out")]
    Timeout,
}

/// Failure pushing an accepted sample to the remote location store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PushError {
    /// Connection-level failure (DNS, reset, refused).
    #[error("network error: {message}")]
    Network { message: String },
    #[error("push timed out")]
    Timeout,
    /// The store answered but refused the update (validation, auth, server error).
    #[error("push rejected ({status_code}): {message}")]
    Rejected { status_code: u16, message: String },
}

impl PushError {
    /// Only network-level failures are worth an automatic retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, PushError::Network { .. } | PushError::Timeout)
    }
}

/// Unified error type for route-tracker operations.
#[derive(Debug, Clone, Error)]
pub enum TrackerError {
    /// `start()` was called while a session is already running
    #[error("session '{session_id}' is already active")]
    AlreadyActive { session_id: String },
    /// `stop()` ended the session while `start()` was still waiting for a fix
    #[error("session '{session_id}' was stopped before start completed")]
    StoppedDuringStart { session_id: String },
    /// Position acquisition failed
    #[error("acquisition failed: {0}")]
    Acquisition(#[from] AcquisitionError),
    /// Location push failed
    #[error("location push failed: {0}")]
    Push(#[from] PushError),
    /// Persistence/storage error
    #[error("persistence error: {message}")]
    Persistence { message: String },
    /// Routing provider error
    #[error("{}", format_provider(provider, message, status_code))]
    Provider {
        provider: String,
        message: String,
        status_code: Option<u16>,
    },
    /// Configuration error
    #[error("configuration error: {message}")]
    Config { message: String },
    /// Generic internal error
    #[error("internal error: {message}")]
    Internal { message: String },
}

fn format_provider(provider: &str, message: &str, status_code: &Option<u16>) -> String {
    match status_code {
        Some(code) => format!("provider '{}' failed ({}): {}", provider, code, message),
        None => format!("provider '{}' failed: {}", provider, message),
    }
}

impl TrackerError {
    pub(crate) fn persistence(message: impl Into<String>) -> Self {
        TrackerError::Persistence {
            message: message.into(),
        }
    }

    pub(crate) fn provider(provider: &str, message: impl Into<String>) -> Self {
        TrackerError::Provider {
            provider: provider.to_string(),
            message: message.into(),
            status_code: None,
        }
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        TrackerError::Config {
            message: message.into(),
        }
    }
}

impl From<rmp_serde::encode::Error> for TrackerError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        TrackerError::persistence(format!("encode failed: {}", e))
    }
}

impl From<rmp_serde::decode::Error> for TrackerError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        TrackerError::persistence(format!("decode failed: {}", e))
    }
}

#[cfg(feature = "persistence")]
impl From<rusqlite::Error> for TrackerError {
    fn from(e: rusqlite::Error) -> Self {
        TrackerError::persistence(e.to_string())
    }
}

/// Result type alias for route-tracker operations.
pub type Result<T> = std::result::Result<T, TrackerError>;
