//! Error taxonomy for the session relay.
//!
//! Every fallible operation in the relay returns [`RelayError`]. The variants
//! follow the failure classes a control connection can observe:
//!
//! - **Connection establishment**: [`RelayError::Authentication`],
//!   [`RelayError::Network`], [`RelayError::Timeout`]. These are surfaced to the
//!   client as a failed `connectResult`, never as a crash of the pool.
//! - **Session bookkeeping**: [`RelayError::NotConnected`],
//!   [`RelayError::DuplicateSession`], [`RelayError::PortInUse`].
//! - **Local terminals**: [`RelayError::Spawn`], [`RelayError::Backend`].
//! - **Log tailing**: [`RelayError::MalformedRecord`], which is logged and the
//!   offending line dropped.
//!
//! # Retry classification
//!
//! Connection failures are additionally classified as transient or permanent
//! by message pattern (see [`is_retryable_error`]). Authentication failures take
//! precedence: an error mentioning both "timeout" and "authentication failed"
//! is not retried, to avoid locking out accounts.

use std::time::Duration;

use thiserror::Error;

/// Errors produced by the relay's pools, tailer and router.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Session '{0}' already exists")]
    DuplicateSession(String),

    #[error("Local port {0} is already forwarded on this connection")]
    PortInUse(u16),

    #[error("Failed to start terminal: {0}")]
    Spawn(String),

    #[error("Terminal backend error: {0}")]
    Backend(String),

    #[error("Malformed record: {0}")]
    MalformedRecord(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("{0} is not enabled in this build")]
    FeatureDisabled(&'static str),

    #[error("{0}")]
    InvalidFrame(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RelayError>;

impl RelayError {
    /// Whether a failed connection attempt is worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            RelayError::Authentication(_) => false,
            RelayError::Timeout(_) => true,
            RelayError::Network(message) => is_retryable_error(message),
            RelayError::Io(e) => is_retryable_error(&e.to_string()),
            _ => false,
        }
    }

    /// Classify a transport-level failure message into the connect taxonomy.
    pub(crate) fn from_connect_failure(message: impl Into<String>) -> Self {
        let message = message.into();
        if is_auth_error(&message) {
            RelayError::Authentication(message)
        } else {
            RelayError::Network(message)
        }
    }
}

/// Authentication error patterns that indicate permanent failures.
const AUTH_ERRORS: &[&str] = &[
    "authentication failed",
    "password authentication failed",
    "key authentication failed",
    "agent authentication failed",
    "permission denied",
    "publickey",
    "auth fail",
    "no authentication",
    "all authentication methods failed",
];

/// Connection error patterns that indicate transient failures.
const RETRYABLE_ERRORS: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection timed out",
    "timeout",
    "network is unreachable",
    "no route to host",
    "host is down",
    "temporary failure",
    "resource temporarily unavailable",
    "handshake failed",
    "failed to connect",
    "broken pipe",
    "would block",
];

fn is_auth_error(error: &str) -> bool {
    let error_lower = error.to_lowercase();
    AUTH_ERRORS.iter().any(|pattern| error_lower.contains(pattern))
}

/// Determines if an error message describes a transient or permanent failure.
///
/// 1. Authentication failures are never retryable (checked first).
/// 2. Known connection errors ("connection refused", "timeout", ...) are retryable.
/// 3. Anything else is retried unless it looks like an SSH protocol error
///    without a timeout/connect hint.
pub(crate) fn is_retryable_error(error: &str) -> bool {
    let error_lower = error.to_lowercase();

    if is_auth_error(&error_lower) {
        return false;
    }

    if RETRYABLE_ERRORS
        .iter()
        .any(|pattern| error_lower.contains(pattern))
    {
        return true;
    }

    !error_lower.contains("ssh") || error_lower.contains("timeout") || error_lower.contains("connect")
}
