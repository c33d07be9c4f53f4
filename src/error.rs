//! Error types for trackmon.
//!
//! Errors are strongly typed using thiserror so callers can tell a missing
//! developer token apart from a transport that dropped mid-session, or an
//! acknowledgement that never arrived.

use thiserror::Error;

use crate::entity::WatchKey;

/// Configuration errors. Fatal to the attempted operation, never to the process.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("Developer token is not set")]
    MissingDeveloperToken,

    #[error("Developer token cannot be empty")]
    EmptyDeveloperToken,

    #[error("Invalid value for '{key}': {reason}")]
    InvalidValue {
        key: String,
        reason: String,
    },
}

/// Errors raised while establishing the channel connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("Connection failed: {message}")]
    Failed {
        message: String,
    },

    #[error("Connection closed before it was established: {reason}")]
    ClosedDuringHandshake {
        reason: String,
    },
}

/// Errors local to a single `watch()` call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WatchError {
    #[error("No acknowledgement for {key} after {duration_ms}ms")]
    AckTimeout {
        key: WatchKey,
        duration_ms: u64,
    },

    #[error("Invalid {field}: {reason}")]
    InvalidId {
        field: &'static str,
        reason: String,
    },

    #[error("Watch request for {key} rejected: {message}")]
    Rejected {
        key: WatchKey,
        message: String,
    },

    #[error("Failed to emit watch request for {key}: {message}")]
    EmitFailed {
        key: WatchKey,
        message: String,
    },

    #[error("Monitor was shut down before {key} was acknowledged")]
    MonitorShutdown {
        key: WatchKey,
    },

    #[error("{key} was unwatched before its request was sent")]
    Unwatched {
        key: WatchKey,
    },
}

/// Mid-session channel errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Transport error: {message}")]
    Channel {
        message: String,
    },

    #[error("Channel disconnected: {reason}")]
    Disconnected {
        reason: String,
    },

    #[error("Channel is not connected")]
    NotConnected,
}

/// Failure reported by an observer callback. Logged, never propagated.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ObserverError {
    /// What went wrong.
    pub message: String,
}

impl ObserverError {
    /// Creates an observer error.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Top-level error type for trackmon.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MonitorError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Watch error: {0}")]
    Watch(#[from] WatchError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl MonitorError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a configuration error.
    #[must_use]
    pub const fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }

    /// Returns true if this is a connection error.
    #[must_use]
    pub const fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_))
    }

    /// Returns true if an acknowledgement did not arrive in time.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Watch(WatchError::AckTimeout { .. }))
    }

    /// Returns true if this is a transport error.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Configuration(_) => false, // Same token, same outcome
            Self::Connection(_) | Self::Transport(_) => true,
            Self::Watch(e) => matches!(
                e,
                WatchError::AckTimeout { .. } | WatchError::EmitFailed { .. }
            ),
            Self::Internal { .. } => false,
        }
    }
}

/// Result type alias for trackmon operations.
pub type MonitorResult<T> = Result<T, MonitorError>;
