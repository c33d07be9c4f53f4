//! Event channel boundary.
//!
//! An `EventChannel` owns exactly one transport connection to the tracking
//! service and exposes pub/sub primitives: connect, disconnect, emit with an
//! optional acknowledgement, and handler registration by event name. It knows
//! nothing about subscriptions; the monitor layers those on top.
//!
//! The wire encoding is the transport's business. Payloads cross this
//! boundary as `serde_json::Value`.

/// In-process loopback channel.
pub mod memory;

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::config::DEFAULT_REALTIME_HOST;
use crate::error::TransportError;

pub use memory::{Emission, MemoryChannel};

/// Invoked when the connection is established.
pub type ConnectHandler = Arc<dyn Fn() + Send + Sync>;

/// Invoked when an established connection closes.
pub type DisconnectHandler = Arc<dyn Fn(DisconnectReason) + Send + Sync>;

/// Invoked for every inbound event with the registered name.
pub type EventHandler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Invoked on connect failures and mid-session transport errors.
pub type ErrorHandler = Arc<dyn Fn(ChannelError) + Send + Sync>;

/// One-shot acknowledgement callback for an emitted event.
pub type AckCallback = Box<dyn FnOnce(Value) + Send>;

/// Parameters for a connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectParams {
    /// Developer token presented in the handshake.
    pub developer_token: String,
    /// Connect over TLS.
    pub use_ssl: bool,
    /// Host, optionally with a scheme and/or port.
    pub host: String,
}

impl ConnectParams {
    /// Creates parameters for the default host.
    #[must_use]
    pub fn new(developer_token: impl Into<String>, use_ssl: bool) -> Self {
        Self {
            developer_token: developer_token.into(),
            use_ssl,
            host: DEFAULT_REALTIME_HOST.to_string(),
        }
    }

    /// Replaces the host.
    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Endpoint URL. A host that already carries a scheme is used as-is.
    #[must_use]
    pub fn url(&self) -> String {
        let host = self.host.trim().trim_end_matches('/');
        if host.starts_with("http://") || host.starts_with("https://") {
            return host.to_string();
        }
        let scheme = if self.use_ssl { "https" } else { "http" };
        format!("{scheme}://{host}")
    }
}

/// Why a connection closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectReason {
    /// Human-readable description.
    pub message: String,
    /// Transport close code, if the transport has one.
    pub code: Option<u16>,
}

impl DisconnectReason {
    /// Creates a reason with a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    /// Creates a reason with a message and close code.
    pub fn with_code(message: impl Into<String>, code: u16) -> Self {
        Self {
            message: message.into(),
            code: Some(code),
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(code) = self.code {
            write!(f, "{} (code: {})", self.message, code)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

/// Error reported by the transport through `on_error`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelError {
    /// Human-readable error message.
    pub message: String,
}

impl ChannelError {
    /// Creates a channel error.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Transport connection owned by the monitor.
///
/// Implementations must:
/// - allow at most one connection attempt at a time (a second `connect()`
///   while connecting or connected is a no-op);
/// - report every failure through `on_error` or `on_disconnect`, never drop it;
/// - invoke handlers without holding internal locks, since handlers call back
///   into the monitor.
pub trait EventChannel: Send + Sync {
    /// Starts a connection attempt. Completion is reported through the
    /// connect/error handlers, possibly before this call returns.
    ///
    /// # Errors
    ///
    /// Returns a `TransportError` if the attempt could not even be started.
    fn connect(&self, params: &ConnectParams) -> Result<(), TransportError>;

    /// Closes the connection (or abandons the attempt in progress).
    fn disconnect(&self);

    /// Sends an event. `ack`, if given, is invoked with the service's response.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::NotConnected` when no connection is up.
    fn emit(&self, event: &str, payload: Value, ack: Option<AckCallback>) -> Result<(), TransportError>;

    /// Registers the connect handler.
    fn on_connect(&self, handler: ConnectHandler);

    /// Registers the disconnect handler.
    fn on_disconnect(&self, handler: DisconnectHandler);

    /// Registers a handler for the named inbound event.
    fn on_event(&self, event: &str, handler: EventHandler);

    /// Registers the error handler.
    fn on_error(&self, handler: ErrorHandler);

    /// Whether the transport currently reports a live connection.
    fn is_connected(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_scheme_follows_ssl_flag() {
        assert_eq!(ConnectParams::new("t", true).url(), format!("https://{DEFAULT_REALTIME_HOST}"));
        assert_eq!(
            ConnectParams::new("t", false).with_host("rt.local:3030").url(),
            "http://rt.local:3030"
        );
    }

    #[test]
    fn test_url_keeps_explicit_scheme() {
        let p = ConnectParams::new("t", true).with_host("http://10.0.0.2:3000/");
        assert_eq!(p.url(), "http://10.0.0.2:3000");
    }

    #[test]
    fn test_disconnect_reason_display() {
        assert_eq!(DisconnectReason::new("bye").to_string(), "bye");
        assert_eq!(DisconnectReason::with_code("gone", 1006).to_string(), "gone (code: 1006)");
    }
}
