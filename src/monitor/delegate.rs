//! Connection delegate.

use crate::channel::DisconnectReason;
use crate::error::MonitorError;

/// Receives channel-wide notifications from the monitor.
///
/// Held weakly: the monitor never keeps a delegate alive. Every method has
/// a no-op default. Callbacks run without monitor locks held.
pub trait ConnectionDelegate: Send + Sync {
    /// The channel connected (initially or after a reconnect).
    fn on_connected(&self) {}

    /// The channel closed without being asked to.
    fn on_disconnected(&self, _reason: &DisconnectReason) {}

    /// Connect failure (`MonitorError::Connection`) or mid-session transport
    /// error (`MonitorError::Transport`).
    fn on_connection_error(&self, _error: &MonitorError) {}

    /// Custom realtime host, queried at every connect attempt.
    fn host_domain(&self) -> Option<String> {
        None
    }
}
