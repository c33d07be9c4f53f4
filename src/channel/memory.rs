//! In-process loopback implementation of `EventChannel`.
//!
//! The host side of the channel (normally the remote service) is driven by
//! method calls: complete or fail a connect, acknowledge emissions, push
//! events, drop the connection. Used for embedded setups and tests.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::Value;

use crate::error::TransportError;

use super::{
    AckCallback, ChannelError, ConnectHandler, ConnectParams, DisconnectHandler, DisconnectReason,
    ErrorHandler, EventChannel, EventHandler,
};

/// An event emitted by the client side.
#[derive(Debug, Clone, PartialEq)]
pub struct Emission {
    /// Sequence number, usable with [`MemoryChannel::ack`].
    pub id: u64,
    /// Event name.
    pub event: String,
    /// Payload as emitted.
    pub payload: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkStatus {
    Idle,
    Connecting,
    Connected,
}

#[derive(Default)]
struct Handlers {
    connect: Option<ConnectHandler>,
    disconnect: Option<DisconnectHandler>,
    error: Option<ErrorHandler>,
    events: HashMap<String, Vec<EventHandler>>,
}

struct LinkState {
    status: LinkStatus,
    auto_accept: bool,
    attempts: Vec<ConnectParams>,
    emitted: Vec<Emission>,
    pending_acks: HashMap<u64, AckCallback>,
    next_emission: u64,
}

/// Loopback channel.
pub struct MemoryChannel {
    state: Mutex<LinkState>,
    handlers: Mutex<Handlers>,
}

impl std::fmt::Debug for MemoryChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.lock_state();
        f.debug_struct("MemoryChannel")
            .field("status", &st.status)
            .field("attempts", &st.attempts.len())
            .field("emitted", &st.emitted.len())
            .field("pending_acks", &st.pending_acks.len())
            .finish()
    }
}

impl Default for MemoryChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryChannel {
    /// Creates a channel whose connect attempts stay pending until
    /// [`complete_connect`](Self::complete_connect) or
    /// [`fail_connect`](Self::fail_connect).
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LinkState {
                status: LinkStatus::Idle,
                auto_accept: false,
                attempts: Vec::new(),
                emitted: Vec::new(),
                pending_acks: HashMap::new(),
                next_emission: 1,
            }),
            handlers: Mutex::new(Handlers::default()),
        }
    }

    /// Creates a channel that accepts every connect attempt immediately.
    #[must_use]
    pub fn auto_accepting() -> Self {
        let ch = Self::new();
        ch.lock_state().auto_accept = true;
        ch
    }

    fn lock_state(&self) -> MutexGuard<'_, LinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_handlers(&self) -> MutexGuard<'_, Handlers> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Accepts the pending connect attempt. Returns false if none is pending.
    pub fn complete_connect(&self) -> bool {
        {
            let mut st = self.lock_state();
            if st.status != LinkStatus::Connecting {
                return false;
            }
            st.status = LinkStatus::Connected;
        }
        let handler = self.lock_handlers().connect.clone();
        if let Some(h) = handler {
            h();
        }
        true
    }

    /// Rejects the pending connect attempt. Returns false if none is pending.
    pub fn fail_connect(&self, message: &str) -> bool {
        {
            let mut st = self.lock_state();
            if st.status != LinkStatus::Connecting {
                return false;
            }
            st.status = LinkStatus::Idle;
        }
        self.fire_error(ChannelError::new(message));
        true
    }

    /// Drops an established connection from the remote side. Outstanding
    /// acknowledgements are discarded, as a real transport would.
    pub fn drop_connection(&self, reason: &str) -> bool {
        {
            let mut st = self.lock_state();
            if st.status != LinkStatus::Connected {
                return false;
            }
            st.status = LinkStatus::Idle;
            st.pending_acks.clear();
        }
        self.fire_disconnect(DisconnectReason::with_code(reason, 1006));
        true
    }

    /// Raises a mid-session transport error without closing the link.
    pub fn raise_error(&self, message: &str) {
        self.fire_error(ChannelError::new(message));
    }

    /// Pushes an inbound event to every handler registered for `event`.
    /// Returns the number of handlers invoked.
    pub fn deliver(&self, event: &str, payload: &Value) -> usize {
        let handlers: Vec<EventHandler> = self
            .lock_handlers()
            .events
            .get(event)
            .cloned()
            .unwrap_or_default();
        for h in &handlers {
            h(payload);
        }
        handlers.len()
    }

    /// Acknowledges emission `id` with `response`. Returns false if the
    /// emission is unknown, already acknowledged, or was emitted without an ack.
    pub fn ack(&self, id: u64, response: Value) -> bool {
        let cb = self.lock_state().pending_acks.remove(&id);
        match cb {
            Some(cb) => {
                cb(response);
                true
            }
            None => false,
        }
    }

    /// Acknowledges every outstanding emission with `response`.
    pub fn ack_all(&self, response: &Value) -> usize {
        let mut pending: Vec<(u64, AckCallback)> = self.lock_state().pending_acks.drain().collect();
        pending.sort_by_key(|(id, _)| *id);
        let n = pending.len();
        for (_, cb) in pending {
            cb(response.clone());
        }
        n
    }

    /// Everything emitted so far, in order.
    #[must_use]
    pub fn emitted(&self) -> Vec<Emission> {
        self.lock_state().emitted.clone()
    }

    /// Emissions with the given event name.
    #[must_use]
    pub fn emitted_named(&self, event: &str) -> Vec<Emission> {
        self.lock_state()
            .emitted
            .iter()
            .filter(|e| e.event == event)
            .cloned()
            .collect()
    }

    /// Forgets recorded emissions (pending acks stay answerable).
    pub fn clear_emitted(&self) {
        self.lock_state().emitted.clear();
    }

    /// Every connect attempt that was actually started.
    #[must_use]
    pub fn connect_attempts(&self) -> Vec<ConnectParams> {
        self.lock_state().attempts.clone()
    }

    /// Whether a connect attempt is pending.
    #[must_use]
    pub fn is_connecting(&self) -> bool {
        self.lock_state().status == LinkStatus::Connecting
    }

    /// Number of emissions still awaiting an acknowledgement.
    #[must_use]
    pub fn pending_ack_count(&self) -> usize {
        self.lock_state().pending_acks.len()
    }

    fn fire_error(&self, err: ChannelError) {
        let handler = self.lock_handlers().error.clone();
        if let Some(h) = handler {
            h(err);
        }
    }

    fn fire_disconnect(&self, reason: DisconnectReason) {
        let handler = self.lock_handlers().disconnect.clone();
        if let Some(h) = handler {
            h(reason);
        }
    }
}

impl EventChannel for MemoryChannel {
    fn connect(&self, params: &ConnectParams) -> Result<(), TransportError> {
        let auto_accept = {
            let mut st = self.lock_state();
            if st.status != LinkStatus::Idle {
                return Ok(());
            }
            st.status = LinkStatus::Connecting;
            st.attempts.push(params.clone());
            st.auto_accept
        };
        if auto_accept {
            self.complete_connect();
        }
        Ok(())
    }

    fn disconnect(&self) {
        let was_connected = {
            let mut st = self.lock_state();
            let was = st.status == LinkStatus::Connected;
            st.status = LinkStatus::Idle;
            st.pending_acks.clear();
            was
        };
        if was_connected {
            self.fire_disconnect(DisconnectReason::with_code("io client disconnect", 1000));
        }
    }

    fn emit(&self, event: &str, payload: Value, ack: Option<AckCallback>) -> Result<(), TransportError> {
        let mut st = self.lock_state();
        if st.status != LinkStatus::Connected {
            return Err(TransportError::NotConnected);
        }
        let id = st.next_emission;
        st.next_emission += 1;
        st.emitted.push(Emission {
            id,
            event: event.to_string(),
            payload,
        });
        if let Some(cb) = ack {
            st.pending_acks.insert(id, cb);
        }
        Ok(())
    }

    fn on_connect(&self, handler: ConnectHandler) {
        self.lock_handlers().connect = Some(handler);
    }

    fn on_disconnect(&self, handler: DisconnectHandler) {
        self.lock_handlers().disconnect = Some(handler);
    }

    fn on_event(&self, event: &str, handler: EventHandler) {
        self.lock_handlers()
            .events
            .entry(event.to_string())
            .or_default()
            .push(handler);
    }

    fn on_error(&self, handler: ErrorHandler) {
        self.lock_handlers().error = Some(handler);
    }

    fn is_connected(&self) -> bool {
        self.lock_state().status == LinkStatus::Connected
    }
}
