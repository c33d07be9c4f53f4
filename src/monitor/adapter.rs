//! Wires channel callbacks into the monitor.
//!
//! Every handler holds a `Weak` reference, so a channel that outlives its
//! monitor calls into nothing.

use std::sync::Arc;

use serde_json::Value;

use crate::channel::{ChannelError, DisconnectReason};

use super::connection::Shared;
use super::events::INBOUND_EVENTS;

pub(super) fn install_handlers(shared: &Arc<Shared>) {
    let channel = Arc::clone(&shared.channel);
    let weak = Arc::downgrade(shared);

    let w = weak.clone();
    channel.on_connect(Arc::new(move || {
        if let Some(s) = w.upgrade() {
            s.handle_connected();
        }
    }));

    let w = weak.clone();
    channel.on_disconnect(Arc::new(move |reason: DisconnectReason| {
        if let Some(s) = w.upgrade() {
            s.handle_disconnected(reason);
        }
    }));

    let w = weak.clone();
    channel.on_error(Arc::new(move |error: ChannelError| {
        if let Some(s) = w.upgrade() {
            s.handle_error(error);
        }
    }));

    for event in INBOUND_EVENTS {
        let w = weak.clone();
        channel.on_event(
            event.name,
            Arc::new(move |payload: &Value| {
                if let Some(s) = w.upgrade() {
                    s.dispatch_event(event, payload);
                }
            }),
        );
    }
}
