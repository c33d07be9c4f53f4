//! Watch request construction and emission.
//!
//! Builds the per-kind watch payload and hands it to the channel together
//! with the acknowledgement callback. No state of its own: the monitor owns
//! the bookkeeping of which request is in flight.

use std::sync::Arc;

use serde_json::{json, Map, Value};

use crate::channel::{AckCallback, EventChannel};
use crate::entity::{WatchKey, WatchTarget};
use crate::error::TransportError;

/// Channel event for watching an order.
pub const WATCH_ORDER_EVENT: &str = "watch order";
/// Channel event for watching a driver.
pub const WATCH_DRIVER_EVENT: &str = "watch driver";
/// Channel event for watching a waypoint.
pub const WATCH_WAYPOINT_EVENT: &str = "watch way point";

/// A fully built watch request.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchRequest {
    /// Entity the request is for.
    pub key: WatchKey,
    /// Channel event name.
    pub event: &'static str,
    /// Request payload.
    pub payload: Value,
}

impl WatchRequest {
    /// Builds the request for `target`.
    #[must_use]
    pub fn for_target(target: &WatchTarget) -> Self {
        let (event, payload) = match target {
            WatchTarget::Order {
                order_uuid,
                share_uuid,
            } => {
                let mut body = Map::new();
                body.insert("order_uuid".to_string(), json!(order_uuid));
                if let Some(share) = share_uuid {
                    body.insert("share_uuid".to_string(), json!(share));
                }
                (WATCH_ORDER_EVENT, Value::Object(body))
            }
            WatchTarget::Driver {
                driver_uuid,
                share_uuid,
            } => (
                WATCH_DRIVER_EVENT,
                json!({ "driver_uuid": driver_uuid, "share_uuid": share_uuid }),
            ),
            WatchTarget::Waypoint {
                waypoint_id,
                order_uuid,
            } => (
                WATCH_WAYPOINT_EVENT,
                json!({ "waypoint_id": waypoint_id, "order_uuid": order_uuid }),
            ),
        };

        Self {
            key: target.key(),
            event,
            payload,
        }
    }
}

/// Forwards watch requests to the channel.
pub(crate) struct WatchRequestDispatcher {
    channel: Arc<dyn EventChannel>,
}

impl WatchRequestDispatcher {
    pub(crate) fn new(channel: Arc<dyn EventChannel>) -> Self {
        Self { channel }
    }

    /// Emits the request; `on_ack` receives the raw acknowledgement.
    pub(crate) fn dispatch<F>(&self, request: WatchRequest, on_ack: F) -> Result<(), TransportError>
    where
        F: FnOnce(Value) + Send + 'static,
    {
        let ack: AckCallback = Box::new(on_ack);
        self.channel.emit(request.event, request.payload, Some(ack))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::channel::{ConnectParams, MemoryChannel};

    #[test]
    fn test_order_payload_without_share() {
        let req = WatchRequest::for_target(&WatchTarget::order("o-1"));
        assert_eq!(req.event, WATCH_ORDER_EVENT);
        assert_eq!(req.payload, json!({"order_uuid": "o-1"}));
        assert_eq!(req.key, WatchKey::order("o-1"));
    }

    #[test]
    fn test_order_payload_with_share() {
        let req = WatchRequest::for_target(&WatchTarget::shared_order("o-1", "s-1"));
        assert_eq!(req.payload, json!({"order_uuid": "o-1", "share_uuid": "s-1"}));
    }

    #[test]
    fn test_driver_payload() {
        let req = WatchRequest::for_target(&WatchTarget::driver("d-1", "s-1"));
        assert_eq!(req.event, WATCH_DRIVER_EVENT);
        assert_eq!(req.payload, json!({"driver_uuid": "d-1", "share_uuid": "s-1"}));
    }

    #[test]
    fn test_waypoint_payload() {
        let req = WatchRequest::for_target(&WatchTarget::waypoint(9, "o-1"));
        assert_eq!(req.event, WATCH_WAYPOINT_EVENT);
        assert_eq!(req.payload, json!({"waypoint_id": 9, "order_uuid": "o-1"}));
        assert_eq!(req.key, WatchKey::waypoint(9));
    }

    #[test]
    fn test_dispatch_forwards_ack() {
        let channel = Arc::new(MemoryChannel::auto_accepting());
        channel.connect(&ConnectParams::new("T1", true)).unwrap();
        let dispatcher = WatchRequestDispatcher::new(channel.clone());

        let got = Arc::new(Mutex::new(None));
        let g = Arc::clone(&got);
        dispatcher
            .dispatch(WatchRequest::for_target(&WatchTarget::order("o-1")), move |v| {
                *g.lock().unwrap() = Some(v);
            })
            .unwrap();

        let emitted = channel.emitted_named(WATCH_ORDER_EVENT);
        assert_eq!(emitted.len(), 1);
        channel.ack(emitted[0].id, json!({"status": "ok"}));
        assert_eq!(got.lock().unwrap().clone(), Some(json!({"status": "ok"})));
    }

    #[test]
    fn test_dispatch_fails_when_disconnected() {
        let channel = Arc::new(MemoryChannel::new());
        let dispatcher = WatchRequestDispatcher::new(channel);
        let err = dispatcher
            .dispatch(WatchRequest::for_target(&WatchTarget::order("o-1")), |_| {})
            .unwrap_err();
        assert_eq!(err, TransportError::NotConnected);
    }
}
