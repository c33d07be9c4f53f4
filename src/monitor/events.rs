//! Inbound event catalogue and the update type handed to observers.
//!
//! The service pushes named events whose payload identifies the entity it
//! concerns. The payload itself is opaque to the monitor and is forwarded
//! to observers untouched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entity::{EntityId, EntityKind, WatchKey};

/// An inbound event the monitor subscribes to on the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InboundEvent {
    /// Event name on the channel.
    pub name: &'static str,
    /// Kind of entity the event concerns.
    pub kind: EntityKind,
    /// Payload fields holding the entity id, tried in order.
    pub id_fields: &'static [&'static str],
}

/// Order status changed.
pub const ORDER_UPDATE: InboundEvent = InboundEvent {
    name: "order update",
    kind: EntityKind::Order,
    id_fields: &["order_uuid", "uuid"],
};

/// Order completed.
pub const ORDER_DONE: InboundEvent = InboundEvent {
    name: "order done",
    kind: EntityKind::Order,
    id_fields: &["order_uuid", "uuid"],
};

/// Driver moved.
pub const LOCATION_UPDATE: InboundEvent = InboundEvent {
    name: "location update",
    kind: EntityKind::Driver,
    id_fields: &["driver_uuid", "uuid"],
};

/// Waypoint ETA changed.
pub const WAYPOINT_ETA_UPDATED: InboundEvent = InboundEvent {
    name: "way point eta updated",
    kind: EntityKind::Waypoint,
    id_fields: &["waypoint_id", "way_point_id", "id"],
};

/// Driver arrived at a waypoint.
pub const WAYPOINT_ARRIVED: InboundEvent = InboundEvent {
    name: "way point arrived",
    kind: EntityKind::Waypoint,
    id_fields: &["waypoint_id", "way_point_id", "id"],
};

/// Waypoint completed.
pub const WAYPOINT_DONE: InboundEvent = InboundEvent {
    name: "way point done",
    kind: EntityKind::Waypoint,
    id_fields: &["waypoint_id", "way_point_id", "id"],
};

/// Every event the monitor listens for.
pub const INBOUND_EVENTS: [InboundEvent; 6] = [
    ORDER_UPDATE,
    ORDER_DONE,
    LOCATION_UPDATE,
    WAYPOINT_ETA_UPDATED,
    WAYPOINT_ARRIVED,
    WAYPOINT_DONE,
];

impl InboundEvent {
    /// Looks up a catalogue entry by channel event name.
    #[must_use]
    pub fn by_name(name: &str) -> Option<Self> {
        INBOUND_EVENTS.iter().copied().find(|e| e.name == name)
    }

    /// Extracts the key of the entity `payload` concerns.
    ///
    /// Waypoint ids must be numeric (numeric strings are accepted); order and
    /// driver ids are strings (numbers are stringified).
    #[must_use]
    pub fn extract_key(&self, payload: &Value) -> Option<WatchKey> {
        self.id_fields
            .iter()
            .find_map(|field| payload.get(*field).and_then(|v| self.id_from(v)))
            .map(|id| WatchKey::new(self.kind, id))
    }

    fn id_from(&self, v: &Value) -> Option<EntityId> {
        match self.kind {
            EntityKind::Waypoint => match v {
                Value::Number(n) => n.as_u64().map(EntityId::Numeric),
                Value::String(s) => s.trim().parse().ok().map(EntityId::Numeric),
                _ => None,
            },
            EntityKind::Order | EntityKind::Driver => match v {
                Value::String(s) if !s.is_empty() => Some(EntityId::Uuid(s.clone())),
                Value::Number(n) => Some(EntityId::Uuid(n.to_string())),
                _ => None,
            },
        }
    }
}

/// Update delivered to observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityUpdate {
    /// The entity the update concerns.
    pub key: WatchKey,
    /// Channel event name, e.g. `"order update"`.
    pub event: String,
    /// Payload exactly as received.
    pub payload: Value,
    /// When the monitor received it.
    pub received_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_by_name() {
        assert_eq!(InboundEvent::by_name("order update"), Some(ORDER_UPDATE));
        assert_eq!(InboundEvent::by_name("way point done"), Some(WAYPOINT_DONE));
        assert_eq!(InboundEvent::by_name("nope"), None);
    }

    #[test]
    fn test_extract_order_key_prefers_order_uuid() {
        let payload = json!({"uuid": "other", "order_uuid": "uuid-1", "status": 3});
        assert_eq!(ORDER_UPDATE.extract_key(&payload), Some(WatchKey::order("uuid-1")));

        let payload = json!({"uuid": "uuid-2"});
        assert_eq!(ORDER_DONE.extract_key(&payload), Some(WatchKey::order("uuid-2")));
    }

    #[test]
    fn test_extract_driver_key() {
        let payload = json!({"driver_uuid": "d-1", "lat": 32.1, "lng": 34.8});
        assert_eq!(LOCATION_UPDATE.extract_key(&payload), Some(WatchKey::driver("d-1")));
    }

    #[test]
    fn test_extract_waypoint_key_accepts_numeric_string() {
        assert_eq!(
            WAYPOINT_ARRIVED.extract_key(&json!({"way_point_id": 42})),
            Some(WatchKey::waypoint(42))
        );
        assert_eq!(
            WAYPOINT_ETA_UPDATED.extract_key(&json!({"id": "17"})),
            Some(WatchKey::waypoint(17))
        );
        assert_eq!(WAYPOINT_DONE.extract_key(&json!({"way_point_id": "x"})), None);
    }

    #[test]
    fn test_extract_waypoint_key_prefers_waypoint_id() {
        assert_eq!(
            WAYPOINT_DONE.extract_key(&json!({"waypoint_id": 5})),
            Some(WatchKey::waypoint(5))
        );
        assert_eq!(
            WAYPOINT_ARRIVED.extract_key(&json!({"waypoint_id": 8, "way_point_id": 9, "id": 10})),
            Some(WatchKey::waypoint(8))
        );
    }

    #[test]
    fn test_extract_missing_id() {
        assert_eq!(ORDER_UPDATE.extract_key(&json!({"status": 1})), None);
        assert_eq!(ORDER_UPDATE.extract_key(&json!({"uuid": ""})), None);
        assert_eq!(ORDER_UPDATE.extract_key(&json!("not an object")), None);
    }
}
