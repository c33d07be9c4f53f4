//! Entity kinds, identifiers and watch targets.
//!
//! Everything the monitor watches is addressed by a `WatchKey`: the entity
//! kind plus its identifier. Orders and drivers are identified by UUID
//! strings issued by the tracking service, waypoints by a numeric id.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::WatchError;

/// Longest identifier string accepted by `watch()`.
const MAX_ID_LEN: usize = 64;

/// The category of thing being watched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// A customer order.
    Order,
    /// A driver carrying one or more orders.
    Driver,
    /// A stop along an order's route.
    Waypoint,
}

impl EntityKind {
    /// All kinds, in declaration order.
    pub const ALL: [Self; 3] = [Self::Order, Self::Driver, Self::Waypoint];
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Order => write!(f, "order"),
            Self::Driver => write!(f, "driver"),
            Self::Waypoint => write!(f, "waypoint"),
        }
    }
}

/// Identifier of a watched entity.
///
/// UUIDs are kept as the service sent them; the monitor never normalizes
/// them, so `"ABC"` and `"abc"` are distinct keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityId {
    /// Numeric id (waypoints).
    Numeric(u64),
    /// Service-issued UUID string (orders, drivers).
    Uuid(String),
}

impl EntityId {
    /// Returns the UUID string, if this is a UUID id.
    #[must_use]
    pub fn as_uuid(&self) -> Option<&str> {
        match self {
            Self::Uuid(s) => Some(s),
            Self::Numeric(_) => None,
        }
    }

    /// Returns the numeric id, if this is a numeric id.
    #[must_use]
    pub const fn as_numeric(&self) -> Option<u64> {
        match self {
            Self::Numeric(n) => Some(*n),
            Self::Uuid(_) => None,
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Numeric(n) => write!(f, "{n}"),
            Self::Uuid(s) => write!(f, "{s}"),
        }
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        Self::Uuid(s.to_string())
    }
}

impl From<String> for EntityId {
    fn from(s: String) -> Self {
        Self::Uuid(s)
    }
}

impl From<u64> for EntityId {
    fn from(n: u64) -> Self {
        Self::Numeric(n)
    }
}

/// Composite registry key: entity kind plus entity id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WatchKey {
    /// Entity kind.
    pub kind: EntityKind,
    /// Entity id.
    pub id: EntityId,
}

impl WatchKey {
    /// Creates a key.
    #[must_use]
    pub fn new(kind: EntityKind, id: impl Into<EntityId>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    /// Shorthand for an order key.
    #[must_use]
    pub fn order(uuid: impl Into<String>) -> Self {
        Self::new(EntityKind::Order, EntityId::Uuid(uuid.into()))
    }

    /// Shorthand for a driver key.
    #[must_use]
    pub fn driver(uuid: impl Into<String>) -> Self {
        Self::new(EntityKind::Driver, EntityId::Uuid(uuid.into()))
    }

    /// Shorthand for a waypoint key.
    #[must_use]
    pub fn waypoint(id: u64) -> Self {
        Self::new(EntityKind::Waypoint, EntityId::Numeric(id))
    }
}

impl fmt::Display for WatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// What a caller asks the monitor to watch, with everything needed to
/// (re)issue the watch request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WatchTarget {
    /// Watch an order, optionally through a shared-location link.
    Order {
        order_uuid: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        share_uuid: Option<String>,
    },

    /// Watch a driver's location. Requires the share the driver was seen through.
    Driver {
        driver_uuid: String,
        share_uuid: String,
    },

    /// Watch a single waypoint of an order.
    Waypoint {
        waypoint_id: u64,
        order_uuid: String,
    },
}

impl WatchTarget {
    /// Order target without a share.
    #[must_use]
    pub fn order(order_uuid: impl Into<String>) -> Self {
        Self::Order {
            order_uuid: order_uuid.into(),
            share_uuid: None,
        }
    }

    /// Order target through a shared-location link.
    #[must_use]
    pub fn shared_order(order_uuid: impl Into<String>, share_uuid: impl Into<String>) -> Self {
        Self::Order {
            order_uuid: order_uuid.into(),
            share_uuid: Some(share_uuid.into()),
        }
    }

    /// Driver target.
    #[must_use]
    pub fn driver(driver_uuid: impl Into<String>, share_uuid: impl Into<String>) -> Self {
        Self::Driver {
            driver_uuid: driver_uuid.into(),
            share_uuid: share_uuid.into(),
        }
    }

    /// Waypoint target.
    #[must_use]
    pub fn waypoint(waypoint_id: u64, order_uuid: impl Into<String>) -> Self {
        Self::Waypoint {
            waypoint_id,
            order_uuid: order_uuid.into(),
        }
    }

    /// The entity kind.
    #[must_use]
    pub const fn kind(&self) -> EntityKind {
        match self {
            Self::Order { .. } => EntityKind::Order,
            Self::Driver { .. } => EntityKind::Driver,
            Self::Waypoint { .. } => EntityKind::Waypoint,
        }
    }

    /// The registry key this target is recorded under.
    #[must_use]
    pub fn key(&self) -> WatchKey {
        match self {
            Self::Order { order_uuid, .. } => WatchKey::order(order_uuid.clone()),
            Self::Driver { driver_uuid, .. } => WatchKey::driver(driver_uuid.clone()),
            Self::Waypoint { waypoint_id, .. } => WatchKey::waypoint(*waypoint_id),
        }
    }

    /// The share UUID, if any.
    #[must_use]
    pub fn share_uuid(&self) -> Option<&str> {
        match self {
            Self::Order { share_uuid, .. } => share_uuid.as_deref(),
            Self::Driver { share_uuid, .. } => Some(share_uuid),
            Self::Waypoint { .. } => None,
        }
    }

    /// Validates the identifiers.
    ///
    /// # Errors
    ///
    /// Returns `WatchError::InvalidId` for empty, oversized or whitespace
    /// bearing identifiers, and for a zero waypoint id.
    pub fn validate(&self) -> Result<(), WatchError> {
        match self {
            Self::Order {
                order_uuid,
                share_uuid,
            } => {
                check_uuid("order_uuid", order_uuid)?;
                if let Some(share) = share_uuid {
                    check_uuid("share_uuid", share)?;
                }
            }
            Self::Driver {
                driver_uuid,
                share_uuid,
            } => {
                check_uuid("driver_uuid", driver_uuid)?;
                check_uuid("share_uuid", share_uuid)?;
            }
            Self::Waypoint {
                waypoint_id,
                order_uuid,
            } => {
                if *waypoint_id == 0 {
                    return Err(WatchError::InvalidId {
                        field: "waypoint_id",
                        reason: "must be non-zero".to_string(),
                    });
                }
                check_uuid("order_uuid", order_uuid)?;
            }
        }
        Ok(())
    }
}

fn check_uuid(field: &'static str, value: &str) -> Result<(), WatchError> {
    if value.is_empty() {
        return Err(WatchError::InvalidId {
            field,
            reason: "cannot be empty".to_string(),
        });
    }
    if value.len() > MAX_ID_LEN {
        return Err(WatchError::InvalidId {
            field,
            reason: format!("exceeds maximum length of {MAX_ID_LEN}"),
        });
    }
    if value.chars().any(char::is_whitespace) {
        return Err(WatchError::InvalidId {
            field,
            reason: "contains whitespace".to_string(),
        });
    }
    Ok(())
}
