//! Realtime monitoring.
//!
//! [`ConnectionMonitor`] keeps one channel connection to the tracking
//! service and a registry of watched entities. Observers register through
//! [`ConnectionMonitor::watch`] and receive [`EntityUpdate`]s for the
//! entities they watch; after every reconnect the registry is replayed so
//! subscriptions survive transport drops without caller involvement.

/// Watch acknowledgements and the timer bounding them.
pub mod ack;
mod adapter;
/// Connection state machine.
pub mod connection;
/// Connection-wide notifications.
pub mod delegate;
/// Watch request construction.
pub mod dispatcher;
/// Inbound event catalogue.
pub mod events;
/// Watched-entity registry.
pub mod registry;

pub use ack::{AckHandle, WatchAck};
pub use connection::{ConnectionMonitor, ConnectionState, WeakConnectionMonitor};
pub use delegate::ConnectionDelegate;
pub use dispatcher::{WatchRequest, WATCH_DRIVER_EVENT, WATCH_ORDER_EVENT, WATCH_WAYPOINT_EVENT};
pub use events::{EntityUpdate, InboundEvent, INBOUND_EVENTS};
pub use registry::{
    ObserverHandle, ObserverId, RemoveOutcome, SubscriptionEntry, SubscriptionRegistry,
    UpsertOutcome, WatchObserver,
};
