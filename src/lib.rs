//! # trackmon - realtime delivery tracking monitor
//!
//! trackmon keeps a single realtime channel open to a delivery-tracking
//! service and lets many observers watch orders, drivers and waypoints over
//! it. It owns the connection lifecycle: subscriptions are remembered, and
//! replayed after every reconnect.
//!
//! ## Core Concepts
//!
//! - **EventChannel**: the transport boundary (connect, emit with ack, named events)
//! - **ConnectionMonitor**: state machine plus subscription registry
//! - **WatchTarget / WatchKey**: what is watched, and how it is keyed
//! - **AckHandle**: resolves once with the service's acknowledgement or an error
//! - **Staleness**: a live connection silent for over 240 s is reported as suspect
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use trackmon::{ConnectionMonitor, MonitorConfig, ObserverHandle, WatchTarget};
//!
//! let monitor = ConnectionMonitor::new(MonitorConfig::from_env()?, channel);
//! let handle = ObserverHandle::new(&my_observer);
//! let ack = monitor.watch(WatchTarget::order("uuid-1"), &handle);
//! monitor.connect()?;
//! ack.wait()?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod channel;
pub mod config;
pub mod connectivity;
pub mod entity;
pub mod error;
pub mod monitor;
pub mod time;

pub use channel::{ConnectParams, DisconnectReason, EventChannel, MemoryChannel};
pub use config::MonitorConfig;
pub use connectivity::{ConnectivityWatcher, Reachability, ReachabilityProbe, TcpProbe};
pub use entity::{EntityId, EntityKind, WatchKey, WatchTarget};
pub use error::{
    ConfigurationError, ConnectionError, MonitorError, MonitorResult, ObserverError,
    TransportError, WatchError,
};
pub use monitor::{
    AckHandle, ConnectionDelegate, ConnectionMonitor, ConnectionState, EntityUpdate,
    ObserverHandle, ObserverId, WatchAck, WatchObserver, WeakConnectionMonitor,
};
pub use time::{Clock, ManualClock, SystemClock};
