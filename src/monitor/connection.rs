//! The connection monitor.
//!
//! Owns the event channel, the subscription registry and the connection
//! state machine:
//!
//! ```text
//! Disconnected --connect()--> Connecting --channel up--> Connected
//!      ^                          |                        |   ^
//!      |                     error/close            drop / |   | channel up
//!      +--------------------------+                 error  v   |
//!      +---- disconnect() / token change ------------ Reconnecting
//! ```
//!
//! Every transition into `Connected` replays the registry: one watch request
//! per entry, in insertion order, carrying the acknowledgement waiters that
//! were still unresolved.
//!
//! All state lives behind one mutex. The lock is never held while calling
//! into the channel, an observer, or the connection delegate.

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::channel::{ChannelError, ConnectParams, DisconnectReason, EventChannel};
use crate::config::{MonitorConfig, DEFAULT_REALTIME_HOST};
use crate::connectivity::{
    ConnectivityObserver, ConnectivityTransition, ConnectivityWatcher, Reachability, TcpProbe,
};
use crate::entity::{EntityKind, WatchKey, WatchTarget};
use crate::error::{
    ConfigurationError, ConnectionError, MonitorError, MonitorResult, TransportError, WatchError,
};
use crate::time::{Clock, SystemClock};

use super::ack::{resolve_all, AckHandle, AckSender, AckTimer, Deadline, Waiter, WatchAck};
use super::adapter;
use super::delegate::ConnectionDelegate;
use super::dispatcher::{WatchRequest, WatchRequestDispatcher};
use super::events::{EntityUpdate, InboundEvent};
use super::registry::{ObserverHandle, RemoveOutcome, SubscriptionRegistry};

const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No connection and none wanted.
    Disconnected,
    /// First connection attempt in progress.
    Connecting,
    /// Channel up; watch requests go out immediately.
    Connected,
    /// An established connection was lost and is being re-established.
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
        };
        f.write_str(s)
    }
}

struct PendingAck {
    key: WatchKey,
    waiters: Vec<Waiter>,
}

/// Waiters whose emission was abandoned when the connection went away.
#[derive(Default)]
struct Requeued {
    disarm: Vec<u64>,
    orphaned: Vec<(WatchKey, Vec<Waiter>)>,
}

struct MonitorState {
    state: ConnectionState,
    developer_token: Option<String>,
    registry: SubscriptionRegistry,
    /// Key -> emission currently awaiting an acknowledgement.
    inflight: HashMap<WatchKey, u64>,
    /// Waiters for keys with no request on the wire.
    deferred: HashMap<WatchKey, Vec<Waiter>>,
    pending: HashMap<u64, PendingAck>,
    next_emission: u64,
    next_waiter: u64,
    intentional_disconnect: bool,
    manually_connected: bool,
    ever_connected: bool,
    last_event_at: Option<DateTime<Utc>>,
    connectivity: ConnectivityObserver,
    shut_down: bool,
}

impl MonitorState {
    fn new(developer_token: Option<String>) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            developer_token,
            registry: SubscriptionRegistry::new(),
            inflight: HashMap::new(),
            deferred: HashMap::new(),
            pending: HashMap::new(),
            next_emission: 1,
            next_waiter: 1,
            intentional_disconnect: false,
            manually_connected: false,
            ever_connected: false,
            last_event_at: None,
            connectivity: ConnectivityObserver::new(),
            shut_down: false,
        }
    }

    fn set_state(&mut self, to: ConnectionState) {
        if self.state != to {
            info!(from = %self.state, to = %to, "connection state changed");
            self.state = to;
        }
    }

    fn begin_emission(&mut self, key: WatchKey, waiters: Vec<Waiter>) -> u64 {
        let emission = self.next_emission;
        self.next_emission += 1;
        self.inflight.insert(key.clone(), emission);
        self.pending.insert(emission, PendingAck { key, waiters });
        emission
    }

    fn new_waiter(&mut self, tx: AckSender) -> Waiter {
        let id = self.next_waiter;
        self.next_waiter += 1;
        Waiter::new(id, tx)
    }

    /// Detaches one waiter wherever it is parked. The emission it rode, if
    /// any, stays in flight for the other waiters and the replay bookkeeping.
    fn take_waiter(&mut self, id: u64) -> Option<(WatchKey, Waiter)> {
        let deferred_hit = self.deferred.iter().find_map(|(key, waiters)| {
            waiters
                .iter()
                .position(|w| w.id == id)
                .map(|pos| (key.clone(), pos))
        });
        if let Some((key, pos)) = deferred_hit {
            let waiters = self.deferred.get_mut(&key)?;
            let waiter = waiters.remove(pos);
            if waiters.is_empty() {
                self.deferred.remove(&key);
            }
            return Some((key, waiter));
        }
        let (emission, pos) = self.pending.iter().find_map(|(emission, p)| {
            p.waiters
                .iter()
                .position(|w| w.id == id)
                .map(|pos| (*emission, pos))
        })?;
        let p = self.pending.get_mut(&emission)?;
        Some((p.key.clone(), p.waiters.remove(pos)))
    }

    /// Moves every in-flight waiter back to `deferred` so the next replay
    /// carries it. Waiters of keys that are no longer registered are handed
    /// back as orphans.
    fn requeue_inflight(&mut self) -> Requeued {
        let mut out = Requeued::default();
        self.inflight.clear();
        let mut drained: Vec<(u64, PendingAck)> = self.pending.drain().collect();
        drained.sort_by_key(|(em, _)| *em);
        for (emission, p) in drained {
            out.disarm.push(emission);
            if p.waiters.is_empty() {
                continue;
            }
            if self.registry.is_empty(&p.key) {
                out.orphaned.push((p.key, p.waiters));
            } else {
                self.deferred.entry(p.key).or_default().extend(p.waiters);
            }
        }
        out
    }

    fn is_stale(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        if !matches!(
            self.state,
            ConnectionState::Connected | ConnectionState::Reconnecting
        ) || !self.ever_connected
        {
            return false;
        }
        let Some(last) = self.last_event_at else {
            return false;
        };
        // A clock that moved backwards yields a negative span: not stale.
        (now - last).to_std().is_ok_and(|elapsed| elapsed > threshold)
    }
}

enum Notice {
    Connected,
    Disconnected(DisconnectReason),
    Error(MonitorError),
}

pub(super) struct Shared {
    cfg: MonitorConfig,
    pub(super) channel: Arc<dyn EventChannel>,
    dispatcher: WatchRequestDispatcher,
    clock: Arc<dyn Clock>,
    state: Mutex<MonitorState>,
    delegate: RwLock<Option<Weak<dyn ConnectionDelegate>>>,
    timer: AckTimer,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn delegate(&self) -> Option<Arc<dyn ConnectionDelegate>> {
        self.delegate
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade)
    }

    fn notify(&self, notices: Vec<Notice>) {
        if notices.is_empty() {
            return;
        }
        let Some(delegate) = self.delegate() else {
            return;
        };
        for notice in notices {
            match notice {
                Notice::Connected => delegate.on_connected(),
                Notice::Disconnected(reason) => delegate.on_disconnected(&reason),
                Notice::Error(err) => delegate.on_connection_error(&err),
            }
        }
    }

    /// Delegate host, then configured host, then the default.
    fn resolve_host(&self) -> String {
        self.delegate()
            .and_then(|d| d.host_domain())
            .filter(|h| !h.trim().is_empty())
            .or_else(|| self.cfg.host.clone())
            .unwrap_or_else(|| DEFAULT_REALTIME_HOST.to_string())
    }

    fn send(self: &Arc<Self>, emission: u64, target: &WatchTarget) {
        let request = WatchRequest::for_target(target);
        debug!(
            kind = %request.key.kind,
            entity_id = %request.key.id,
            emission,
            event = request.event,
            "sending watch request"
        );
        self.timer.arm(Deadline::Emission(emission), self.cfg.ack_timeout);
        let weak = Arc::downgrade(self);
        let result = self.dispatcher.dispatch(request, move |response| {
            if let Some(shared) = weak.upgrade() {
                shared.handle_ack(emission, response);
            }
        });
        if let Err(e) = result {
            self.fail_emission(emission, &e);
        }
    }

    fn take_pending(&self, emission: u64) -> Option<PendingAck> {
        let mut st = self.lock();
        let p = st.pending.remove(&emission)?;
        if st.inflight.get(&p.key) == Some(&emission) {
            st.inflight.remove(&p.key);
        }
        Some(p)
    }

    /// Resolves `waiters` and drops their deadlines.
    fn settle(&self, waiters: Vec<Waiter>, result: &MonitorResult<WatchAck>) {
        for w in &waiters {
            self.timer.disarm(Deadline::Waiter(w.id));
        }
        resolve_all(waiters, result);
    }

    fn handle_ack(&self, emission: u64, response: Value) {
        self.timer.disarm(Deadline::Emission(emission));
        let Some(p) = self.take_pending(emission) else {
            debug!(emission, "acknowledgement for abandoned request ignored");
            return;
        };
        let result = WatchAck::from_response(p.key.clone(), response, self.clock.now())
            .map_err(MonitorError::from);
        match &result {
            Ok(_) => debug!(kind = %p.key.kind, entity_id = %p.key.id, "watch acknowledged"),
            Err(e) => warn!(kind = %p.key.kind, entity_id = %p.key.id, error = %e, "watch rejected"),
        }
        self.settle(p.waiters, &result);
    }

    fn expire(&self, what: Deadline) {
        match what {
            Deadline::Emission(emission) => {
                let Some(p) = self.take_pending(emission) else {
                    return;
                };
                let err = self.timed_out(&p.key);
                self.settle(p.waiters, &Err(err));
            }
            Deadline::Waiter(id) => {
                let Some((key, waiter)) = self.lock().take_waiter(id) else {
                    return;
                };
                waiter.resolve(Err(self.timed_out(&key)));
            }
        }
    }

    fn timed_out(&self, key: &WatchKey) -> MonitorError {
        let duration_ms = u64::try_from(self.cfg.ack_timeout.as_millis()).unwrap_or(u64::MAX);
        warn!(kind = %key.kind, entity_id = %key.id, duration_ms, "watch acknowledgement timed out");
        WatchError::AckTimeout {
            key: key.clone(),
            duration_ms,
        }
        .into()
    }

    fn fail_emission(&self, emission: u64, cause: &TransportError) {
        self.timer.disarm(Deadline::Emission(emission));
        let Some(p) = self.take_pending(emission) else {
            return;
        };
        warn!(kind = %p.key.kind, entity_id = %p.key.id, error = %cause, "failed to emit watch request");
        let err = MonitorError::from(WatchError::EmitFailed {
            key: p.key.clone(),
            message: cause.to_string(),
        });
        self.settle(p.waiters, &Err(err));
    }

    fn finish_requeue(&self, requeued: Requeued, reason: &str) {
        for emission in requeued.disarm {
            self.timer.disarm(Deadline::Emission(emission));
        }
        let err: MonitorResult<WatchAck> = Err(TransportError::Disconnected {
            reason: reason.to_string(),
        }
        .into());
        for (_, waiters) in requeued.orphaned {
            self.settle(waiters, &err);
        }
    }

    fn resolve_unwatched(&self, orphans: Vec<(WatchKey, Vec<Waiter>)>) {
        for (key, waiters) in orphans {
            self.settle(waiters, &Err(WatchError::Unwatched { key }.into()));
        }
    }

    /// Starts a reconnect attempt from `Reconnecting`. Failures are reported
    /// to the delegate; the state stays `Reconnecting`.
    fn reopen(&self) {
        let host = self.resolve_host();
        let params = {
            let st = self.lock();
            if st.state != ConnectionState::Reconnecting {
                return;
            }
            match st.developer_token.clone() {
                Some(token) => ConnectParams::new(token, self.cfg.use_ssl).with_host(host),
                None => return,
            }
        };
        info!(url = %params.url(), "reconnecting channel");
        if let Err(e) = self.channel.connect(&params) {
            let err = MonitorError::from(ConnectionError::Failed {
                message: e.to_string(),
            });
            warn!(error = %err, "reconnect attempt could not be started");
            self.notify(vec![Notice::Error(err)]);
        }
    }

    pub(super) fn handle_connected(self: &Arc<Self>) {
        let (batch, orphans) = {
            let mut guard = self.lock();
            let st = &mut *guard;
            let current = st.state;
            match current {
                ConnectionState::Connecting | ConnectionState::Reconnecting => {}
                ConnectionState::Connected => {
                    debug!("duplicate connect notification ignored");
                    return;
                }
                ConnectionState::Disconnected => {
                    drop(guard);
                    info!("channel connected after disconnect was requested; closing it");
                    self.channel.disconnect();
                    return;
                }
            }
            st.set_state(ConnectionState::Connected);
            st.ever_connected = true;
            st.last_event_at = Some(self.clock.now());

            let orphans: Vec<(WatchKey, Vec<Waiter>)> = st
                .registry
                .prune_dead()
                .into_iter()
                .filter_map(|key| st.deferred.remove(&key).map(|w| (key, w)))
                .collect();

            let mut batch = Vec::new();
            for entry in st.registry.all_entries() {
                let key = entry.key();
                if st.inflight.contains_key(&key) {
                    continue;
                }
                let waiters = st.deferred.remove(&key).unwrap_or_default();
                let emission = st.begin_emission(key, waiters);
                batch.push((emission, entry.target));
            }
            (batch, orphans)
        };

        info!(entries = batch.len(), "replaying watch requests");
        for (emission, target) in &batch {
            self.send(*emission, target);
        }
        self.resolve_unwatched(orphans);
        self.notify(vec![Notice::Connected]);
    }

    pub(super) fn handle_disconnected(&self, reason: DisconnectReason) {
        let (requeued, notice, reconnect) = {
            let mut st = self.lock();
            let current = st.state;
            if st.intentional_disconnect || current == ConnectionState::Disconnected {
                debug!(reason = %reason, "channel closed");
                return;
            }
            match current {
                ConnectionState::Connecting => {
                    st.set_state(ConnectionState::Disconnected);
                    let err = ConnectionError::ClosedDuringHandshake {
                        reason: reason.to_string(),
                    };
                    (Requeued::default(), Notice::Error(err.into()), false)
                }
                ConnectionState::Connected => {
                    st.set_state(ConnectionState::Reconnecting);
                    let requeued = st.requeue_inflight();
                    let reconnect = !st.connectivity.is_unreachable();
                    (requeued, Notice::Disconnected(reason.clone()), reconnect)
                }
                ConnectionState::Reconnecting | ConnectionState::Disconnected => {
                    debug!(reason = %reason, "close notification while reconnecting ignored");
                    return;
                }
            }
        };
        warn!(reason = %reason, "channel closed unexpectedly");
        self.finish_requeue(requeued, &reason.message);
        self.notify(vec![notice]);
        if reconnect {
            self.reopen();
        }
    }

    pub(super) fn handle_error(&self, error: ChannelError) {
        let (requeued, err, restart) = {
            let mut st = self.lock();
            let current = st.state;
            match current {
                ConnectionState::Connecting => {
                    st.set_state(ConnectionState::Disconnected);
                    let err: MonitorError = ConnectionError::Failed {
                        message: error.message.clone(),
                    }
                    .into();
                    (Requeued::default(), err, false)
                }
                ConnectionState::Reconnecting => {
                    let err: MonitorError = ConnectionError::Failed {
                        message: error.message.clone(),
                    }
                    .into();
                    (Requeued::default(), err, false)
                }
                ConnectionState::Connected => {
                    st.set_state(ConnectionState::Reconnecting);
                    let requeued = st.requeue_inflight();
                    let restart = !st.connectivity.is_unreachable();
                    let err: MonitorError = TransportError::Channel {
                        message: error.message.clone(),
                    }
                    .into();
                    (requeued, err, restart)
                }
                ConnectionState::Disconnected => {
                    let err: MonitorError = TransportError::Channel {
                        message: error.message.clone(),
                    }
                    .into();
                    (Requeued::default(), err, false)
                }
            }
        };
        warn!(error = %err, "channel error");
        self.finish_requeue(requeued, &error.message);
        self.notify(vec![Notice::Error(err)]);
        if restart {
            self.channel.disconnect();
            self.reopen();
        }
    }

    pub(super) fn dispatch_event(&self, event: InboundEvent, payload: &Value) -> usize {
        let now = self.clock.now();
        let key = event.extract_key(payload);
        let observers = {
            let mut st = self.lock();
            st.last_event_at = Some(now);
            match &key {
                Some(k) => st.registry.observers(k),
                None => Vec::new(),
            }
        };
        let Some(key) = key else {
            debug!(event = event.name, "event without entity id ignored");
            return 0;
        };
        if observers.is_empty() {
            debug!(event = event.name, kind = %key.kind, entity_id = %key.id, "event for unwatched entity");
            return 0;
        }

        let update = EntityUpdate {
            key,
            event: event.name.to_string(),
            payload: payload.clone(),
            received_at: now,
        };
        let mut notified = 0;
        let mut saw_dead = false;
        for handle in &observers {
            let Some(observer) = handle.upgrade() else {
                saw_dead = true;
                continue;
            };
            notified += 1;
            match catch_unwind(AssertUnwindSafe(|| observer.on_update(&update))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(observer = %handle.id(), event = event.name, error = %e, "observer failed");
                }
                Err(_) => {
                    warn!(observer = %handle.id(), event = event.name, "observer panicked");
                }
            }
        }
        debug!(event = event.name, kind = %update.key.kind, entity_id = %update.key.id, notified, "event delivered");
        if saw_dead {
            self.prune_dead();
        }
        notified
    }

    fn prune_dead(&self) {
        let orphans: Vec<(WatchKey, Vec<Waiter>)> = {
            let mut guard = self.lock();
            let st = &mut *guard;
            st.registry
                .prune_dead()
                .into_iter()
                .filter_map(|key| st.deferred.remove(&key).map(|w| (key, w)))
                .collect()
        };
        self.resolve_unwatched(orphans);
    }
}

/// Realtime tracking monitor.
///
/// Cheap to clone; clones share one connection and one registry.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
///
/// use serde_json::json;
/// use trackmon::channel::MemoryChannel;
/// use trackmon::error::ObserverError;
/// use trackmon::{ConnectionMonitor, EntityUpdate, MonitorConfig, ObserverHandle, WatchTarget};
///
/// let channel = Arc::new(MemoryChannel::auto_accepting());
/// let monitor = ConnectionMonitor::new(
///     MonitorConfig::default().with_developer_token("T1"),
///     channel.clone(),
/// );
///
/// let observer = Arc::new(|u: &EntityUpdate| -> Result<(), ObserverError> {
///     println!("{} -> {}", u.key, u.payload);
///     Ok(())
/// });
/// let handle = ObserverHandle::new(&observer);
///
/// let ack = monitor.watch(WatchTarget::order("uuid-1"), &handle);
/// monitor.connect().unwrap();
/// channel.ack_all(&json!({"status": "ok"}));
/// assert!(ack.wait().is_ok());
/// ```
#[derive(Clone)]
pub struct ConnectionMonitor {
    shared: Arc<Shared>,
}

/// Non-owning reference to a [`ConnectionMonitor`].
#[derive(Clone)]
pub struct WeakConnectionMonitor {
    shared: Weak<Shared>,
}

impl WeakConnectionMonitor {
    /// Returns the monitor if any strong handle is still alive.
    #[must_use]
    pub fn upgrade(&self) -> Option<ConnectionMonitor> {
        self.shared.upgrade().map(|shared| ConnectionMonitor { shared })
    }
}

impl fmt::Debug for WeakConnectionMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakConnectionMonitor")
            .field("alive", &(self.shared.strong_count() > 0))
            .finish()
    }
}

impl fmt::Debug for ConnectionMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.shared.lock();
        f.debug_struct("ConnectionMonitor")
            .field("state", &st.state)
            .field("entries", &st.registry.len())
            .field("inflight", &st.inflight.len())
            .field("last_event_at", &st.last_event_at)
            .finish_non_exhaustive()
    }
}

impl ConnectionMonitor {
    /// Creates a monitor over `channel` using the wall clock.
    pub fn new(config: MonitorConfig, channel: Arc<dyn EventChannel>) -> Self {
        Self::with_clock(config, channel, Arc::new(SystemClock))
    }

    /// Creates a monitor with an explicit clock.
    ///
    /// # Panics
    ///
    /// Panics if the acknowledgement timer thread cannot be spawned.
    pub fn with_clock(
        config: MonitorConfig,
        channel: Arc<dyn EventChannel>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let token = config.developer_token.clone().filter(|t| !t.is_empty());
        let shared = Arc::new_cyclic(|weak: &Weak<Shared>| {
            let on_expire = {
                let weak = weak.clone();
                move |what| {
                    if let Some(shared) = weak.upgrade() {
                        shared.expire(what);
                    }
                }
            };
            Shared {
                timer: AckTimer::start(config.timer_queue_capacity, on_expire),
                dispatcher: WatchRequestDispatcher::new(Arc::clone(&channel)),
                channel,
                clock,
                state: Mutex::new(MonitorState::new(token)),
                delegate: RwLock::new(None),
                cfg: config,
            }
        });
        adapter::install_handlers(&shared);
        Self { shared }
    }

    /// A handle that does not keep the monitor alive.
    #[must_use]
    pub fn downgrade(&self) -> WeakConnectionMonitor {
        WeakConnectionMonitor {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &MonitorConfig {
        &self.shared.cfg
    }

    /// Sets the connection delegate. Only a weak reference is kept.
    pub fn set_connection_delegate<D: ConnectionDelegate + 'static>(&self, delegate: &Arc<D>) {
        let weak = Arc::downgrade(delegate);
        let weak: Weak<dyn ConnectionDelegate> = weak;
        *self
            .shared
            .delegate
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(weak);
    }

    /// Removes the connection delegate.
    pub fn clear_connection_delegate(&self) {
        *self
            .shared
            .delegate
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Sets the developer token.
    ///
    /// Changing the token of a live (or connecting) monitor disconnects it;
    /// call [`connect`](Self::connect) again to use the new token.
    ///
    /// # Errors
    ///
    /// `ConfigurationError::EmptyDeveloperToken` for an empty token.
    pub fn set_developer_token(&self, token: impl Into<String>) -> MonitorResult<()> {
        let token = token.into();
        if token.is_empty() {
            return Err(ConfigurationError::EmptyDeveloperToken.into());
        }
        let teardown = {
            let mut st = self.shared.lock();
            if st.developer_token.as_deref() == Some(token.as_str()) {
                return Ok(());
            }
            st.developer_token = Some(token);
            if st.state == ConnectionState::Disconnected {
                None
            } else {
                info!("developer token changed; dropping current connection");
                st.intentional_disconnect = true;
                st.set_state(ConnectionState::Disconnected);
                Some(st.requeue_inflight())
            }
        };
        if let Some(requeued) = teardown {
            self.shared.finish_requeue(requeued, "developer token changed");
            self.shared.channel.disconnect();
        }
        Ok(())
    }

    /// True once a developer token has been configured.
    #[must_use]
    pub fn developer_token_set(&self) -> bool {
        self.shared.lock().developer_token.is_some()
    }

    /// Opens the channel. A no-op while connecting or connected.
    ///
    /// Success means the attempt started; completion is reported through
    /// [`state`](Self::state) and the connection delegate.
    ///
    /// # Errors
    ///
    /// - `ConfigurationError::MissingDeveloperToken` without a token.
    /// - `ConnectionError::Failed` if the channel refused to start.
    /// - `MonitorError::Internal` after [`shutdown`](Self::shutdown).
    pub fn connect(&self) -> MonitorResult<()> {
        let host = self.shared.resolve_host();
        let params = {
            let mut st = self.shared.lock();
            if st.shut_down {
                return Err(MonitorError::internal("monitor has been shut down"));
            }
            if matches!(
                st.state,
                ConnectionState::Connecting | ConnectionState::Connected
            ) {
                debug!(state = %st.state, "connect ignored");
                return Ok(());
            }
            let Some(token) = st.developer_token.clone() else {
                return Err(ConfigurationError::MissingDeveloperToken.into());
            };
            st.manually_connected = true;
            st.intentional_disconnect = false;
            if st.state == ConnectionState::Disconnected {
                st.set_state(ConnectionState::Connecting);
            }
            ConnectParams::new(token, self.shared.cfg.use_ssl).with_host(host)
        };

        info!(url = %params.url(), "opening channel");
        if let Err(e) = self.shared.channel.connect(&params) {
            let err = MonitorError::from(ConnectionError::Failed {
                message: e.to_string(),
            });
            {
                let mut st = self.shared.lock();
                if st.state != ConnectionState::Connected {
                    st.set_state(ConnectionState::Disconnected);
                }
            }
            warn!(error = %err, "connect attempt could not be started");
            self.shared.notify(vec![Notice::Error(err.clone())]);
            return Err(err);
        }
        Ok(())
    }

    /// Closes the channel. The registry is kept and replayed on the next
    /// [`connect`](Self::connect). A no-op while disconnected.
    pub fn disconnect(&self) {
        let requeued = {
            let mut st = self.shared.lock();
            st.intentional_disconnect = true;
            st.manually_connected = false;
            if st.state == ConnectionState::Disconnected {
                return;
            }
            st.set_state(ConnectionState::Disconnected);
            st.requeue_inflight()
        };
        self.shared.finish_requeue(requeued, "disconnected by client");
        self.shared.channel.disconnect();
    }

    /// Registers `observer` for `target` and requests updates.
    ///
    /// Sent immediately when connected, otherwise on the next transition to
    /// `Connected`. A request already on the wire for the same entity is
    /// shared rather than repeated. The returned handle resolves once, within
    /// `ack_timeout` of this call whatever the connection state; a timeout
    /// leaves the registration in place.
    pub fn watch(&self, target: WatchTarget, observer: &ObserverHandle) -> AckHandle {
        let key = target.key();
        if let Err(e) = target.validate() {
            warn!(kind = %key.kind, error = %e, "watch request rejected locally");
            return AckHandle::resolved(key, Err(e.into()));
        }

        let (tx, handle) = AckHandle::pair(key.clone());
        let (waiter_id, emission) = {
            let mut guard = self.shared.lock();
            let st = &mut *guard;
            if st.shut_down {
                drop(guard);
                return AckHandle::resolved(key.clone(), Err(WatchError::MonitorShutdown { key }.into()));
            }
            let outcome = st.registry.upsert(target.clone(), observer.clone());
            debug!(kind = %key.kind, entity_id = %key.id, ?outcome, state = %st.state, "watch registered");

            let waiter = st.new_waiter(tx);
            let waiter_id = waiter.id;
            let emission = if let Some(pending) =
                st.inflight.get(&key).and_then(|em| st.pending.get_mut(em))
            {
                pending.waiters.push(waiter);
                None
            } else if st.state == ConnectionState::Connected {
                Some(st.begin_emission(key, vec![waiter]))
            } else {
                st.deferred.entry(key).or_default().push(waiter);
                None
            };
            (waiter_id, emission)
        };
        self.shared
            .timer
            .arm(Deadline::Waiter(waiter_id), self.shared.cfg.ack_timeout);
        if let Some(emission) = emission {
            self.shared.send(emission, &target);
        }
        handle
    }

    /// Removes `observer` from `key`. No network traffic.
    ///
    /// Returns false if the observer was not registered for `key`. When the
    /// entry empties, acknowledgement waiters that never got a request on
    /// the wire resolve with `WatchError::Unwatched`.
    pub fn unwatch(&self, key: &WatchKey, observer: &ObserverHandle) -> bool {
        let (outcome, orphaned) = {
            let mut st = self.shared.lock();
            let outcome = st.registry.remove_observer(key, observer.id());
            let orphaned = if outcome == RemoveOutcome::EntryPruned {
                st.deferred.remove(key).unwrap_or_default()
            } else {
                Vec::new()
            };
            (outcome, orphaned)
        };
        debug!(kind = %key.kind, entity_id = %key.id, ?outcome, "unwatch");
        self.shared
            .settle(orphaned, &Err(WatchError::Unwatched { key: key.clone() }.into()));
        outcome != RemoveOutcome::NotRegistered
    }

    /// Feeds a reachability sample.
    ///
    /// An unreachable -> reachable transition forces a reconnect, but only
    /// for a monitor the caller connected and did not disconnect.
    pub fn handle_reachability(&self, reachability: Reachability) {
        let (requeued, restart) = {
            let mut st = self.shared.lock();
            match st.connectivity.observe(reachability) {
                None => return,
                Some(ConnectivityTransition::Lost) => {
                    info!("network unreachable");
                    return;
                }
                Some(ConnectivityTransition::Recovered) => info!("network reachable again"),
            }
            if !st.manually_connected || st.intentional_disconnect || st.shut_down {
                return;
            }
            let current = st.state;
            match current {
                ConnectionState::Connected => {
                    st.set_state(ConnectionState::Reconnecting);
                    (st.requeue_inflight(), true)
                }
                ConnectionState::Reconnecting => (Requeued::default(), false),
                ConnectionState::Disconnected | ConnectionState::Connecting => return,
            }
        };
        self.shared.finish_requeue(requeued, "network changed");
        if restart {
            self.shared.channel.disconnect();
        }
        self.shared.reopen();
    }

    /// Starts a [`ConnectivityWatcher`] probing the realtime host over TCP
    /// every `reachability_poll_interval`.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the watcher thread cannot be spawned.
    pub fn spawn_connectivity_watcher(&self) -> std::io::Result<ConnectivityWatcher> {
        let host = self.shared.resolve_host();
        let probe = TcpProbe::for_endpoint(&host, self.shared.cfg.use_ssl, PROBE_TIMEOUT);
        ConnectivityWatcher::spawn(
            self.downgrade(),
            Arc::new(probe),
            self.shared.cfg.reachability_poll_interval,
        )
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    /// Whether the caller asked to be connected and has not disconnected since.
    #[must_use]
    pub fn was_manually_connected(&self) -> bool {
        self.shared.lock().manually_connected
    }

    /// When the last inbound event (or connect) was seen.
    #[must_use]
    pub fn last_event_at(&self) -> Option<DateTime<Utc>> {
        self.shared.lock().last_event_at
    }

    /// True if the connection has been silent longer than the staleness
    /// threshold. Always false before the first successful connect.
    #[must_use]
    pub fn is_waiting_too_long_for_socket_event(&self) -> bool {
        let now = self.shared.clock.now();
        self.shared
            .lock()
            .is_stale(now, self.shared.cfg.staleness_threshold)
    }

    /// Connected and not stale.
    #[must_use]
    pub fn is_working_connection(&self) -> bool {
        let now = self.shared.clock.now();
        let st = self.shared.lock();
        st.state == ConnectionState::Connected
            && !st.is_stale(now, self.shared.cfg.staleness_threshold)
    }

    /// True if any entity of `kind` is watched.
    #[must_use]
    pub fn is_monitoring(&self, kind: EntityKind) -> bool {
        !self.shared.lock().registry.keys_of(kind).is_empty()
    }

    /// True if `key` has at least one observer.
    #[must_use]
    pub fn is_watching(&self, key: &WatchKey) -> bool {
        !self.shared.lock().registry.is_empty(key)
    }

    /// Watched keys of `kind`, in insertion order.
    #[must_use]
    pub fn watched_keys(&self, kind: EntityKind) -> Vec<WatchKey> {
        self.shared.lock().registry.keys_of(kind)
    }

    /// Disconnects, fails every outstanding acknowledgement with
    /// `WatchError::MonitorShutdown` and stops the timer thread. Further
    /// `watch` calls resolve immediately with the same error.
    pub fn shutdown(&self) {
        self.disconnect();
        let outstanding: Vec<(WatchKey, Vec<Waiter>)> = {
            let mut st = self.shared.lock();
            if st.shut_down {
                return;
            }
            st.shut_down = true;
            st.inflight.clear();
            let mut out: Vec<(WatchKey, Vec<Waiter>)> =
                st.pending.drain().map(|(_, p)| (p.key, p.waiters)).collect();
            out.extend(st.deferred.drain());
            out
        };
        for (key, waiters) in outstanding {
            self.shared
                .settle(waiters, &Err(WatchError::MonitorShutdown { key }.into()));
        }
        self.shared.timer.shutdown();
        info!("monitor shut down");
    }
}
