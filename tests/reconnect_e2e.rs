use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde_json::json;

use trackmon::channel::MemoryChannel;
use trackmon::monitor::{WATCH_DRIVER_EVENT, WATCH_ORDER_EVENT, WATCH_WAYPOINT_EVENT};
use trackmon::{
    ConnectionDelegate, ConnectionMonitor, ConnectionState, DisconnectReason, EntityUpdate,
    MonitorConfig, MonitorError, ObserverError, ObserverHandle, Reachability, TransportError,
    WatchError, WatchKey, WatchObserver, WatchTarget,
};

#[derive(Default)]
struct Counter {
    seen: Mutex<usize>,
}

impl WatchObserver for Counter {
    fn on_update(&self, _update: &EntityUpdate) -> Result<(), ObserverError> {
        *self.seen.lock().unwrap() += 1;
        Ok(())
    }
}

fn observer() -> (Arc<Counter>, ObserverHandle) {
    let c = Arc::new(Counter::default());
    let h = ObserverHandle::new(&c);
    (c, h)
}

#[derive(Default)]
struct Log {
    connected: Mutex<usize>,
    disconnects: Mutex<Vec<DisconnectReason>>,
    errors: Mutex<Vec<MonitorError>>,
}

impl ConnectionDelegate for Log {
    fn on_connected(&self) {
        *self.connected.lock().unwrap() += 1;
    }

    fn on_disconnected(&self, reason: &DisconnectReason) {
        self.disconnects.lock().unwrap().push(reason.clone());
    }

    fn on_connection_error(&self, error: &MonitorError) {
        self.errors.lock().unwrap().push(error.clone());
    }
}

fn config() -> MonitorConfig {
    MonitorConfig::default().with_developer_token("T1")
}

#[test]
fn order_scenario_with_drop_and_automatic_resend() {
    let channel = Arc::new(MemoryChannel::new());
    let monitor = ConnectionMonitor::new(config(), channel.clone());
    let delegate = Arc::new(Log::default());
    monitor.set_connection_delegate(&delegate);
    let (count, h) = observer();

    let ack = monitor.watch(WatchTarget::order("uuid-1"), &h);
    monitor.connect().unwrap();
    channel.complete_connect();
    let first = channel.emitted_named(WATCH_ORDER_EVENT);
    assert_eq!(first.len(), 1);
    channel.ack(first[0].id, json!({"status": "ok"}));
    assert_eq!(ack.wait().unwrap().response["status"], "ok");

    channel.clear_emitted();
    assert!(channel.drop_connection("transport close"));
    assert_eq!(monitor.state(), ConnectionState::Reconnecting);
    assert_eq!(delegate.disconnects.lock().unwrap().len(), 1);
    // The reconnect attempt starts on its own.
    assert!(channel.is_connecting());
    assert_eq!(channel.connect_attempts().len(), 2);
    assert!(channel.emitted().is_empty());

    assert!(channel.complete_connect());
    assert_eq!(monitor.state(), ConnectionState::Connected);
    assert_eq!(*delegate.connected.lock().unwrap(), 2);

    let resent = channel.emitted_named(WATCH_ORDER_EVENT);
    assert_eq!(resent.len(), 1);
    assert_eq!(resent[0].payload, json!({"order_uuid": "uuid-1"}));

    channel.deliver("order update", &json!({"order_uuid": "uuid-1", "status": 3}));
    assert_eq!(*count.seen.lock().unwrap(), 1);
}

#[test]
fn reconnect_replays_each_entry_once_in_insertion_order() {
    let channel = Arc::new(MemoryChannel::auto_accepting());
    let monitor = ConnectionMonitor::new(config(), channel.clone());
    let (_a, ha) = observer();
    let (_b, hb) = observer();

    let _ = monitor.watch(WatchTarget::order("o-1"), &ha);
    let _ = monitor.watch(WatchTarget::driver("d-1", "s-1"), &ha);
    let _ = monitor.watch(WatchTarget::waypoint(5, "o-1"), &hb);
    let _ = monitor.watch(WatchTarget::order("o-1"), &hb);
    monitor.connect().unwrap();
    channel.ack_all(&json!({"status": "ok"}));

    channel.clear_emitted();
    monitor.disconnect();
    assert!(channel.emitted().is_empty());
    monitor.connect().unwrap();

    let events: Vec<String> = channel.emitted().into_iter().map(|e| e.event).collect();
    assert_eq!(
        events,
        vec![WATCH_ORDER_EVENT, WATCH_DRIVER_EVENT, WATCH_WAYPOINT_EVENT]
    );
}

#[test]
fn unwatched_entry_is_not_replayed() {
    let channel = Arc::new(MemoryChannel::auto_accepting());
    let monitor = ConnectionMonitor::new(config(), channel.clone());
    let (_a, h) = observer();

    let _ = monitor.watch(WatchTarget::order("keep"), &h);
    let _ = monitor.watch(WatchTarget::order("drop"), &h);
    monitor.connect().unwrap();
    channel.ack_all(&json!({"status": "ok"}));
    assert!(monitor.unwatch(&WatchKey::order("drop"), &h));

    channel.clear_emitted();
    channel.drop_connection("transport close");
    assert_eq!(monitor.state(), ConnectionState::Connected);

    let resent = channel.emitted_named(WATCH_ORDER_EVENT);
    assert_eq!(resent.len(), 1);
    assert_eq!(resent[0].payload, json!({"order_uuid": "keep"}));
}

#[test]
fn replay_uses_latest_share_uuid() {
    let channel = Arc::new(MemoryChannel::auto_accepting());
    let monitor = ConnectionMonitor::new(config(), channel.clone());
    let (_a, h) = observer();

    let _ = monitor.watch(WatchTarget::order("o-1"), &h);
    monitor.connect().unwrap();
    channel.ack_all(&json!({"status": "ok"}));
    let _ = monitor.watch(WatchTarget::shared_order("o-1", "share-2"), &h);
    channel.ack_all(&json!({"status": "ok"}));

    channel.clear_emitted();
    channel.drop_connection("transport close");
    let resent = channel.emitted_named(WATCH_ORDER_EVENT);
    assert_eq!(resent.len(), 1);
    assert_eq!(resent[0].payload, json!({"order_uuid": "o-1", "share_uuid": "share-2"}));
}

#[test]
fn unresolved_ack_survives_reconnect() {
    let channel = Arc::new(MemoryChannel::new());
    let monitor = ConnectionMonitor::new(config(), channel.clone());
    let (_a, h) = observer();

    monitor.connect().unwrap();
    channel.complete_connect();
    let ack = monitor.watch(WatchTarget::order("o-1"), &h);
    assert_eq!(channel.pending_ack_count(), 1);

    channel.drop_connection("transport close");
    assert!(ack.try_result().is_none());

    channel.clear_emitted();
    channel.complete_connect();
    let resent = channel.emitted_named(WATCH_ORDER_EVENT);
    assert_eq!(resent.len(), 1);
    channel.ack(resent[0].id, json!({"status": "ok"}));
    assert!(ack.wait().is_ok());
}

#[test]
fn in_flight_ack_of_unwatched_entry_fails_on_drop() {
    let channel = Arc::new(MemoryChannel::new());
    let monitor = ConnectionMonitor::new(config(), channel.clone());
    let (_a, h) = observer();

    monitor.connect().unwrap();
    channel.complete_connect();
    let ack = monitor.watch(WatchTarget::order("o-1"), &h);
    monitor.unwatch(&WatchKey::order("o-1"), &h);

    channel.drop_connection("transport close");
    let err = ack.wait().unwrap_err();
    assert!(matches!(err, MonitorError::Transport(TransportError::Disconnected { .. })));
}

#[test]
fn intentional_disconnect_does_not_reconnect() {
    let channel = Arc::new(MemoryChannel::auto_accepting());
    let monitor = ConnectionMonitor::new(config(), channel.clone());
    let delegate = Arc::new(Log::default());
    monitor.set_connection_delegate(&delegate);

    monitor.connect().unwrap();
    monitor.disconnect();

    assert_eq!(monitor.state(), ConnectionState::Disconnected);
    assert_eq!(channel.connect_attempts().len(), 1);
    assert!(delegate.disconnects.lock().unwrap().is_empty());
    assert!(delegate.errors.lock().unwrap().is_empty());
}

#[test]
fn transport_error_while_connected_restarts_the_channel() {
    let channel = Arc::new(MemoryChannel::auto_accepting());
    let monitor = ConnectionMonitor::new(config(), channel.clone());
    let delegate = Arc::new(Log::default());
    monitor.set_connection_delegate(&delegate);
    let (_a, h) = observer();
    let _ = monitor.watch(WatchTarget::driver("d-1", "s-1"), &h);
    monitor.connect().unwrap();
    channel.clear_emitted();

    channel.raise_error("ping timeout");

    assert_eq!(monitor.state(), ConnectionState::Connected);
    assert_eq!(channel.connect_attempts().len(), 2);
    assert_eq!(channel.emitted_named(WATCH_DRIVER_EVENT).len(), 1);
    let errors = delegate.errors.lock().unwrap().clone();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].is_transport());
}

#[test]
fn failed_reconnect_stays_reconnecting() {
    let channel = Arc::new(MemoryChannel::new());
    let monitor = ConnectionMonitor::new(config(), channel.clone());
    let delegate = Arc::new(Log::default());
    monitor.set_connection_delegate(&delegate);

    monitor.connect().unwrap();
    channel.complete_connect();
    channel.drop_connection("transport close");
    assert!(channel.fail_connect("host unreachable"));

    assert_eq!(monitor.state(), ConnectionState::Reconnecting);
    let errors = delegate.errors.lock().unwrap().clone();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].is_connection());

    // An explicit connect picks the attempt back up.
    monitor.connect().unwrap();
    assert!(channel.complete_connect());
    assert_eq!(monitor.state(), ConnectionState::Connected);
}

#[test]
fn network_recovery_forces_reconnect() {
    let channel = Arc::new(MemoryChannel::auto_accepting());
    let monitor = ConnectionMonitor::new(config(), channel.clone());
    let (_a, h) = observer();
    let _ = monitor.watch(WatchTarget::order("o-1"), &h);
    monitor.connect().unwrap();
    channel.ack_all(&json!({"status": "ok"}));
    channel.clear_emitted();

    monitor.handle_reachability(Reachability::Reachable);
    monitor.handle_reachability(Reachability::Unreachable);
    assert_eq!(monitor.state(), ConnectionState::Connected);
    assert_eq!(channel.connect_attempts().len(), 1);

    monitor.handle_reachability(Reachability::Reachable);
    assert_eq!(monitor.state(), ConnectionState::Connected);
    assert_eq!(channel.connect_attempts().len(), 2);
    assert_eq!(channel.emitted_named(WATCH_ORDER_EVENT).len(), 1);
}

#[test]
fn drop_while_offline_waits_for_network() {
    let channel = Arc::new(MemoryChannel::auto_accepting());
    let monitor = ConnectionMonitor::new(config(), channel.clone());
    monitor.connect().unwrap();

    monitor.handle_reachability(Reachability::Unreachable);
    channel.drop_connection("network down");
    assert_eq!(monitor.state(), ConnectionState::Reconnecting);
    assert_eq!(channel.connect_attempts().len(), 1);

    monitor.handle_reachability(Reachability::Reachable);
    assert_eq!(monitor.state(), ConnectionState::Connected);
    assert_eq!(channel.connect_attempts().len(), 2);
}

#[test]
fn unacknowledged_watch_times_out_while_offline() {
    let channel = Arc::new(MemoryChannel::new());
    let monitor = ConnectionMonitor::new(
        config().with_ack_timeout(Duration::from_millis(80)),
        channel.clone(),
    );
    let (_a, h) = observer();
    monitor.connect().unwrap();
    channel.complete_connect();

    let ack = monitor.watch(WatchTarget::driver("d-1", "s-1"), &h);
    monitor.handle_reachability(Reachability::Unreachable);
    channel.drop_connection("network down");
    assert_eq!(monitor.state(), ConnectionState::Reconnecting);

    let err = ack
        .wait_timeout(Duration::from_secs(5))
        .expect("timer should resolve the handle")
        .unwrap_err();
    assert!(matches!(
        err,
        MonitorError::Watch(WatchError::AckTimeout { ref key, duration_ms: 80 }) if *key == WatchKey::driver("d-1")
    ));

    // A watch issued while still offline is bounded too.
    let later = monitor.watch(WatchTarget::driver("d-2", "s-2"), &h);
    assert!(later
        .wait_timeout(Duration::from_secs(5))
        .expect("timer should resolve the handle")
        .unwrap_err()
        .is_timeout());
    assert_eq!(channel.connect_attempts().len(), 1);
    assert!(monitor.is_watching(&WatchKey::driver("d-1")));
}

#[test]
fn network_recovery_ignored_without_manual_connect() {
    let channel = Arc::new(MemoryChannel::auto_accepting());
    let monitor = ConnectionMonitor::new(config(), channel.clone());

    monitor.handle_reachability(Reachability::Unreachable);
    monitor.handle_reachability(Reachability::Reachable);
    assert_eq!(monitor.state(), ConnectionState::Disconnected);

    monitor.connect().unwrap();
    monitor.disconnect();
    monitor.handle_reachability(Reachability::Unreachable);
    monitor.handle_reachability(Reachability::Reachable);
    assert_eq!(monitor.state(), ConnectionState::Disconnected);
    assert_eq!(channel.connect_attempts().len(), 1);
}

#[test]
fn concurrent_watches_during_connect_are_sent_exactly_once() {
    let channel = Arc::new(MemoryChannel::auto_accepting());
    let monitor = ConnectionMonitor::new(config(), channel.clone());
    let (_a, h) = observer();

    let workers: Vec<_> = (0..4)
        .map(|t| {
            let monitor = monitor.clone();
            let h = h.clone();
            thread::spawn(move || {
                for i in 0..50 {
                    let _ = monitor.watch(WatchTarget::order(format!("o-{t}-{i}")), &h);
                }
            })
        })
        .collect();
    monitor.connect().unwrap();
    for w in workers {
        w.join().unwrap();
    }

    let mut per_key: HashMap<String, usize> = HashMap::new();
    for e in channel.emitted_named(WATCH_ORDER_EVENT) {
        let id = e.payload["order_uuid"].as_str().unwrap().to_string();
        *per_key.entry(id).or_default() += 1;
    }
    assert_eq!(per_key.len(), 200);
    assert!(per_key.values().all(|&n| n == 1));
}
