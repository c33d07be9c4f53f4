//! Watch acknowledgements.
//!
//! Every `watch()` call gets an [`AckHandle`] that resolves exactly once:
//! with the service's acknowledgement, or with an error (timeout, rejected
//! request, validation failure, shutdown). The bound on waiting is enforced
//! by [`AckTimer`], a small worker thread owned by the monitor, independent
//! of whatever timeouts the transport applies. Each waiter's deadline starts
//! when `watch()` is called, whether or not the monitor is connected; each
//! emitted request carries its own deadline as well.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::entity::WatchKey;
use crate::error::{MonitorError, MonitorResult, WatchError};

/// A successful acknowledgement.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchAck {
    pub key: WatchKey,
    /// Response document as sent by the service.
    pub response: Value,
    pub received_at: DateTime<Utc>,
}

impl WatchAck {
    /// Interprets a raw acknowledgement. A document with `"success": false`
    /// is a rejection; anything else is accepted as-is.
    ///
    /// # Errors
    ///
    /// Returns `WatchError::Rejected` carrying the service's `message`.
    pub fn from_response(
        key: WatchKey,
        response: Value,
        received_at: DateTime<Utc>,
    ) -> Result<Self, WatchError> {
        if response.get("success").and_then(Value::as_bool) == Some(false) {
            let message = response
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("request rejected by service")
                .to_string();
            return Err(WatchError::Rejected { key, message });
        }
        Ok(Self {
            key,
            response,
            received_at,
        })
    }
}

pub(crate) type AckSender = Sender<MonitorResult<WatchAck>>;

/// One caller waiting on an acknowledgement, tagged with the id its
/// deadline is armed under.
#[derive(Debug)]
pub(crate) struct Waiter {
    pub(crate) id: u64,
    tx: AckSender,
}

impl Waiter {
    pub(crate) const fn new(id: u64, tx: AckSender) -> Self {
        Self { id, tx }
    }

    pub(crate) fn resolve(self, result: MonitorResult<WatchAck>) {
        // Receiver dropped means the caller stopped caring.
        let _ = self.tx.send(result);
    }
}

/// What a timer entry bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) enum Deadline {
    /// A request on the wire, by emission id.
    Emission(u64),
    /// A single `watch()` caller, by waiter id.
    Waiter(u64),
}

/// Resolves once with the outcome of a `watch()` call.
#[derive(Debug)]
pub struct AckHandle {
    key: WatchKey,
    rx: Receiver<MonitorResult<WatchAck>>,
}

impl AckHandle {
    pub(crate) fn pair(key: WatchKey) -> (AckSender, Self) {
        let (tx, rx) = bounded(1);
        (tx, Self { key, rx })
    }

    pub(crate) fn resolved(key: WatchKey, result: MonitorResult<WatchAck>) -> Self {
        let (tx, handle) = Self::pair(key);
        let _ = tx.send(result);
        handle
    }

    /// The entity this acknowledgement is for.
    #[must_use]
    pub const fn key(&self) -> &WatchKey {
        &self.key
    }

    /// Blocks until the outcome is known.
    ///
    /// # Errors
    ///
    /// Returns the watch error, or `WatchError::MonitorShutdown` if the
    /// monitor went away without resolving the handle.
    pub fn wait(self) -> MonitorResult<WatchAck> {
        self.rx.recv().unwrap_or_else(|_| {
            Err(MonitorError::Watch(WatchError::MonitorShutdown { key: self.key }))
        })
    }

    /// Waits up to `timeout`. `None` means still pending.
    #[must_use]
    pub fn wait_timeout(&self, timeout: Duration) -> Option<MonitorResult<WatchAck>> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(MonitorError::Watch(
                WatchError::MonitorShutdown {
                    key: self.key.clone(),
                },
            ))),
        }
    }

    /// Non-blocking poll. `None` means still pending.
    #[must_use]
    pub fn try_result(&self) -> Option<MonitorResult<WatchAck>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(MonitorError::Watch(
                WatchError::MonitorShutdown {
                    key: self.key.clone(),
                },
            ))),
        }
    }
}

/// Resolves every waiter with the same outcome.
pub(crate) fn resolve_all(waiters: Vec<Waiter>, result: &MonitorResult<WatchAck>) {
    for w in waiters {
        w.resolve(result.clone());
    }
}

enum TimerMsg {
    Arm { what: Deadline, at: Instant },
    Disarm { what: Deadline },
    Shutdown,
}

/// Deadline tracker for outstanding emissions and waiters.
///
/// Runs a dedicated worker thread; `on_expire` is invoked on that thread for
/// each deadline that passes before it is disarmed.
#[derive(Debug)]
pub(crate) struct AckTimer {
    tx: Sender<TimerMsg>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl AckTimer {
    pub(crate) fn start<F>(capacity: usize, on_expire: F) -> Self
    where
        F: Fn(Deadline) + Send + 'static,
    {
        let (tx, rx) = bounded::<TimerMsg>(capacity.max(1));
        let join = thread::Builder::new()
            .name("trackmon-ack-timer".to_string())
            .spawn(move || timer_loop(&rx, &on_expire))
            .expect("failed to spawn trackmon ack timer");
        Self {
            tx,
            join: Mutex::new(Some(join)),
        }
    }

    pub(crate) fn arm(&self, what: Deadline, timeout: Duration) {
        let at = Instant::now() + timeout;
        if self.tx.send(TimerMsg::Arm { what, at }).is_err() {
            warn!(?what, "ack timer stopped; acknowledgement wait is unbounded");
        }
    }

    /// Best effort: a full queue leaves the entry armed, and its expiry then
    /// finds nothing left to resolve. Never blocks, so expiry callbacks may
    /// call it on the timer thread.
    pub(crate) fn disarm(&self, what: Deadline) {
        let _ = self.tx.try_send(TimerMsg::Disarm { what });
    }

    pub(crate) fn shutdown(&self) {
        let _ = self.tx.send(TimerMsg::Shutdown);
        let handle = self
            .join
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            // The timer may be shut down from its own expiry callback.
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for AckTimer {
    fn drop(&mut self) {
        // Do not join: the last monitor handle can be dropped on the timer thread itself.
        let _ = self.tx.try_send(TimerMsg::Shutdown);
    }
}

fn timer_loop<F: Fn(Deadline)>(rx: &Receiver<TimerMsg>, on_expire: &F) {
    let mut by_deadline: BTreeSet<(Instant, Deadline)> = BTreeSet::new();
    let mut deadlines: HashMap<Deadline, Instant> = HashMap::new();

    loop {
        let msg = match by_deadline.first().copied() {
            None => match rx.recv() {
                Ok(msg) => msg,
                Err(_) => break,
            },
            Some((next, _)) => {
                let wait = next.saturating_duration_since(Instant::now());
                match rx.recv_timeout(wait) {
                    Ok(msg) => msg,
                    Err(RecvTimeoutError::Timeout) => {
                        let now = Instant::now();
                        while let Some(&(at, what)) = by_deadline.first() {
                            if at > now {
                                break;
                            }
                            by_deadline.remove(&(at, what));
                            deadlines.remove(&what);
                            debug!(?what, "acknowledgement deadline passed");
                            on_expire(what);
                        }
                        continue;
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        };

        match msg {
            TimerMsg::Arm { what, at } => {
                if let Some(prev) = deadlines.insert(what, at) {
                    by_deadline.remove(&(prev, what));
                }
                by_deadline.insert((at, what));
            }
            TimerMsg::Disarm { what } => {
                if let Some(at) = deadlines.remove(&what) {
                    by_deadline.remove(&(at, what));
                }
            }
            TimerMsg::Shutdown => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;

    #[test]
    fn test_from_response_accepts() {
        let ack = WatchAck::from_response(WatchKey::order("o"), json!({"status": "ok"}), Utc::now())
            .unwrap();
        assert_eq!(ack.response["status"], "ok");
    }

    #[test]
    fn test_from_response_rejects_unsuccessful() {
        let err = WatchAck::from_response(
            WatchKey::order("o"),
            json!({"success": false, "message": "Order not found"}),
            Utc::now(),
        )
        .unwrap_err();
        assert_eq!(
            err,
            WatchError::Rejected {
                key: WatchKey::order("o"),
                message: "Order not found".to_string(),
            }
        );
    }

    #[test]
    fn test_handle_resolves_once() {
        let (tx, handle) = AckHandle::pair(WatchKey::order("o"));
        assert!(handle.try_result().is_none());
        tx.send(Err(WatchError::Unwatched { key: WatchKey::order("o") }.into()))
            .unwrap();
        assert!(handle.try_result().unwrap().is_err());
    }

    #[test]
    fn test_handle_dropped_sender_reports_shutdown() {
        let (tx, handle) = AckHandle::pair(WatchKey::driver("d"));
        drop(tx);
        let err = handle.wait().unwrap_err();
        assert!(matches!(err, MonitorError::Watch(WatchError::MonitorShutdown { .. })));
    }

    #[test]
    fn test_waiter_resolves_its_handle() {
        let (tx, handle) = AckHandle::pair(WatchKey::waypoint(3));
        let waiter = Waiter::new(11, tx);
        assert_eq!(waiter.id, 11);
        waiter.resolve(Err(WatchError::AckTimeout {
            key: WatchKey::waypoint(3),
            duration_ms: 5,
        }
        .into()));
        assert!(handle.wait().unwrap_err().is_timeout());
    }

    #[test]
    fn test_timer_expires_armed_emission() {
        let (fired_tx, fired_rx) = bounded::<Deadline>(8);
        let timer = AckTimer::start(16, move |d| {
            let _ = fired_tx.send(d);
        });
        timer.arm(Deadline::Emission(7), Duration::from_millis(10));
        assert_eq!(
            fired_rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            Deadline::Emission(7)
        );
        timer.shutdown();
    }

    #[test]
    fn test_timer_disarm_prevents_expiry() {
        let (fired_tx, fired_rx) = bounded::<Deadline>(8);
        let timer = AckTimer::start(16, move |d| {
            let _ = fired_tx.send(d);
        });
        timer.arm(Deadline::Emission(1), Duration::from_millis(50));
        timer.disarm(Deadline::Emission(1));
        timer.arm(Deadline::Emission(2), Duration::from_millis(60));
        assert_eq!(
            fired_rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            Deadline::Emission(2)
        );
        assert!(fired_rx.recv_timeout(Duration::from_millis(100)).is_err());
        timer.shutdown();
    }

    #[test]
    fn test_timer_keeps_waiter_and_emission_ids_apart() {
        let (fired_tx, fired_rx) = bounded::<Deadline>(8);
        let timer = AckTimer::start(16, move |d| {
            let _ = fired_tx.send(d);
        });
        timer.arm(Deadline::Waiter(4), Duration::from_millis(30));
        timer.arm(Deadline::Emission(4), Duration::from_millis(30));
        timer.disarm(Deadline::Emission(4));
        assert_eq!(
            fired_rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            Deadline::Waiter(4)
        );
        assert!(fired_rx.recv_timeout(Duration::from_millis(100)).is_err());
        timer.shutdown();
    }

    #[test]
    fn test_timer_orders_by_deadline() {
        let fired = Arc::new(Mutex::new(Vec::new()));
        let f = Arc::clone(&fired);
        let (done_tx, done_rx) = bounded::<()>(4);
        let timer = AckTimer::start(16, move |d| {
            f.lock().unwrap().push(d);
            let _ = done_tx.send(());
        });
        timer.arm(Deadline::Waiter(1), Duration::from_millis(80));
        timer.arm(Deadline::Waiter(2), Duration::from_millis(10));
        done_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        done_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(
            fired.lock().unwrap().as_slice(),
            &[Deadline::Waiter(2), Deadline::Waiter(1)]
        );
        timer.shutdown();
    }
}
