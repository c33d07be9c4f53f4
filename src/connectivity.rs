//! Host network reachability.
//!
//! [`ConnectivityObserver`] turns a stream of reachability samples into
//! transitions. [`ConnectivityWatcher`] samples a [`ReachabilityProbe`] on a
//! background thread and feeds the monitor. Neither reconnects anything on
//! its own; the monitor decides what a transition means.

use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::monitor::WeakConnectionMonitor;

/// Network reachability sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reachability {
    /// The realtime host can be reached.
    Reachable,
    /// It cannot.
    Unreachable,
}

impl From<bool> for Reachability {
    fn from(reachable: bool) -> Self {
        if reachable {
            Self::Reachable
        } else {
            Self::Unreachable
        }
    }
}

/// A change in reachability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectivityTransition {
    /// Reachable (or unknown) -> unreachable.
    Lost,
    /// Unreachable -> reachable.
    Recovered,
}

/// Edge detector over reachability samples.
#[derive(Debug, Default, Clone)]
pub struct ConnectivityObserver {
    last: Option<Reachability>,
}

impl ConnectivityObserver {
    /// Creates an observer with no samples yet.
    #[must_use]
    pub const fn new() -> Self {
        Self { last: None }
    }

    /// Records a sample and returns the transition it caused, if any.
    ///
    /// The first reachable sample is not a transition: there was no drop to
    /// recover from.
    pub fn observe(&mut self, now: Reachability) -> Option<ConnectivityTransition> {
        match (self.last.replace(now), now) {
            (Some(Reachability::Unreachable), Reachability::Reachable) => {
                Some(ConnectivityTransition::Recovered)
            }
            (None | Some(Reachability::Reachable), Reachability::Unreachable) => {
                Some(ConnectivityTransition::Lost)
            }
            _ => None,
        }
    }

    /// The latest sample.
    #[must_use]
    pub const fn last(&self) -> Option<Reachability> {
        self.last
    }

    /// True if the latest sample says unreachable.
    #[must_use]
    pub fn is_unreachable(&self) -> bool {
        self.last == Some(Reachability::Unreachable)
    }
}

/// Answers "can the realtime host be reached right now?".
pub trait ReachabilityProbe: Send + Sync {
    /// Takes one sample. May block up to the probe's own timeout.
    fn probe(&self) -> Reachability;
}

/// Probes by opening a TCP connection to the realtime host.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    host: String,
    port: u16,
    timeout: Duration,
}

impl TcpProbe {
    /// Probe for an explicit host and port.
    pub fn new(host: impl Into<String>, port: u16, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            timeout,
        }
    }

    /// Probe derived from a connect host such as `https://rt.example.com` or
    /// `rt.local:3030`. The port defaults from the scheme or the SSL flag.
    #[must_use]
    pub fn for_endpoint(host: &str, use_ssl: bool, timeout: Duration) -> Self {
        let (secure, rest) = if let Some(rest) = host.strip_prefix("https://") {
            (true, rest)
        } else if let Some(rest) = host.strip_prefix("http://") {
            (false, rest)
        } else {
            (use_ssl, host)
        };
        let authority = rest.split('/').next().unwrap_or(rest);
        let default_port = if secure { 443 } else { 80 };
        match authority.rsplit_once(':') {
            Some((h, p)) => match p.parse() {
                Ok(port) => Self::new(h, port, timeout),
                Err(_) => Self::new(authority, default_port, timeout),
            },
            None => Self::new(authority, default_port, timeout),
        }
    }

    /// Target host.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Target port.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }
}

impl ReachabilityProbe for TcpProbe {
    fn probe(&self) -> Reachability {
        let addrs: Vec<SocketAddr> = match (self.host.as_str(), self.port).to_socket_addrs() {
            Ok(addrs) => addrs.collect(),
            Err(e) => {
                debug!(host = %self.host, error = %e, "realtime host did not resolve");
                return Reachability::Unreachable;
            }
        };
        let reachable = addrs
            .iter()
            .any(|addr| TcpStream::connect_timeout(addr, self.timeout).is_ok());
        Reachability::from(reachable)
    }
}

/// Background sampler feeding reachability into a monitor.
///
/// Stops when [`stop`](Self::stop) is called, when dropped, or when the
/// monitor it feeds is gone.
#[derive(Debug)]
pub struct ConnectivityWatcher {
    stop_tx: Sender<()>,
    join: Option<JoinHandle<()>>,
}

impl ConnectivityWatcher {
    /// Starts sampling `probe` every `interval`.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the thread cannot be spawned.
    pub fn spawn(
        monitor: WeakConnectionMonitor,
        probe: Arc<dyn ReachabilityProbe>,
        interval: Duration,
    ) -> std::io::Result<Self> {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let join = thread::Builder::new()
            .name("trackmon-connectivity".to_string())
            .spawn(move || watch_loop(&monitor, probe.as_ref(), interval, &stop_rx))?;
        info!(
            interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
            "connectivity watcher started"
        );
        Ok(Self {
            stop_tx,
            join: Some(join),
        })
    }

    /// Stops the sampler and waits for it to exit.
    pub fn stop(mut self) {
        self.halt();
    }

    fn halt(&mut self) {
        let _ = self.stop_tx.try_send(());
        if let Some(handle) = self.join.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ConnectivityWatcher {
    fn drop(&mut self) {
        self.halt();
    }
}

fn watch_loop(
    monitor: &WeakConnectionMonitor,
    probe: &dyn ReachabilityProbe,
    interval: Duration,
    stop_rx: &Receiver<()>,
) {
    loop {
        let Some(m) = monitor.upgrade() else {
            break;
        };
        m.handle_reachability(probe.probe());
        drop(m);

        match stop_rx.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("connectivity watcher exiting");
}
