//! Network connectivity monitor.
//!
//! Wraps a [`ConnectivityDriver`] and turns its raw status into
//! deduplicated [`ConnectivityStatus`] transitions for subscribers.
//!
//! ```text
//!   driver.subscribe_state() ─┐
//!                             ├─▶ poller ─▶ diff ─▶ broadcast ─▶ IP renewal hook
//!   poll tick (interval) ─────┘
//! ```
//!
//! ## Notification rules
//!
//! 1. A driver read failure is logged and treated as "no change".
//! 2. While the link is mid-association (scanning, authenticating,
//!    associating, handshake) nothing is published, unless
//!    [`StatusPolicy::skip_transitional`] is off.
//! 3. Otherwise a status is published only when ssid, connected or ip
//!    differ from the last published status.  The first status after
//!    start always publishes.
//! 4. After publishing an SSID change that landed on a connected link,
//!    the [`IpRenewal`] hook runs (when enabled).

use std::sync::{Arc, Mutex, PoisonError};

use crossbeam_channel::{Receiver, select};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use crate::app::commands::Connection;
use crate::app::lifecycle::{ShutdownSignal, TaskSet};
use crate::app::ports::{ConnectivityDriver, DriverStatus, IpRenewal, LinkState, WifiNetwork};
use crate::config::SupervisorConfig;
use crate::error::{Error, Result};
use crate::pubsub::{Subscription, SubscriptionRegistry};

// ───────────────────────────────────────────────────────────────
// Status value
// ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectivityStatus {
    pub connected: bool,
    pub ip: String,
    pub ssid: String,
    pub channel: u32,
}

impl From<&DriverStatus> for ConnectivityStatus {
    fn from(raw: &DriverStatus) -> Self {
        Self {
            connected: raw.state == LinkState::Completed,
            ip: raw.ip.clone(),
            ssid: raw.ssid.clone(),
            channel: raw.channel,
        }
    }
}

/// What changed between two published statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusChange {
    pub ssid_changed: bool,
    pub connected_changed: bool,
    pub ip_changed: bool,
}

/// Compare against the last published status.  `None` means "nothing
/// worth publishing".  Channel alone never triggers a notification.
pub fn diff(prev: Option<&ConnectivityStatus>, next: &ConnectivityStatus) -> Option<StatusChange> {
    let Some(prev) = prev else {
        return Some(StatusChange {
            ssid_changed: true,
            connected_changed: true,
            ip_changed: true,
        });
    };
    let change = StatusChange {
        ssid_changed: prev.ssid != next.ssid,
        connected_changed: prev.connected != next.connected,
        ip_changed: prev.ip != next.ip,
    };
    (change.ssid_changed || change.connected_changed || change.ip_changed).then_some(change)
}

// ───────────────────────────────────────────────────────────────
// Policy
// ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusPolicy {
    pub skip_transitional: bool,
    pub renew_ip_on_ssid_change: bool,
    pub poll_interval: std::time::Duration,
}

impl From<&SupervisorConfig> for StatusPolicy {
    fn from(cfg: &SupervisorConfig) -> Self {
        Self {
            skip_transitional: cfg.skip_transitional_states,
            renew_ip_on_ssid_change: cfg.renew_ip_on_ssid_change,
            poll_interval: cfg.poll_interval(),
        }
    }
}

// ───────────────────────────────────────────────────────────────
// Monitor
// ───────────────────────────────────────────────────────────────

struct Shared {
    driver: Arc<dyn ConnectivityDriver>,
    renewal: Option<Arc<dyn IpRenewal>>,
    policy: StatusPolicy,
    updates: SubscriptionRegistry<ConnectivityStatus>,
    snapshot: Mutex<Snapshot>,
}

/// `current` is replaced on every accepted poll; `published` only feeds the diff.
#[derive(Default)]
struct Snapshot {
    current: ConnectivityStatus,
    published: Option<ConnectivityStatus>,
}

impl Shared {
    /// One poll: read, filter, diff, publish, then run the renewal hook.
    fn poll_once(&self) {
        let raw = match self.driver.status() {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Network: status read failed: {}", e);
                return;
            }
        };
        if self.policy.skip_transitional && raw.state.is_transitional() {
            debug!("Network: link {:?}, holding notifications", raw.state);
            return;
        }
        let next = ConnectivityStatus::from(&raw);

        let change = {
            let mut snap = self.snapshot.lock().unwrap_or_else(PoisonError::into_inner);
            snap.current = next.clone();
            let change = diff(snap.published.as_ref(), &next);
            if change.is_some() {
                snap.published = Some(next.clone());
                // Broadcast under the lock so publishes stay in poll order.
                self.updates.broadcast(next.clone());
            }
            change
        };
        let Some(change) = change else { return };

        info!(
            "Network: connected={} ssid='{}' ip='{}'",
            next.connected, next.ssid, next.ip
        );
        if change.ssid_changed && next.connected && self.policy.renew_ip_on_ssid_change {
            if let Some(renewal) = &self.renewal {
                if let Err(e) = renewal.renew(&next.ssid) {
                    warn!("Network: IP renewal on '{}' failed: {}", next.ssid, e);
                }
            }
        }
    }
}

struct Running {
    done: ShutdownSignal,
    tasks: TaskSet,
}

/// Connectivity monitor.  `start`/`stop` may be repeated; a restart
/// republishes the first status it sees.
pub struct NetworkMonitor {
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
}

impl NetworkMonitor {
    pub fn new(
        driver: Arc<dyn ConnectivityDriver>,
        renewal: Option<Arc<dyn IpRenewal>>,
        policy: StatusPolicy,
        subscriber_depth: usize,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                driver,
                renewal,
                policy,
                updates: SubscriptionRegistry::new("network", subscriber_depth),
                snapshot: Mutex::new(Snapshot::default()),
            }),
            running: Mutex::new(None),
        }
    }

    /// Start the driver and the status poller.  No-op if already running.
    pub fn start(&self) -> Result<()> {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.is_some() {
            return Ok(());
        }
        self.shared
            .driver
            .start()
            .map_err(|e| Error::driver("network_start", e))?;
        self.shared
            .snapshot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .published = None;

        let done = ShutdownSignal::new();
        let edges = self.shared.driver.subscribe_state();
        let shared = Arc::clone(&self.shared);
        let done_rx = done.receiver();
        let mut tasks = TaskSet::new();
        if let Err(e) = tasks.spawn("net-poll", move || poll_loop(&shared, &edges, &done_rx)) {
            let _ = self.shared.driver.stop();
            return Err(e);
        }
        info!("Network: monitor started");
        *running = Some(Running { done, tasks });
        Ok(())
    }

    /// Stop polling and the driver.  Safe to call when not started.
    pub fn stop(&self) {
        let Some(mut running) = self.running.lock().unwrap_or_else(PoisonError::into_inner).take()
        else {
            return;
        };
        running.done.fire();
        running.tasks.join_all(self.shared.policy.poll_interval * 2);
        if let Err(e) = self.shared.driver.stop() {
            warn!("Network: driver stop failed: {}", e);
        }
        info!("Network: monitor stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Status from the latest accepted poll, channel included
    /// (default/disconnected before the first poll).
    pub fn status(&self) -> ConnectivityStatus {
        self.shared
            .snapshot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .current
            .clone()
    }

    /// Poll the driver right now, outside the regular tick.
    pub fn refresh(&self) {
        self.shared.poll_once();
    }

    /// Join a network.  Failures are returned to the caller untouched;
    /// persisting the choice is the caller's job.
    pub fn connect(&self, connection: &Connection) -> Result<()> {
        connection.validate()?;
        info!("Network: connecting to '{}'", connection.ssid());
        if let Err(e) = self.shared.driver.connect(connection) {
            error!("Network: connect to '{}' failed: {}", connection.ssid(), e);
            return Err(Error::driver("connect", e));
        }
        self.refresh();
        Ok(())
    }

    /// Discovered networks, ending when the driver's scan completes.
    pub fn scan(&self) -> Result<ScanStream> {
        let rx = self
            .shared
            .driver
            .scan()
            .map_err(|e| Error::driver("scan", e))?;
        Ok(ScanStream { rx })
    }

    pub fn subscribe(&self) -> Subscription<ConnectivityStatus> {
        self.shared.updates.subscribe()
    }

    /// Close every subscriber; used by the owner at teardown.
    pub fn shutdown_subscribers(&self) {
        self.shared.updates.shutdown();
    }
}

impl Drop for NetworkMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn poll_loop(shared: &Shared, edges: &Subscription<bool>, done: &Receiver<()>) {
    shared.poll_once();
    loop {
        select! {
            recv(done) -> _ => break,
            recv(edges.receiver()) -> edge => match edge {
                Ok(associated) => {
                    debug!("Network: association edge ({})", associated);
                    shared.poll_once();
                }
                // Driver closed its edge stream; fall back to ticks only.
                Err(_) => {
                    tick_until_done(shared, done);
                    return;
                }
            },
            default(shared.policy.poll_interval) => shared.poll_once(),
        }
    }
}

fn tick_until_done(shared: &Shared, done: &Receiver<()>) {
    loop {
        select! {
            recv(done) -> _ => return,
            default(shared.policy.poll_interval) => shared.poll_once(),
        }
    }
}

// ───────────────────────────────────────────────────────────────
// Scan stream
// ───────────────────────────────────────────────────────────────

/// Iterator over scan results.  Hidden networks (empty SSID) are skipped.
pub struct ScanStream {
    rx: Receiver<WifiNetwork>,
}

impl Iterator for ScanStream {
    type Item = WifiNetwork;

    fn next(&mut self) -> Option<WifiNetwork> {
        loop {
            let network = self.rx.recv().ok()?;
            if !network.ssid.is_empty() {
                return Some(network);
            }
        }
    }
}
