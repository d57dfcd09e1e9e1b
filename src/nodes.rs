//! Payment node manager.
//!
//! Owns every configured Lightning backend and funnels the settled invoices
//! of all enabled nodes into one stream.
//!
//! ```text
//!   node A driver ──▶ drain A ──┐
//!   node B driver ──▶ drain B ──┼──▶ settled registry ──▶ supervisor
//!   node C (disabled)           │
//! ```
//!
//! ## Ordering
//!
//! The persisted record changes only after the matching driver operation
//! succeeded.  Enable: start driver, subscribe, spawn the drain, then
//! persist (all undone if the write fails).  Disable: stop driver, end
//! drain, then persist.  A failure at any step leaves disk and memory
//! agreeing with each other.
//!
//! The node list sits behind one lock that is never held across a driver
//! start or a retry backoff.  A node being started is marked `starting`;
//! disable, remove and `stop_all` clear the mark, and a start that comes
//! back to a cleared mark stops the driver again instead of installing it.
//! The drains never take the lock.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crossbeam_channel::{Receiver, select};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::app::commands::{NodeBackend, NodeConfig, NodeRecord, validate_node_name};
use crate::app::events::{Invoice, InvoiceRequest, NodeStatus};
use crate::app::lifecycle::{ShutdownSignal, TaskSet};
use crate::app::ports::{NodeDriverFactory, PaymentNodeDriver, SettingsStore};
use crate::config::SupervisorConfig;
use crate::error::{Error, Result};
use crate::pubsub::{Subscription, SubscriptionRegistry};

// ───────────────────────────────────────────────────────────────
// Public snapshot
// ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    Local,
    RemoteRpc,
}

/// Point-in-time view of one configured node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentNode {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub kind: NodeKind,
    pub status: NodeStatus,
}

impl PaymentNode {
    pub fn enabled(&self) -> bool {
        self.enabled
    }
}

// ───────────────────────────────────────────────────────────────
// Internals
// ───────────────────────────────────────────────────────────────

struct Drain {
    done: ShutdownSignal,
    tasks: TaskSet,
}

impl Drain {
    fn end(mut self, timeout: Duration) {
        self.done.fire();
        self.tasks.join_all(timeout);
    }
}

struct ManagedNode {
    record: NodeRecord,
    driver: Arc<dyn PaymentNodeDriver>,
    drain: Option<Drain>,
    starting: bool,
}

impl ManagedNode {
    fn snapshot(&self) -> PaymentNode {
        PaymentNode {
            id: self.record.id.clone(),
            name: self.record.name.clone(),
            enabled: self.record.enabled,
            kind: match self.record.backend {
                NodeBackend::Local => NodeKind::Local,
                NodeBackend::Remote { .. } => NodeKind::RemoteRpc,
            },
            status: self.driver.status(),
        }
    }
}

// ───────────────────────────────────────────────────────────────
// NodeManager
// ───────────────────────────────────────────────────────────────

pub struct NodeManager {
    store: Arc<dyn SettingsStore>,
    factory: Arc<dyn NodeDriverFactory>,
    nodes: Mutex<Vec<ManagedNode>>,
    settled: SubscriptionRegistry<Invoice>,
    start_attempts: u32,
    start_backoff: Duration,
    join_timeout: Duration,
}

impl NodeManager {
    pub fn new(
        store: Arc<dyn SettingsStore>,
        factory: Arc<dyn NodeDriverFactory>,
        config: &SupervisorConfig,
    ) -> Self {
        Self {
            store,
            factory,
            nodes: Mutex::new(Vec::new()),
            settled: SubscriptionRegistry::new("invoices", config.subscriber_depth),
            start_attempts: config.node_start_attempts.max(1),
            start_backoff: config.node_start_backoff(),
            join_timeout: config.shutdown_timeout(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ManagedNode>> {
        self.nodes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn position(nodes: &[ManagedNode], id: &str) -> Result<usize> {
        nodes
            .iter()
            .position(|n| n.record.id == id)
            .ok_or_else(|| Error::not_found("node", id))
    }

    fn driver(&self, id: &str) -> Result<Arc<dyn PaymentNodeDriver>> {
        let nodes = self.lock();
        let idx = Self::position(&nodes, id)?;
        Ok(Arc::clone(&nodes[idx].driver))
    }

    // ── Startup ───────────────────────────────────────────────

    /// Rebuild drivers for every persisted node not already loaded.
    /// Records whose driver cannot be built are logged and skipped.
    pub fn load(&self) -> Result<usize> {
        let records = self
            .store
            .nodes()
            .map_err(|e| Error::storage("load_nodes", e))?;
        let mut nodes = self.lock();
        let mut loaded = 0;
        for record in records {
            if nodes.iter().any(|n| n.record.id == record.id) {
                continue;
            }
            match self.factory.create(&record) {
                Ok(driver) => {
                    debug!("Nodes: loaded '{}' ({})", record.name, record.id);
                    nodes.push(ManagedNode {
                        record,
                        driver,
                        drain: None,
                        starting: false,
                    });
                    loaded += 1;
                }
                Err(e) => warn!("Nodes: skipping '{}' ({}): {}", record.name, record.id, e),
            }
        }
        info!("Nodes: {} node(s) loaded", nodes.len());
        Ok(loaded)
    }

    /// Start every enabled node that is not running yet.  A node that fails
    /// gets one retry after the configured backoff, then is skipped.
    /// Returns how many nodes are running afterwards.
    pub fn start_enabled(&self, done: &ShutdownSignal) -> usize {
        let pending: Vec<(String, String, Arc<dyn PaymentNodeDriver>)> = self
            .lock()
            .iter_mut()
            .filter(|n| n.record.enabled && n.drain.is_none() && !n.starting)
            .map(|n| {
                n.starting = true;
                (n.record.id.clone(), n.record.name.clone(), Arc::clone(&n.driver))
            })
            .collect();

        let mut pending = pending.into_iter();
        'nodes: for (id, name, driver) in pending.by_ref() {
            let mut attempt = 1;
            loop {
                match self.bring_up(&driver, &name) {
                    Ok(drain) => {
                        self.install(&id, &driver, drain);
                        break;
                    }
                    Err(e) if attempt < self.start_attempts => {
                        warn!(
                            "Nodes: '{}' failed to start ({}), retrying in {:?}",
                            name, e, self.start_backoff
                        );
                        if done.wait_timeout(self.start_backoff) {
                            self.release(&id);
                            break 'nodes;
                        }
                        if !self.is_starting(&id) {
                            debug!("Nodes: '{}' start cancelled", name);
                            break;
                        }
                        attempt += 1;
                    }
                    Err(e) => {
                        error!("Nodes: '{}' failed to start: {}", name, e);
                        self.release(&id);
                        break;
                    }
                }
            }
        }
        for (id, ..) in pending {
            self.release(&id);
        }
        self.running_count()
    }

    /// Stop every running node.  Enabled flags are left as persisted.
    pub fn stop_all(&self) {
        let running: Vec<(String, Arc<dyn PaymentNodeDriver>, Drain)> = self
            .lock()
            .iter_mut()
            .filter_map(|n| {
                n.starting = false;
                let drain = n.drain.take()?;
                Some((n.record.name.clone(), Arc::clone(&n.driver), drain))
            })
            .collect();
        for (name, driver, drain) in running {
            self.shut_down(&name, &driver, drain);
            info!("Nodes: '{}' stopped", name);
        }
    }

    /// Start the driver and the settled-invoice drain.  Runs without the
    /// node lock; no persistence.
    fn bring_up(&self, driver: &Arc<dyn PaymentNodeDriver>, name: &str) -> Result<Drain> {
        driver.start().map_err(|e| Error::driver("start_node", e))?;
        let invoices = match driver.subscribe_invoices() {
            Ok(sub) => sub,
            Err(e) => {
                let _ = driver.stop();
                return Err(Error::driver("subscribe_invoices", e));
            }
        };
        self.spawn_drain(name, invoices).inspect_err(|_| {
            let _ = driver.stop();
        })
    }

    /// Hand a started node its drain.  If the start was cancelled in the
    /// meantime the driver is stopped again.
    fn install(&self, id: &str, driver: &Arc<dyn PaymentNodeDriver>, drain: Drain) {
        {
            let mut nodes = self.lock();
            if let Some(node) = nodes.iter_mut().find(|n| n.record.id == id && n.starting) {
                node.starting = false;
                node.drain = Some(drain);
                info!("Nodes: '{}' running", node.record.name);
                return;
            }
        }
        debug!("Nodes: '{}' start cancelled, stopping again", id);
        self.shut_down(id, driver, drain);
    }

    fn is_starting(&self, id: &str) -> bool {
        self.lock().iter().any(|n| n.record.id == id && n.starting)
    }

    fn release(&self, id: &str) {
        if let Some(node) = self.lock().iter_mut().find(|n| n.record.id == id) {
            node.starting = false;
        }
    }

    fn shut_down(&self, name: &str, driver: &Arc<dyn PaymentNodeDriver>, drain: Drain) {
        if let Err(e) = driver.stop() {
            warn!("Nodes: stopping '{}' failed: {}", name, e);
        }
        drain.end(self.join_timeout);
    }

    fn spawn_drain(&self, name: &str, invoices: Subscription<Invoice>) -> Result<Drain> {
        let done = ShutdownSignal::new();
        let done_rx = done.receiver();
        let settled = self.settled.clone();
        let name = name.to_string();
        let mut tasks = TaskSet::new();
        tasks.spawn("node-drain", move || {
            drain_loop(&name, &invoices, &settled, &done_rx);
        })?;
        Ok(Drain { done, tasks })
    }

    // ── CRUD ──────────────────────────────────────────────────

    pub fn get_nodes(&self) -> Vec<PaymentNode> {
        self.lock().iter().map(ManagedNode::snapshot).collect()
    }

    pub fn get_node(&self, id: &str) -> Result<PaymentNode> {
        let nodes = self.lock();
        let idx = Self::position(&nodes, id)?;
        Ok(nodes[idx].snapshot())
    }

    /// Persist a new, disabled node, then build its driver.
    pub fn add_node(&self, config: NodeConfig) -> Result<PaymentNode> {
        config.validate()?;
        let record = config.into_record(Uuid::new_v4().to_string());

        let mut nodes = self.lock();
        self.store
            .put_node(&record)
            .map_err(|e| Error::storage("add_node", e))?;
        let driver = match self.factory.create(&record) {
            Ok(driver) => driver,
            Err(e) => {
                error!("Nodes: driver for '{}' failed: {}", record.name, e);
                if let Err(e) = self.store.remove_node(&record.id) {
                    warn!("Nodes: rollback of '{}' failed: {}", record.id, e);
                }
                return Err(Error::driver("add_node", e));
            }
        };
        info!("Nodes: added '{}' ({})", record.name, record.id);
        let node = ManagedNode {
            record,
            driver,
            drain: None,
            starting: false,
        };
        let snapshot = node.snapshot();
        nodes.push(node);
        Ok(snapshot)
    }

    pub fn enable_node(&self, id: &str) -> Result<()> {
        let (driver, name) = {
            let mut nodes = self.lock();
            let idx = Self::position(&nodes, id)?;
            let node = &mut nodes[idx];
            if node.drain.is_some() {
                return Ok(());
            }
            if node.starting {
                return Err(Error::Invalid(format!("node '{}' is already starting", node.record.name)));
            }
            node.starting = true;
            (Arc::clone(&node.driver), node.record.name.clone())
        };

        let drain = match self.bring_up(&driver, &name) {
            Ok(drain) => drain,
            Err(e) => {
                error!("Nodes: enable '{}' failed: {}", name, e);
                self.release(id);
                return Err(e);
            }
        };

        // Persist and install under one lock; any failure hands the drain back.
        let outcome = {
            let mut nodes = self.lock();
            match nodes.iter_mut().find(|n| n.record.id == id && n.starting) {
                None => Err((
                    drain,
                    Error::Invalid(format!("node '{}' was disabled or removed while starting", name)),
                )),
                Some(node) => {
                    node.starting = false;
                    let updated = NodeRecord {
                        enabled: true,
                        ..node.record.clone()
                    };
                    match self.store.put_node(&updated) {
                        Ok(()) => {
                            node.record = updated;
                            node.drain = Some(drain);
                            Ok(())
                        }
                        Err(e) => {
                            error!("Nodes: persisting enable of '{}' failed: {}", name, e);
                            Err((drain, Error::storage("enable_node", e)))
                        }
                    }
                }
            }
        };
        match outcome {
            Ok(()) => {
                info!("Nodes: '{}' enabled", name);
                Ok(())
            }
            Err((drain, e)) => {
                self.shut_down(&name, &driver, drain);
                Err(e)
            }
        }
    }

    pub fn disable_node(&self, id: &str) -> Result<()> {
        let mut nodes = self.lock();
        let idx = Self::position(&nodes, id)?;
        let node = &mut nodes[idx];
        node.starting = false;

        if node.drain.is_some() {
            node.driver
                .stop()
                .map_err(|e| Error::driver("disable_node", e))?;
        }
        if let Some(drain) = node.drain.take() {
            drain.end(self.join_timeout);
        }
        if node.record.enabled {
            let updated = NodeRecord {
                enabled: false,
                ..node.record.clone()
            };
            self.store
                .put_node(&updated)
                .map_err(|e| Error::storage("disable_node", e))?;
            node.record = updated;
        }
        info!("Nodes: '{}' disabled", node.record.name);
        Ok(())
    }

    pub fn remove_node(&self, id: &str) -> Result<()> {
        let mut nodes = self.lock();
        let idx = Self::position(&nodes, id)?;
        {
            let node = &mut nodes[idx];
            node.starting = false;
            if node.drain.is_some() {
                node.driver
                    .stop()
                    .map_err(|e| Error::driver("remove_node", e))?;
            }
            if let Some(drain) = node.drain.take() {
                drain.end(self.join_timeout);
            }
        }
        match self.store.remove_node(id) {
            Ok(()) | Err(crate::error::StorageError::NotFound) => {}
            Err(e) => return Err(Error::storage("remove_node", e)),
        }
        let node = nodes.remove(idx);
        info!("Nodes: removed '{}' ({})", node.record.name, node.record.id);
        Ok(())
    }

    pub fn rename_node(&self, id: &str, name: &str) -> Result<()> {
        validate_node_name(name)?;
        let mut nodes = self.lock();
        let idx = Self::position(&nodes, id)?;
        let node = &mut nodes[idx];
        let updated = NodeRecord {
            name: name.to_string(),
            ..node.record.clone()
        };
        self.store
            .put_node(&updated)
            .map_err(|e| Error::storage("rename_node", e))?;
        node.record = updated;
        Ok(())
    }

    // ── Driver passthroughs ───────────────────────────────────

    pub fn node_status(&self, id: &str) -> Result<NodeStatus> {
        Ok(self.driver(id)?.status())
    }

    pub fn unlock_node(&self, id: &str, password: &str) -> Result<()> {
        self.driver(id)?
            .unlock(password)
            .map_err(|e| Error::driver("unlock_node", e))
    }

    pub fn init_node(&self, id: &str, password: &str, mnemonic: &[String]) -> Result<()> {
        self.driver(id)?
            .init(password, mnemonic)
            .map_err(|e| Error::driver("init_node", e))
    }

    pub fn generate_seed(&self, id: &str) -> Result<Vec<String>> {
        self.driver(id)?
            .generate_seed()
            .map_err(|e| Error::driver("generate_seed", e))
    }

    pub fn add_invoice(&self, id: &str, request: &InvoiceRequest) -> Result<Invoice> {
        self.driver(id)?
            .add_invoice(request)
            .map_err(|e| Error::driver("add_invoice", e))
    }

    pub fn get_invoice(&self, id: &str, r_hash: &str) -> Result<Invoice> {
        self.driver(id)?
            .get_invoice(r_hash)
            .map_err(|e| Error::driver("get_invoice", e))
    }

    // ── Fan-out ───────────────────────────────────────────────

    /// Settled invoices from every running node.
    pub fn subscribe_settled(&self) -> Subscription<Invoice> {
        self.settled.subscribe()
    }

    pub fn shutdown_subscribers(&self) {
        self.settled.shutdown();
    }

    /// Number of nodes with a live invoice drain.
    pub fn running_count(&self) -> usize {
        self.lock().iter().filter(|n| n.drain.is_some()).count()
    }
}

impl Drop for NodeManager {
    fn drop(&mut self) {
        self.stop_all();
    }
}

fn drain_loop(
    name: &str,
    invoices: &Subscription<Invoice>,
    settled: &SubscriptionRegistry<Invoice>,
    done: &Receiver<()>,
) {
    loop {
        select! {
            recv(done) -> _ => break,
            recv(invoices.receiver()) -> msg => match msg {
                Ok(invoice) if invoice.settled => {
                    info!("Nodes: '{}' settled {} msat ({})", name, invoice.msat, invoice.r_hash);
                    settled.broadcast(invoice);
                }
                Ok(invoice) => debug!("Nodes: '{}' invoice {} pending", name, invoice.r_hash),
                Err(_) => {
                    warn!("Nodes: '{}' invoice stream closed", name);
                    break;
                }
            },
        }
    }
    invoices.cancel();
}
