//! Dispenser supervisor — the hexagonal core.
//!
//! [`DispenserSupervisor`] composes the actuator, the network monitor, the
//! node manager and the two service gates.  It maps touch and payment
//! events to dispense actuation and sequences startup and shutdown.
//!
//! ```text
//!   touches ─────────┐
//!                    ├─▶ decision loop ─▶ toggle_dispense ─▶ motor/buzzer
//!   settled invoices ┘                          │
//!                                               └─▶ queue ─▶ broadcaster ─▶ subscribers
//! ```
//!
//! ## Lifecycle
//!
//! `Stopped → Starting → Started → Stopping → Stopped`.  `run_and_wait`
//! walks the whole cycle; everything acquired during startup is released by
//! a [`Teardown`] guard on every exit path, including startup failures.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crossbeam_channel::{Sender, TrySendError, bounded, never, select};
use log::{debug, error, info, warn};

use crate::app::commands::{Connection, NodeConfig};
use crate::app::events::{DispenseState, Invoice, InvoiceRequest, SupervisorState, Update};
use crate::app::lifecycle::{ShutdownSignal, StateCell, TaskSet};
use crate::app::ports::{
    ConnectivityDriver, IpRenewal, MachineDriver, NodeDriverFactory, ServiceExposure, SettingsStore,
    SystemControl, UpdateManager,
};
use crate::config::SupervisorConfig;
use crate::error::{Error, Result};
use crate::gate::ServiceGate;
use crate::machine::DispenseActuator;
use crate::network::{ConnectivityStatus, NetworkMonitor, ScanStream, StatusPolicy};
use crate::nodes::{NodeManager, PaymentNode};
use crate::pubsub::{Subscription, SubscriptionRegistry};

pub const DEFAULT_NAME: &str = "Dispenser";

/// Every external collaborator the supervisor needs.
pub struct Collaborators {
    pub machine: Arc<dyn MachineDriver>,
    pub connectivity: Arc<dyn ConnectivityDriver>,
    pub ip_renewal: Option<Arc<dyn IpRenewal>>,
    pub node_factory: Arc<dyn NodeDriverFactory>,
    pub store: Arc<dyn SettingsStore>,
    pub api_exposure: Arc<dyn ServiceExposure>,
    pub pos_exposure: Arc<dyn ServiceExposure>,
    pub updater: Arc<dyn UpdateManager>,
    pub system: Arc<dyn SystemControl>,
}

struct Settings {
    name: Mutex<String>,
    dispense_on_touch: AtomicBool,
    buzz_on_dispense: AtomicBool,
}

struct Inner {
    config: SupervisorConfig,
    store: Arc<dyn SettingsStore>,
    updater: Arc<dyn UpdateManager>,
    system: Arc<dyn SystemControl>,
    api_exposure: Arc<dyn ServiceExposure>,
    pos_exposure: Arc<dyn ServiceExposure>,

    machine: DispenseActuator,
    network: NetworkMonitor,
    nodes: NodeManager,

    settings: Settings,
    dispenses: SubscriptionRegistry<DispenseState>,
    /// Feed of the broadcaster task while running.
    dispense_tx: Mutex<Option<Sender<DispenseState>>>,

    state: StateCell,
    done: Mutex<ShutdownSignal>,
}

// ───────────────────────────────────────────────────────────────
// DispenserSupervisor
// ───────────────────────────────────────────────────────────────

/// Cheap to clone; every clone drives the same supervisor.
#[derive(Clone)]
pub struct DispenserSupervisor {
    inner: Arc<Inner>,
}

impl DispenserSupervisor {
    pub fn new(config: SupervisorConfig, c: Collaborators) -> Result<Self> {
        config.validate().map_err(|e| Error::Invalid(e.to_string()))?;
        let depth = config.subscriber_depth;
        let inner = Inner {
            machine: DispenseActuator::new(c.machine, depth),
            network: NetworkMonitor::new(
                c.connectivity,
                c.ip_renewal,
                StatusPolicy::from(&config),
                depth,
            ),
            nodes: NodeManager::new(Arc::clone(&c.store), c.node_factory, &config),
            settings: Settings {
                name: Mutex::new(DEFAULT_NAME.to_string()),
                dispense_on_touch: AtomicBool::new(config.default_dispense_on_touch),
                buzz_on_dispense: AtomicBool::new(config.default_buzz_on_dispense),
            },
            dispenses: SubscriptionRegistry::new("dispense", depth),
            dispense_tx: Mutex::new(None),
            state: StateCell::new(depth),
            done: Mutex::new(ShutdownSignal::new()),
            store: c.store,
            updater: c.updater,
            system: c.system,
            api_exposure: c.api_exposure,
            pos_exposure: c.pos_exposure,
            config,
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    // ── Lifecycle ─────────────────────────────────────────────

    /// Run the full lifecycle: start everything, block until [`stop`],
    /// tear everything down.  A startup failure is returned after the
    /// already-started parts have been stopped.
    ///
    /// [`stop`]: Self::stop
    pub fn run_and_wait(&self) -> Result<()> {
        let done = self.inner.begin()?;
        let mut run = Teardown::new(&self.inner, done.clone());
        self.inner.restore_settings();

        self.inner.machine.start().inspect_err(|e| {
            error!("Supervisor: machine start failed: {}", e);
        })?;
        run.machine = true;

        match self.inner.network.start() {
            Ok(()) => run.network = true,
            Err(e) => warn!("Supervisor: network start failed, continuing offline: {}", e),
        }

        let pos = ServiceGate::watch("pos", Arc::clone(&self.inner.pos_exposure), &self.inner.network)?;
        pos.bind(self.inner.config.pos_listen.as_str())?;
        run.gates.push(pos);
        let api = ServiceGate::watch("api", Arc::clone(&self.inner.api_exposure), &self.inner.network)?;
        api.bind(self.inner.config.api_listen.as_str())?;
        run.gates.push(api);

        self.spawn_tasks(&mut run, &done)?;
        for gate in &run.gates {
            gate.start();
        }

        if done.is_fired() {
            info!("Supervisor: stop requested during startup");
            return Ok(());
        }
        self.inner.state.advance(SupervisorState::Started);
        self.inner.machine.diagnostic_noise();
        info!("Supervisor: '{}' running", self.name());

        done.wait();
        Ok(())
    }

    fn spawn_tasks(&self, run: &mut Teardown<'_>, done: &ShutdownSignal) -> Result<()> {
        // Broadcaster: the only writer into the dispense registry while running.
        let (tx, rx) = bounded::<DispenseState>(self.inner.config.subscriber_depth);
        let inner = Arc::clone(&self.inner);
        run.broadcaster.spawn("dispense-broadcast", move || {
            for state in &rx {
                inner.dispenses.broadcast(state);
            }
        })?;
        *self.inner.lock_dispense_tx() = Some(tx);

        // Saved Wi-Fi.
        let inner = Arc::clone(&self.inner);
        run.workers.spawn("wifi-restore", move || inner.restore_wifi())?;

        // Nodes, once the network is up.
        let inner = Arc::clone(&self.inner);
        let net = self.inner.network.subscribe();
        let signal = done.clone();
        run.workers.spawn("nodes", move || inner.nodes_task(&net, &signal))?;

        // Touch and payment decisions.
        let inner = Arc::clone(&self.inner);
        let touches = self.inner.machine.subscribe_touches();
        let settled = self.inner.nodes.subscribe_settled();
        let signal = done.clone();
        run.workers.spawn("decide", move || {
            inner.decision_loop(&touches, &settled, &signal);
        })?;
        Ok(())
    }

    /// Request shutdown.  Safe to call any number of times from any thread.
    pub fn stop(&self) {
        let done = self.inner.lock_done();
        match self.inner.state.get() {
            SupervisorState::Starting | SupervisorState::Started => {
                if done.fire() {
                    info!("Supervisor: stop requested");
                }
            }
            SupervisorState::Stopping | SupervisorState::Stopped => {}
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.inner.state.get()
    }

    pub fn subscribe_state(&self) -> Subscription<SupervisorState> {
        self.inner.state.subscribe()
    }

    /// Block until the supervisor reports `Stopped`, up to `timeout`.
    pub fn wait_stopped(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.state() != SupervisorState::Stopped {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        true
    }

    pub fn reboot(&self) -> Result<()> {
        info!("Supervisor: reboot requested");
        self.stop();
        self.wait_stopped(self.inner.config.shutdown_timeout());
        self.inner
            .system
            .reboot()
            .map_err(|e| Error::driver("reboot", e))
    }

    pub fn shutdown(&self) -> Result<()> {
        info!("Supervisor: poweroff requested");
        self.stop();
        self.wait_stopped(self.inner.config.shutdown_timeout());
        self.inner
            .system
            .poweroff()
            .map_err(|e| Error::driver("shutdown", e))
    }

    // ── Dispensing ────────────────────────────────────────────

    /// Drive the machine and publish the resulting state.
    pub fn toggle_dispense(&self, on: bool) {
        self.inner.toggle_dispense(on);
    }

    pub fn subscribe_dispenses(&self) -> Subscription<DispenseState> {
        self.inner.dispenses.subscribe()
    }

    // ── Settings ──────────────────────────────────────────────

    pub fn name(&self) -> String {
        self.inner.settings.name.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn set_name(&self, name: &str) -> Result<()> {
        let name = name.trim();
        if name.is_empty() || name.len() > 64 {
            return Err(Error::Invalid("name must be 1-64 bytes".into()));
        }
        self.inner
            .store
            .set_name(name)
            .map_err(|e| Error::storage("set_name", e))?;
        *self.inner.settings.name.lock().unwrap_or_else(PoisonError::into_inner) = name.to_string();
        Ok(())
    }

    pub fn dispense_on_touch(&self) -> bool {
        self.inner.settings.dispense_on_touch.load(Ordering::Acquire)
    }

    pub fn set_dispense_on_touch(&self, on: bool) -> Result<()> {
        self.inner
            .store
            .set_dispense_on_touch(on)
            .map_err(|e| Error::storage("set_dispense_on_touch", e))?;
        self.inner.settings.dispense_on_touch.store(on, Ordering::Release);
        Ok(())
    }

    pub fn buzz_on_dispense(&self) -> bool {
        self.inner.settings.buzz_on_dispense.load(Ordering::Acquire)
    }

    pub fn set_buzz_on_dispense(&self, on: bool) -> Result<()> {
        self.inner
            .store
            .set_buzz_on_dispense(on)
            .map_err(|e| Error::storage("set_buzz_on_dispense", e))?;
        self.inner.settings.buzz_on_dispense.store(on, Ordering::Release);
        Ok(())
    }

    // ── Network ───────────────────────────────────────────────

    /// Join a network and remember it on success.
    pub fn connect_wifi(&self, connection: &Connection) -> Result<()> {
        self.inner.network.connect(connection)?;
        self.inner
            .store
            .set_wifi(connection)
            .map_err(|e| Error::storage("save_wifi", e))
    }

    pub fn network_status(&self) -> ConnectivityStatus {
        self.inner.network.status()
    }

    pub fn scan_wifi(&self) -> Result<ScanStream> {
        self.inner.network.scan()
    }

    pub fn subscribe_network(&self) -> Subscription<ConnectivityStatus> {
        self.inner.network.subscribe()
    }

    pub fn api_service_id(&self) -> String {
        self.inner.api_exposure.id()
    }

    pub fn pos_service_id(&self) -> String {
        self.inner.pos_exposure.id()
    }

    // ── Nodes ─────────────────────────────────────────────────

    pub fn get_nodes(&self) -> Vec<PaymentNode> {
        self.inner.nodes.get_nodes()
    }

    pub fn get_node(&self, id: &str) -> Result<PaymentNode> {
        self.inner.nodes.get_node(id)
    }

    pub fn add_node(&self, config: NodeConfig) -> Result<PaymentNode> {
        self.inner.nodes.add_node(config)
    }

    pub fn remove_node(&self, id: &str) -> Result<()> {
        self.inner.nodes.remove_node(id)
    }

    pub fn enable_node(&self, id: &str) -> Result<()> {
        self.inner.nodes.enable_node(id)
    }

    pub fn disable_node(&self, id: &str) -> Result<()> {
        self.inner.nodes.disable_node(id)
    }

    pub fn rename_node(&self, id: &str, name: &str) -> Result<()> {
        self.inner.nodes.rename_node(id, name)
    }

    pub fn unlock_node(&self, id: &str, password: &str) -> Result<()> {
        self.inner.nodes.unlock_node(id, password)
    }

    pub fn init_node(&self, id: &str, password: &str, mnemonic: &[String]) -> Result<()> {
        self.inner.nodes.init_node(id, password, mnemonic)
    }

    pub fn generate_seed(&self, id: &str) -> Result<Vec<String>> {
        self.inner.nodes.generate_seed(id)
    }

    pub fn add_invoice(&self, id: &str, request: &InvoiceRequest) -> Result<Invoice> {
        self.inner.nodes.add_invoice(id, request)
    }

    pub fn get_invoice(&self, id: &str, r_hash: &str) -> Result<Invoice> {
        self.inner.nodes.get_invoice(id, r_hash)
    }

    // ── Updates ───────────────────────────────────────────────

    pub fn start_update(&self, url: &str) -> Result<Update> {
        let update = self
            .inner
            .updater
            .start_update(url)
            .map_err(|e| Error::driver("start_update", e))?;
        if let Err(e) = self.inner.store.set_current_update(Some(&update)) {
            warn!("Supervisor: recording update {} failed: {}", update.id, e);
        }
        Ok(update)
    }

    pub fn get_update(&self, id: &str) -> Result<Update> {
        self.inner
            .updater
            .get_update(id)
            .map_err(|e| Error::driver("get_update", e))
    }

    pub fn current_update(&self) -> Result<Option<Update>> {
        self.inner
            .updater
            .current_update()
            .map_err(|e| Error::driver("current_update", e))
    }

    pub fn cancel_update(&self, id: &str) -> Result<()> {
        self.inner
            .updater
            .cancel_update(id)
            .map_err(|e| Error::driver("cancel_update", e))
    }

    pub fn commit_update(&self, id: &str) -> Result<()> {
        self.inner
            .updater
            .commit_update(id)
            .map_err(|e| Error::driver("commit_update", e))
    }

    pub fn reject_update(&self, id: &str) -> Result<()> {
        self.inner
            .updater
            .reject_update(id)
            .map_err(|e| Error::driver("reject_update", e))
    }

    pub fn subscribe_update(&self, id: &str) -> Result<Subscription<Update>> {
        self.inner
            .updater
            .subscribe_update(id)
            .map_err(|e| Error::driver("subscribe_update", e))
    }
}

// ───────────────────────────────────────────────────────────────
// Internals
// ───────────────────────────────────────────────────────────────

impl Inner {
    fn lock_done(&self) -> MutexGuard<'_, ShutdownSignal> {
        self.done.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_dispense_tx(&self) -> MutexGuard<'_, Option<Sender<DispenseState>>> {
        self.dispense_tx.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `Stopped → Starting` with a fresh done signal.
    fn begin(&self) -> Result<ShutdownSignal> {
        let mut done = self.lock_done();
        if !self.state.advance(SupervisorState::Starting) {
            return Err(Error::AlreadyRunning);
        }
        *done = ShutdownSignal::new();
        Ok(done.clone())
    }

    fn restore_settings(&self) {
        match self.store.name() {
            Ok(Some(name)) => *self.settings.name.lock().unwrap_or_else(PoisonError::into_inner) = name,
            Ok(None) => {}
            Err(e) => warn!("Supervisor: restoring name failed: {}", e),
        }
        match self.store.dispense_on_touch() {
            Ok(Some(on)) => self.settings.dispense_on_touch.store(on, Ordering::Release),
            Ok(None) => {}
            Err(e) => warn!("Supervisor: restoring dispense_on_touch failed: {}", e),
        }
        match self.store.buzz_on_dispense() {
            Ok(Some(on)) => self.settings.buzz_on_dispense.store(on, Ordering::Release),
            Ok(None) => {}
            Err(e) => warn!("Supervisor: restoring buzz_on_dispense failed: {}", e),
        }
        debug!(
            "Supervisor: settings restored (dispense_on_touch={}, buzz_on_dispense={})",
            self.settings.dispense_on_touch.load(Ordering::Acquire),
            self.settings.buzz_on_dispense.load(Ordering::Acquire)
        );
    }

    fn toggle_dispense(&self, on: bool) {
        // Held across actuation and enqueue: queue order is motor order.
        let tx = self.lock_dispense_tx();
        // The buzzer is always silenced on stop, whatever the flag says.
        if self.settings.buzz_on_dispense.load(Ordering::Acquire) || !on {
            self.machine.toggle_buzzer(on);
        }
        self.machine.toggle_motor(on);

        let state = DispenseState::from(on);
        match tx.as_ref() {
            Some(tx) => match tx.try_send(state) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => warn!("Supervisor: dispense queue full, dropping {:?}", state),
                Err(TrySendError::Disconnected(_)) => {
                    self.dispenses.broadcast(state);
                }
            },
            None => {
                self.dispenses.broadcast(state);
            }
        }
    }

    fn restore_wifi(&self) {
        self.network.refresh();
        if self.network.status().connected {
            debug!("Supervisor: network already connected, skipping saved Wi-Fi");
            return;
        }
        match self.store.wifi() {
            Ok(Some(connection)) => {
                if let Err(e) = self.network.connect(&connection) {
                    warn!("Supervisor: saved Wi-Fi '{}' failed: {}", connection.ssid(), e);
                }
            }
            Ok(None) => info!("Supervisor: no saved Wi-Fi connection"),
            Err(e) => warn!("Supervisor: reading saved Wi-Fi failed: {}", e),
        }
    }

    /// Load nodes, then start the enabled ones each time the link comes up.
    fn nodes_task(&self, net: &Subscription<ConnectivityStatus>, done: &ShutdownSignal) {
        if let Err(e) = self.nodes.load() {
            warn!("Supervisor: loading nodes failed: {}", e);
        }
        let done_rx = done.receiver();
        let mut link_up = false;
        let mut on_status = |connected: bool| {
            if connected && !link_up {
                let running = self.nodes.start_enabled(done);
                info!("Supervisor: network up, {} node(s) running", running);
            }
            link_up = connected;
        };
        on_status(self.network.status().connected);
        loop {
            select! {
                recv(done_rx) -> _ => break,
                recv(net.receiver()) -> msg => match msg {
                    Ok(status) => on_status(status.connected),
                    Err(_) => break,
                },
            }
        }
    }

    fn decision_loop(
        &self,
        touches: &Subscription<bool>,
        settled: &Subscription<Invoice>,
        done: &ShutdownSignal,
    ) {
        let done_rx = done.receiver();
        // A closed source is swapped for `never()`; the other keeps being served.
        let (no_touches, no_invoices) = (never::<bool>(), never::<Invoice>());
        let (mut touch_open, mut settled_open) = (true, true);
        loop {
            let touch_rx = if touch_open { touches.receiver() } else { &no_touches };
            let settled_rx = if settled_open { settled.receiver() } else { &no_invoices };
            select! {
                recv(done_rx) -> _ => break,
                recv(touch_rx) -> msg => match msg {
                    Ok(touched) => {
                        let dispense = touched && self.settings.dispense_on_touch.load(Ordering::Acquire);
                        self.toggle_dispense(dispense);
                    }
                    Err(_) => {
                        warn!("Supervisor: touch stream closed");
                        touch_open = false;
                    }
                },
                recv(settled_rx) -> msg => match msg {
                    Ok(invoice) => {
                        info!("Supervisor: paid {} msat, dispensing", invoice.msat);
                        self.toggle_dispense(true);
                        done.wait_timeout(self.config.dispense_pulse());
                        self.toggle_dispense(false);
                    }
                    Err(_) => {
                        warn!("Supervisor: invoice stream closed");
                        settled_open = false;
                    }
                },
            }
        }
    }
}

// ───────────────────────────────────────────────────────────────
// Teardown guard
// ───────────────────────────────────────────────────────────────

/// Releases everything `run_and_wait` acquired, in reverse order.
struct Teardown<'a> {
    inner: &'a Inner,
    done: ShutdownSignal,
    machine: bool,
    network: bool,
    gates: Vec<ServiceGate>,
    workers: TaskSet,
    broadcaster: TaskSet,
}

impl<'a> Teardown<'a> {
    fn new(inner: &'a Inner, done: ShutdownSignal) -> Self {
        Self {
            inner,
            done,
            machine: false,
            network: false,
            gates: Vec::new(),
            workers: TaskSet::new(),
            broadcaster: TaskSet::new(),
        }
    }
}

impl Drop for Teardown<'_> {
    fn drop(&mut self) {
        let inner = self.inner;
        let timeout = inner.config.shutdown_timeout();
        inner.state.advance(SupervisorState::Stopping);
        self.done.fire();

        for gate in &self.gates {
            gate.stop();
        }
        let leaked = self.workers.join_all(timeout);
        if !leaked.is_empty() {
            error!("Supervisor: tasks still running after {:?}: {:?}", timeout, leaked);
        }

        if inner.machine.motor_on() {
            inner.toggle_dispense(false);
        }
        // Closing the queue lets the broadcaster flush and exit.
        inner.lock_dispense_tx().take();
        self.broadcaster.join_all(timeout);

        inner.nodes.stop_all();
        for gate in self.gates.drain(..) {
            gate.shutdown(timeout);
        }
        if self.network {
            inner.network.stop();
        }
        if self.machine {
            inner.machine.stop(timeout);
        }

        inner.dispenses.shutdown();
        inner.network.shutdown_subscribers();
        inner.nodes.shutdown_subscribers();
        inner.machine.shutdown_subscribers();

        inner.state.advance(SupervisorState::Stopped);
        inner.state.shutdown_subscribers();
    }
}
