//! Network-gated service exposure.
//!
//! A [`ServiceGate`] publishes one local listener (API, point-of-sale) via
//! a [`ServiceExposure`] only while the network is connected.
//!
//! ```text
//!            start()                connected
//!   Idle ───────────▶ Requested ───────────────▶ Exposed
//!    ▲                  ▲   │                     │
//!    │       stop()     │   └──── disconnected ◀──┘
//!    └──────────────────┴──────────────────────────┘
//! ```
//!
//! `start` is idempotent and may be called before connectivity exists; the
//! exposure is brought up on the first "connected" notification and brought
//! up exactly once no matter how many duplicate starts or notifications
//! arrive.  Each gate has its own lock; gates never serialize on each other.

use std::net::{TcpListener, ToSocketAddrs};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crossbeam_channel::{Receiver, select};
use log::{debug, info, warn};

use crate::app::lifecycle::{ShutdownSignal, TaskSet};
use crate::app::ports::ServiceExposure;
use crate::error::{Error, Result};
use crate::network::{ConnectivityStatus, NetworkMonitor};
use crate::pubsub::Subscription;

#[derive(Debug, Default)]
struct GateState {
    requested: bool,
    exposed: bool,
    connected: bool,
}

struct Core {
    name: &'static str,
    exposure: Arc<dyn ServiceExposure>,
    state: Mutex<GateState>,
}

impl Core {
    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drive the exposure towards `requested && connected`.
    fn reconcile(&self, st: &mut GateState) {
        let want = st.requested && st.connected;
        if want && !st.exposed {
            match self.exposure.start() {
                Ok(()) => {
                    st.exposed = true;
                    info!("Gate[{}]: exposed as {}", self.name, self.exposure.id());
                }
                Err(e) => warn!("Gate[{}]: exposure failed, waiting for next update: {}", self.name, e),
            }
        } else if !want && st.exposed {
            if let Err(e) = self.exposure.stop() {
                warn!("Gate[{}]: exposure stop failed: {}", self.name, e);
            }
            st.exposed = false;
            info!("Gate[{}]: withdrawn", self.name);
        }
    }

    fn on_status(&self, status: &ConnectivityStatus) {
        let mut st = self.lock();
        if st.connected != status.connected {
            debug!("Gate[{}]: network connected={}", self.name, status.connected);
        }
        st.connected = status.connected;
        self.reconcile(&mut st);
    }
}

pub struct ServiceGate {
    core: Arc<Core>,
    watcher: Mutex<Option<(ShutdownSignal, TaskSet)>>,
}

impl ServiceGate {
    /// Gate driven by `monitor`'s connectivity updates.
    pub fn watch(
        name: &'static str,
        exposure: Arc<dyn ServiceExposure>,
        monitor: &NetworkMonitor,
    ) -> Result<Self> {
        // Subscribe before sampling so no transition falls in between.
        let updates = monitor.subscribe();
        let connected = monitor.status().connected;
        Self::new(name, exposure, updates, connected)
    }

    /// Gate driven by an arbitrary status stream, starting from `connected`.
    pub fn new(
        name: &'static str,
        exposure: Arc<dyn ServiceExposure>,
        updates: Subscription<ConnectivityStatus>,
        connected: bool,
    ) -> Result<Self> {
        let core = Arc::new(Core {
            name,
            exposure,
            state: Mutex::new(GateState {
                connected,
                ..GateState::default()
            }),
        });
        let done = ShutdownSignal::new();
        let done_rx = done.receiver();
        let watched = Arc::clone(&core);
        let mut tasks = TaskSet::new();
        tasks.spawn(&format!("gate-{name}"), move || {
            watch_loop(&watched, &updates, &done_rx);
        })?;
        Ok(Self {
            core,
            watcher: Mutex::new(Some((done, tasks))),
        })
    }

    /// Bind the local listener and hand it to the exposure.
    pub fn bind<A: ToSocketAddrs + std::fmt::Debug>(&self, addr: A) -> Result<()> {
        let name = self.core.name;
        let listener = TcpListener::bind(&addr).map_err(|e| Error::Startup {
            surface: name,
            reason: format!("bind {:?}: {}", addr, e),
        })?;
        if let Ok(local) = listener.local_addr() {
            info!("Gate[{}]: listening on {}", name, local);
        }
        self.core
            .exposure
            .set_listener(listener)
            .map_err(|e| Error::Startup {
                surface: name,
                reason: e.to_string(),
            })
    }

    /// Request exposure.  Deferred until the network is connected.
    pub fn start(&self) {
        let mut st = self.core.lock();
        if !st.requested {
            debug!("Gate[{}]: start requested", self.core.name);
        }
        st.requested = true;
        self.core.reconcile(&mut st);
    }

    /// Withdraw the exposure.  Safe when never started.
    pub fn stop(&self) {
        let mut st = self.core.lock();
        st.requested = false;
        self.core.reconcile(&mut st);
    }

    /// Stop and end the watcher thread.  Idempotent.
    pub fn shutdown(&self, join_timeout: Duration) {
        self.stop();
        if let Some((done, mut tasks)) = self
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            done.fire();
            tasks.join_all(join_timeout);
        }
    }

    pub fn is_exposed(&self) -> bool {
        self.core.lock().exposed
    }

    pub fn is_requested(&self) -> bool {
        self.core.lock().requested
    }

    pub fn name(&self) -> &'static str {
        self.core.name
    }

    pub fn id(&self) -> String {
        self.core.exposure.id()
    }
}

impl Drop for ServiceGate {
    fn drop(&mut self) {
        self.shutdown(Duration::from_millis(500));
    }
}

fn watch_loop(core: &Core, updates: &Subscription<ConnectivityStatus>, done: &Receiver<()>) {
    loop {
        select! {
            recv(done) -> _ => break,
            recv(updates.receiver()) -> msg => match msg {
                Ok(status) => core.on_status(&status),
                Err(_) => {
                    debug!("Gate[{}]: network updates closed", core.name);
                    // Treat a closed feed as disconnected and wait for shutdown.
                    core.on_status(&ConnectivityStatus::default());
                    let _ = done.recv();
                    break;
                }
            },
        }
    }
}
