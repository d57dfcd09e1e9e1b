//! Simulated Lightning payment nodes.
//!
//! [`SimNodeFactory`] implements [`NodeDriverFactory`]; every driver it
//! builds is a [`SimNode`] keeping invoices in memory.  Invoices are paid
//! with [`SimNode::settle`], which publishes the settled invoice to every
//! invoice subscriber just like a real node's invoice stream would.
//!
//! ## Local wallet lifecycle
//!
//! ```text
//!   Uninitialized ──init()──▶ Started ──stop()──▶ Stopped ──start()──▶ Locked ──unlock()──▶ Started
//! ```
//!
//! Remote nodes skip the wallet states and go straight to `Started`.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::info;

use crate::app::commands::{NodeBackend, NodeRecord};
use crate::app::events::{Invoice, InvoiceRequest, NodeStatus};
use crate::app::ports::{NodeDriverFactory, PaymentNodeDriver};
use crate::error::DriverError;
use crate::pubsub::{Subscription, SubscriptionRegistry};

const SEED_WORDS: usize = 24;

/// Small fixed vocabulary for simulated seeds.
const WORDLIST: [&str; 16] = [
    "abandon", "candy", "dispense", "lightning", "motor", "payment", "sweet", "touch", "vend", "wallet",
    "channel", "invoice", "settle", "buzzer", "relay", "satoshi",
];

fn hex(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{:02x}", b);
    }
    s
}

#[derive(Debug)]
struct Wallet {
    status: NodeStatus,
    password: Option<String>,
}

pub struct SimNode {
    name: String,
    local: bool,
    wallet: Mutex<Wallet>,
    invoices: Mutex<BTreeMap<String, Invoice>>,
    updates: SubscriptionRegistry<Invoice>,
    counter: AtomicU64,
}

impl SimNode {
    pub fn new(record: &NodeRecord) -> Self {
        let local = matches!(record.backend, NodeBackend::Local);
        Self {
            name: record.name.clone(),
            local,
            wallet: Mutex::new(Wallet {
                status: NodeStatus::Stopped,
                password: None,
            }),
            invoices: Mutex::new(BTreeMap::new()),
            updates: SubscriptionRegistry::new("node-invoices", 32),
            counter: AtomicU64::new(0),
        }
    }

    fn wallet(&self) -> MutexGuard<'_, Wallet> {
        self.wallet.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn require_started(&self) -> Result<(), DriverError> {
        match self.wallet().status {
            NodeStatus::Started => Ok(()),
            other => Err(DriverError::Unavailable(format!("node {:?}", other))),
        }
    }

    /// Mark an invoice paid and publish it.
    pub fn settle(&self, r_hash: &str) -> Result<Invoice, DriverError> {
        self.require_started()?;
        let invoice = {
            let mut invoices = self.invoices.lock().unwrap_or_else(PoisonError::into_inner);
            let invoice = invoices
                .get_mut(r_hash)
                .ok_or_else(|| DriverError::Rejected(format!("unknown invoice {r_hash}")))?;
            invoice.settled = true;
            invoice.clone()
        };
        info!("Lightning(sim): '{}' invoice {} settled", self.name, r_hash);
        self.updates.broadcast(invoice.clone());
        Ok(invoice)
    }
}

impl PaymentNodeDriver for SimNode {
    fn start(&self) -> Result<(), DriverError> {
        let mut wallet = self.wallet();
        wallet.status = match (self.local, wallet.password.is_some()) {
            (false, _) => NodeStatus::Started,
            (true, false) => NodeStatus::Uninitialized,
            (true, true) => NodeStatus::Locked,
        };
        info!("Lightning(sim): '{}' {:?}", self.name, wallet.status);
        Ok(())
    }

    fn stop(&self) -> Result<(), DriverError> {
        self.wallet().status = NodeStatus::Stopped;
        self.updates.shutdown();
        Ok(())
    }

    fn get_invoice(&self, r_hash: &str) -> Result<Invoice, DriverError> {
        self.invoices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(r_hash)
            .cloned()
            .ok_or_else(|| DriverError::Rejected(format!("unknown invoice {r_hash}")))
    }

    fn add_invoice(&self, request: &InvoiceRequest) -> Result<Invoice, DriverError> {
        self.require_started()?;
        if request.msat == 0 {
            return Err(DriverError::Rejected("amount must be positive".into()));
        }
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let digest = hmac_sha256::Hash::hash(format!("{}:{}:{}", self.name, n, request.memo).as_bytes());
        let r_hash = hex(&digest);
        let invoice = Invoice {
            payment_request: format!("lnsim{}m1{}", request.msat, &r_hash[..20]),
            r_hash: r_hash.clone(),
            settled: false,
            msat: request.msat,
            memo: request.memo.clone(),
        };
        self.invoices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(r_hash, invoice.clone());
        self.updates.broadcast(invoice.clone());
        Ok(invoice)
    }

    fn subscribe_invoices(&self) -> Result<Subscription<Invoice>, DriverError> {
        Ok(self.updates.subscribe())
    }

    fn status(&self) -> NodeStatus {
        self.wallet().status
    }

    fn unlock(&self, password: &str) -> Result<(), DriverError> {
        if !self.local {
            return Err(DriverError::Rejected("remote nodes have no wallet to unlock".into()));
        }
        let mut wallet = self.wallet();
        match (&wallet.password, wallet.status) {
            (None, _) => Err(DriverError::Rejected("wallet not initialized".into())),
            (Some(_), NodeStatus::Stopped) => Err(DriverError::Unavailable("node not started".into())),
            (Some(expected), _) if expected != password => Err(DriverError::Rejected("wrong password".into())),
            (Some(_), _) => {
                wallet.status = NodeStatus::Started;
                Ok(())
            }
        }
    }

    fn init(&self, password: &str, mnemonic: &[String]) -> Result<(), DriverError> {
        if !self.local {
            return Err(DriverError::Rejected("remote nodes cannot be initialized".into()));
        }
        if password.len() < 8 {
            return Err(DriverError::Rejected("password must be at least 8 characters".into()));
        }
        if mnemonic.len() != SEED_WORDS {
            return Err(DriverError::Rejected(format!("mnemonic must have {SEED_WORDS} words")));
        }
        let mut wallet = self.wallet();
        if wallet.password.is_some() {
            return Err(DriverError::Rejected("wallet already initialized".into()));
        }
        if wallet.status == NodeStatus::Stopped {
            return Err(DriverError::Unavailable("node not started".into()));
        }
        wallet.password = Some(password.to_string());
        wallet.status = NodeStatus::Started;
        Ok(())
    }

    fn generate_seed(&self) -> Result<Vec<String>, DriverError> {
        if !self.local {
            return Err(DriverError::Rejected("remote nodes have no seed".into()));
        }
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let a = hmac_sha256::Hash::hash(format!("{}:seed:{}", self.name, n).as_bytes());
        let b = hmac_sha256::Hash::hash(&a);
        Ok(a.iter()
            .chain(b.iter())
            .take(SEED_WORDS)
            .map(|byte| WORDLIST[usize::from(byte & 0x0F)].to_string())
            .collect())
    }
}

/// Builds [`SimNode`]s and keeps a handle to each for test access.
#[derive(Default)]
pub struct SimNodeFactory {
    built: Mutex<HashMap<String, Arc<SimNode>>>,
}

impl SimNodeFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The driver most recently built for `id`.
    pub fn node(&self, id: &str) -> Option<Arc<SimNode>> {
        self.built
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }
}

impl NodeDriverFactory for SimNodeFactory {
    fn create(&self, record: &NodeRecord) -> Result<Arc<dyn PaymentNodeDriver>, DriverError> {
        if let NodeBackend::Remote { uri, .. } = &record.backend {
            if !uri.contains(':') {
                return Err(DriverError::Rejected(format!("'{uri}' is not host:port")));
            }
        }
        let node = Arc::new(SimNode::new(record));
        self.built
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(record.id.clone(), Arc::clone(&node));
        Ok(node)
    }
}
