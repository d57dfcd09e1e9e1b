//! Port traits — the hexagonal boundary between the supervisor and the outside world.
//!
//! ```text
//!   Adapter ──▶ Port trait ──▶ DispenserSupervisor (domain)
//! ```
//!
//! Driven adapters (GPIO machine, Wi-Fi supplicant, Lightning nodes, the
//! settings store, service exposure, OS control) implement these traits.
//! The supervisor holds them as `Arc<dyn Port>` and shares them with its
//! background tasks, so every port is `Send + Sync` and takes `&self`.
//!
//! ## Contract notes
//!
//! - Driver calls that touch the network (connect, node start) MUST carry
//!   their own timeout and report it as [`DriverError::Timeout`].
//! - **SettingsStore** implementations MUST write atomically; a failed
//!   write leaves the previous value intact.
//! - Streams are [`Subscription`]s; cancelling one never affects another.

use std::net::TcpListener;

use crossbeam_channel::Receiver;
use serde::{Deserialize, Serialize};

use crate::app::commands::{Connection, Encryption, NodeRecord};
use crate::app::events::{Invoice, InvoiceRequest, NodeStatus, Update};
use crate::error::{DriverError, StorageError};
use crate::pubsub::Subscription;

// ───────────────────────────────────────────────────────────────
// Machine (touch sensor, motor, buzzer)
// ───────────────────────────────────────────────────────────────

pub trait MachineDriver: Send + Sync {
    fn start(&self) -> Result<(), DriverError>;
    fn stop(&self);

    fn toggle_motor(&self, on: bool);
    fn toggle_buzzer(&self, on: bool);

    /// Two short buzzer pulses.  Blocks until finished.
    fn diagnostic_noise(&self);

    /// Debounced touch events: `true` on touch begin, `false` on release.
    fn subscribe_touches(&self) -> Subscription<bool>;
}

// ───────────────────────────────────────────────────────────────
// Connectivity
// ───────────────────────────────────────────────────────────────

/// Supplicant association state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    Disconnected,
    Inactive,
    Scanning,
    Authenticating,
    Associating,
    Associated,
    Handshake,
    Completed,
}

impl LinkState {
    /// Mid-association states that settle on their own within seconds.
    pub fn is_transitional(self) -> bool {
        matches!(
            self,
            Self::Scanning | Self::Authenticating | Self::Associating | Self::Associated | Self::Handshake
        )
    }
}

/// Raw status as reported by the connectivity driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverStatus {
    pub state: LinkState,
    pub ip: String,
    pub ssid: String,
    pub channel: u32,
}

/// One network found by a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WifiNetwork {
    pub ssid: String,
    pub encryption: Encryption,
    /// Signal strength in dBm.
    pub signal_dbm: i16,
}

pub trait ConnectivityDriver: Send + Sync {
    fn start(&self) -> Result<(), DriverError>;
    fn stop(&self) -> Result<(), DriverError>;
    fn status(&self) -> Result<DriverStatus, DriverError>;
    fn connect(&self, connection: &Connection) -> Result<(), DriverError>;

    /// Discovered networks; the channel disconnects when the scan completes.
    fn scan(&self) -> Result<Receiver<WifiNetwork>, DriverError>;

    /// Association edges: `true` when associated, `false` when lost.
    fn subscribe_state(&self) -> Subscription<bool>;
}

/// Renews the DHCP lease after the link moved to a different network.
pub trait IpRenewal: Send + Sync {
    fn renew(&self, ssid: &str) -> Result<(), DriverError>;
}

// ───────────────────────────────────────────────────────────────
// Payment nodes
// ───────────────────────────────────────────────────────────────

pub trait PaymentNodeDriver: Send + Sync {
    fn start(&self) -> Result<(), DriverError>;
    fn stop(&self) -> Result<(), DriverError>;

    fn get_invoice(&self, r_hash: &str) -> Result<Invoice, DriverError>;
    fn add_invoice(&self, request: &InvoiceRequest) -> Result<Invoice, DriverError>;

    /// Every invoice update the node sees, settled or not.
    fn subscribe_invoices(&self) -> Result<Subscription<Invoice>, DriverError>;

    fn status(&self) -> NodeStatus;

    fn unlock(&self, password: &str) -> Result<(), DriverError>;
    fn init(&self, password: &str, mnemonic: &[String]) -> Result<(), DriverError>;
    fn generate_seed(&self) -> Result<Vec<String>, DriverError>;
}

/// Builds a driver for a persisted node record.
pub trait NodeDriverFactory: Send + Sync {
    fn create(&self, record: &NodeRecord) -> Result<std::sync::Arc<dyn PaymentNodeDriver>, DriverError>;
}

// ───────────────────────────────────────────────────────────────
// Persistence
// ───────────────────────────────────────────────────────────────

/// Durable settings.  `Ok(None)` means "never written".
pub trait SettingsStore: Send + Sync {
    fn name(&self) -> Result<Option<String>, StorageError>;
    fn set_name(&self, name: &str) -> Result<(), StorageError>;

    fn dispense_on_touch(&self) -> Result<Option<bool>, StorageError>;
    fn set_dispense_on_touch(&self, on: bool) -> Result<(), StorageError>;

    fn buzz_on_dispense(&self) -> Result<Option<bool>, StorageError>;
    fn set_buzz_on_dispense(&self, on: bool) -> Result<(), StorageError>;

    fn wifi(&self) -> Result<Option<Connection>, StorageError>;
    fn set_wifi(&self, connection: &Connection) -> Result<(), StorageError>;

    fn nodes(&self) -> Result<Vec<NodeRecord>, StorageError>;
    fn node(&self, id: &str) -> Result<Option<NodeRecord>, StorageError>;
    /// Insert or replace by `record.id`.
    fn put_node(&self, record: &NodeRecord) -> Result<(), StorageError>;
    /// `Err(StorageError::NotFound)` if absent.
    fn remove_node(&self, id: &str) -> Result<(), StorageError>;

    fn private_key(&self, service: &str) -> Result<Option<Vec<u8>>, StorageError>;
    fn set_private_key(&self, service: &str, key: &[u8]) -> Result<(), StorageError>;

    fn current_update(&self) -> Result<Option<Update>, StorageError>;
    fn set_current_update(&self, update: Option<&Update>) -> Result<(), StorageError>;
}

// ───────────────────────────────────────────────────────────────
// Service exposure
// ───────────────────────────────────────────────────────────────

/// Publishes one local listener to the outside (e.g. as an onion service).
pub trait ServiceExposure: Send + Sync {
    fn set_listener(&self, listener: TcpListener) -> Result<(), DriverError>;
    fn start(&self) -> Result<(), DriverError>;
    fn stop(&self) -> Result<(), DriverError>;
    /// Stable public address of this service.
    fn id(&self) -> String;
}

// ───────────────────────────────────────────────────────────────
// Updates and OS control
// ───────────────────────────────────────────────────────────────

pub trait UpdateManager: Send + Sync {
    fn start_update(&self, url: &str) -> Result<Update, DriverError>;
    fn get_update(&self, id: &str) -> Result<Update, DriverError>;
    fn current_update(&self) -> Result<Option<Update>, DriverError>;
    fn cancel_update(&self, id: &str) -> Result<(), DriverError>;
    fn commit_update(&self, id: &str) -> Result<(), DriverError>;
    fn reject_update(&self, id: &str) -> Result<(), DriverError>;
    fn subscribe_update(&self, id: &str) -> Result<Subscription<Update>, DriverError>;
}

pub trait SystemControl: Send + Sync {
    fn reboot(&self) -> Result<(), DriverError>;
    fn poweroff(&self) -> Result<(), DriverError>;
}
