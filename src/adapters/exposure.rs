//! Local service exposure with a stable, key-derived address.
//!
//! Each exposed service owns a private key kept in the settings store
//! (created on first use).  The public address is derived from that key:
//!
//! ```text
//!   id = hex(HMAC-SHA256(key, service))[..16] + ".local"
//! ```
//!
//! so the address survives restarts and differs per service.  Start only
//! succeeds once a listener has been handed over.

use std::fmt::Write as _;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use log::info;
use uuid::Uuid;

use crate::app::ports::{ServiceExposure, SettingsStore};
use crate::error::{DriverError, StorageError};

/// Public service address, e.g. `1f0c9a2b44d1e7aa.local`.
pub type ServiceId = heapless::String<32>;

const ID_HEX_CHARS: usize = 16;

/// Derive the public address of `service` from its private key.
pub fn service_id(service: &str, key: &[u8]) -> ServiceId {
    let mac = hmac_sha256::HMAC::mac(service.as_bytes(), key);
    let mut id = ServiceId::new();
    for b in &mac[..ID_HEX_CHARS / 2] {
        let _ = write!(id, "{:02x}", b);
    }
    let _ = id.push_str(".local");
    id
}

fn load_or_create_key(store: &dyn SettingsStore, service: &str) -> Result<Vec<u8>, StorageError> {
    if let Some(key) = store.private_key(service)? {
        return Ok(key);
    }
    let mut key = Vec::with_capacity(32);
    key.extend_from_slice(Uuid::new_v4().as_bytes());
    key.extend_from_slice(Uuid::new_v4().as_bytes());
    store.set_private_key(service, &key)?;
    info!("Exposure: created key for '{}'", service);
    Ok(key)
}

pub struct LocalExposure {
    service: String,
    id: ServiceId,
    listener: Mutex<Option<TcpListener>>,
    exposed: AtomicBool,
}

impl LocalExposure {
    pub fn new(service: &str, store: &Arc<dyn SettingsStore>) -> Result<Self, StorageError> {
        let key = load_or_create_key(store.as_ref(), service)?;
        Ok(Self {
            service: service.to_string(),
            id: service_id(service, &key),
            listener: Mutex::new(None),
            exposed: AtomicBool::new(false),
        })
    }

    pub fn is_exposed(&self) -> bool {
        self.exposed.load(Ordering::Acquire)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(|l| l.local_addr().ok())
    }
}

impl ServiceExposure for LocalExposure {
    fn set_listener(&self, listener: TcpListener) -> Result<(), DriverError> {
        *self.listener.lock().unwrap_or_else(PoisonError::into_inner) = Some(listener);
        Ok(())
    }

    fn start(&self) -> Result<(), DriverError> {
        let Some(addr) = self.local_addr() else {
            return Err(DriverError::Unavailable(format!("'{}' has no listener", self.service)));
        };
        if !self.exposed.swap(true, Ordering::AcqRel) {
            info!("Exposure: '{}' published as {} -> {}", self.service, self.id, addr);
        }
        Ok(())
    }

    fn stop(&self) -> Result<(), DriverError> {
        if self.exposed.swap(false, Ordering::AcqRel) {
            info!("Exposure: '{}' withdrawn", self.service);
        }
        Ok(())
    }

    fn id(&self) -> String {
        self.id.to_string()
    }
}
