//! Simulated Wi-Fi station adapter.
//!
//! Implements [`ConnectivityDriver`] for host runs and tests.  The set of
//! networks "in range" is fixed at construction; joining one of them moves
//! the link to `Completed` with a synthetic address, anything else fails.
//!
//! Also provides [`LogIpRenewal`], an [`IpRenewal`] hook that only logs.

use std::sync::{Mutex, MutexGuard, PoisonError};

use crossbeam_channel::{Receiver, unbounded};
use log::{info, warn};

use crate::app::commands::{Connection, Encryption};
use crate::app::ports::{ConnectivityDriver, DriverStatus, IpRenewal, LinkState, WifiNetwork};
use crate::error::DriverError;
use crate::pubsub::{Subscription, SubscriptionRegistry};

#[derive(Debug)]
struct SimState {
    started: bool,
    link: LinkState,
    ssid: heapless::String<32>,
    ip: String,
    channel: u32,
    joins: u32,
}

pub struct SimWifi {
    in_range: Vec<WifiNetwork>,
    state: Mutex<SimState>,
    edges: SubscriptionRegistry<bool>,
}

impl SimWifi {
    pub fn new(in_range: Vec<WifiNetwork>) -> Self {
        Self {
            in_range,
            state: Mutex::new(SimState {
                started: false,
                link: LinkState::Inactive,
                ssid: heapless::String::new(),
                ip: String::new(),
                channel: 0,
                joins: 0,
            }),
            edges: SubscriptionRegistry::new("wifi-edges", 8),
        }
    }

    /// A small neighbourhood with one network of each security class.
    pub fn with_defaults() -> Self {
        Self::new(vec![
            WifiNetwork {
                ssid: "homeNet".into(),
                encryption: Encryption::Personal,
                signal_dbm: -48,
            },
            WifiNetwork {
                ssid: "cafe".into(),
                encryption: Encryption::None,
                signal_dbm: -67,
            },
            WifiNetwork {
                ssid: "corp".into(),
                encryption: Encryption::Enterprise,
                signal_dbm: -72,
            },
            WifiNetwork {
                ssid: String::new(),
                encryption: Encryption::Personal,
                signal_dbm: -80,
            },
        ])
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Simulate losing the access point.
    pub fn drop_link(&self) {
        let mut st = self.lock();
        st.link = LinkState::Disconnected;
        st.ip.clear();
        st.ssid.clear();
        drop(st);
        warn!("WiFi(sim): link lost");
        self.edges.broadcast(false);
    }
}

impl ConnectivityDriver for SimWifi {
    fn start(&self) -> Result<(), DriverError> {
        let mut st = self.lock();
        st.started = true;
        if st.link == LinkState::Inactive {
            st.link = LinkState::Disconnected;
        }
        info!("WiFi(sim): station started");
        Ok(())
    }

    fn stop(&self) -> Result<(), DriverError> {
        let mut st = self.lock();
        st.started = false;
        st.link = LinkState::Inactive;
        st.ip.clear();
        st.ssid.clear();
        info!("WiFi(sim): station stopped");
        Ok(())
    }

    fn status(&self) -> Result<DriverStatus, DriverError> {
        let st = self.lock();
        if !st.started {
            return Err(DriverError::Unavailable("station not started".into()));
        }
        Ok(DriverStatus {
            state: st.link,
            ip: st.ip.clone(),
            ssid: st.ssid.to_string(),
            channel: st.channel,
        })
    }

    fn connect(&self, connection: &Connection) -> Result<(), DriverError> {
        let Some(network) = self.in_range.iter().find(|n| n.ssid == connection.ssid()) else {
            return Err(DriverError::Rejected(format!("'{}' not in range", connection.ssid())));
        };
        if network.encryption != connection.encryption() {
            return Err(DriverError::Rejected(format!(
                "'{}' expects {:?} security",
                network.ssid, network.encryption
            )));
        }
        let mut st = self.lock();
        if !st.started {
            return Err(DriverError::Unavailable("station not started".into()));
        }
        st.joins += 1;
        st.ssid = heapless::String::try_from(connection.ssid())
            .map_err(|()| DriverError::Rejected("SSID longer than 32 bytes".into()))?;
        st.ip = format!("192.168.4.{}", 10 + st.joins % 200);
        st.channel = 1 + (st.joins % 11);
        st.link = LinkState::Completed;
        info!("WiFi(sim): associated with '{}' ({})", st.ssid, st.ip);
        drop(st);
        self.edges.broadcast(true);
        Ok(())
    }

    fn scan(&self) -> Result<Receiver<WifiNetwork>, DriverError> {
        if !self.lock().started {
            return Err(DriverError::Unavailable("station not started".into()));
        }
        let (tx, rx) = unbounded();
        for network in &self.in_range {
            let _ = tx.send(network.clone());
        }
        Ok(rx)
    }

    fn subscribe_state(&self) -> Subscription<bool> {
        self.edges.subscribe()
    }
}

/// Lease renewal that only records the request in the log.
pub struct LogIpRenewal;

impl IpRenewal for LogIpRenewal {
    fn renew(&self, ssid: &str) -> Result<(), DriverError> {
        info!("WiFi: renewing DHCP lease on '{}'", ssid);
        Ok(())
    }
}
