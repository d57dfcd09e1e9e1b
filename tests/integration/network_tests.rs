//! `NetworkMonitor` fan-out, filtering and the IP-renewal hook.

use std::sync::Arc;
use std::time::Duration;

use lnvend::app::commands::Connection;
use lnvend::app::ports::{IpRenewal, LinkState};
use lnvend::error::Error;
use lnvend::network::{ConnectivityStatus, NetworkMonitor, StatusPolicy};

use crate::mocks::{MockConnectivity, MockRenewal, eventually};

fn policy(skip_transitional: bool) -> StatusPolicy {
    StatusPolicy {
        skip_transitional,
        renew_ip_on_ssid_change: true,
        poll_interval: Duration::from_millis(50),
    }
}

fn monitor(skip_transitional: bool) -> (NetworkMonitor, Arc<MockConnectivity>, Arc<MockRenewal>) {
    let wifi = Arc::new(MockConnectivity::new());
    let renewal = Arc::new(MockRenewal::default());
    let hook: Arc<dyn IpRenewal> = renewal.clone();
    let m = NetworkMonitor::new(wifi.clone(), Some(hook), policy(skip_transitional), 8);
    (m, wifi, renewal)
}

#[test]
fn cancelled_subscriber_stops_receiving() {
    let (m, wifi, _) = monitor(true);
    let a = m.subscribe();
    let b = m.subscribe();
    assert_eq!(a.id(), 0);
    assert_eq!(b.id(), 1);

    wifi.set(LinkState::Completed, "10.0.0.5", "homeNet");
    m.refresh();
    let up = ConnectivityStatus {
        connected: true,
        ip: "10.0.0.5".into(),
        ssid: "homeNet".into(),
        channel: 6,
    };
    assert_eq!(a.try_recv(), Some(up.clone()));
    assert_eq!(b.try_recv(), Some(up));

    a.cancel();
    wifi.set(LinkState::Disconnected, "", "");
    m.refresh();
    let got = b.try_recv().unwrap();
    assert!(!got.connected);
    assert!(got.ip.is_empty() && got.ssid.is_empty());
    assert_eq!(a.try_recv(), None);
}

#[test]
fn unchanged_status_is_published_once() {
    let (m, wifi, _) = monitor(true);
    let sub = m.subscribe();
    wifi.set(LinkState::Completed, "10.0.0.5", "homeNet");
    m.refresh();
    m.refresh();
    m.refresh();
    assert!(sub.try_recv().is_some());
    assert_eq!(sub.try_recv(), None);
}

#[test]
fn status_tracks_channel_without_publishing() {
    let (m, wifi, _) = monitor(true);
    let sub = m.subscribe();
    wifi.set(LinkState::Completed, "10.0.0.5", "homeNet");
    m.refresh();
    assert_eq!(m.status().channel, 6);
    assert!(sub.try_recv().is_some());

    wifi.set_channel(11);
    m.refresh();
    assert_eq!(m.status().channel, 11);
    assert_eq!(sub.try_recv(), None, "channel alone is not a change");

    // The diff still runs against what subscribers last saw.
    wifi.set(LinkState::Completed, "10.0.0.9", "homeNet");
    m.refresh();
    assert_eq!(sub.try_recv().map(|s| s.ip), Some("10.0.0.9".to_string()));
}

#[test]
fn transitional_states_are_held_back_when_configured() {
    let (m, wifi, _) = monitor(true);
    let sub = m.subscribe();
    wifi.set(LinkState::Authenticating, "", "homeNet");
    m.refresh();
    assert_eq!(sub.try_recv(), None);

    let (m, wifi, _) = monitor(false);
    let sub = m.subscribe();
    wifi.set(LinkState::Authenticating, "", "homeNet");
    m.refresh();
    assert_eq!(sub.try_recv().map(|s| s.connected), Some(false));
}

#[test]
fn ssid_change_triggers_renewal_after_publish() {
    let (m, wifi, renewal) = monitor(true);
    wifi.set(LinkState::Completed, "10.0.0.5", "homeNet");
    m.refresh();
    wifi.set(LinkState::Completed, "10.0.0.5", "cafe");
    m.refresh();
    // IP-only change does not renew.
    wifi.set(LinkState::Completed, "10.0.0.9", "cafe");
    m.refresh();
    assert_eq!(*renewal.renewed.lock().unwrap(), vec!["homeNet", "cafe"]);
}

#[test]
fn renewal_can_be_disabled() {
    let wifi = Arc::new(MockConnectivity::new());
    let renewal = Arc::new(MockRenewal::default());
    let hook: Arc<dyn IpRenewal> = renewal.clone();
    let m = NetworkMonitor::new(
        wifi.clone(),
        Some(hook),
        StatusPolicy {
            renew_ip_on_ssid_change: false,
            ..policy(true)
        },
        8,
    );
    wifi.set(LinkState::Completed, "10.0.0.5", "homeNet");
    m.refresh();
    assert!(renewal.renewed.lock().unwrap().is_empty());
}

#[test]
fn poller_publishes_driver_edges() {
    let (m, wifi, _) = monitor(true);
    let sub = m.subscribe();
    m.start().unwrap();
    m.start().unwrap();
    assert!(m.is_running());
    assert_eq!(
        sub.recv_timeout(Duration::from_secs(1)).map(|s| s.connected).ok(),
        Some(false)
    );

    wifi.link(LinkState::Completed, "10.0.0.5", "homeNet");
    assert_eq!(
        sub.recv_timeout(Duration::from_secs(1)).map(|s| s.connected).ok(),
        Some(true)
    );
    m.stop();
    m.stop();
    assert!(!m.is_running());
}

#[test]
fn poller_notices_changes_without_edges() {
    let (m, wifi, _) = monitor(true);
    m.start().unwrap();
    wifi.set(LinkState::Completed, "10.0.0.5", "homeNet");
    assert!(eventually(Duration::from_secs(2), || m.status().connected));
    m.stop();
}

#[test]
fn connect_validates_before_driver() {
    let (m, wifi, _) = monitor(true);
    let bad = Connection::Open { ssid: String::new() };
    assert!(matches!(m.connect(&bad), Err(Error::Invalid(_))));
    assert!(wifi.connects.lock().unwrap().is_empty());

    m.connect(&Connection::Open { ssid: "cafe".into() }).unwrap();
    assert!(m.status().connected);
    assert_eq!(m.status().ssid, "cafe");
}

#[test]
fn shutdown_closes_subscribers() {
    let (m, _, _) = monitor(true);
    let sub = m.subscribe();
    m.shutdown_subscribers();
    assert_eq!(sub.recv(), None);
}
