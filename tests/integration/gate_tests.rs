//! `ServiceGate` start/stop against a hand-fed connectivity stream.

use std::net::TcpListener;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use lnvend::app::ports::ServiceExposure;
use lnvend::error::Error;
use lnvend::gate::ServiceGate;
use lnvend::network::ConnectivityStatus;
use lnvend::pubsub::SubscriptionRegistry;

use crate::mocks::{MockExposure, eventually};

const WAIT: Duration = Duration::from_secs(2);

fn status(connected: bool) -> ConnectivityStatus {
    ConnectivityStatus {
        connected,
        ..ConnectivityStatus::default()
    }
}

fn gate(connected: bool) -> (ServiceGate, Arc<MockExposure>, SubscriptionRegistry<ConnectivityStatus>) {
    let feed = SubscriptionRegistry::new("test-network", 8);
    let exposure = Arc::new(MockExposure::new("svc.mock"));
    let as_port: Arc<dyn ServiceExposure> = exposure.clone();
    let g = ServiceGate::new("api", as_port, feed.subscribe(), connected).unwrap();
    (g, exposure, feed)
}

#[test]
fn duplicate_starts_expose_once() {
    let (g, exposure, feed) = gate(false);
    g.start();
    g.start();
    assert_eq!(exposure.starts(), 0);
    assert!(g.is_requested());

    feed.broadcast(status(true));
    assert!(eventually(WAIT, || g.is_exposed()));
    feed.broadcast(status(true));
    g.start();
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(exposure.starts(), 1);
}

#[test]
fn start_while_connected_exposes_immediately() {
    let (g, exposure, _feed) = gate(true);
    g.start();
    assert!(g.is_exposed());
    assert_eq!(exposure.starts(), 1);
}

#[test]
fn disconnect_withdraws_and_reconnect_restores() {
    let (g, exposure, feed) = gate(true);
    g.start();
    feed.broadcast(status(false));
    assert!(eventually(WAIT, || !g.is_exposed()));
    assert_eq!(exposure.stops(), 1);

    feed.broadcast(status(true));
    assert!(eventually(WAIT, || g.is_exposed()));
    assert_eq!(exposure.starts(), 2);
}

#[test]
fn stop_before_connect_never_exposes() {
    let (g, exposure, feed) = gate(false);
    g.start();
    g.stop();
    feed.broadcast(status(true));
    std::thread::sleep(Duration::from_millis(50));
    assert!(!g.is_exposed());
    assert_eq!(exposure.starts(), 0);
}

#[test]
fn closed_feed_counts_as_disconnected() {
    let (g, _exposure, feed) = gate(true);
    g.start();
    feed.shutdown();
    assert!(eventually(WAIT, || !g.is_exposed()));
    assert!(g.is_requested());
}

#[test]
fn bind_hands_listener_to_exposure() {
    let (g, exposure, _feed) = gate(false);
    g.bind("127.0.0.1:0").unwrap();
    assert!(exposure.has_listener.load(Ordering::SeqCst));
    assert_eq!(g.id(), "svc.mock");
    assert_eq!(g.name(), "api");
}

#[test]
fn bind_failure_is_a_startup_error() {
    let taken = TcpListener::bind("127.0.0.1:0").unwrap();
    let (g, _exposure, _feed) = gate(false);
    let err = g.bind(taken.local_addr().unwrap()).unwrap_err();
    assert!(matches!(err, Error::Startup { surface: "api", .. }), "got {err}");
}

#[test]
fn shutdown_is_idempotent() {
    let (g, exposure, _feed) = gate(true);
    g.start();
    g.shutdown(WAIT);
    g.shutdown(WAIT);
    assert!(!g.is_exposed());
    assert_eq!(exposure.stops(), 1);
}
