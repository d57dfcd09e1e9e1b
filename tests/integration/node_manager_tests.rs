//! `NodeManager` against the in-memory store and the mock node factory.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use lnvend::adapters::nvs::NvsStore;
use lnvend::app::commands::{NodeBackend, NodeConfig, NodeRecord};
use lnvend::app::events::NodeStatus;
use lnvend::app::lifecycle::ShutdownSignal;
use lnvend::app::ports::SettingsStore;
use lnvend::config::SupervisorConfig;
use lnvend::error::Error;
use lnvend::nodes::{NodeKind, NodeManager};

use crate::mocks::{MockNodeFactory, eventually, test_config};

struct Fixture {
    store: Arc<NvsStore>,
    factory: Arc<MockNodeFactory>,
    manager: NodeManager,
}

fn fixture() -> Fixture {
    let store = Arc::new(NvsStore::in_memory());
    let factory = Arc::new(MockNodeFactory::default());
    let manager = NodeManager::new(store.clone(), factory.clone(), &test_config());
    Fixture {
        store,
        factory,
        manager,
    }
}

fn local(name: &str) -> NodeConfig {
    NodeConfig::Local { name: name.into() }
}

fn record(id: &str, enabled: bool) -> NodeRecord {
    NodeRecord {
        id: id.into(),
        name: format!("node-{id}"),
        enabled,
        backend: NodeBackend::Remote {
            uri: "10.0.0.2:10009".into(),
            cert: String::new(),
            macaroon: String::new(),
        },
    }
}

// ── AddNode ───────────────────────────────────────────────────

#[test]
fn add_local_node_is_disabled_with_fresh_id() {
    let f = fixture();
    let before = f.manager.get_nodes().len();

    let a = f.manager.add_node(local("Local")).unwrap();
    assert!(!a.enabled());
    assert!(!a.id.is_empty());
    assert_eq!(a.name, "Local");
    assert_eq!(a.kind, NodeKind::Local);
    assert_eq!(f.manager.get_nodes().len(), before + 1);

    let b = f.manager.add_node(local("Local")).unwrap();
    assert_ne!(a.id, b.id);
    assert_eq!(f.store.nodes().unwrap().len(), 2);
}

#[test]
fn ids_never_repeat() {
    let f = fixture();
    let ids: HashSet<_> = (0..20)
        .map(|i| f.manager.add_node(local(&format!("n{i}"))).unwrap().id)
        .collect();
    assert_eq!(ids.len(), 20);
}

#[test]
fn add_rejects_invalid_config() {
    let f = fixture();
    assert!(matches!(f.manager.add_node(local("  ")), Err(Error::Invalid(_))));
    let remote = NodeConfig::RemoteLnd {
        name: "shop".into(),
        uri: String::new(),
        cert: String::new(),
        macaroon: String::new(),
    };
    assert!(f.manager.add_node(remote).is_err());
    assert!(f.manager.get_nodes().is_empty());
}

#[test]
fn add_rolls_back_store_when_driver_fails() {
    let f = fixture();
    f.factory.fail_create.store(true, Ordering::SeqCst);
    assert!(matches!(
        f.manager.add_node(local("Local")),
        Err(Error::Driver { op: "add_node", .. })
    ));
    assert!(f.store.nodes().unwrap().is_empty());
    assert!(f.manager.get_nodes().is_empty());
}

// ── Enable / disable ──────────────────────────────────────────

#[test]
fn enable_failure_leaves_node_disabled() {
    let f = fixture();
    f.factory.fail_start.store(true, Ordering::SeqCst);
    let node = f.manager.add_node(local("Local")).unwrap();

    assert!(f.manager.enable_node(&node.id).is_err());
    assert!(!f.manager.get_node(&node.id).unwrap().enabled());
    assert!(!f.store.node(&node.id).unwrap().unwrap().enabled);
    assert_eq!(f.manager.running_count(), 0);
}

#[test]
fn enable_persists_and_is_idempotent() {
    let f = fixture();
    let node = f.manager.add_node(local("Local")).unwrap();

    f.manager.enable_node(&node.id).unwrap();
    f.manager.enable_node(&node.id).unwrap();
    let got = f.manager.get_node(&node.id).unwrap();
    assert!(got.enabled());
    assert_eq!(got.status, NodeStatus::Started);
    assert!(f.store.node(&node.id).unwrap().unwrap().enabled);
    assert_eq!(f.factory.node(&node.id).starts.load(Ordering::SeqCst), 1);
}

#[test]
fn disable_stops_and_persists() {
    let f = fixture();
    let node = f.manager.add_node(local("Local")).unwrap();
    f.manager.enable_node(&node.id).unwrap();

    f.manager.disable_node(&node.id).unwrap();
    assert!(!f.manager.get_node(&node.id).unwrap().enabled());
    assert!(!f.store.node(&node.id).unwrap().unwrap().enabled);
    assert_eq!(f.factory.node(&node.id).stops.load(Ordering::SeqCst), 1);
    assert_eq!(f.manager.running_count(), 0);
}

#[test]
fn unknown_id_is_not_found() {
    let f = fixture();
    assert!(matches!(f.manager.get_node("nope"), Err(Error::NotFound { .. })));
    assert!(matches!(f.manager.enable_node("nope"), Err(Error::NotFound { .. })));
    assert!(matches!(f.manager.remove_node("nope"), Err(Error::NotFound { .. })));
}

// ── Remove / rename ───────────────────────────────────────────

#[test]
fn remove_stops_and_forgets() {
    let f = fixture();
    let node = f.manager.add_node(local("Local")).unwrap();
    f.manager.enable_node(&node.id).unwrap();

    f.manager.remove_node(&node.id).unwrap();
    assert!(f.manager.get_nodes().is_empty());
    assert_eq!(f.store.node(&node.id).unwrap(), None);
    assert_eq!(f.factory.node(&node.id).stops.load(Ordering::SeqCst), 1);
}

#[test]
fn rename_validates_and_persists() {
    let f = fixture();
    let node = f.manager.add_node(local("Local")).unwrap();
    assert!(f.manager.rename_node(&node.id, "").is_err());
    f.manager.rename_node(&node.id, "Till 2").unwrap();
    assert_eq!(f.manager.get_node(&node.id).unwrap().name, "Till 2");
    assert_eq!(f.store.node(&node.id).unwrap().unwrap().name, "Till 2");
}

// ── Load / start_enabled ──────────────────────────────────────

#[test]
fn load_then_start_enabled_only() {
    let f = fixture();
    f.store.put_node(&record("a", true)).unwrap();
    f.store.put_node(&record("b", false)).unwrap();

    assert_eq!(f.manager.load().unwrap(), 2);
    assert_eq!(f.manager.load().unwrap(), 0, "second load adds nothing");

    let done = ShutdownSignal::new();
    assert_eq!(f.manager.start_enabled(&done), 1);
    assert_eq!(f.factory.node("a").starts.load(Ordering::SeqCst), 1);
    assert_eq!(f.factory.node("b").starts.load(Ordering::SeqCst), 0);

    // Already running nodes are left alone.
    assert_eq!(f.manager.start_enabled(&done), 1);
    assert_eq!(f.factory.node("a").starts.load(Ordering::SeqCst), 1);

    f.manager.stop_all();
    assert_eq!(f.manager.running_count(), 0);
    assert!(f.store.node("a").unwrap().unwrap().enabled, "stop_all keeps flags");
}

#[test]
fn failing_node_is_retried_once() {
    let f = fixture();
    f.factory.fail_start.store(true, Ordering::SeqCst);
    f.store.put_node(&record("a", true)).unwrap();
    f.manager.load().unwrap();

    assert_eq!(f.manager.start_enabled(&ShutdownSignal::new()), 0);
    assert_eq!(f.factory.node("a").starts.load(Ordering::SeqCst), 2);
}

#[test]
fn shutdown_cuts_retry_backoff_short() {
    let f = fixture();
    f.factory.fail_start.store(true, Ordering::SeqCst);
    f.store.put_node(&record("a", true)).unwrap();
    f.manager.load().unwrap();

    let done = ShutdownSignal::new();
    done.fire();
    assert_eq!(f.manager.start_enabled(&done), 0);
    assert_eq!(f.factory.node("a").starts.load(Ordering::SeqCst), 1);
}

fn slow_retry_fixture(backoff_ms: u64) -> Fixture {
    let store = Arc::new(NvsStore::in_memory());
    let factory = Arc::new(MockNodeFactory::default());
    factory.fail_start.store(true, Ordering::SeqCst);
    let config = SupervisorConfig {
        node_start_attempts: 2,
        node_start_backoff_ms: backoff_ms,
        ..test_config()
    };
    let manager = NodeManager::new(store.clone(), factory.clone(), &config);
    store.put_node(&record("a", true)).unwrap();
    manager.load().unwrap();
    Fixture {
        store,
        factory,
        manager,
    }
}

#[test]
fn queries_do_not_wait_on_start_backoff() {
    let f = slow_retry_fixture(800);
    let done = ShutdownSignal::new();
    std::thread::scope(|s| {
        let boot = s.spawn(|| f.manager.start_enabled(&done));
        assert!(eventually(Duration::from_secs(2), || {
            f.factory.node("a").starts.load(Ordering::SeqCst) == 1
        }));

        let t0 = Instant::now();
        assert_eq!(f.manager.get_nodes().len(), 1);
        assert!(f.manager.get_node("a").is_ok());
        assert!(t0.elapsed() < Duration::from_millis(200), "blocked {:?}", t0.elapsed());

        assert!(matches!(f.manager.enable_node("a"), Err(Error::Invalid(_))));
        done.fire();
        assert_eq!(boot.join().unwrap(), 0);
    });
}

#[test]
fn disable_during_backoff_cancels_retry() {
    let f = slow_retry_fixture(300);
    let done = ShutdownSignal::new();
    std::thread::scope(|s| {
        let boot = s.spawn(|| f.manager.start_enabled(&done));
        assert!(eventually(Duration::from_secs(2), || {
            f.factory.node("a").starts.load(Ordering::SeqCst) == 1
        }));
        f.manager.disable_node("a").unwrap();
        assert_eq!(boot.join().unwrap(), 0);
    });
    assert_eq!(f.factory.node("a").starts.load(Ordering::SeqCst), 1);
    assert!(!f.store.node("a").unwrap().unwrap().enabled);
}

// ── Settled fan-out ───────────────────────────────────────────

#[test]
fn only_settled_invoices_are_forwarded() {
    let f = fixture();
    let node = f.manager.add_node(local("Local")).unwrap();
    f.manager.enable_node(&node.id).unwrap();
    let settled = f.manager.subscribe_settled();

    let driver = f.factory.node(&node.id);
    driver.emit("01", false);
    driver.emit("02", true);
    let got = settled.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(got.r_hash, "02");
    assert!(got.settled);
    assert!(settled.recv_timeout(Duration::from_millis(100)).is_err());

    f.manager.shutdown_subscribers();
    assert_eq!(settled.recv(), None);
}

#[test]
fn passthroughs_reach_driver() {
    let f = fixture();
    let node = f.manager.add_node(local("Local")).unwrap();
    assert_eq!(f.manager.generate_seed(&node.id).unwrap().len(), 24);
    f.manager.unlock_node(&node.id, "pw").unwrap();
    let invoice = f
        .manager
        .add_invoice(
            &node.id,
            &lnvend::app::events::InvoiceRequest {
                msat: 2500,
                memo: "gum".into(),
            },
        )
        .unwrap();
    assert_eq!(invoice.msat, 2500);
    assert!(f.manager.get_invoice(&node.id, "ff").is_err());
    assert_eq!(f.manager.node_status(&node.id).unwrap(), NodeStatus::Stopped);
}
