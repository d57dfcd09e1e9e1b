//! End-to-end tests of `DispenserSupervisor` over the recording mocks.

use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::RecvTimeoutError;

use lnvend::app::commands::{Connection, NodeConfig};
use lnvend::app::events::{DispenseState, SupervisorState};
use lnvend::app::ports::{LinkState, SettingsStore};
use lnvend::app::service::{DEFAULT_NAME, DispenserSupervisor};
use lnvend::error::{Error, Result};
use lnvend::pubsub::Subscription;

use crate::mocks::{Harness, MachineCall, eventually, test_config};

const WAIT: Duration = Duration::from_secs(3);

fn launch(sup: &DispenserSupervisor) -> JoinHandle<Result<()>> {
    let s = sup.clone();
    let handle = thread::spawn(move || s.run_and_wait());
    assert!(
        eventually(WAIT, || sup.state() == SupervisorState::Started),
        "supervisor never reached Started"
    );
    handle
}

fn finish(sup: &DispenserSupervisor, handle: JoinHandle<Result<()>>) {
    sup.stop();
    assert!(sup.wait_stopped(WAIT), "supervisor did not stop in time");
    handle.join().unwrap().unwrap();
}

/// Drain pending values and require the channel to be closed.
fn assert_closed<T>(sub: &Subscription<T>) {
    loop {
        match sub.recv_timeout(Duration::from_secs(1)) {
            Ok(_) => continue,
            Err(RecvTimeoutError::Disconnected) => return,
            Err(RecvTimeoutError::Timeout) => panic!("subscription {} still open", sub.id()),
        }
    }
}

// ── Dispense actuation ────────────────────────────────────────

#[test]
fn toggle_without_buzz_leaves_buzzer_alone_on_start() {
    let h = Harness::new();
    let sup = h.supervisor(test_config());
    assert!(!sup.buzz_on_dispense());

    sup.toggle_dispense(true);
    assert_eq!(h.machine.calls(), vec![MachineCall::Motor(true)]);

    h.machine.clear();
    sup.toggle_dispense(false);
    assert_eq!(
        h.machine.calls(),
        vec![MachineCall::Buzzer(false), MachineCall::Motor(false)]
    );
}

#[test]
fn toggle_with_buzz_drives_both() {
    let h = Harness::new();
    let sup = h.supervisor(test_config());
    sup.set_buzz_on_dispense(true).unwrap();

    sup.toggle_dispense(true);
    assert_eq!(
        h.machine.calls(),
        vec![MachineCall::Buzzer(true), MachineCall::Motor(true)]
    );
    assert_eq!(h.store.buzz_on_dispense().unwrap(), Some(true));
}

#[test]
fn toggle_publishes_while_stopped() {
    let h = Harness::new();
    let sup = h.supervisor(test_config());
    let sub = sup.subscribe_dispenses();
    sup.toggle_dispense(true);
    sup.toggle_dispense(false);
    assert_eq!(sub.try_recv(), Some(DispenseState::On));
    assert_eq!(sub.try_recv(), Some(DispenseState::Off));
}

#[test]
fn touch_begin_then_end_dispenses_on_then_off() {
    let h = Harness::new();
    let sup = h.supervisor(test_config());
    let dispenses = sup.subscribe_dispenses();
    let run = launch(&sup);

    h.machine.touch(true);
    h.machine.touch(false);
    assert_eq!(dispenses.recv_timeout(WAIT).ok(), Some(DispenseState::On));
    assert_eq!(dispenses.recv_timeout(WAIT).ok(), Some(DispenseState::Off));

    finish(&sup, run);
    assert_eq!(dispenses.recv(), None, "no dispense beyond [On, Off]");
}

#[test]
fn touch_ignored_when_dispense_on_touch_disabled() {
    let h = Harness::new();
    let sup = h.supervisor(test_config());
    sup.set_dispense_on_touch(false).unwrap();
    let dispenses = sup.subscribe_dispenses();
    let run = launch(&sup);

    h.machine.touch(true);
    // A touch still settles the machine to "off".
    assert_eq!(dispenses.recv_timeout(WAIT).ok(), Some(DispenseState::Off));
    assert!(!h.machine.calls().contains(&MachineCall::Motor(true)));

    finish(&sup, run);
}

#[test]
fn settled_invoice_dispenses_one_pulse() {
    let h = Harness::new();
    let sup = h.supervisor(test_config());
    let node = sup.add_node(NodeConfig::Local { name: "Local".into() }).unwrap();
    sup.enable_node(&node.id).unwrap();
    let dispenses = sup.subscribe_dispenses();
    let run = launch(&sup);

    let driver = h.factory.node(&node.id);
    driver.emit("aa", false);
    driver.emit("aa", true);
    assert_eq!(dispenses.recv_timeout(WAIT).ok(), Some(DispenseState::On));
    assert_eq!(dispenses.recv_timeout(WAIT).ok(), Some(DispenseState::Off));
    assert_eq!(dispenses.recv_timeout(Duration::from_millis(200)).ok(), None);

    finish(&sup, run);
}

#[test]
fn concurrent_toggles_publish_in_motor_order() {
    let h = Harness::new();
    let sup = h.supervisor(lnvend::config::SupervisorConfig {
        subscriber_depth: 1024,
        ..test_config()
    });
    let dispenses = sup.subscribe_dispenses();

    thread::scope(|s| {
        for offset in 0..2 {
            let sup = &sup;
            s.spawn(move || {
                for i in 0..200 {
                    sup.toggle_dispense((i + offset) % 2 == 0);
                }
            });
        }
    });

    let motor: Vec<_> = h
        .machine
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            MachineCall::Motor(on) => Some(DispenseState::from(on)),
            _ => None,
        })
        .collect();
    let published: Vec<_> = std::iter::from_fn(|| dispenses.try_recv()).collect();
    assert_eq!(motor.len(), 400);
    assert_eq!(published, motor);
}

#[test]
fn invoices_still_dispense_after_touch_source_closes() {
    let h = Harness::new();
    let sup = h.supervisor(test_config());
    let node = sup.add_node(NodeConfig::Local { name: "Local".into() }).unwrap();
    sup.enable_node(&node.id).unwrap();
    let dispenses = sup.subscribe_dispenses();
    let run = launch(&sup);

    h.machine.close_touches();
    thread::sleep(Duration::from_millis(100));
    assert_eq!(sup.state(), SupervisorState::Started);

    h.factory.node(&node.id).emit("bb", true);
    assert_eq!(dispenses.recv_timeout(WAIT).ok(), Some(DispenseState::On));
    assert_eq!(dispenses.recv_timeout(WAIT).ok(), Some(DispenseState::Off));

    finish(&sup, run);
}

// ── Lifecycle ─────────────────────────────────────────────────

#[test]
fn state_walks_full_cycle_and_closes() {
    let h = Harness::new();
    let sup = h.supervisor(test_config());
    let states = sup.subscribe_state();
    assert_eq!(sup.state(), SupervisorState::Stopped);

    let run = launch(&sup);
    finish(&sup, run);

    let seen: Vec<_> = states.iter().collect();
    assert_eq!(
        seen,
        vec![
            SupervisorState::Starting,
            SupervisorState::Started,
            SupervisorState::Stopping,
            SupervisorState::Stopped,
        ]
    );
}

#[test]
fn stop_closes_every_subscriber_in_bounded_time() {
    let h = Harness::new();
    let sup = h.supervisor(test_config());
    let run = launch(&sup);

    let dispenses = sup.subscribe_dispenses();
    let network = sup.subscribe_network();
    let states = sup.subscribe_state();

    let stopper = sup.clone();
    let started = std::time::Instant::now();
    thread::spawn(move || stopper.stop());
    assert!(sup.wait_stopped(WAIT));
    run.join().unwrap().unwrap();
    assert!(started.elapsed() < WAIT);

    assert_closed(&dispenses);
    assert_closed(&network);
    assert_closed(&states);
    assert_eq!(h.machine.calls().last(), Some(&MachineCall::Stop));
}

#[test]
fn stop_is_idempotent() {
    let h = Harness::new();
    let sup = h.supervisor(test_config());
    sup.stop();
    let run = launch(&sup);
    sup.stop();
    sup.stop();
    finish(&sup, run);
    sup.stop();
    assert_eq!(sup.state(), SupervisorState::Stopped);
}

#[test]
fn second_run_while_running_is_rejected() {
    let h = Harness::new();
    let sup = h.supervisor(test_config());
    let run = launch(&sup);
    assert!(matches!(sup.run_and_wait(), Err(Error::AlreadyRunning)));
    finish(&sup, run);
}

#[test]
fn restart_after_stop() {
    let h = Harness::new();
    let sup = h.supervisor(test_config());
    let run = launch(&sup);
    finish(&sup, run);

    let dispenses = sup.subscribe_dispenses();
    let run = launch(&sup);
    h.machine.touch(true);
    assert_eq!(dispenses.recv_timeout(WAIT).ok(), Some(DispenseState::On));
    finish(&sup, run);
}

#[test]
fn machine_failure_aborts_startup_cleanly() {
    let h = Harness::new();
    h.machine.fail_start.store(true, std::sync::atomic::Ordering::SeqCst);
    let sup = h.supervisor(test_config());

    let err = sup.run_and_wait().unwrap_err();
    assert!(matches!(err, Error::Driver { op: "machine_start", .. }), "got {err}");
    assert_eq!(sup.state(), SupervisorState::Stopped);
    assert_eq!(h.api.starts(), 0);
    assert!(!h.machine.calls().contains(&MachineCall::Noise));
}

#[test]
fn bind_failure_aborts_startup() {
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let h = Harness::new();
    let sup = h.supervisor(lnvend::config::SupervisorConfig {
        api_listen: taken.local_addr().unwrap().to_string(),
        ..test_config()
    });

    let err = sup.run_and_wait().unwrap_err();
    assert!(matches!(err, Error::Startup { surface: "api", .. }), "got {err}");
    assert_eq!(sup.state(), SupervisorState::Stopped);
    let calls = h.machine.calls();
    assert_eq!(calls.first(), Some(&MachineCall::Start));
    assert_eq!(calls.last(), Some(&MachineCall::Stop));
    assert!(!calls.contains(&MachineCall::Noise));
    assert_eq!(h.api.starts(), 0);
}

#[test]
fn network_failure_is_not_fatal() {
    let h = Harness::new();
    h.wifi.fail_start.store(true, std::sync::atomic::Ordering::SeqCst);
    let sup = h.supervisor(test_config());
    let run = launch(&sup);
    assert!(!sup.network_status().connected);
    finish(&sup, run);
}

#[test]
fn diagnostic_noise_after_start() {
    let h = Harness::new();
    let sup = h.supervisor(test_config());
    let run = launch(&sup);
    assert!(eventually(WAIT, || h.machine.calls().contains(&MachineCall::Noise)));
    finish(&sup, run);
}

#[test]
fn reboot_stops_then_reboots() {
    let h = Harness::new();
    let sup = h.supervisor(test_config());
    let run = launch(&sup);
    sup.reboot().unwrap();
    assert_eq!(sup.state(), SupervisorState::Stopped);
    assert_eq!(h.system.reboots(), 1);
    run.join().unwrap().unwrap();
}

// ── Gates and network ─────────────────────────────────────────

#[test]
fn gates_follow_connectivity() {
    let h = Harness::new();
    let sup = h.supervisor(test_config());
    let run = launch(&sup);
    assert!(h.api.has_listener.load(std::sync::atomic::Ordering::SeqCst));
    assert_eq!(h.api.starts(), 0);

    h.wifi.link(LinkState::Completed, "10.0.0.5", "homeNet");
    assert!(eventually(WAIT, || h.api.starts() == 1 && h.pos.starts() == 1));

    h.wifi.link(LinkState::Disconnected, "", "");
    assert!(eventually(WAIT, || h.api.stops() >= 1 && h.pos.stops() >= 1));

    finish(&sup, run);
    assert_eq!(h.api.starts(), 1);
    assert_eq!(sup.api_service_id(), "api.mock");
    assert_eq!(sup.pos_service_id(), "pos.mock");
}

#[test]
fn connect_wifi_persists_only_on_success() {
    let h = Harness::new();
    let sup = h.supervisor(test_config());
    let cafe = Connection::Open { ssid: "cafe".into() };

    h.wifi.fail_connect.store(true, std::sync::atomic::Ordering::SeqCst);
    assert!(sup.connect_wifi(&cafe).is_err());
    assert_eq!(h.store.wifi().unwrap(), None);

    h.wifi.fail_connect.store(false, std::sync::atomic::Ordering::SeqCst);
    sup.connect_wifi(&cafe).unwrap();
    assert_eq!(h.store.wifi().unwrap(), Some(cafe));
    assert!(sup.network_status().connected);
}

#[test]
fn invalid_connection_never_reaches_driver() {
    let h = Harness::new();
    let sup = h.supervisor(test_config());
    let bad = Connection::Personal {
        ssid: "homeNet".into(),
        psk: "short".into(),
    };
    assert!(matches!(sup.connect_wifi(&bad), Err(Error::Invalid(_))));
    assert!(h.wifi.connects.lock().unwrap().is_empty());
}

#[test]
fn saved_wifi_is_rejoined_on_start() {
    let h = Harness::new();
    let home = Connection::Personal {
        ssid: "homeNet".into(),
        psk: "correct horse".into(),
    };
    h.store.set_wifi(&home).unwrap();
    let sup = h.supervisor(test_config());
    let run = launch(&sup);
    assert!(eventually(WAIT, || h.wifi.connects.lock().unwrap().len() == 1));
    assert!(eventually(WAIT, || sup.network_status().connected));
    finish(&sup, run);
}

// ── Settings ──────────────────────────────────────────────────

#[test]
fn settings_restored_on_start() {
    let h = Harness::new();
    h.store.set_name("Candy Corner").unwrap();
    h.store.set_dispense_on_touch(false).unwrap();
    let sup = h.supervisor(test_config());
    assert_eq!(sup.name(), DEFAULT_NAME);

    let run = launch(&sup);
    assert_eq!(sup.name(), "Candy Corner");
    assert!(!sup.dispense_on_touch());
    finish(&sup, run);
}

#[test]
fn set_name_validates_and_persists() {
    let h = Harness::new();
    let sup = h.supervisor(test_config());
    assert!(matches!(sup.set_name("   "), Err(Error::Invalid(_))));
    assert!(sup.set_name(&"x".repeat(65)).is_err());
    assert_eq!(sup.name(), DEFAULT_NAME);

    sup.set_name("Lobby").unwrap();
    assert_eq!(sup.name(), "Lobby");
    assert_eq!(h.store.name().unwrap().as_deref(), Some("Lobby"));
}

#[test]
fn updates_report_unavailable_backend() {
    let h = Harness::new();
    let sup = h.supervisor(test_config());
    assert!(matches!(sup.start_update("http://fw"), Err(Error::Driver { .. })));
    assert_eq!(sup.current_update().unwrap(), None);
    assert_eq!(h.store.current_update().unwrap(), None);
}

#[test]
fn invalid_config_rejected() {
    let h = Harness::new();
    let mut config = test_config();
    config.subscriber_depth = 0;
    let store: std::sync::Arc<dyn SettingsStore> = h.store.clone();
    let result = DispenserSupervisor::new(
        config,
        lnvend::app::service::Collaborators {
            machine: h.machine.clone(),
            connectivity: h.wifi.clone(),
            ip_renewal: None,
            node_factory: h.factory.clone(),
            store,
            api_exposure: h.api.clone(),
            pos_exposure: h.pos.clone(),
            updater: std::sync::Arc::new(lnvend::adapters::updater::NoopUpdater),
            system: h.system.clone(),
        },
    );
    assert!(matches!(result, Err(Error::Invalid(_))));
}
