//! lnvend — Lightning-payment vending controller, host entry point.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                      Adapters (outer ring)                     │
//! │                                                                │
//! │  GpioMachine      SimWifi          SimNodeFactory   NvsStore   │
//! │  (Machine)        (Connectivity)   (Payment nodes)  (Settings) │
//! │  LocalExposure ×2 NoopUpdater      LogSystemControl            │
//! │                                                                │
//! │  ──────────────── Port Trait Boundary ───────────────────      │
//! │                                                                │
//! │  ┌────────────────────────────────────────────────────────┐    │
//! │  │              DispenserSupervisor                       │    │
//! │  │  machine · network · nodes · gates · decision loop     │    │
//! │  └────────────────────────────────────────────────────────┘    │
//! └────────────────────────────────────────────────────────────────┘
//! ```
#![deny(unused_must_use)]

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};

use lnvend::adapters::exposure::LocalExposure;
use lnvend::adapters::gpio::{GpioMachine, SimPin};
use lnvend::adapters::lightning::SimNodeFactory;
use lnvend::adapters::nvs::NvsStore;
use lnvend::adapters::system::LogSystemControl;
use lnvend::adapters::updater::NoopUpdater;
use lnvend::adapters::wifi::{LogIpRenewal, SimWifi};
use lnvend::app::ports::SettingsStore;
use lnvend::app::service::{Collaborators, DispenserSupervisor};
use lnvend::config::SupervisorConfig;

#[derive(Debug, Parser)]
#[command(name = "lnvend", version, about = "Lightning-payment vending controller")]
struct Args {
    /// JSON supervisor configuration; defaults apply when omitted.
    #[arg(short, long, env = "LNVEND_CONFIG")]
    config: Option<PathBuf>,

    /// Directory holding persisted settings.
    #[arg(short, long, env = "LNVEND_DATA_DIR", default_value = ".lnvend")]
    data_dir: PathBuf,

    /// Stop after this many seconds (runs until killed otherwise).
    #[arg(long)]
    run_secs: Option<u64>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    info!("lnvend v{}", env!("CARGO_PKG_VERSION"));

    // ── Config ────────────────────────────────────────────────
    let config = match &args.config {
        Some(path) => SupervisorConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => {
            info!("Config: no file given, using defaults");
            SupervisorConfig::default()
        }
    };

    // ── Adapters ──────────────────────────────────────────────
    std::fs::create_dir_all(&args.data_dir)
        .with_context(|| format!("creating {}", args.data_dir.display()))?;
    let store: Arc<dyn SettingsStore> = Arc::new(
        NvsStore::open(args.data_dir.join("settings.bin")).context("opening settings store")?,
    );

    let collaborators = Collaborators {
        machine: Arc::new(GpioMachine::new(SimPin::new(), SimPin::new(), SimPin::new())),
        connectivity: Arc::new(SimWifi::with_defaults()),
        ip_renewal: Some(Arc::new(LogIpRenewal)),
        node_factory: Arc::new(SimNodeFactory::new()),
        api_exposure: Arc::new(LocalExposure::new("api", &store).context("api exposure key")?),
        pos_exposure: Arc::new(LocalExposure::new("pos", &store).context("pos exposure key")?),
        store,
        updater: Arc::new(NoopUpdater),
        system: Arc::new(LogSystemControl::new()),
    };

    let supervisor = DispenserSupervisor::new(config, collaborators)?;

    if let Some(secs) = args.run_secs {
        let stopper = supervisor.clone();
        thread::Builder::new()
            .name("lnvend-stopper".into())
            .spawn(move || {
                thread::sleep(Duration::from_secs(secs));
                info!("Run time elapsed, stopping");
                stopper.stop();
            })
            .context("spawning stopper")?;
    }

    // ── Run ───────────────────────────────────────────────────
    if let Err(e) = supervisor.run_and_wait() {
        warn!("Supervisor exited with error: {}", e);
        return Err(e.into());
    }
    info!("Supervisor stopped");
    Ok(())
}
