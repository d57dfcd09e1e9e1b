//! Host stand-in for OS power control.

use std::sync::atomic::{AtomicU32, Ordering};

use log::warn;

use crate::app::ports::SystemControl;
use crate::error::DriverError;

/// Logs reboot/poweroff requests instead of acting on them.
#[derive(Debug, Default)]
pub struct LogSystemControl {
    reboots: AtomicU32,
    poweroffs: AtomicU32,
}

impl LogSystemControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reboots(&self) -> u32 {
        self.reboots.load(Ordering::Relaxed)
    }

    pub fn poweroffs(&self) -> u32 {
        self.poweroffs.load(Ordering::Relaxed)
    }
}

impl SystemControl for LogSystemControl {
    fn reboot(&self) -> Result<(), DriverError> {
        self.reboots.fetch_add(1, Ordering::Relaxed);
        warn!("System: reboot requested");
        Ok(())
    }

    fn poweroff(&self) -> Result<(), DriverError> {
        self.poweroffs.fetch_add(1, Ordering::Relaxed);
        warn!("System: poweroff requested");
        Ok(())
    }
}
