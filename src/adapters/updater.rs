//! Update manager for builds without an OTA backend.

use crate::app::events::Update;
use crate::app::ports::UpdateManager;
use crate::error::DriverError;
use crate::pubsub::Subscription;

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopUpdater;

fn unavailable() -> DriverError {
    DriverError::Unavailable("no updater available".into())
}

impl UpdateManager for NoopUpdater {
    fn start_update(&self, _url: &str) -> Result<Update, DriverError> {
        Err(unavailable())
    }

    fn get_update(&self, _id: &str) -> Result<Update, DriverError> {
        Err(unavailable())
    }

    fn current_update(&self) -> Result<Option<Update>, DriverError> {
        Ok(None)
    }

    fn cancel_update(&self, _id: &str) -> Result<(), DriverError> {
        Err(unavailable())
    }

    fn commit_update(&self, _id: &str) -> Result<(), DriverError> {
        Err(unavailable())
    }

    fn reject_update(&self, _id: &str) -> Result<(), DriverError> {
        Err(unavailable())
    }

    fn subscribe_update(&self, _id: &str) -> Result<Subscription<Update>, DriverError> {
        Err(unavailable())
    }
}
