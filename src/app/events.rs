//! Outbound values published by the supervisor and its subsystems.
//!
//! These travel through [`SubscriptionRegistry`](crate::pubsub::SubscriptionRegistry)
//! fan-outs or are returned from API operations.  No wire format is
//! implied; the serde derives exist so an API adapter can pick one.

use core::fmt;

use serde::{Deserialize, Serialize};

// ───────────────────────────────────────────────────────────────
// Dispense
// ───────────────────────────────────────────────────────────────

/// Motor actuation state, driven only by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DispenseState {
    On,
    Off,
}

impl From<bool> for DispenseState {
    fn from(on: bool) -> Self {
        if on { Self::On } else { Self::Off }
    }
}

// ───────────────────────────────────────────────────────────────
// Supervisor lifecycle
// ───────────────────────────────────────────────────────────────

/// Top-level daemon phase.  Ordered: transitions only move forward,
/// except `Stopped → Starting` on a full restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SupervisorState {
    Starting,
    Started,
    Stopping,
    Stopped,
}

impl SupervisorState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Started => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        }
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_advance_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Stopped, Self::Starting)
                | (Self::Starting, Self::Started)
                | (Self::Starting, Self::Stopping)
                | (Self::Started, Self::Stopping)
                | (Self::Stopping, Self::Stopped)
        )
    }
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ───────────────────────────────────────────────────────────────
// Payments
// ───────────────────────────────────────────────────────────────

/// A payment observed from a node.  Forwarded once, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invoice {
    /// Hex-encoded payment hash.
    pub r_hash: String,
    pub payment_request: String,
    pub settled: bool,
    pub msat: u64,
    pub memo: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceRequest {
    pub msat: u64,
    pub memo: String,
}

/// Connection status reported by a payment node driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    Stopped,
    Uninitialized,
    Locked,
    Started,
    Failed,
}

// ───────────────────────────────────────────────────────────────
// Updates
// ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateState {
    Started,
    Cancelled,
    Failed,
    Installed,
    Rejected,
    Completed,
}

/// One software update attempt and its progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update {
    pub id: String,
    /// Seconds since the Unix epoch.
    pub started: u64,
    pub url: String,
    pub state: UpdateState,
    /// 0-100.
    pub progress: u8,
    pub should_reboot: bool,
    pub should_commit: bool,
}
