//! Lightning-payment vending controller.
//!
//! Exposes the supervisor, its subsystems and the host adapters for the
//! binary and for integration testing.

#![deny(unused_must_use)]

pub mod adapters;
pub mod app;
pub mod config;
pub mod error;
pub mod gate;
pub mod machine;
pub mod network;
pub mod nodes;
pub mod pubsub;
