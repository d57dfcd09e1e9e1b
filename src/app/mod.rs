//! Application core — the dispenser supervisor and its boundary types.
//!
//! The business rules (touch and payment dispensing, start/stop ordering,
//! settings) live in [`service`].  All interaction with hardware, radios,
//! payment nodes and storage happens through **port traits** defined in
//! [`ports`], keeping this layer testable without real peripherals.

pub mod commands;
pub mod events;
pub mod lifecycle;
pub mod ports;
pub mod service;
