//! BLE central latency harness - host-testable core.
//!
//! Discovers peripherals advertising the test service, connects up to
//! [`config::MAX_CONNECTIONS`] of them, then writes a fixed payload to each
//! one in turn and measures the time until the peer writes back.
//!
//! Everything here is pure logic driven through the [`ble::Stack`] and
//! [`ble::Clock`] traits, so it runs on the host:
//!
//! Usage: `cargo test --lib`
//!
//! Note: The embedded binary (main.rs, `--features embedded`) binds these
//! traits to the Nordic SoftDevice and runs the orchestrator in an Embassy
//! task.

#![cfg_attr(not(test), no_std)]

pub mod ble;
pub mod config;
pub mod error;
pub mod latency;
pub mod orchestrator;

mod log;

pub use ble::{Address, AddressKind, Clock, ConnHandle, Event, Stack, Tick};
pub use error::{Error, StackError, StackOp};
pub use orchestrator::{LatencyReport, Orchestrator, StackHandler, State};

/// The orchestrator sized for the configured connection count.
pub type Harness = Orchestrator<{ config::MAX_CONNECTIONS }>;
