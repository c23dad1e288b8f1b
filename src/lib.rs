//! cukemerlin - cucumber wire protocol step server for event-broker testing
//!
//! A test runner matches and invokes steps over the wire protocol; step
//! handlers open links to the event broker under test, send events, and
//! assert on what comes back, possibly after a bounded wait.

pub mod broker;
pub mod cli;
pub mod commands;
pub mod common;
pub mod server;
pub mod steps;
pub mod wire;

// Re-export commonly used types for tests
pub use common::{Error, Result};
pub use wire::{Reply, Request, StepId};
