//! Cucumber wire protocol: message types, line framing and a client
//!
//! The runner talks to the server over plain TCP, one JSON value per line.

pub mod client;
pub mod protocol;
pub mod transport;

pub use client::WireClient;
pub use protocol::{Reply, Request, StepId};
