//! Common utilities shared by the server, the client and the step modules

pub mod config;
pub mod error;
pub mod logging;
pub mod paths;

pub use error::{Error, Result};
