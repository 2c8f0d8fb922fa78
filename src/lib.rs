//! sandbox-relay library
//!
//! Runs generated code inside an isolated environment while the tools it
//! calls stay on the host:
//! - Binary relay protocol shared by both endpoints
//! - Relay server (sandbox side) running submitted JavaScript in V8
//! - Relay client and execution orchestrator (host side)

pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod router;
pub mod sandbox;
pub mod script;
pub mod server;
pub mod session;
pub mod tool;
pub mod transport;

pub use error::{RelayError, Result};
