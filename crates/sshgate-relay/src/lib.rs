//! Public relay server
//!
//! Binds the backend-protocol listener that clients connect to and the
//! control listener that agents dial, and hands every accepted connection to
//! the connection broker.

pub mod config;
pub mod server;

pub use config::RelayConfig;
pub use server::{BoundRelay, RelayServer, RelayServerError};
