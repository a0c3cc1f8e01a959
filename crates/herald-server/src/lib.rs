//! # herald-server
//!
//! WebSocket gateway server for Herald.
//!
//! - [`config`] - layered configuration (TOML file plus environment)
//! - [`handlers`] - handshake, per-connection event loop, health endpoint
//! - [`metrics`] - Prometheus metrics
//! - [`supervisor`] - multi-process mode: spawns, restarts, and relays workers
//! - [`worker`] - the worker end of the supervisor control channel

pub mod config;
pub mod handlers;
pub mod metrics;
pub mod supervisor;
pub mod worker;
