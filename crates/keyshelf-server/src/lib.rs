//! keyshelf HTTP server.
//!
//! Wires the core library, storage backend and policy engine into an Axum
//! router serving the JSON API at `/v1/*`. Callers are authenticated by the
//! host in front of this server, which forwards the caller identity in
//! headers.

pub mod config;
pub mod error;
pub mod middleware;
pub mod routes;
pub mod state;
pub mod vault;
