//! Token usage monitoring backend: reads the CLI stats cache, prices and
//! aggregates usage, stores periodic snapshots and pushes live updates to
//! WebSocket subscribers when the cache changes.

pub mod cli;
pub mod config;
pub mod hub;
pub mod logging;
pub mod server;
pub mod store;
pub mod usage;
pub mod watch;
