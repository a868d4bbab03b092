pub mod config;
pub mod cost;
pub mod serve;
pub mod snapshot;
pub mod stats;
pub mod trends;
