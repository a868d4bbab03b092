//! HTTP query layer and the live WebSocket endpoint.

pub mod dto;
pub mod handlers;
pub mod router;
pub mod ws;

pub use handlers::AppState;
pub use router::create_router;
