use async_trait::async_trait;
use thiserror::Error;

use super::envelope::Envelope;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("subscriber is disconnected")]
    Disconnected,
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("transport error: {0}")]
    Transport(String),
}

/// Bidirectional channel to one subscriber, supplied by the caller of the hub.
#[async_trait]
pub trait Transport: Send + 'static {
    async fn send(&mut self, envelope: &Envelope) -> Result<(), DeliveryError>;

    /// Whether the peer is still reachable after a failed send
    fn is_connected(&self) -> bool;

    async fn close(&mut self);
}
