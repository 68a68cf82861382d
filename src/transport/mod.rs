use async_trait::async_trait;

use crate::error::TransportError;

pub mod mock;
pub mod websocket;

/// One live bidirectional byte channel to the relay.
///
/// Implementations own their socket and background tasks; dropping a
/// transport must tear everything down. Reconnection policy lives above this
/// trait, in [`crate::signaling::SignalingClient`].
#[async_trait]
pub trait RawTransport: Send + Sync {
    /// Send one frame's bytes to the relay.
    async fn send(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Receive the next frame's bytes. `None` means the channel is gone.
    async fn recv(&mut self) -> Option<Vec<u8>>;

    fn is_connected(&self) -> bool;
}

/// Factory used by the signaling client to (re)establish its channel.
///
/// A trait so tests can hand out in-memory pairs and fault-injecting
/// transports; production uses [`websocket::WebSocketConnector`].
#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn RawTransport>, TransportError>;
}
