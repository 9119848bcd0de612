use async_trait::async_trait;
use optbridge_core::{BridgeError, InboundMessage, TransportEvent};
use tokio::sync::mpsc;

/// Where a transport pushes inbound frames and lifecycle events.
pub type EventSink = mpsc::UnboundedSender<TransportEvent>;

/// The streaming connection to a venue.
///
/// Implementations never hold exchange-specific callbacks: everything they
/// receive goes to the one sink handed over by the connection manager.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start a connection attempt.
    ///
    /// Every event produced by this attempt must carry `generation`. Readiness
    /// is signalled with [`TransportEvent::Opened`], not by returning.
    async fn connect(&self, generation: u64, sink: EventSink) -> Result<(), BridgeError>;

    /// Write one message to the open connection.
    async fn send(&self, message: &serde_json::Value) -> Result<(), BridgeError>;

    fn is_open(&self) -> bool;

    /// Drop an already-consumed message from any client-side receive cache.
    fn prune(&self, _message: &InboundMessage) {}
}
