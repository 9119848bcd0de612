use serde::{Deserialize, Serialize};

/// An inbound message from the venue: an opaque JSON document.
pub type InboundMessage = serde_json::Value;

/// Lifecycle state of the single streaming connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Closed,
    Connecting,
    Open,
}

/// Events a transport pushes to the inbound sink.
///
/// `generation` identifies the connect attempt that produced the event so
/// that late events from a replaced connection can be told apart.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The connection is open and ready to send.
    Opened { generation: u64 },
    /// One inbound frame, in receipt order.
    Message {
        generation: u64,
        payload: InboundMessage,
    },
    /// The connection closed or failed.
    Closed { generation: u64, reason: String },
}
