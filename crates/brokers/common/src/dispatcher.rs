use optbridge_core::{InboundMessage, TransportEvent};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::connection::ConnectionManager;
use crate::correlator::{Correlator, DispatchOutcome, FailureKind};
use crate::transport::Transport;

/// Sole consumer of the transport's event sink.
///
/// Runs on one task, so messages are evaluated one at a time in arrival
/// order and no predicate ever runs concurrently with another.
pub struct Dispatcher {
    correlator: Correlator,
    connection: ConnectionManager,
    transport: Arc<dyn Transport>,
}

impl Dispatcher {
    pub fn new(
        correlator: Correlator,
        connection: ConnectionManager,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            correlator,
            connection,
            transport,
        }
    }

    /// Consume events until every sender is gone.
    pub async fn run(self, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
        while let Some(event) = events.recv().await {
            self.handle(event).await;
        }
        info!("Dispatcher stopped");
    }

    pub async fn handle(&self, event: TransportEvent) {
        match event {
            TransportEvent::Opened { generation } => {
                self.connection.on_open(generation).await;
            }
            TransportEvent::Message {
                generation,
                payload,
            } => {
                if generation != self.connection.generation() {
                    debug!(generation, "Dropping message from a replaced connection");
                    return;
                }
                self.on_message(payload).await;
            }
            TransportEvent::Closed { generation, reason } => {
                if self.connection.on_close(generation, &reason) {
                    self.correlator.fail_all(FailureKind::ConnectionLost).await;
                }
            }
        }
    }

    /// Offer one inbound message to the pending exchanges.
    pub async fn on_message(&self, raw: InboundMessage) -> DispatchOutcome {
        let outcome = self.correlator.dispatch(&raw).await;
        for consumed in &outcome.prune {
            self.transport.prune(consumed);
        }
        outcome
    }
}
