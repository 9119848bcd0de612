use async_trait::async_trait;
use optbridge_core::{BridgeError, InboundMessage, TransportEvent};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

use crate::transport::{EventSink, Transport};

type Trigger = Box<dyn Fn(&serde_json::Value) -> bool + Send + Sync>;

/// A scripted reply: when an outbound message matches, push `replies`.
struct Responder {
    trigger: Trigger,
    replies: Vec<InboundMessage>,
}

#[derive(Default)]
struct SimulatedState {
    sink: Option<EventSink>,
    generation: u64,
    open: bool,
    connects: usize,
    fail_connects: bool,
    connect_stall: Option<Duration>,
    open_delay: Duration,
    sent: Vec<serde_json::Value>,
    pruned: Vec<InboundMessage>,
    responders: Vec<Responder>,
}

/// An in-memory transport for tests and dry runs.
///
/// Connects instantly (or after a configurable delay), records every outbound
/// message, and replays scripted replies when an outbound message matches.
#[derive(Default)]
pub struct SimulatedTransport {
    state: Mutex<SimulatedState>,
}

impl SimulatedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, SimulatedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reply with `replies` every time an outbound message satisfies `trigger`.
    pub fn respond_to<F>(&self, trigger: F, replies: Vec<InboundMessage>)
    where
        F: Fn(&serde_json::Value) -> bool + Send + Sync + 'static,
    {
        self.state().responders.push(Responder {
            trigger: Box::new(trigger),
            replies,
        });
    }

    /// Delay between `connect` and the `Opened` event.
    pub fn set_open_delay(&self, delay: Duration) {
        self.state().open_delay = delay;
    }

    /// Hold the next connect attempt for `stall` before it proceeds.
    pub fn stall_next_connect(&self, stall: Duration) {
        self.state().connect_stall = Some(stall);
    }

    /// Make every connect attempt fail.
    pub fn fail_connects(&self, fail: bool) {
        self.state().fail_connects = fail;
    }

    /// Deliver an unsolicited inbound message on the current connection.
    pub fn push(&self, message: InboundMessage) {
        let state = self.state();
        if let Some(sink) = &state.sink {
            let _ = sink.send(TransportEvent::Message {
                generation: state.generation,
                payload: message,
            });
        }
    }

    /// Drop the current connection.
    pub fn close(&self, reason: &str) {
        let mut state = self.state();
        state.open = false;
        if let Some(sink) = &state.sink {
            let _ = sink.send(TransportEvent::Closed {
                generation: state.generation,
                reason: reason.to_string(),
            });
        }
    }

    pub fn sent(&self) -> Vec<serde_json::Value> {
        self.state().sent.clone()
    }

    pub fn pruned(&self) -> Vec<InboundMessage> {
        self.state().pruned.clone()
    }

    pub fn connect_count(&self) -> usize {
        self.state().connects
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    async fn connect(&self, generation: u64, sink: EventSink) -> Result<(), BridgeError> {
        let stall = {
            let mut state = self.state();
            state.connects += 1;
            state.connect_stall.take()
        };
        if let Some(stall) = stall {
            tokio::time::sleep(stall).await;
        }

        let delay = {
            let mut state = self.state();
            if state.fail_connects {
                return Err(BridgeError::Transport("simulated connect failure".to_string()));
            }
            state.generation = generation;
            state.sink = Some(sink.clone());
            state.open = true;
            state.open_delay
        };

        debug!(generation, "Simulated transport connecting");
        if delay.is_zero() {
            let _ = sink.send(TransportEvent::Opened { generation });
        } else {
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = sink.send(TransportEvent::Opened { generation });
            });
        }
        Ok(())
    }

    async fn send(&self, message: &serde_json::Value) -> Result<(), BridgeError> {
        let mut state = self.state();
        if !state.open {
            return Err(BridgeError::ConnectionLost("simulated transport closed".to_string()));
        }
        state.sent.push(message.clone());

        let replies: Vec<InboundMessage> = state
            .responders
            .iter()
            .filter(|r| (r.trigger)(message))
            .flat_map(|r| r.replies.iter().cloned())
            .collect();
        if let Some(sink) = &state.sink {
            for payload in replies {
                let _ = sink.send(TransportEvent::Message {
                    generation: state.generation,
                    payload,
                });
            }
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.state().open
    }

    fn prune(&self, message: &InboundMessage) {
        self.state().pruned.push(message.clone());
    }
}
