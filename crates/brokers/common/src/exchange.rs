use optbridge_core::BridgeError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::connection::{ConnectionManager, Readiness};
use crate::correlator::{Correlator, FailureKind, Matcher, Resolution};
use crate::dispatcher::Dispatcher;
use crate::transport::Transport;

/// Engine-wide settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Messages kept per exchange for diagnostics.
    pub transcript_cap: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { transcript_cap: 64 }
    }
}

/// One request/response exchange: what to send and how to recognise the
/// answer.
pub struct ExchangeSpec<T> {
    pub request: serde_json::Value,
    pub matcher: Matcher<T>,
    pub timeout: Duration,
    /// Pause between the handshake and the request.
    pub settle: Duration,
}

/// Where an exchange is in its life. Terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangePhase {
    Idle,
    AwaitingConnection,
    AwaitingAuth,
    AwaitingMatch,
    Resolved,
    TimedOut,
    ConnectionLost,
}

impl ExchangePhase {
    pub fn of<T>(resolution: &Resolution<T>) -> Self {
        match resolution {
            Ok(_) => ExchangePhase::Resolved,
            Err(f) if f.kind == FailureKind::Timeout => ExchangePhase::TimedOut,
            Err(f) if f.kind == FailureKind::ConnectionLost => ExchangePhase::ConnectionLost,
            // A venue rejection is an answer, just not a successful one.
            Err(_) => ExchangePhase::Resolved,
        }
    }
}

/// Correlation engine bound to one transport.
#[derive(Clone)]
pub struct Engine {
    correlator: Correlator,
    connection: ConnectionManager,
}

impl Engine {
    /// Wire the engine to `transport` and spawn its dispatcher.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(transport: Arc<dyn Transport>, config: EngineConfig) -> Self {
        let (sink, events) = mpsc::unbounded_channel();
        let correlator = Correlator::new(config.transcript_cap);
        let connection = ConnectionManager::new(Arc::clone(&transport), sink);
        let dispatcher = Dispatcher::new(correlator.clone(), connection.clone(), transport);
        tokio::spawn(dispatcher.run(events));

        Self {
            correlator,
            connection,
        }
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    /// Run one exchange: register, connect, authenticate, send, await.
    ///
    /// The exchange is registered before anything is sent so an early reply
    /// is never missed. Failures come back as a failed [`Resolution`].
    pub async fn run<T: Send + 'static>(&self, spec: ExchangeSpec<T>) -> Resolution<T> {
        let name = spec.matcher.name;
        trace!(exchange = name, phase = ?ExchangePhase::Idle);
        let handle = self.correlator.register(spec.matcher, spec.timeout).await;
        let id = handle.id();

        match tokio::time::timeout_at(handle.deadline(), self.deliver(name, &spec.request, spec.settle))
            .await
        {
            Ok(Ok(())) => {
                trace!(exchange = name, exchange_id = %id, phase = ?ExchangePhase::AwaitingMatch);
            }
            Ok(Err(e)) => {
                warn!(exchange = name, exchange_id = %id, error = %e, "Exchange could not be sent");
                self.correlator.fail(id, FailureKind::ConnectionLost).await;
            }
            Err(_) => {
                debug!(exchange = name, exchange_id = %id, "Deadline passed before the request was sent");
            }
        }

        let resolution = handle.wait().await;
        debug!(exchange = name, exchange_id = %id, phase = ?ExchangePhase::of(&resolution), "Exchange finished");
        resolution
    }

    /// Ensure open, authenticate, wait the settle delay, send the request.
    async fn deliver(
        &self,
        name: &'static str,
        request: &serde_json::Value,
        settle: Duration,
    ) -> Result<(), BridgeError> {
        trace!(exchange = name, phase = ?ExchangePhase::AwaitingConnection);
        let readiness = self.connection.ensure_open().await?;

        if let Some(handshake) = self.connection.handshake().await {
            trace!(exchange = name, phase = ?ExchangePhase::AwaitingAuth);
            // A fresh connection was already authenticated by the on-open hook.
            if readiness == Readiness::AlreadyOpen {
                self.connection.send(&handshake).await?;
            }
            tokio::time::sleep(settle).await;
        }

        self.connection.send(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated::SimulatedTransport;
    use optbridge_core::{ConnectionState, InboundMessage};
    use serde_json::json;
    use tokio::time::Instant;

    fn spec(id: i64, timeout_ms: u64) -> ExchangeSpec<i64> {
        ExchangeSpec {
            request: json!({"name": "poll", "id": id}),
            matcher: Matcher::new(
                "poll",
                move |m: &InboundMessage| m["id"].as_i64() == Some(id) && m.get("name").is_none(),
                |m: &InboundMessage| m["id"].as_i64().unwrap_or_default(),
            ),
            timeout: Duration::from_millis(timeout_ms),
            settle: Duration::from_millis(50),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_connects_authenticates_and_matches() {
        let transport = Arc::new(SimulatedTransport::new());
        transport.respond_to(
            |m| m["name"] == "poll",
            vec![json!({"noise": true}), json!({"id": 5})],
        );
        let engine = Engine::start(transport.clone(), EngineConfig::default());
        engine
            .connection()
            .set_handshake(Some(json!({"name": "ssid", "msg": "token"})))
            .await;

        let matched = engine.run(spec(5, 4000)).await.unwrap();
        assert_eq!(matched.value, 5);
        assert_eq!(transport.connect_count(), 1);
        // Handshake from the on-open hook, then the request.
        assert_eq!(
            transport.sent(),
            vec![
                json!({"name": "ssid", "msg": "token"}),
                json!({"name": "poll", "id": 5})
            ]
        );
        assert_eq!(engine.connection().state(), ConnectionState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_connection_reauthenticates_before_request() {
        let transport = Arc::new(SimulatedTransport::new());
        transport.respond_to(|m| m["name"] == "poll", vec![json!({"id": 1})]);
        let engine = Engine::start(transport.clone(), EngineConfig::default());
        engine
            .connection()
            .set_handshake(Some(json!({"name": "ssid"})))
            .await;

        engine.run(spec(1, 4000)).await.unwrap();
        engine.run(spec(1, 4000)).await.unwrap();

        assert_eq!(transport.connect_count(), 1);
        assert_eq!(
            transport.sent(),
            vec![
                json!({"name": "ssid"}),
                json!({"name": "poll", "id": 1}),
                json!({"name": "ssid"}),
                json!({"name": "poll", "id": 1}),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_connect() {
        let transport = Arc::new(SimulatedTransport::new());
        transport.set_open_delay(Duration::from_millis(300));
        transport.respond_to(|m| m["id"] == 1, vec![json!({"id": 1})]);
        transport.respond_to(|m| m["id"] == 2, vec![json!({"id": 2})]);
        let engine = Engine::start(transport.clone(), EngineConfig::default());

        let (a, b) = tokio::join!(engine.run(spec(1, 4000)), engine.run(spec(2, 4000)));
        assert_eq!(a.unwrap().value, 1);
        assert_eq!(b.unwrap().value, 2);
        assert_eq!(transport.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_fails_pending_without_waiting_for_deadline() {
        let transport = Arc::new(SimulatedTransport::new());
        let engine = Engine::start(transport.clone(), EngineConfig::default());

        let started = Instant::now();
        let closer = {
            let transport = transport.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(500)).await;
                transport.close("socket reset");
            })
        };
        let failure = engine.run(spec(9, 10_000)).await.unwrap_err();
        closer.await.unwrap();

        assert_eq!(failure.kind, FailureKind::ConnectionLost);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(engine.connection().state(), ConnectionState::Closed);
        assert_eq!(engine.correlator().pending_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_lazily_after_close() {
        let transport = Arc::new(SimulatedTransport::new());
        transport.respond_to(|m| m["name"] == "poll", vec![json!({"id": 3})]);
        let engine = Engine::start(transport.clone(), EngineConfig::default());

        engine.run(spec(3, 4000)).await.unwrap();
        transport.close("idle");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(engine.connection().state(), ConnectionState::Closed);

        engine.run(spec(3, 4000)).await.unwrap();
        assert_eq!(transport.connect_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_outliving_deadline_does_not_block_next_exchange() {
        let transport = Arc::new(SimulatedTransport::new());
        transport.stall_next_connect(Duration::from_secs(30));
        transport.respond_to(|m| m["name"] == "poll", vec![json!({"id": 4})]);
        let engine = Engine::start(transport.clone(), EngineConfig::default());

        let started = Instant::now();
        let failure = engine.run(spec(4, 4000)).await.unwrap_err();
        assert_eq!(failure.kind, FailureKind::Timeout);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(engine.connection().state(), ConnectionState::Closed);

        let matched = engine.run(spec(4, 4000)).await.unwrap();
        assert_eq!(matched.value, 4);
        assert_eq!(transport.connect_count(), 2);
        assert_eq!(engine.connection().state(), ConnectionState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_fails_exchange() {
        let transport = Arc::new(SimulatedTransport::new());
        transport.fail_connects(true);
        let engine = Engine::start(transport.clone(), EngineConfig::default());

        let failure = engine.run(spec(1, 4000)).await.unwrap_err();
        assert_eq!(failure.kind, FailureKind::ConnectionLost);
        assert_eq!(engine.connection().state(), ConnectionState::Closed);
        assert!(transport.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_exchange_times_out() {
        let transport = Arc::new(SimulatedTransport::new());
        let engine = Engine::start(transport.clone(), EngineConfig::default());

        let started = Instant::now();
        let failure = engine.run(spec(1, 4000)).await.unwrap_err();
        assert_eq!(failure.kind, FailureKind::Timeout);
        assert!(started.elapsed() >= Duration::from_millis(4000));
    }
}
