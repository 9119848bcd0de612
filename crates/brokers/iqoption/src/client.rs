use optbridge_brokers_common::{Engine, EngineConfig, ExchangeSpec, Matcher, Resolution, Transport};
use optbridge_core::*;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::IqOptionConfig;
use crate::exchanges::{self, PlacedOrder};
use crate::http::HttpSession;
use crate::protocol::{self, OutboundMessage, PlaceOrderBody};
use crate::ws::WsTransport;

/// IQ Option operations over one shared streaming connection.
///
/// Every operation runs as an exchange on the correlation engine; exchange
/// failures (timeout, connection loss, rejection) come back as
/// `success: false` with the messages observed, never as errors.
pub struct IqOptionBroker {
    config: IqOptionConfig,
    engine: Engine,
    session: Arc<dyn SessionProvider>,
    orders: Arc<dyn OrderStore>,
}

impl IqOptionBroker {
    /// Must be called from within a tokio runtime.
    pub fn new(
        config: IqOptionConfig,
        transport: Arc<dyn Transport>,
        session: Arc<dyn SessionProvider>,
        orders: Arc<dyn OrderStore>,
    ) -> Self {
        let engine = Engine::start(
            transport,
            EngineConfig {
                transcript_cap: config.transcript_cap,
            },
        );
        Self {
            config,
            engine,
            session,
            orders,
        }
    }

    /// Wire the broker to the live venue: WebSocket stream plus HTTP session.
    pub fn connect(config: IqOptionConfig, orders: Arc<dyn OrderStore>) -> Result<Self, BridgeError> {
        let transport = Arc::new(WsTransport::new(config.ws_url.clone()));
        let session = Arc::new(HttpSession::new(config.clone())?);
        Ok(Self::new(config, transport, session, orders))
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Keep the stream handshake in step with the HTTP session token.
    async fn sync_handshake(&self) {
        let handshake = self
            .session
            .handshake_token()
            .map(|token| protocol::authenticate(&token).to_value());
        self.engine.connection().set_handshake(handshake).await;
    }

    async fn run<T: Send + 'static>(
        &self,
        request: OutboundMessage,
        matcher: Matcher<T>,
        (timeout, settle): (Duration, Duration),
    ) -> Resolution<T> {
        self.engine
            .run(ExchangeSpec {
                request: request.to_value(),
                matcher,
                timeout,
                settle,
            })
            .await
    }

    pub async fn login(&self, credentials: &LoginRequest) -> Result<LoginResponse, BridgeError> {
        let outcome = self.session.login(credentials).await?;
        self.sync_handshake().await;
        Ok(LoginResponse {
            success: outcome.success,
            token: None,
            raw: outcome.raw,
        })
    }

    /// Balances of the given types (1 = REAL, 4 = DEMO).
    ///
    /// Without an authenticated session this returns `success: false`
    /// before touching the connection.
    pub async fn get_balances(&self, types: &[i64]) -> BalancesResponse {
        if let Err(e) = self.session.establish_session().await {
            warn!(error = %e, "No session, skipping balance request");
            return BalancesResponse::failed();
        }
        self.sync_handshake().await;

        let types = if types.is_empty() {
            DEFAULT_BALANCE_TYPES.to_vec()
        } else {
            types.to_vec()
        };
        let resolution = self
            .run(
                protocol::get_balances(&types),
                exchanges::balances_matcher(types),
                self.config.timeouts.balances(),
            )
            .await;

        match resolution {
            Ok(matched) => BalancesResponse {
                success: true,
                balances: matched.value,
            },
            Err(failure) => {
                warn!(kind = ?failure.kind, "Balance request failed");
                BalancesResponse::failed()
            }
        }
    }

    /// Venue instrument id for `ticker`, trying each category of `lookup` in
    /// order. `raw` carries every message observed across all attempts.
    pub async fn resolve_instrument(
        &self,
        lookup: InstrumentLookup,
        ticker: &str,
    ) -> Result<InstrumentResolution, BridgeError> {
        let ticker = ticker.trim();
        if ticker.is_empty() {
            return Err(BridgeError::Client("ticker is required".to_string()));
        }
        self.sync_handshake().await;

        let mut raw = Vec::new();
        for category in lookup.categories() {
            let (found, observed) = self
                .lookup_instrument(protocol::get_instruments(*category), ticker)
                .await;
            raw.extend(observed);
            if let Some(instrument_id) = found {
                info!(%ticker, category = category.as_str(), %instrument_id, "Instrument resolved");
                return Ok(InstrumentResolution {
                    success: true,
                    instrument_id: Some(instrument_id),
                    raw,
                });
            }
        }

        Ok(InstrumentResolution {
            success: false,
            instrument_id: None,
            raw,
        })
    }

    async fn lookup_instrument(
        &self,
        request: OutboundMessage,
        ticker: &str,
    ) -> (Option<String>, Vec<Value>) {
        let resolution = self
            .run(
                request,
                exchanges::instrument_matcher(ticker),
                self.config.timeouts.instruments(),
            )
            .await;
        match resolution {
            Ok(matched) => (Some(matched.value), matched.transcript),
            Err(failure) => (None, failure.transcript),
        }
    }

    /// Place an order and wait for the venue's acknowledgement.
    ///
    /// A ticker (or no instrument at all) is resolved to a venue id first,
    /// scoped to the account's user group. A zero balance id falls back to
    /// the profile's default balance.
    pub async fn place_order(
        &self,
        request: PlaceOrderRequest,
    ) -> Result<PlaceOrderResponse, BridgeError> {
        let side = request.resolve_side()?;
        if request.amount <= rust_decimal::Decimal::ZERO {
            return Err(BridgeError::Client("amount must be positive".to_string()));
        }

        self.session.establish_session().await.map_err(|e| match e {
            BridgeError::Session(_) => e,
            other => BridgeError::Session(other.to_string()),
        })?;
        let profile = self.session.profile().await.unwrap_or_else(|e| {
            warn!(error = %e, "Profile unavailable, placing without it");
            Profile::default()
        });
        self.sync_handshake().await;

        let instrument_type = match request.instrument_type {
            InstrumentType::FxOption => InstrumentType::FxOption,
            _ => InstrumentType::DigitalOption,
        };
        let instrument_id = match request.ticker_to_resolve() {
            Some(ticker) => {
                let subscribe = protocol::subscribe_instruments(
                    instrument_type,
                    profile.user_group_id,
                    profile.is_regulated,
                );
                let (found, _) = self.lookup_instrument(subscribe, &ticker).await;
                found.ok_or_else(|| {
                    BridgeError::Client(format!(
                        "Unable to resolve instrument_id for {} under {}. Provide instrument_id explicitly.",
                        ticker,
                        instrument_type.as_str()
                    ))
                })?
            }
            None => request
                .instrument_id
                .as_deref()
                .map(str::trim)
                .unwrap_or_default()
                .to_string(),
        };

        let user_balance_id = if request.user_balance_id != 0 {
            request.user_balance_id
        } else {
            profile.balance_id
        };

        let body = PlaceOrderBody {
            user_balance_id,
            instrument_type,
            instrument_id: instrument_id.clone(),
            side,
            amount: request.amount,
        };
        let placed = PlacedOrder {
            request,
            side,
            user_balance_id,
            instrument_id,
        };
        let resolution = self
            .run(
                protocol::place_order(&body),
                exchanges::place_order_matcher(placed, Arc::clone(&self.orders)),
                self.config.timeouts.place_order(),
            )
            .await;

        Ok(match resolution {
            Ok(matched) => {
                info!(broker_order_id = matched.value, "Order acknowledged");
                PlaceOrderResponse {
                    success: true,
                    order_id: Some(matched.value),
                    raw: Some(matched.raw),
                }
            }
            Err(failure) => {
                warn!(kind = ?failure.kind, "Order not acknowledged");
                PlaceOrderResponse {
                    success: false,
                    order_id: None,
                    raw: Some(Value::Array(failure.transcript)),
                }
            }
        })
    }

    /// First order-state message naming `order_id`.
    pub async fn order_status(&self, order_id: i64) -> Result<OrderStatusResponse, BridgeError> {
        if order_id <= 0 {
            return Err(BridgeError::Client(format!("invalid order id {}", order_id)));
        }
        self.sync_handshake().await;

        let resolution = self
            .run(
                protocol::subscribe_order_state(),
                exchanges::status_matcher(order_id),
                self.config.timeouts.order_status(),
            )
            .await;

        Ok(match resolution {
            Ok(matched) => OrderStatusResponse {
                success: true,
                raw: matched.value,
            },
            Err(failure) => OrderStatusResponse {
                success: false,
                raw: Value::Array(failure.transcript),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use optbridge_brokers_common::simulated::SimulatedTransport;
    use rust_decimal_macros::dec;
    use serde_json::json;
    use std::sync::Mutex;
    use tokio::time::Instant;

    struct FakeSession {
        logged_in: bool,
        profile: Profile,
    }

    #[async_trait]
    impl SessionProvider for FakeSession {
        async fn login(&self, credentials: &LoginRequest) -> Result<LoginOutcome, BridgeError> {
            Ok(LoginOutcome {
                success: credentials.password == "secret",
                raw: json!({"code": "success"}),
            })
        }

        async fn establish_session(&self) -> Result<(), BridgeError> {
            if self.logged_in {
                Ok(())
            } else {
                Err(BridgeError::Session("not logged in".to_string()))
            }
        }

        async fn profile(&self) -> Result<Profile, BridgeError> {
            Ok(self.profile.clone())
        }

        fn handshake_token(&self) -> Option<String> {
            self.logged_in.then(|| "ssid-token".to_string())
        }
    }

    #[derive(Default)]
    struct RecordingStore {
        orders: Mutex<Vec<OrderRecord>>,
    }

    #[async_trait]
    impl OrderStore for RecordingStore {
        async fn save_order(&self, order: &OrderRecord) -> Result<(), StoreError> {
            self.orders.lock().unwrap().push(order.clone());
            Ok(())
        }

        async fn list_orders(&self) -> Result<Vec<OrderRecord>, StoreError> {
            Ok(self.orders.lock().unwrap().clone())
        }
    }

    struct Harness {
        broker: Arc<IqOptionBroker>,
        transport: Arc<SimulatedTransport>,
        store: Arc<RecordingStore>,
    }

    fn harness(logged_in: bool) -> Harness {
        let transport = Arc::new(SimulatedTransport::new());
        let store = Arc::new(RecordingStore::default());
        let session = Arc::new(FakeSession {
            logged_in,
            profile: Profile {
                user_group_id: 193,
                is_regulated: false,
                balance_id: 555,
            },
        });
        let broker = IqOptionBroker::new(
            IqOptionConfig::default(),
            transport.clone(),
            session,
            store.clone(),
        );
        Harness {
            broker: Arc::new(broker),
            transport,
            store,
        }
    }

    fn request_named(name: &'static str) -> impl Fn(&Value) -> bool + Send + Sync {
        move |m: &Value| m["msg"]["name"] == name
    }

    fn order(instrument_id: Option<&str>, action: Option<&str>) -> PlaceOrderRequest {
        PlaceOrderRequest {
            user_balance_id: 0,
            instrument_type: InstrumentType::DigitalOption,
            instrument_id: instrument_id.map(str::to_string),
            side: None,
            action: action.map(str::to_string),
            amount: dec!(10),
            leverage: None,
            limit_price: None,
            stop_price: None,
            stop_lose_value: None,
            stop_lose_kind: None,
            take_profit_value: None,
            take_profit_kind: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_balances_without_session_short_circuit() {
        let h = harness(false);
        let response = h.broker.get_balances(&[1, 4]).await;
        assert!(!response.success);
        assert!(response.balances.is_empty());
        assert_eq!(h.transport.connect_count(), 0);
        assert!(h.transport.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_balances_authenticate_then_filter() {
        let h = harness(true);
        h.transport.respond_to(
            request_named("get-balances"),
            vec![
                json!({"name": "timeSync", "msg": 1723456789000_i64}),
                json!({"name": "balances", "msg": [
                    {"id": 1, "type": 1, "amount": 100.5, "currency": "USD"},
                    {"id": 2, "type": 4, "amount": "9000", "currency": "USD"},
                    {"id": 3, "type": 2, "amount": 1}
                ]}),
            ],
        );

        let response = h.broker.get_balances(&[1, 4]).await;
        assert!(response.success);
        let ids: Vec<i64> = response.balances.iter().map(|b| b.id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(response.balances[1].amount, 9000.0);

        let sent = h.transport.sent();
        assert_eq!(sent[0], json!({"name": "ssid", "msg": "ssid-token"}));
        assert_eq!(sent[1]["msg"]["name"], "get-balances");
        // Both observed messages are dropped from the receive buffer.
        assert_eq!(h.transport.pruned().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_balance_calls_share_one_snapshot() {
        let h = harness(true);
        let real = {
            let broker = Arc::clone(&h.broker);
            tokio::spawn(async move { broker.get_balances(&[1]).await })
        };
        let demo = {
            let broker = Arc::clone(&h.broker);
            tokio::spawn(async move { broker.get_balances(&[4]).await })
        };

        tokio::time::sleep(Duration::from_millis(500)).await;
        h.transport.push(json!({"msg": {"balances": [
            {"id": 10, "type": 1},
            {"id": 40, "type": 4}
        ]}}));

        let real = real.await.unwrap();
        let demo = demo.await.unwrap();
        assert!(real.success && demo.success);
        assert_eq!(real.balances.iter().map(|b| b.id).collect::<Vec<_>>(), vec![10]);
        assert_eq!(demo.balances.iter().map(|b| b.id).collect::<Vec<_>>(), vec![40]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_balances_time_out_quietly() {
        let h = harness(true);
        let started = Instant::now();
        let response = h.broker.get_balances(&[]).await;
        assert!(!response.success);
        assert!(started.elapsed() >= Duration::from_millis(4000));
        assert_eq!(h.transport.sent()[1]["msg"]["body"]["types_ids"], json!([1, 4]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_side_fails_before_any_send() {
        let h = harness(true);
        let err = h.broker.place_order(order(Some("1861"), None)).await.unwrap_err();
        assert!(matches!(err, BridgeError::Client(_)));
        assert_eq!(h.transport.connect_count(), 0);
        assert!(h.transport.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_place_order_without_session_is_session_error() {
        let h = harness(false);
        let err = h.broker.place_order(order(Some("1861"), Some("CALL"))).await.unwrap_err();
        assert!(matches!(err, BridgeError::Session(_)));
        assert!(h.transport.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_place_order_resolves_ticker_and_persists() {
        let h = harness(true);
        h.transport.respond_to(
            request_named("instruments-changed"),
            vec![json!({"name": "instruments", "msg": {"instruments": [
                {"ticker": "EURUSD", "id": "do1861"}
            ]}})],
        );
        h.transport.respond_to(
            request_named("place-order-temp"),
            vec![json!({"name": "digital-option-placed", "msg": {"id": 9001, "status": "open"}})],
        );

        let response = h.broker.place_order(order(Some("eurusd"), Some("PUT"))).await.unwrap();
        assert!(response.success);
        assert_eq!(response.order_id, Some(9001));

        let sent = h.transport.sent();
        let subscribe = sent.iter().find(|m| m["name"] == "subscribeMessage").unwrap();
        assert_eq!(subscribe["msg"]["body"]["routingFilters"]["user_group_id"], 193);
        let place = sent.iter().find(|m| m["msg"]["name"] == "place-order-temp").unwrap();
        assert_eq!(place["msg"]["body"]["instrument_id"], "do1861");
        assert_eq!(place["msg"]["body"]["side"], "sell");
        // Zero balance id falls back to the profile's balance.
        assert_eq!(place["msg"]["body"]["user_balance_id"], 555);

        tokio::time::sleep(Duration::from_millis(10)).await;
        let stored = h.store.list_orders().await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].broker_order_id, 9001);
        assert_eq!(stored[0].status, "open");
        assert_eq!(stored[0].side, Side::Sell);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresolvable_ticker_is_client_error() {
        let h = harness(true);
        let err = h.broker.place_order(order(None, Some("CALL"))).await.unwrap_err();
        match err {
            BridgeError::Client(message) => assert!(message.contains("EURUSD")),
            other => panic!("unexpected error {:?}", other),
        }
        assert!(h
            .transport
            .sent()
            .iter()
            .all(|m| m["msg"]["name"] != "place-order-temp"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_place_order_rejection_fails_early() {
        let h = harness(true);
        h.transport.respond_to(
            request_named("place-order-temp"),
            vec![json!({"name": "order-placed-temp", "status": 4000, "msg": {"message": "insufficient funds"}})],
        );

        let started = Instant::now();
        let mut req = order(Some("1861"), Some("CALL"));
        req.user_balance_id = 42;
        let response = h.broker.place_order(req).await.unwrap();
        assert!(!response.success);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(response.raw.unwrap().as_array().unwrap().len(), 1);
        assert!(h.store.list_orders().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_lookup_falls_through_to_fx_options() {
        let h = harness(true);
        h.transport.respond_to(
            |m: &Value| m["msg"]["body"]["type"] == "digital-option",
            vec![json!({"name": "instruments", "msg": {"instruments": [{"ticker": "GBPUSD", "id": 1}]}})],
        );
        h.transport.respond_to(
            |m: &Value| m["msg"]["body"]["type"] == "fx-option",
            vec![json!({"name": "instruments", "result": {"instruments": [{"ticker": "EURUSD", "id": 77}]}})],
        );

        let started = Instant::now();
        let resolution = h
            .broker
            .resolve_instrument(InstrumentLookup::Auto, "eurusd")
            .await
            .unwrap();
        let elapsed = started.elapsed();
        assert!(resolution.success);
        assert_eq!(resolution.instrument_id.as_deref(), Some("77"));
        assert_eq!(resolution.raw.len(), 2);
        // The digital-option attempt runs to its full deadline first.
        let deadline = Duration::from_millis(IqOptionConfig::default().timeouts.instruments_ms);
        assert!(elapsed >= deadline);
        assert!(elapsed < deadline * 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_category_lookup_reports_failure() {
        let h = harness(true);
        let resolution = h
            .broker
            .resolve_instrument(InstrumentLookup::FxOption, "EURUSD")
            .await
            .unwrap();
        assert!(!resolution.success);
        assert_eq!(resolution.instrument_id, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_order_status_timeout_returns_collected_messages() {
        let h = harness(true);
        h.transport.respond_to(
            request_named("portfolio.order-changed"),
            vec![
                json!({"name": "order-changed", "msg": {"id": 1}}),
                json!({"name": "order-changed", "msg": {"order_id": 2}}),
            ],
        );

        let response = h.broker.order_status(123).await.unwrap();
        assert!(!response.success);
        assert_eq!(response.raw.as_array().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_order_status_matches_order_id() {
        let h = harness(true);
        h.transport.respond_to(
            request_named("portfolio.order-changed"),
            vec![json!({"name": "order-changed", "msg": {"order_id": "123", "status": "closed"}})],
        );

        let response = h.broker.order_status(123).await.unwrap();
        assert!(response.success);
        assert_eq!(response.raw["msg"]["status"], "closed");
    }

    #[tokio::test]
    async fn test_login_installs_handshake() {
        let h = harness(true);
        let response = h
            .broker
            .login(&LoginRequest {
                identifier: "trader@example.com".to_string(),
                password: "secret".to_string(),
                two_factor_code: None,
            })
            .await
            .unwrap();
        assert!(response.success);
        assert!(response.token.is_none());
        assert_eq!(
            h.broker.engine().connection().handshake().await,
            Some(json!({"name": "ssid", "msg": "ssid-token"}))
        );
    }
}
