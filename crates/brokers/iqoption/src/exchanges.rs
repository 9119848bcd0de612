//! How each venue exchange recognises and reads its answer.
//!
//! The venue wraps the interesting part of a message under `msg`, `result`
//! or `message` depending on the channel, so every matcher first picks the
//! payload in a fixed precedence and only then inspects its shape. Values
//! are coerced leniently: a missing or mistyped field reads as zero, false
//! or the empty string, never as an error.

use optbridge_brokers_common::Matcher;
use optbridge_core::{Balance, InboundMessage, OrderRecord, OrderStore, PlaceOrderRequest, Side};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Payload & coercion helpers
// ---------------------------------------------------------------------------

/// The first of `keys` present and non-null on `raw`, else `raw` itself.
pub fn payload<'a>(raw: &'a Value, keys: &[&str]) -> &'a Value {
    keys.iter()
        .filter_map(|k| raw.get(*k))
        .find(|v| !v.is_null())
        .unwrap_or(raw)
}

fn message_name(raw: &Value) -> Option<&str> {
    raw.get("name").and_then(Value::as_str)
}

/// Numeric value of a number or a numeric string.
pub fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

/// Integer value of a number or numeric string; fractional values truncate.
pub fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        other => as_f64(other).map(|f| f as i64),
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn as_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn field<'a>(record: &'a Value, key: &str) -> &'a Value {
    record.get(key).unwrap_or(&Value::Null)
}

// ---------------------------------------------------------------------------
// Balances
// ---------------------------------------------------------------------------

/// The balance list carried by a message, if it carries one.
///
/// Accepted shapes, in order: the payload is a bare list, the payload has a
/// `balances` list, the payload has a `result.balances` list.
pub fn balance_list(raw: &Value) -> Option<&Vec<Value>> {
    let payload = payload(raw, &["msg", "message"]);
    if let Some(list) = payload.as_array() {
        return Some(list);
    }
    if let Some(list) = payload.get("balances").and_then(Value::as_array) {
        return Some(list);
    }
    payload
        .get("result")
        .and_then(|r| r.get("balances"))
        .and_then(Value::as_array)
}

pub fn normalize_balance(record: &Value) -> Balance {
    let num = |key: &str| as_f64(field(record, key)).unwrap_or(0.0);
    let int = |key: &str| as_i64(field(record, key)).unwrap_or(0);
    let flag = |key: &str| truthy(field(record, key));

    Balance {
        id: int("id"),
        user_id: int("user_id"),
        balance_type: int("type"),
        amount: num("amount"),
        enrolled_amount: num("enrolled_amount"),
        enrolled_sum_amount: num("enrolled_sum_amount"),
        hold_amount: num("hold_amount"),
        orders_amount: num("orders_amount"),
        currency: as_text(field(record, "currency")),
        is_fiat: flag("is_fiat"),
        is_marginal: flag("is_marginal"),
        has_deposits: flag("has_deposits"),
        auth_amount: num("auth_amount"),
        equivalent: num("equivalent"),
    }
}

/// Normalized balances of the requested types. An empty `types` keeps all.
pub fn extract_balances(raw: &Value, types: &[i64]) -> Vec<Balance> {
    balance_list(raw)
        .map(|list| {
            list.iter()
                .map(normalize_balance)
                .filter(|b| types.is_empty() || types.contains(&b.balance_type))
                .collect()
        })
        .unwrap_or_default()
}

/// Balance snapshots answer every pending balance request at once, so the
/// match is shared. The messages observed along the way are pruned from the
/// transport's receive buffer.
pub fn balances_matcher(types: Vec<i64>) -> Matcher<Vec<Balance>> {
    Matcher::new(
        "get-balances",
        |raw: &InboundMessage| balance_list(raw).is_some(),
        move |raw: &InboundMessage| extract_balances(raw, &types),
    )
    .shared()
    .pruning()
}

// ---------------------------------------------------------------------------
// Instruments
// ---------------------------------------------------------------------------

/// Id of the instrument with `ticker` in an instrument-list message.
///
/// The message must be named like an instrument message and carry an
/// `instruments` list; the entry must have a non-empty id.
pub fn find_instrument(raw: &Value, ticker: &str) -> Option<String> {
    let name = message_name(raw)?;
    if !name.to_ascii_lowercase().contains("instrument") {
        return None;
    }
    let instruments = payload(raw, &["msg", "result"])
        .get("instruments")?
        .as_array()?;
    instruments
        .iter()
        .find(|i| as_text(field(i, "ticker")).eq_ignore_ascii_case(ticker))
        .map(|i| field(i, "id"))
        .filter(|id| truthy(id))
        .map(as_text)
}

pub fn instrument_matcher(ticker: &str) -> Matcher<String> {
    let wanted = ticker.to_string();
    let read = wanted.clone();
    Matcher::new(
        "get-instruments",
        move |raw: &InboundMessage| find_instrument(raw, &wanted).is_some(),
        move |raw: &InboundMessage| find_instrument(raw, &read).unwrap_or_default(),
    )
}

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

/// Nonzero venue order id carried by a message, under `id` or `order_id`.
pub fn order_id(raw: &Value) -> Option<i64> {
    let payload = payload(raw, &["msg", "result", "message"]);
    let id = payload
        .get("id")
        .filter(|v| !v.is_null())
        .or_else(|| payload.get("order_id"))?;
    as_i64(id).filter(|id| *id != 0)
}

/// An explicit order rejection: `order-placed-temp` with a non-200 status.
pub fn is_rejection(raw: &Value) -> bool {
    if message_name(raw) != Some("order-placed-temp") {
        return false;
    }
    let status = field(raw, "status");
    truthy(status) && as_i64(status) != Some(200)
}

/// Everything needed to persist an order once the venue acknowledges it.
#[derive(Clone)]
pub struct PlacedOrder {
    pub request: PlaceOrderRequest,
    pub side: Side,
    pub user_balance_id: i64,
    pub instrument_id: String,
}

impl PlacedOrder {
    pub fn record(&self, broker_order_id: i64, raw: &Value) -> OrderRecord {
        let status = payload(raw, &["msg", "result", "message"])
            .get("status")
            .filter(|s| !s.is_null())
            .map(as_text);
        OrderRecord::from_request(
            &self.request,
            self.side,
            self.user_balance_id,
            &self.instrument_id,
            broker_order_id,
            status,
            raw.clone(),
        )
    }
}

/// Acknowledgement of a placed order. Persisting the record is spawned so
/// the dispatcher never waits on storage.
pub fn place_order_matcher(order: PlacedOrder, store: Arc<dyn OrderStore>) -> Matcher<i64> {
    Matcher::new(
        "place-order",
        |raw: &InboundMessage| order_id(raw).is_some(),
        move |raw: &InboundMessage| {
            let id = order_id(raw).unwrap_or_default();
            let record = order.record(id, raw);
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                match store.save_order(&record).await {
                    Ok(()) => debug!(broker_order_id = id, "Order record saved"),
                    Err(e) => warn!(broker_order_id = id, error = %e, "Failed to save order record"),
                }
            });
            id
        },
    )
    .rejecting(|raw: &InboundMessage| is_rejection(raw))
}

/// True when the payload's `id` or `order_id` is numerically `order_id`.
pub fn names_order(raw: &Value, order_id: i64) -> bool {
    let payload = payload(raw, &["msg", "result"]);
    ["id", "order_id"]
        .iter()
        .any(|k| payload.get(*k).and_then(as_f64) == Some(order_id as f64))
}

/// Any message naming `order_id` under `id` or `order_id`.
pub fn status_matcher(order_id: i64) -> Matcher<Value> {
    Matcher::new(
        "order-status",
        move |raw: &InboundMessage| names_order(raw, order_id),
        |raw: &InboundMessage| raw.clone(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_payload_precedence() {
        let raw = json!({"msg": null, "result": {"a": 1}, "message": {"b": 2}});
        assert_eq!(payload(&raw, &["msg", "result", "message"]), &json!({"a": 1}));
        let raw = json!({"x": 1});
        assert_eq!(payload(&raw, &["msg"]), &raw);
    }

    #[test]
    fn test_balance_shapes() {
        assert!(balance_list(&json!({"msg": [{"id": 1}]})).is_some());
        assert!(balance_list(&json!({"message": {"balances": []}})).is_some());
        assert!(balance_list(&json!({"msg": {"result": {"balances": [{}]}}})).is_some());
        assert!(balance_list(&json!([{"id": 1}])).is_some());
        assert!(balance_list(&json!({"msg": {"balances": "nope"}})).is_none());
        assert!(balance_list(&json!({"name": "timeSync", "msg": 1723456789})).is_none());
    }

    #[test]
    fn test_normalize_balance_is_total() {
        let b = normalize_balance(&json!({
            "id": "77",
            "type": 4,
            "amount": "12.5",
            "currency": "USD",
            "is_fiat": 1,
            "hold_amount": {"weird": true}
        }));
        assert_eq!(b.id, 77);
        assert_eq!(b.balance_type, 4);
        assert_eq!(b.amount, 12.5);
        assert_eq!(b.hold_amount, 0.0);
        assert_eq!(b.currency, "USD");
        assert!(b.is_fiat);
        assert!(!b.has_deposits);

        assert_eq!(normalize_balance(&json!("garbage")), Balance::default());
    }

    #[test]
    fn test_extract_filters_by_type() {
        let raw = json!({"msg": [{"id": 1, "type": 1}, {"id": 2, "type": 4}, {"id": 3, "type": 2}]});
        let ids: Vec<i64> = extract_balances(&raw, &[1, 4]).iter().map(|b| b.id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(extract_balances(&raw, &[]).len(), 3);
    }

    #[test]
    fn test_find_instrument() {
        let raw = json!({
            "name": "instruments",
            "msg": {"instruments": [
                {"ticker": "GBPUSD", "id": "do2"},
                {"ticker": "eurusd", "id": 1861}
            ]}
        });
        assert_eq!(find_instrument(&raw, "EURUSD").as_deref(), Some("1861"));
        assert_eq!(find_instrument(&raw, "USDJPY"), None);

        let unnamed = json!({"msg": {"instruments": [{"ticker": "EURUSD", "id": 1}]}});
        assert_eq!(find_instrument(&unnamed, "EURUSD"), None);

        let no_id = json!({"name": "instruments", "msg": {"instruments": [{"ticker": "EURUSD"}]}});
        assert_eq!(find_instrument(&no_id, "EURUSD"), None);
    }

    #[test]
    fn test_order_id_reads_nonzero_ids() {
        assert_eq!(order_id(&json!({"name": "order", "msg": {"id": 9001}})), Some(9001));
        assert_eq!(order_id(&json!({"result": {"order_id": "42"}})), Some(42));
        assert_eq!(order_id(&json!({"name": "order-placed-temp", "msg": {"id": 0}})), None);
        assert_eq!(order_id(&json!({"name": "heartbeat"})), None);
    }

    #[test]
    fn test_status_match_is_exact() {
        assert!(names_order(&json!({"msg": {"id": 123}}), 123));
        assert!(names_order(&json!({"result": {"order_id": "123"}}), 123));
        assert!(!names_order(&json!({"msg": {"id": 123.7}}), 123));
        assert!(!names_order(&json!({"msg": {"order_id": 124}}), 123));
        assert!(!names_order(&json!({"msg": {"status": "closed"}}), 123));
    }

    #[test]
    fn test_rejection_detection() {
        assert!(is_rejection(&json!({"name": "order-placed-temp", "status": 4000})));
        assert!(!is_rejection(&json!({"name": "order-placed-temp", "status": 200})));
        assert!(!is_rejection(&json!({"name": "order-placed-temp"})));
        assert!(!is_rejection(&json!({"name": "order", "status": 500})));
    }
}
