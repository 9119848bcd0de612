use optbridge_core::{InstrumentType, Side};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Inner request carried by `sendMessage` / `subscribeMessage` frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub name: String,
    pub version: String,
    pub body: Value,
}

impl Request {
    fn new(name: &str, version: &str, body: Value) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
            body,
        }
    }
}

/// Frames sent TO the venue.
///
/// Serializes as `{"name": <variant>, "msg": <payload>}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "msg")]
pub enum OutboundMessage {
    /// Session token handshake.
    #[serde(rename = "ssid")]
    Ssid(String),
    #[serde(rename = "sendMessage")]
    SendMessage(Request),
    #[serde(rename = "subscribeMessage")]
    SubscribeMessage(Request),
}

impl OutboundMessage {
    pub fn to_value(&self) -> Value {
        // Every variant is a plain string or JSON tree, serialization cannot fail.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Name of the inner request, if any.
    pub fn request_name(&self) -> Option<&str> {
        match self {
            OutboundMessage::Ssid(_) => None,
            OutboundMessage::SendMessage(r) | OutboundMessage::SubscribeMessage(r) => {
                Some(r.name.as_str())
            }
        }
    }
}

/// Body of a `place-order-temp` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceOrderBody {
    pub user_balance_id: i64,
    pub instrument_type: InstrumentType,
    pub instrument_id: String,
    pub side: Side,
    pub amount: Decimal,
}

pub fn authenticate(token: &str) -> OutboundMessage {
    OutboundMessage::Ssid(token.to_string())
}

pub fn get_balances(types: &[i64]) -> OutboundMessage {
    OutboundMessage::SendMessage(Request::new(
        "get-balances",
        "1.0",
        json!({ "types_ids": types }),
    ))
}

pub fn get_instruments(instrument_type: InstrumentType) -> OutboundMessage {
    OutboundMessage::SendMessage(Request::new(
        "get-instruments",
        "4.0",
        json!({ "type": instrument_type.as_str() }),
    ))
}

/// Subscribe to an instrument list scoped to the caller's user group.
///
/// `user_group_id` is sent only when nonzero and `is_regulated` only when set.
pub fn subscribe_instruments(
    instrument_type: InstrumentType,
    user_group_id: i64,
    is_regulated: bool,
) -> OutboundMessage {
    let mut filters = json!({ "type": instrument_type.as_str() });
    if user_group_id != 0 {
        filters["user_group_id"] = json!(user_group_id);
    }
    if is_regulated {
        filters["is_regulated"] = json!(true);
    }
    OutboundMessage::SubscribeMessage(Request::new(
        "instruments-changed",
        "5.0",
        json!({ "routingFilters": filters }),
    ))
}

pub fn place_order(body: &PlaceOrderBody) -> OutboundMessage {
    OutboundMessage::SendMessage(Request::new(
        "place-order-temp",
        "4.0",
        serde_json::to_value(body).unwrap_or(Value::Null),
    ))
}

pub fn subscribe_order_state() -> OutboundMessage {
    OutboundMessage::SubscribeMessage(Request::new(
        "portfolio.order-changed",
        "2.0",
        json!({ "routingFilters": { "instrument_type": InstrumentType::DigitalOption.as_str() } }),
    ))
}
