use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::traits::BridgeError;

// ---------------------------------------------------------------------------
// Instruments
// ---------------------------------------------------------------------------

/// Instrument families the venue trades.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstrumentType {
    Crypto,
    Forex,
    Cfd,
    #[default]
    DigitalOption,
    FxOption,
}

impl InstrumentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstrumentType::Crypto => "crypto",
            InstrumentType::Forex => "forex",
            InstrumentType::Cfd => "cfd",
            InstrumentType::DigitalOption => "digital-option",
            InstrumentType::FxOption => "fx-option",
        }
    }
}

/// Which instrument category an id lookup should search.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstrumentLookup {
    DigitalOption,
    FxOption,
    /// Try digital options first, then fx options.
    #[default]
    Auto,
}

impl InstrumentLookup {
    /// Categories to try, in order.
    pub fn categories(&self) -> &'static [InstrumentType] {
        match self {
            InstrumentLookup::DigitalOption => &[InstrumentType::DigitalOption],
            InstrumentLookup::FxOption => &[InstrumentType::FxOption],
            InstrumentLookup::Auto => &[InstrumentType::DigitalOption, InstrumentType::FxOption],
        }
    }
}

impl std::str::FromStr for InstrumentLookup {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "digital-option" => Ok(InstrumentLookup::DigitalOption),
            "fx-option" => Ok(InstrumentLookup::FxOption),
            "auto" | "" => Ok(InstrumentLookup::Auto),
            other => Err(BridgeError::Client(format!(
                "unknown instrument type '{}', expected digital-option, fx-option or auto",
                other
            ))),
        }
    }
}

/// Default ticker used when an order names no instrument.
pub const DEFAULT_TICKER: &str = "EURUSD";

/// True when an instrument id is really a ticker symbol (e.g. "EURUSD")
/// that still has to be resolved to a venue id.
pub fn looks_like_ticker(instrument_id: &str) -> bool {
    instrument_id.len() >= 6
        && instrument_id.chars().all(|c| c.is_ascii_alphabetic())
}

// ---------------------------------------------------------------------------
// Balances
// ---------------------------------------------------------------------------

/// Balance type id for real-money accounts.
pub const BALANCE_TYPE_REAL: i64 = 1;
/// Balance type id for practice accounts.
pub const BALANCE_TYPE_DEMO: i64 = 4;

/// Balance types requested when the caller names none.
pub const DEFAULT_BALANCE_TYPES: [i64; 2] = [BALANCE_TYPE_REAL, BALANCE_TYPE_DEMO];

/// Parse a comma-separated list of balance type ids ("1,4").
///
/// Blank entries and non-numeric entries are dropped. An empty result falls
/// back to [`DEFAULT_BALANCE_TYPES`].
pub fn parse_balance_types(raw: Option<&str>) -> Vec<i64> {
    let parsed: Vec<i64> = raw
        .unwrap_or("1,4")
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse::<i64>().ok())
        .collect();

    if parsed.is_empty() {
        DEFAULT_BALANCE_TYPES.to_vec()
    } else {
        parsed
    }
}

/// A normalized balance record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub id: i64,
    pub user_id: i64,
    /// 1 = REAL, 4 = DEMO.
    #[serde(rename = "type")]
    pub balance_type: i64,
    pub amount: f64,
    pub enrolled_amount: f64,
    pub enrolled_sum_amount: f64,
    pub hold_amount: f64,
    pub orders_amount: f64,
    pub currency: String,
    pub is_fiat: bool,
    pub is_marginal: bool,
    pub has_deposits: bool,
    pub auth_amount: f64,
    pub equivalent: f64,
}

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

impl std::str::FromStr for Side {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "buy" => Ok(Side::Buy),
            "sell" => Ok(Side::Sell),
            other => Err(BridgeError::Client(format!("invalid side '{}'", other))),
        }
    }
}

/// An order as submitted by a caller.
///
/// `side` and `action` stay loosely typed so that an invalid value is
/// reported as a client error instead of a deserialization failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaceOrderRequest {
    #[serde(default)]
    pub user_balance_id: i64,
    #[serde(default)]
    pub instrument_type: InstrumentType,
    /// Venue instrument id, or a ticker such as "EURUSD" to be resolved.
    #[serde(default)]
    pub instrument_id: Option<String>,
    /// "buy" or "sell".
    #[serde(default)]
    pub side: Option<String>,
    /// Shortcut: "CALL" maps to buy, "PUT" maps to sell.
    #[serde(default)]
    pub action: Option<String>,
    pub amount: Decimal,
    #[serde(default)]
    pub leverage: Option<i32>,
    #[serde(default)]
    pub limit_price: Option<Decimal>,
    #[serde(default)]
    pub stop_price: Option<Decimal>,
    #[serde(default)]
    pub stop_lose_value: Option<Decimal>,
    #[serde(default)]
    pub stop_lose_kind: Option<String>,
    #[serde(default)]
    pub take_profit_value: Option<Decimal>,
    #[serde(default)]
    pub take_profit_kind: Option<String>,
}

impl PlaceOrderRequest {
    /// Work out the logical side: the CALL/PUT shortcut wins, then `side`.
    pub fn resolve_side(&self) -> Result<Side, BridgeError> {
        match self.action.as_deref() {
            Some("CALL") => return Ok(Side::Buy),
            Some("PUT") => return Ok(Side::Sell),
            _ => {}
        }
        match self.side.as_deref() {
            Some("buy") => Ok(Side::Buy),
            Some("sell") => Ok(Side::Sell),
            _ => Err(BridgeError::Client(
                "Provide either action=CALL|PUT or side=buy|sell".to_string(),
            )),
        }
    }

    /// The ticker to resolve when the instrument id is absent or is a ticker.
    pub fn ticker_to_resolve(&self) -> Option<String> {
        match self.instrument_id.as_deref().map(str::trim) {
            None | Some("") => Some(DEFAULT_TICKER.to_string()),
            Some(id) if looks_like_ticker(id) => Some(id.to_ascii_uppercase()),
            Some(_) => None,
        }
    }
}

/// A placed order as persisted after the venue acknowledged it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRecord {
    pub id: Uuid,
    pub user_balance_id: i64,
    pub instrument_type: InstrumentType,
    pub instrument_id: String,
    pub side: Side,
    pub amount: Decimal,
    pub leverage: i32,
    pub limit_price: Decimal,
    pub stop_price: Decimal,
    pub stop_lose_value: Decimal,
    pub stop_lose_kind: String,
    pub take_profit_value: Decimal,
    pub take_profit_kind: String,
    /// Venue-assigned order id.
    pub broker_order_id: i64,
    pub status: String,
    pub raw_place_response: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OrderRecord {
    /// Build the stored record for an acknowledged order, applying defaults.
    pub fn from_request(
        req: &PlaceOrderRequest,
        side: Side,
        user_balance_id: i64,
        instrument_id: &str,
        broker_order_id: i64,
        status: Option<String>,
        raw: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_balance_id,
            instrument_type: req.instrument_type,
            instrument_id: instrument_id.to_string(),
            side,
            amount: req.amount,
            leverage: req.leverage.unwrap_or(1),
            limit_price: req.limit_price.unwrap_or(Decimal::ZERO),
            stop_price: req.stop_price.unwrap_or(Decimal::ZERO),
            stop_lose_value: req.stop_lose_value.unwrap_or(Decimal::ZERO),
            stop_lose_kind: req
                .stop_lose_kind
                .clone()
                .unwrap_or_else(|| "percent".to_string()),
            take_profit_value: req.take_profit_value.unwrap_or(Decimal::ZERO),
            take_profit_kind: req
                .take_profit_kind
                .clone()
                .unwrap_or_else(|| "percent".to_string()),
            broker_order_id,
            status: status.unwrap_or_else(|| "created".to_string()),
            raw_place_response: raw,
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Credentials for the venue's HTTP login.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub identifier: String,
    pub password: String,
    #[serde(default, rename = "twoFactorCode")]
    pub two_factor_code: Option<String>,
}

/// Result of an HTTP login attempt.
#[derive(Debug, Clone)]
pub struct LoginOutcome {
    pub success: bool,
    /// The venue's raw response body.
    pub raw: serde_json::Value,
}

/// The parts of the account profile used when placing orders.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub user_group_id: i64,
    pub is_regulated: bool,
    pub balance_id: i64,
}

// ---------------------------------------------------------------------------
// Daily Results
// ---------------------------------------------------------------------------

/// Win/loss statistics for one account on one day, keyed by (date, account).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyResult {
    pub date: NaiveDate,
    pub account: String,
    #[serde(default)]
    pub win: u32,
    #[serde(default)]
    pub loss: u32,
    #[serde(default)]
    pub tie: u32,
    #[serde(default)]
    pub max_consecutive_win: u32,
    #[serde(default)]
    pub max_consecutive_loss: u32,
    #[serde(default)]
    pub consecutive_win: u32,
    #[serde(default)]
    pub consecutive_loss: u32,
}

/// One row of a grouped results listing (the account is the group key).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultRow {
    pub date: NaiveDate,
    pub win: u32,
    pub loss: u32,
    pub tie: u32,
    pub max_consecutive_win: u32,
    pub max_consecutive_loss: u32,
    pub consecutive_win: u32,
    pub consecutive_loss: u32,
}

impl From<&DailyResult> for ResultRow {
    fn from(r: &DailyResult) -> Self {
        Self {
            date: r.date,
            win: r.win,
            loss: r.loss,
            tie: r.tie,
            max_consecutive_win: r.max_consecutive_win,
            max_consecutive_loss: r.max_consecutive_loss,
            consecutive_win: r.consecutive_win,
            consecutive_loss: r.consecutive_loss,
        }
    }
}

/// Group result rows by account; each group is ordered by date, newest first.
pub fn group_results(rows: &[DailyResult]) -> BTreeMap<String, Vec<ResultRow>> {
    let mut grouped: BTreeMap<String, Vec<ResultRow>> = BTreeMap::new();
    for row in rows {
        grouped
            .entry(row.account.clone())
            .or_default()
            .push(ResultRow::from(row));
    }
    for group in grouped.values_mut() {
        group.sort_by(|a, b| b.date.cmp(&a.date));
    }
    grouped
}

// ---------------------------------------------------------------------------
// Operation responses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    pub success: bool,
    /// Always null; the session lives in the cookie jar.
    pub token: Option<String>,
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalancesResponse {
    pub success: bool,
    pub balances: Vec<Balance>,
}

impl BalancesResponse {
    pub fn failed() -> Self {
        Self {
            success: false,
            balances: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentResolution {
    pub success: bool,
    pub instrument_id: Option<String>,
    /// Every message observed while resolving.
    pub raw: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaceOrderResponse {
    pub success: bool,
    #[serde(rename = "orderId", skip_serializing_if = "Option::is_none")]
    pub order_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderStatusResponse {
    pub success: bool,
    pub raw: serde_json::Value,
}
