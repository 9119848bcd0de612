use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for connecting to IQ Option.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IqOptionConfig {
    /// Streaming endpoint.
    pub ws_url: String,
    /// HTTP login endpoint.
    pub login_url: String,
    /// HTTP session check endpoint.
    pub session_url: String,
    /// HTTP profile endpoint.
    pub profile_url: String,
    /// Timeout for plain HTTP calls, in seconds.
    pub http_timeout_secs: u64,
    /// Messages kept per exchange for diagnostics.
    pub transcript_cap: usize,
    pub timeouts: ExchangeTimeouts,
}

impl Default for IqOptionConfig {
    fn default() -> Self {
        Self {
            ws_url: "wss://iqoption.com/echo/websocket".to_string(),
            login_url: "https://auth.iqoption.com/api/v2/login".to_string(),
            session_url: "https://auth.iqoption.com/api/v1/session".to_string(),
            profile_url: "https://iqoption.com/api/getprofile".to_string(),
            http_timeout_secs: 10,
            transcript_cap: 64,
            timeouts: ExchangeTimeouts::default(),
        }
    }
}

/// Deadlines and settle delays per exchange, in milliseconds.
///
/// The deadlines keep an HTTP caller waiting a few seconds at most.
/// Instrument lookups get longer because "auto" may run two of them back
/// to back.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeTimeouts {
    pub balances_ms: u64,
    pub balances_settle_ms: u64,
    pub instruments_ms: u64,
    pub instruments_settle_ms: u64,
    pub place_order_ms: u64,
    pub place_order_settle_ms: u64,
    pub order_status_ms: u64,
    pub order_status_settle_ms: u64,
}

impl Default for ExchangeTimeouts {
    fn default() -> Self {
        Self {
            balances_ms: 4_000,
            balances_settle_ms: 50,
            instruments_ms: 6_000,
            instruments_settle_ms: 50,
            place_order_ms: 5_000,
            place_order_settle_ms: 150,
            order_status_ms: 4_000,
            order_status_settle_ms: 50,
        }
    }
}

impl ExchangeTimeouts {
    pub fn balances(&self) -> (Duration, Duration) {
        (ms(self.balances_ms), ms(self.balances_settle_ms))
    }

    pub fn instruments(&self) -> (Duration, Duration) {
        (ms(self.instruments_ms), ms(self.instruments_settle_ms))
    }

    pub fn place_order(&self) -> (Duration, Duration) {
        (ms(self.place_order_ms), ms(self.place_order_settle_ms))
    }

    pub fn order_status(&self) -> (Duration, Duration) {
        (ms(self.order_status_ms), ms(self.order_status_settle_ms))
    }
}

fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config: IqOptionConfig =
            serde_json::from_str(r#"{"timeouts": {"balances_ms": 2500}}"#).unwrap();
        assert_eq!(config.timeouts.balances_ms, 2_500);
        assert_eq!(config.timeouts.place_order_ms, 5_000);
        assert_eq!(config.ws_url, "wss://iqoption.com/echo/websocket");
    }
}
