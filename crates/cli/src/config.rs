use anyhow::{Context, Result};
use optbridge_brokers_iqoption::IqOptionConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level configuration, read from an optional TOML file.
///
/// Every field has a default, so an empty file (or none) is valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Address the API server binds to.
    pub bind: String,
    /// Postgres URL. Without one, orders and results live in memory.
    pub database_url: Option<String>,
    pub iqoption: IqOptionConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:3000".to_string(),
            database_url: None,
            iqoption: IqOptionConfig::default(),
        }
    }
}

impl BridgeConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config {}", path.display()))?;
                Self::parse(&text).with_context(|| format!("parsing config {}", path.display()))
            }
            None => Ok(Self::default()),
        }
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = BridgeConfig::parse("").unwrap();
        assert_eq!(config.bind, "0.0.0.0:3000");
        assert!(config.database_url.is_none());
        assert_eq!(config.iqoption.timeouts.place_order_ms, 5_000);
    }

    #[test]
    fn test_partial_overrides() {
        let config = BridgeConfig::parse(
            r#"
            bind = "127.0.0.1:8080"
            database_url = "postgres://optbridge@localhost/optbridge"

            [iqoption]
            transcript_cap = 16

            [iqoption.timeouts]
            balances_ms = 2500
            "#,
        )
        .unwrap();
        assert_eq!(config.bind, "127.0.0.1:8080");
        assert_eq!(config.iqoption.transcript_cap, 16);
        assert_eq!(config.iqoption.timeouts.balances_ms, 2_500);
        assert_eq!(config.iqoption.timeouts.balances_settle_ms, 50);
        assert_eq!(config.iqoption.ws_url, "wss://iqoption.com/echo/websocket");
    }

    #[test]
    fn test_unknown_types_are_rejected() {
        assert!(BridgeConfig::parse("bind = 3000").is_err());
    }
}
