//! IQ Option venue adapter.
//!
//! Talks to the venue over one WebSocket stream (`ws`) plus a cookie-based
//! HTTP session (`http`). The operations in `client` are built from the
//! exchange definitions in `exchanges` and run on the shared correlation
//! engine.

pub mod client;
pub mod config;
pub mod exchanges;
pub mod http;
pub mod protocol;
pub mod ws;

pub use client::IqOptionBroker;
pub use config::{ExchangeTimeouts, IqOptionConfig};
pub use http::HttpSession;
pub use ws::WsTransport;
