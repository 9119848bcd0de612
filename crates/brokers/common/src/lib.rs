//! Streaming RPC correlation engine.
//!
//! Many request/response exchanges share one streaming connection whose
//! replies carry no request id. Each exchange registers a predicate; a single
//! dispatcher offers every inbound message to the registered exchanges in
//! registration order, and a deadline fails whatever never matched.

pub mod connection;
pub mod correlator;
pub mod dispatcher;
pub mod exchange;
pub mod simulated;
pub mod transport;

pub use connection::{ConnectionManager, Readiness};
pub use correlator::{
    Claim, Correlator, ExchangeFailure, ExchangeHandle, ExchangeId, FailureKind, Matched, Matcher,
    Resolution, ResultSlot,
};
pub use dispatcher::Dispatcher;
pub use exchange::{Engine, EngineConfig, ExchangePhase, ExchangeSpec};
pub use transport::{EventSink, Transport};
