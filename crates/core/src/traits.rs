use crate::models::*;
use async_trait::async_trait;
use chrono::NaiveDate;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors surfaced by bridge operations.
///
/// `Client` and `Session` are raised before any exchange is registered.
/// Exchange timeouts and connection loss are reported as failed results,
/// not as errors; `ConnectionLost` here only covers failures to open or
/// write to the connection.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Bad request: {0}")]
    Client(String),
    #[error("No authenticated session: {0}")]
    Session(String),
    #[error("Connection lost: {0}")]
    ConnectionLost(String),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("HTTP error: {0}")]
    Http(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from the persistence layer.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

// ---------------------------------------------------------------------------
// Session Provider
// ---------------------------------------------------------------------------

/// HTTP-level session with the venue.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// Log in with credentials.
    async fn login(&self, credentials: &LoginRequest) -> Result<LoginOutcome, BridgeError>;

    /// Confirm an authenticated session exists.
    async fn establish_session(&self) -> Result<(), BridgeError>;

    /// Fetch the account profile.
    async fn profile(&self) -> Result<Profile, BridgeError>;

    /// Token sent as the streaming handshake, once logged in.
    fn handshake_token(&self) -> Option<String>;
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

/// Stores orders acknowledged by the venue.
#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn save_order(&self, order: &OrderRecord) -> Result<(), StoreError>;

    /// All stored orders, newest first.
    async fn list_orders(&self) -> Result<Vec<OrderRecord>, StoreError>;
}

/// Stores daily win/loss statistics.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Insert or replace the row for (date, account).
    async fn upsert_result(&self, result: &DailyResult) -> Result<DailyResult, StoreError>;

    /// Rows filtered by account and/or date.
    async fn list_results(
        &self,
        account: Option<&str>,
        date: Option<NaiveDate>,
    ) -> Result<Vec<DailyResult>, StoreError>;
}
