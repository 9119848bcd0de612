pub mod db;
pub mod memory;

use async_trait::async_trait;
use chrono::NaiveDate;
use optbridge_core::{DailyResult, OrderRecord, OrderStore, ResultStore, StoreError};
use tracing::debug;

pub use memory::MemoryStore;

/// A PostgreSQL-backed store for orders and daily results.
pub struct PgStore {
    pub pool: sqlx::PgPool,
}

impl PgStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `database_url` and apply pending migrations.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(db_error)?;
        db::run_migrations(&pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(Self::new(pool))
    }
}

fn db_error(e: sqlx::Error) -> StoreError {
    match e {
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreError::Serialization(e.to_string())
        }
        other => StoreError::Database(other.to_string()),
    }
}

#[async_trait]
impl OrderStore for PgStore {
    async fn save_order(&self, order: &OrderRecord) -> Result<(), StoreError> {
        db::insert_order(&self.pool, order).await.map_err(db_error)?;
        debug!(broker_order_id = order.broker_order_id, "Order stored");
        Ok(())
    }

    async fn list_orders(&self) -> Result<Vec<OrderRecord>, StoreError> {
        db::load_orders(&self.pool).await.map_err(db_error)
    }
}

#[async_trait]
impl ResultStore for PgStore {
    async fn upsert_result(&self, result: &DailyResult) -> Result<DailyResult, StoreError> {
        db::upsert_result(&self.pool, result).await.map_err(db_error)
    }

    async fn list_results(
        &self,
        account: Option<&str>,
        date: Option<NaiveDate>,
    ) -> Result<Vec<DailyResult>, StoreError> {
        db::load_results(&self.pool, account, date)
            .await
            .map_err(db_error)
    }
}
