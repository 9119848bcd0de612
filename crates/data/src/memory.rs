use async_trait::async_trait;
use chrono::NaiveDate;
use optbridge_core::{DailyResult, OrderRecord, OrderStore, ResultStore, StoreError};
use std::collections::BTreeMap;
use tokio::sync::RwLock;

/// In-process store for running without a database, and for tests.
#[derive(Default)]
pub struct MemoryStore {
    orders: RwLock<Vec<OrderRecord>>,
    results: RwLock<BTreeMap<(NaiveDate, String), DailyResult>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OrderStore for MemoryStore {
    async fn save_order(&self, order: &OrderRecord) -> Result<(), StoreError> {
        self.orders.write().await.push(order.clone());
        Ok(())
    }

    async fn list_orders(&self) -> Result<Vec<OrderRecord>, StoreError> {
        let mut orders = self.orders.read().await.clone();
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(orders)
    }
}

#[async_trait]
impl ResultStore for MemoryStore {
    async fn upsert_result(&self, result: &DailyResult) -> Result<DailyResult, StoreError> {
        self.results
            .write()
            .await
            .insert((result.date, result.account.clone()), result.clone());
        Ok(result.clone())
    }

    async fn list_results(
        &self,
        account: Option<&str>,
        date: Option<NaiveDate>,
    ) -> Result<Vec<DailyResult>, StoreError> {
        let mut rows: Vec<DailyResult> = self
            .results
            .read()
            .await
            .values()
            .filter(|r| account.map_or(true, |a| r.account == a))
            .filter(|r| date.map_or(true, |d| r.date == d))
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.account.cmp(&b.account).then(b.date.cmp(&a.date)));
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use optbridge_core::{InstrumentType, Side};
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn day(d: u32, account: &str, win: u32) -> DailyResult {
        DailyResult {
            date: NaiveDate::from_ymd_opt(2025, 8, d).unwrap(),
            account: account.to_string(),
            win,
            loss: 0,
            tie: 0,
            max_consecutive_win: 0,
            max_consecutive_loss: 0,
            consecutive_win: 0,
            consecutive_loss: 0,
        }
    }

    fn order(broker_order_id: i64, age_secs: i64) -> OrderRecord {
        let at = Utc::now() - Duration::seconds(age_secs);
        OrderRecord {
            id: Uuid::new_v4(),
            user_balance_id: 1,
            instrument_type: InstrumentType::DigitalOption,
            instrument_id: "1861".to_string(),
            side: Side::Buy,
            amount: dec!(5),
            leverage: 1,
            limit_price: dec!(0),
            stop_price: dec!(0),
            stop_lose_value: dec!(0),
            stop_lose_kind: "percent".to_string(),
            take_profit_value: dec!(0),
            take_profit_kind: "percent".to_string(),
            broker_order_id,
            status: "created".to_string(),
            raw_place_response: serde_json::json!({"id": broker_order_id}),
            created_at: at,
            updated_at: at,
        }
    }

    #[tokio::test]
    async fn test_upsert_replaces_same_key() {
        let store = MemoryStore::new();
        store.upsert_result(&day(12, "demo-1", 3)).await.unwrap();
        store.upsert_result(&day(12, "demo-1", 5)).await.unwrap();
        store.upsert_result(&day(11, "demo-1", 1)).await.unwrap();

        let rows = store.list_results(Some("demo-1"), None).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].win, 5);
        assert_eq!(rows[1].date, NaiveDate::from_ymd_opt(2025, 8, 11).unwrap());
    }

    #[tokio::test]
    async fn test_list_results_filters() {
        let store = MemoryStore::new();
        store.upsert_result(&day(12, "a", 1)).await.unwrap();
        store.upsert_result(&day(12, "b", 2)).await.unwrap();
        store.upsert_result(&day(13, "b", 3)).await.unwrap();

        let date = NaiveDate::from_ymd_opt(2025, 8, 12);
        assert_eq!(store.list_results(None, date).await.unwrap().len(), 2);
        assert_eq!(store.list_results(Some("b"), date).await.unwrap()[0].win, 2);
        assert_eq!(store.list_results(None, None).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_orders_newest_first() {
        let store = MemoryStore::new();
        store.save_order(&order(1, 60)).await.unwrap();
        store.save_order(&order(2, 0)).await.unwrap();
        store.save_order(&order(3, 30)).await.unwrap();

        let ids: Vec<i64> = store
            .list_orders()
            .await
            .unwrap()
            .iter()
            .map(|o| o.broker_order_id)
            .collect();
        assert_eq!(ids, vec![2, 3, 1]);
    }
}
