use chrono::NaiveDate;
use optbridge_core::{DailyResult, InstrumentType, OrderRecord, Side};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

/// Run embedded migrations.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("../../migrations").run(pool).await?;
    Ok(())
}

/// Insert an order record.
pub async fn insert_order(pool: &PgPool, order: &OrderRecord) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO orders (
            id, user_balance_id, instrument_type, instrument_id, side, amount,
            leverage, limit_price, stop_price, stop_lose_value, stop_lose_kind,
            take_profit_value, take_profit_kind, broker_order_id, status,
            raw_place_response, created_at, updated_at
        ) VALUES (
            $1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
            $11, $12, $13, $14, $15, $16, $17, $18
        )",
    )
    .bind(order.id)
    .bind(order.user_balance_id)
    .bind(order.instrument_type.as_str())
    .bind(&order.instrument_id)
    .bind(order.side.as_str())
    .bind(order.amount)
    .bind(order.leverage)
    .bind(order.limit_price)
    .bind(order.stop_price)
    .bind(order.stop_lose_value)
    .bind(&order.stop_lose_kind)
    .bind(order.take_profit_value)
    .bind(&order.take_profit_kind)
    .bind(order.broker_order_id)
    .bind(&order.status)
    .bind(&order.raw_place_response)
    .bind(order.created_at)
    .bind(order.updated_at)
    .execute(pool)
    .await?;
    Ok(())
}

/// All orders, newest first.
pub async fn load_orders(pool: &PgPool) -> Result<Vec<OrderRecord>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT id, user_balance_id, instrument_type, instrument_id, side, amount,
                leverage, limit_price, stop_price, stop_lose_value, stop_lose_kind,
                take_profit_value, take_profit_kind, broker_order_id, status,
                raw_place_response, created_at, updated_at
         FROM orders
         ORDER BY created_at DESC",
    )
    .fetch_all(pool)
    .await?;

    rows.iter().map(order_from_row).collect()
}

fn order_from_row(r: &PgRow) -> Result<OrderRecord, sqlx::Error> {
    let instrument_type: String = r.try_get("instrument_type")?;
    let side: String = r.try_get("side")?;
    Ok(OrderRecord {
        id: r.try_get("id")?,
        user_balance_id: r.try_get("user_balance_id")?,
        instrument_type: parse_text::<InstrumentType>("instrument_type", &instrument_type)?,
        instrument_id: r.try_get("instrument_id")?,
        side: parse_text::<Side>("side", &side)?,
        amount: r.try_get("amount")?,
        leverage: r.try_get("leverage")?,
        limit_price: r.try_get("limit_price")?,
        stop_price: r.try_get("stop_price")?,
        stop_lose_value: r.try_get("stop_lose_value")?,
        stop_lose_kind: r.try_get("stop_lose_kind")?,
        take_profit_value: r.try_get("take_profit_value")?,
        take_profit_kind: r.try_get("take_profit_kind")?,
        broker_order_id: r.try_get("broker_order_id")?,
        status: r.try_get("status")?,
        raw_place_response: r.try_get("raw_place_response")?,
        created_at: r.try_get("created_at")?,
        updated_at: r.try_get("updated_at")?,
    })
}

/// Decode a serde enum stored as its text form.
fn parse_text<T: serde::de::DeserializeOwned>(column: &str, value: &str) -> Result<T, sqlx::Error> {
    serde_json::from_value(serde_json::Value::String(value.to_string())).map_err(|e| {
        sqlx::Error::ColumnDecode {
            index: column.to_string(),
            source: Box::new(e),
        }
    })
}

/// Insert or replace the row for (date, account).
pub async fn upsert_result(pool: &PgPool, result: &DailyResult) -> Result<DailyResult, sqlx::Error> {
    let row = sqlx::query(
        "INSERT INTO daily_results (
            date, account, win, loss, tie, max_consecutive_win, max_consecutive_loss,
            consecutive_win, consecutive_loss
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ON CONFLICT (date, account) DO UPDATE
        SET win = EXCLUDED.win, loss = EXCLUDED.loss, tie = EXCLUDED.tie,
            max_consecutive_win = EXCLUDED.max_consecutive_win,
            max_consecutive_loss = EXCLUDED.max_consecutive_loss,
            consecutive_win = EXCLUDED.consecutive_win,
            consecutive_loss = EXCLUDED.consecutive_loss,
            updated_at = now()
        RETURNING date, account, win, loss, tie, max_consecutive_win, max_consecutive_loss,
                  consecutive_win, consecutive_loss",
    )
    .bind(result.date)
    .bind(&result.account)
    .bind(counter(result.win))
    .bind(counter(result.loss))
    .bind(counter(result.tie))
    .bind(counter(result.max_consecutive_win))
    .bind(counter(result.max_consecutive_loss))
    .bind(counter(result.consecutive_win))
    .bind(counter(result.consecutive_loss))
    .fetch_one(pool)
    .await?;

    result_from_row(&row)
}

/// Result rows filtered by account and/or date, newest first.
pub async fn load_results(
    pool: &PgPool,
    account: Option<&str>,
    date: Option<NaiveDate>,
) -> Result<Vec<DailyResult>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT date, account, win, loss, tie, max_consecutive_win, max_consecutive_loss,
                consecutive_win, consecutive_loss
         FROM daily_results
         WHERE ($1::TEXT IS NULL OR account = $1)
           AND ($2::DATE IS NULL OR date = $2)
         ORDER BY account ASC, date DESC",
    )
    .bind(account)
    .bind(date)
    .fetch_all(pool)
    .await?;

    rows.iter().map(result_from_row).collect()
}

fn result_from_row(r: &PgRow) -> Result<DailyResult, sqlx::Error> {
    let get = |column: &str| -> Result<u32, sqlx::Error> {
        let value: i32 = r.try_get(column)?;
        Ok(value.max(0) as u32)
    };
    Ok(DailyResult {
        date: r.try_get("date")?,
        account: r.try_get("account")?,
        win: get("win")?,
        loss: get("loss")?,
        tie: get("tie")?,
        max_consecutive_win: get("max_consecutive_win")?,
        max_consecutive_loss: get("max_consecutive_loss")?,
        consecutive_win: get("consecutive_win")?,
        consecutive_loss: get("consecutive_loss")?,
    })
}

/// Counters are non-negative and stored as INTEGER.
fn counter(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}
