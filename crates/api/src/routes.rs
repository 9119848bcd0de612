use crate::error::ApiError;
use crate::state::AppState;
use axum::{
    extract::rejection::{JsonRejection, QueryRejection},
    extract::{Path, Query, State},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDate;
use optbridge_core::{
    group_results, parse_balance_types, DailyResult, InstrumentLookup, LoginRequest,
    PlaceOrderRequest,
};
use serde::Deserialize;
use std::sync::Arc;

pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        // Health
        .route("/health", get(health_check))
        // Session
        .route("/auth/login", post(login))
        // Venue operations
        .route("/balance", get(get_balances))
        .route("/instruments/resolve", get(resolve_instrument))
        .route("/orders", get(list_orders).post(place_order))
        .route("/orders/{id}/status", get(order_status))
        // Daily results
        .route("/results/upsert", post(upsert_result))
        .route("/results", get(list_results))
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "stream": state.broker.engine().connection().state(),
    }))
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

async fn login(
    State(state): State<Arc<AppState>>,
    body: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(credentials) = body?;
    if credentials.identifier.trim().is_empty() || credentials.password.is_empty() {
        return Err(ApiError::BadRequest(
            "identifier and password are required".to_string(),
        ));
    }
    Ok(Json(state.broker.login(&credentials).await?))
}

// ---------------------------------------------------------------------------
// Venue operations
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct BalanceQuery {
    types: Option<String>,
}

async fn get_balances(
    State(state): State<Arc<AppState>>,
    query: Result<Query<BalanceQuery>, QueryRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Query(query) = query?;
    let types = parse_balance_types(query.types.as_deref());
    Ok(Json(state.broker.get_balances(&types).await))
}

#[derive(Deserialize)]
struct ResolveQuery {
    #[serde(rename = "type")]
    lookup: Option<String>,
    ticker: Option<String>,
}

async fn resolve_instrument(
    State(state): State<Arc<AppState>>,
    query: Result<Query<ResolveQuery>, QueryRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Query(query) = query?;
    let lookup: InstrumentLookup = query.lookup.as_deref().unwrap_or("auto").parse()?;
    let ticker = query
        .ticker
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest("ticker is required".to_string()))?;
    Ok(Json(state.broker.resolve_instrument(lookup, &ticker).await?))
}

async fn place_order(
    State(state): State<Arc<AppState>>,
    body: Result<Json<PlaceOrderRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(request) = body?;
    Ok(Json(state.broker.place_order(request).await?))
}

async fn list_orders(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.orders.list_orders().await?))
}

async fn order_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.broker.order_status(id).await?))
}

// ---------------------------------------------------------------------------
// Daily results
// ---------------------------------------------------------------------------

async fn upsert_result(
    State(state): State<Arc<AppState>>,
    body: Result<Json<DailyResult>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(mut result) = body?;
    result.account = result.account.trim().to_string();
    if result.account.is_empty() {
        return Err(ApiError::BadRequest("account is required".to_string()));
    }
    Ok(Json(state.results.upsert_result(&result).await?))
}

#[derive(Deserialize)]
struct ResultsQuery {
    account: Option<String>,
    date: Option<String>,
}

async fn list_results(
    State(state): State<Arc<AppState>>,
    query: Result<Query<ResultsQuery>, QueryRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Query(query) = query?;
    let date = match query.date.as_deref().filter(|d| !d.is_empty()) {
        Some(raw) => Some(NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| {
            ApiError::BadRequest(format!("invalid date '{}', expected YYYY-MM-DD", raw))
        })?),
        None => None,
    };
    let account = query.account.as_deref().filter(|a| !a.is_empty());
    let rows = state.results.list_results(account, date).await?;
    Ok(Json(group_results(&rows)))
}
