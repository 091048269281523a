// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. Health requires no authentication.
// Every other endpoint requires a valid Bearer token checked via the
// `AuthBearer` extractor; the WebSocket feed takes it as `?token=`.
//
// Errors are returned as `{"error": "..."}` with a status code that reflects
// the cause: 400 invalid input, 404 unknown id, 409 duplicate, 502 broker,
// 503 when the stream connections needed for an account switch are absent.
//
// CORS is configured permissively for development.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::api::auth::AuthBearer;
use crate::app_state::AppState;
use crate::broker::{BrokerError, OrderStatusFilter};
use crate::execution::{self, EntryRequest, ExecutionError};
use crate::exit::engine::EngineError;
use crate::exit::strategy::{StrategySpec, StrategyStatus};
use crate::stream::quotes::SubscriptionError;
use crate::types::AccountMode;

type ApiError = (StatusCode, Json<Value>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        let status = match &e {
            EngineError::Invalid(_) => StatusCode::BAD_REQUEST,
            EngineError::Duplicate(_) => StatusCode::CONFLICT,
            EngineError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            EngineError::Broker(_) => StatusCode::BAD_GATEWAY,
        };
        api_error(status, e.to_string())
    }
}

fn broker_error(state: &AppState, order_id: &str, e: BrokerError) -> ApiError {
    state.push_error_with_code(e.to_string(), Some(order_id.to_string()));
    api_error(StatusCode::BAD_GATEWAY, e.to_string())
}

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        // ── Authenticated ───────────────────────────────────────────
        .route("/api/v1/status", get(status))
        .route("/api/v1/mode", get(account_mode).post(switch_account_mode))
        .route("/api/v1/account", get(account))
        .route("/api/v1/positions", get(positions))
        .route("/api/v1/orders", get(list_orders).post(place_order))
        .route("/api/v1/orders/:order_id", get(get_order))
        .route("/api/v1/orders/:order_id/cancel", post(cancel_order))
        .route("/api/v1/orders/:order_id/fill-status", get(fill_status))
        .route(
            "/api/v1/exit-strategies",
            get(list_exit_strategies).post(register_exit_strategy),
        )
        .route(
            "/api/v1/exit-strategies/:order_id",
            get(get_exit_strategy).delete(delete_exit_strategy),
        )
        .route(
            "/api/v1/exit-strategies/:order_id/check-trigger",
            get(check_trigger),
        )
        .route("/api/v1/quotes/subscriptions", get(quote_subscriptions))
        .route("/api/v1/quotes/subscribe", post(subscribe_quotes))
        .route("/api/v1/quotes/unsubscribe", post(unsubscribe_quotes))
        .route("/api/v1/quotes/:symbol", get(latest_quote))
        // ── WebSocket ───────────────────────────────────────────────
        .route("/api/v1/ws", get(crate::api::ws::ws_handler))
        // ── Middleware & State ───────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health (public) & status
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    state_version: u64,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        state_version: state.current_state_version(),
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

async fn status(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.build_status())
}

// =============================================================================
// Account mode
// =============================================================================

fn mode_body(mode: AccountMode) -> Value {
    json!({
        "paper": mode == AccountMode::Paper,
        "environment": mode.to_string(),
    })
}

async fn account_mode(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(mode_body(state.account_mode()))
}

#[derive(Deserialize)]
struct ModeRequest {
    paper: bool,
    #[serde(default)]
    confirm_live: bool,
}

async fn switch_account_mode(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(req): Json<ModeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let mode = if req.paper {
        AccountMode::Paper
    } else {
        if !req.confirm_live {
            return Err(api_error(
                StatusCode::BAD_REQUEST,
                "Switching to the live account requires confirm_live: true",
            ));
        }
        AccountMode::Live
    };
    if state.connections.is_none() {
        return Err(api_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "Stream connections are not running",
        ));
    }

    let changed = state.switch_account_mode(mode).await.map_err(|e| {
        warn!(account_mode = %mode, error = %format!("{e:#}"), "account switch failed");
        state.push_error_with_code(format!("{e:#}"), Some("account_mode".into()));
        api_error(StatusCode::BAD_REQUEST, format!("{e:#}"))
    })?;
    if changed {
        warn!(account_mode = %mode, "account mode switched via API");
    }

    let mut body = mode_body(mode);
    body["changed"] = json!(changed);
    Ok(Json(body))
}

// =============================================================================
// Account, positions & order lookups
// =============================================================================

async fn account(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let account = state
        .engine
        .broker()
        .get_account()
        .await
        .map_err(|e| broker_error(&state, "account", e))?;
    Ok(Json(account))
}

async fn positions(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let positions = state
        .engine
        .broker()
        .list_positions()
        .await
        .map_err(|e| broker_error(&state, "positions", e))?;
    Ok(Json(json!({ "count": positions.len(), "positions": positions })))
}

#[derive(Deserialize)]
struct OrdersQuery {
    #[serde(default)]
    status: OrderStatusFilter,
}

async fn list_orders(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Query(query): Query<OrdersQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let orders = state
        .engine
        .broker()
        .list_orders(query.status)
        .await
        .map_err(|e| broker_error(&state, "orders", e))?;
    Ok(Json(json!({
        "status": query.status.as_str(),
        "count": orders.len(),
        "orders": orders,
    })))
}

async fn get_order(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let order = state
        .engine
        .broker()
        .get_order(&order_id)
        .await
        .map_err(|e| broker_error(&state, &order_id, e))?;
    Ok(Json(json!({
        "order": order,
        "exit_strategy": state.engine.get(&order_id),
    })))
}

// =============================================================================
// Entry orders
// =============================================================================

async fn place_order(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(req): Json<EntryRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let symbol = req.symbol.clone();
    match execution::place_entry(&state.engine, req).await {
        Ok(result) => {
            state.increment_version();
            if let Some(e) = &result.registration_error {
                state.push_error_with_code(
                    format!("exit strategy not registered: {e}"),
                    Some(result.order.id.clone()),
                );
            }
            Ok(Json(result))
        }
        Err(ExecutionError::Invalid(msg)) => Err(api_error(StatusCode::BAD_REQUEST, msg)),
        Err(e) => {
            warn!(symbol = %symbol, error = %e, "entry order failed");
            state.push_error_with_code(e.to_string(), Some(symbol));
            Err(api_error(StatusCode::BAD_GATEWAY, e.to_string()))
        }
    }
}

async fn cancel_order(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let removed = execution::cancel_entry(&state.engine, &order_id)
        .await
        .map_err(|e| broker_error(&state, &order_id, e))?;
    state.increment_version();
    Ok(Json(json!({
        "order_id": order_id,
        "canceled": true,
        "exit_strategy_removed": removed,
    })))
}

async fn fill_status(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let status = execution::fill_status(&state.engine, &order_id)
        .await
        .map_err(|e| broker_error(&state, &order_id, e))?;
    if status.exit.is_some() || status.removed {
        state.increment_version();
    }
    Ok(Json(status))
}

// =============================================================================
// Exit strategies
// =============================================================================

#[derive(Deserialize)]
struct RegisterRequest {
    order_id: String,
    #[serde(flatten)]
    spec: StrategySpec,
}

async fn register_exit_strategy(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let order_id = req.order_id.trim();
    if order_id.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "order_id is required"));
    }
    let record = state.engine.register(order_id, req.spec).await?;
    state.increment_version();
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "monitoring": record.monitoring(),
            "exit_strategy": record,
        })),
    ))
}

#[derive(Deserialize)]
struct ListQuery {
    status: Option<StrategyStatus>,
}

async fn list_exit_strategies(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> impl IntoResponse {
    let records = match query.status {
        Some(status) => state.engine.list_by_status(status),
        None => state.engine.list(),
    };
    Json(json!({
        "count": records.len(),
        "exit_strategies": records,
    }))
}

async fn get_exit_strategy(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .engine
        .get(&order_id)
        .map(Json)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "No exit strategy found"))
}

async fn delete_exit_strategy(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if !state.engine.remove(&order_id, "removed by user").await {
        return Err(api_error(StatusCode::NOT_FOUND, "No exit strategy found"));
    }
    state.increment_version();
    info!(order_id = %order_id, "exit strategy removed via API");
    Ok(Json(json!({ "order_id": order_id, "removed": true })))
}

async fn check_trigger(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<String>,
) -> impl IntoResponse {
    let check = state.engine.check_trigger(&order_id).await;
    if !check.found {
        return (StatusCode::NOT_FOUND, Json(check));
    }
    if check.triggered || check.fill.is_some() {
        state.increment_version();
    }
    if let (Some(e), false) = (&check.error, check.triggered) {
        state.push_error_with_code(e.clone(), Some(order_id));
    }
    (StatusCode::OK, Json(check))
}

// =============================================================================
// Quotes
// =============================================================================

#[derive(Deserialize)]
struct SymbolsRequest {
    #[serde(default)]
    symbols: Vec<String>,
}

fn subscription_error(e: SubscriptionError) -> ApiError {
    match e {
        SubscriptionError::Empty => api_error(StatusCode::BAD_REQUEST, "No symbols provided"),
        SubscriptionError::LimitExceeded { current_count, limit } => (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": e.to_string(),
                "current_count": current_count,
                "limit": limit,
            })),
        ),
    }
}

async fn quote_subscriptions(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let symbols = state.quotes.symbols();
    Json(json!({
        "count": symbols.len(),
        "symbols": symbols,
        "limit": state.quotes.limit(),
        "stream_connected": state.quotes.health().is_connected(),
    }))
}

async fn subscribe_quotes(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(req): Json<SymbolsRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let change = state.quotes.subscribe(&req.symbols).map_err(subscription_error)?;
    state.increment_version();
    Ok(Json(json!({
        "subscribed": change.symbols,
        "all_subscribed": change.all_subscribed,
        "count": change.count,
    })))
}

async fn unsubscribe_quotes(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(req): Json<SymbolsRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let change = state.quotes.unsubscribe(&req.symbols).map_err(subscription_error)?;
    state.increment_version();
    Ok(Json(json!({
        "unsubscribed": change.symbols,
        "all_subscribed": change.all_subscribed,
        "count": change.count,
    })))
}

/// Latest quote from the broker, plus the streamed tick when subscribed.
async fn latest_quote(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let symbol = symbol.trim().to_uppercase();
    let quote = state
        .engine
        .broker()
        .get_quote(&symbol)
        .await
        .map_err(|e| api_error(StatusCode::BAD_GATEWAY, e.to_string()))?;
    Ok(Json(json!({
        "mid": quote.last(),
        "quote": quote,
        "streamed": state.quotes.latest(&symbol),
    })))
}
