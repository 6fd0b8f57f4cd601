//! Admin HTTP API (spec §6): every route reads or mutates one trader,
//! selected by `?trader_id=` or the first registered trader when omitted.
//! All responses are JSON; all errors carry `{error: string}`.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::decision::DecisionRecord;
use crate::error::AppError;
use crate::exchange::ExchangeAdapter;
use crate::logger::{LogStatistics, PerformanceAnalysis};
use crate::manager::{TraderComparison, TraderManager};
use crate::models::{AccountSnapshot, Position};
use crate::trader::AutoTrader;

const MAX_DECISIONS: usize = 10000;
const LATEST_DECISIONS: usize = 5;
const MAX_PERFORMANCE_CYCLES: usize = 5000;
const MAX_FILLS: u32 = 100;

#[derive(Clone)]
pub struct ApiState {
    pub manager: Arc<TraderManager>,
}

pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/health", get(health))
        .route("/api/competition", get(competition))
        .route("/api/traders", get(list_traders))
        .route("/api/status", get(status))
        .route("/api/account", get(account))
        .route("/api/positions", get(positions))
        .route("/api/decisions", get(decisions))
        .route("/api/decisions/latest", get(decisions_latest))
        .route("/api/statistics", get(statistics))
        .route("/api/equity-history", get(equity_history))
        .route("/api/performance", get(performance))
        .route("/api/okx/fills", get(okx_fills))
        .route("/api/execution", get(get_execution).post(set_execution))
        .route("/api/close-all-positions", post(close_all_positions))
        .route("/api/run-full-cycle", post(run_full_cycle))
        .route("/api/ai-close-then-open", post(ai_close_then_open))
        .route("/api/manual/open", post(manual_open))
        .route("/api/manual/close", post(manual_close))
        .route("/api/initial-balance", post(set_initial_balance))
        .route("/api/investment", get(investment))
        .route("/api/investment/adjust", post(investment_adjust))
        .route("/api/close-logs", get(close_logs))
        .with_state(state)
}

#[derive(Debug, Deserialize, Default)]
struct TraderQuery {
    trader_id: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct LimitQuery {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct CyclesQuery {
    cycles: Option<usize>,
}

fn resolve_trader(manager: &TraderManager, trader_id: &Option<String>) -> Result<Arc<AutoTrader>, AppError> {
    match trader_id {
        Some(id) => manager.get(id).ok_or_else(|| AppError::NotFound(format!("no such trader: {id}"))),
        None => manager.first().ok_or_else(|| AppError::NotFound("no traders registered".into())),
    }
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "time": Utc::now().to_rfc3339() }))
}

#[derive(Debug, Serialize)]
struct TraderSummary {
    trader_id: String,
    trader_name: String,
    ai_model: crate::models::AiModel,
}

async fn list_traders(State(state): State<ApiState>) -> Json<Vec<TraderSummary>> {
    let traders = state
        .manager
        .all()
        .into_iter()
        .map(|t| TraderSummary {
            trader_id: t.id().to_string(),
            trader_name: t.config.name.clone(),
            ai_model: t.config.ai_model,
        })
        .collect();
    Json(traders)
}

async fn competition(State(state): State<ApiState>) -> Json<Vec<TraderComparison>> {
    Json(state.manager.comparison().await)
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    trader_id: String,
    execution_enabled: bool,
    call_count: u64,
    initial_balance: f64,
    scan_interval_minutes: u64,
    is_running: bool,
}

async fn status(
    State(state): State<ApiState>,
    Query(query): Query<TraderQuery>,
) -> Result<Json<StatusResponse>, AppError> {
    let trader = resolve_trader(&state.manager, &query.trader_id)?;
    Ok(Json(StatusResponse {
        trader_id: trader.id().to_string(),
        execution_enabled: trader.execution_enabled(),
        call_count: trader.call_count(),
        initial_balance: trader.config.initial_balance,
        scan_interval_minutes: trader.config.scan_interval_minutes,
        is_running: trader.is_running(),
    }))
}

async fn account(
    State(state): State<ApiState>,
    Query(query): Query<TraderQuery>,
) -> Result<Json<AccountSnapshot>, AppError> {
    let trader = resolve_trader(&state.manager, &query.trader_id)?;
    Ok(Json(trader.adapter.get_balance().await?))
}

async fn positions(
    State(state): State<ApiState>,
    Query(query): Query<TraderQuery>,
) -> Result<Json<Vec<Position>>, AppError> {
    let trader = resolve_trader(&state.manager, &query.trader_id)?;
    Ok(Json(trader.adapter.get_positions().await?))
}

async fn decisions(
    State(state): State<ApiState>,
    Query(query): Query<TraderQuery>,
) -> Result<Json<Vec<DecisionRecord>>, AppError> {
    let trader = resolve_trader(&state.manager, &query.trader_id)?;
    Ok(Json(trader.logger.get_latest_records(MAX_DECISIONS)))
}

async fn decisions_latest(
    State(state): State<ApiState>,
    Query(query): Query<TraderQuery>,
) -> Result<Json<Vec<DecisionRecord>>, AppError> {
    let trader = resolve_trader(&state.manager, &query.trader_id)?;
    let mut records = trader.logger.get_latest_records(LATEST_DECISIONS);
    records.reverse();
    Ok(Json(records))
}

async fn statistics(
    State(state): State<ApiState>,
    Query(query): Query<TraderQuery>,
) -> Result<Json<LogStatistics>, AppError> {
    let trader = resolve_trader(&state.manager, &query.trader_id)?;
    Ok(Json(trader.logger.get_statistics()))
}

#[derive(Debug, Serialize)]
struct EquityPoint {
    timestamp: chrono::DateTime<chrono::Utc>,
    equity: f64,
    total_pnl: f64,
    total_pnl_pct: f64,
}

async fn equity_history(
    State(state): State<ApiState>,
    Query(query): Query<TraderQuery>,
) -> Result<Json<Vec<EquityPoint>>, AppError> {
    let trader = resolve_trader(&state.manager, &query.trader_id)?;
    let records = trader.logger.get_latest_records(MAX_DECISIONS);
    let points = records
        .into_iter()
        .map(|r| {
            let baseline = trader.get_invested_amount_at(r.timestamp);
            let total_pnl = r.account.total_equity - baseline;
            let total_pnl_pct = if baseline > 0.0 { total_pnl / baseline * 100.0 } else { 0.0 };
            EquityPoint {
                timestamp: r.timestamp,
                equity: r.account.total_equity,
                total_pnl,
                total_pnl_pct,
            }
        })
        .collect();
    Ok(Json(points))
}

async fn performance(
    State(state): State<ApiState>,
    Query(trader_query): Query<TraderQuery>,
    Query(cycles_query): Query<CyclesQuery>,
) -> Result<Json<PerformanceAnalysis>, AppError> {
    let trader = resolve_trader(&state.manager, &trader_query.trader_id)?;
    let cycles = cycles_query.cycles.unwrap_or(MAX_PERFORMANCE_CYCLES).min(MAX_PERFORMANCE_CYCLES);
    Ok(Json(trader.logger.analyze_performance(cycles)))
}

async fn okx_fills(
    State(state): State<ApiState>,
    Query(trader_query): Query<TraderQuery>,
    Query(limit_query): Query<LimitQuery>,
) -> Json<Vec<Value>> {
    let limit = limit_query.limit.unwrap_or(MAX_FILLS as usize).min(MAX_FILLS as usize) as u32;
    let Ok(trader) = resolve_trader(&state.manager, &trader_query.trader_id) else {
        return Json(Vec::new());
    };
    Json(trader.list_recent_fills(limit).await.unwrap_or_default())
}

#[derive(Debug, Serialize)]
struct ExecutionStatus {
    execution_enabled: bool,
}

async fn get_execution(
    State(state): State<ApiState>,
    Query(query): Query<TraderQuery>,
) -> Result<Json<ExecutionStatus>, AppError> {
    let trader = resolve_trader(&state.manager, &query.trader_id)?;
    Ok(Json(ExecutionStatus {
        execution_enabled: trader.execution_enabled(),
    }))
}

#[derive(Debug, Deserialize)]
struct SetExecutionRequest {
    enabled: bool,
}

async fn set_execution(
    State(state): State<ApiState>,
    Query(query): Query<TraderQuery>,
    Json(body): Json<SetExecutionRequest>,
) -> Result<Json<ExecutionStatus>, AppError> {
    let trader = resolve_trader(&state.manager, &query.trader_id)?;
    trader.set_execution_enabled(body.enabled);
    Ok(Json(ExecutionStatus {
        execution_enabled: trader.execution_enabled(),
    }))
}

async fn close_all_positions(State(state): State<ApiState>) -> Json<Value> {
    let results = state.manager.close_all_positions().await;
    let mapped: HashMap<String, Vec<Value>> = results
        .into_iter()
        .map(|(id, outcomes)| {
            let rendered = outcomes
                .into_iter()
                .map(|outcome| match outcome {
                    Ok(()) => json!({ "ok": true }),
                    Err(e) => json!({ "ok": false, "error": e }),
                })
                .collect();
            (id, rendered)
        })
        .collect();
    Json(json!(mapped))
}

#[derive(Debug, Deserialize, Default)]
struct RunFullCycleRequest {
    delay_seconds: Option<u64>,
}

/// close -> run_once -> delay -> close, per trader (spec §6).
async fn run_full_cycle(
    State(state): State<ApiState>,
    Query(query): Query<TraderQuery>,
    Json(body): Json<RunFullCycleRequest>,
) -> Result<Json<Value>, AppError> {
    let trader = resolve_trader(&state.manager, &query.trader_id)?;
    let delay = body.delay_seconds.unwrap_or(3);

    close_trader_positions(&trader).await;
    let record = trader.run_once().await?;
    tokio::time::sleep(std::time::Duration::from_secs(delay)).await;
    close_trader_positions(&trader).await;

    Ok(Json(json!({ "cycle": record })))
}

async fn close_trader_positions(trader: &AutoTrader) {
    if let Ok(positions) = trader.adapter.get_positions().await {
        for position in positions {
            let _ = match position.side {
                crate::models::Side::Long => trader.adapter.close_long(&position.symbol, 0.0).await,
                crate::models::Side::Short => trader.adapter.close_short(&position.symbol, 0.0).await,
            };
        }
    }
}

async fn ai_close_then_open(
    State(state): State<ApiState>,
    Query(query): Query<TraderQuery>,
) -> Result<Json<Value>, AppError> {
    let trader = resolve_trader(&state.manager, &query.trader_id)?;
    let (close_record, open_record) = trader.run_ai_close_then_open().await?;
    Ok(Json(json!({ "close": close_record, "open": open_record })))
}

#[derive(Debug, Deserialize)]
struct ManualOpenRequest {
    trader_id: Option<String>,
    action: String,
    symbol: String,
    usd: f64,
    leverage: u32,
}

async fn manual_open(
    State(state): State<ApiState>,
    Json(body): Json<ManualOpenRequest>,
) -> Result<Json<Value>, AppError> {
    let trader = resolve_trader(&state.manager, &body.trader_id)?;
    let price = trader.adapter.get_market_price(&body.symbol).await?;
    if price <= 0.0 {
        return Err(AppError::ValidationFailed {
            reason: format!("non-positive market price for {}", body.symbol),
        });
    }
    let base_qty = (body.usd * body.leverage as f64) / price;
    let handle = match body.action.as_str() {
        "long" => trader.adapter.open_long(&body.symbol, base_qty, body.leverage).await?,
        "short" => trader.adapter.open_short(&body.symbol, base_qty, body.leverage).await?,
        other => {
            return Err(AppError::ValidationFailed {
                reason: format!("unknown manual open action: {other}"),
            })
        }
    };
    Ok(Json(json!({ "order": handle })))
}

#[derive(Debug, Deserialize)]
struct ManualCloseRequest {
    trader_id: Option<String>,
    side: String,
    symbol: String,
}

async fn manual_close(
    State(state): State<ApiState>,
    Json(body): Json<ManualCloseRequest>,
) -> Result<Json<Value>, AppError> {
    let trader = resolve_trader(&state.manager, &body.trader_id)?;
    let handle = match body.side.as_str() {
        "long" => trader.adapter.close_long(&body.symbol, 0.0).await?,
        "short" => trader.adapter.close_short(&body.symbol, 0.0).await?,
        other => {
            return Err(AppError::ValidationFailed {
                reason: format!("unknown manual close side: {other}"),
            })
        }
    };
    Ok(Json(json!({ "order": handle })))
}

#[derive(Debug, Deserialize)]
struct InitialBalanceRequest {
    trader_id: Option<String>,
    value: f64,
}

async fn set_initial_balance(
    State(state): State<ApiState>,
    Json(body): Json<InitialBalanceRequest>,
) -> Result<Json<Value>, AppError> {
    if body.value <= 0.0 {
        return Err(AppError::ValidationFailed {
            reason: "initial balance must be > 0".to_string(),
        });
    }
    let trader = resolve_trader(&state.manager, &body.trader_id)?;
    trader.set_initial_balance(body.value);
    Ok(Json(json!({ "ok": true })))
}

async fn investment(
    State(state): State<ApiState>,
    Query(query): Query<TraderQuery>,
) -> Result<Json<crate::models::InvestmentLedger>, AppError> {
    let trader = resolve_trader(&state.manager, &query.trader_id)?;
    Ok(Json(trader.investment_ledger()))
}

#[derive(Debug, Deserialize)]
struct InvestmentAdjustRequest {
    trader_id: Option<String>,
    amount: f64,
    note: Option<String>,
}

async fn investment_adjust(
    State(state): State<ApiState>,
    Json(body): Json<InvestmentAdjustRequest>,
) -> Result<Json<crate::models::InvestmentLedger>, AppError> {
    if body.amount == 0.0 {
        return Err(AppError::ValidationFailed {
            reason: "investment adjustment amount must be nonzero".to_string(),
        });
    }
    let trader = resolve_trader(&state.manager, &body.trader_id)?;
    trader.add_investment_delta(body.amount, body.note.unwrap_or_else(|| "manual adjustment".to_string()));
    Ok(Json(trader.investment_ledger()))
}

async fn close_logs(
    State(state): State<ApiState>,
    Query(trader_query): Query<TraderQuery>,
    Query(limit_query): Query<LimitQuery>,
) -> Result<Json<Vec<DecisionRecord>>, AppError> {
    let trader = resolve_trader(&state.manager, &trader_query.trader_id)?;
    let limit = limit_query.limit.unwrap_or(100);
    let mut matching: Vec<DecisionRecord> = trader
        .logger
        .get_latest_records(MAX_DECISIONS)
        .into_iter()
        .filter(|r| r.decisions.iter().any(|d| d.is_close()))
        .collect();
    matching.reverse();
    matching.truncate(limit);
    Ok(Json(matching))
}
