//! Decision Engine (spec §4.4): one pass of a trader's cycle. Assembles
//! context, renders a prompt, calls the LLM, parses and validates the
//! reply, and produces exactly one `DecisionRecord` regardless of outcome.

use std::collections::HashMap;

use chrono::Utc;
use tracing::{error, warn};

use crate::coinpool::CoinPoolSource;
use crate::decision::{self, Decision, DecisionRecord, ExecutionLogLine};
use crate::error::AppError;
use crate::exchange::ExchangeAdapter;
use crate::market::{self, MarketData, MarketSnapshot};
use crate::models::AccountSnapshot;
use crate::prompt::{self, PromptContext};
use crate::trader::AutoTrader;

const LIQUIDITY_FLOOR_USD: f64 = 15_000_000.0;
const TRAILING_WINDOW: usize = 100;

/// Runs one full cycle for `trader`. Never returns `Err`: every failure
/// mode is folded into a `DecisionRecord` with `success=false` so exactly
/// one record is produced per invocation (spec §8 invariant 1).
pub async fn run_decision_cycle(trader: &AutoTrader, cycle_number: u64) -> DecisionRecord {
    let timestamp = Utc::now();

    // Step 1: account + position snapshot, degrading to a synthesized
    // zero-position snapshot on adapter failure so the cycle still writes
    // a record.
    let (account, positions, snapshot_error) = match trader.adapter.get_balance().await {
        Ok(account) => match trader.adapter.get_positions().await {
            Ok(positions) => (account, positions, None),
            Err(e) => (
                account,
                Vec::new(),
                Some(format!("position fetch failed: {e}")),
            ),
        },
        Err(e) => (
            AccountSnapshot::zero_position(trader.config.initial_balance),
            Vec::new(),
            Some(format!("balance fetch failed: {e}")),
        ),
    };

    trader.risk_limiter.record_equity(account.total_equity, timestamp);

    // Step 2: merged candidate coin pool.
    let candidates = trader.coin_pool.fetch_merged(trader.config.coin_pool_top_k).await;
    let candidate_symbols: Vec<String> = candidates.iter().map(|c| c.symbol.clone()).collect();

    // Step 3: market data for position ∪ pool symbols, liquidity-filtered.
    let position_symbols: Vec<String> = positions.iter().map(|p| p.symbol.clone()).collect();
    let mut wanted: Vec<String> = position_symbols.clone();
    for symbol in &candidate_symbols {
        if !wanted.contains(symbol) {
            wanted.push(symbol.clone());
        }
    }

    let mut market_snapshots: HashMap<String, MarketSnapshot> = HashMap::new();
    let mut fetch_pairs = Vec::new();
    for symbol in &wanted {
        match trader.market.get(symbol).await {
            Ok(snapshot) => fetch_pairs.push((symbol.clone(), snapshot)),
            Err(e) => warn!(trader = %trader.id(), symbol, error = %e, "market data fetch failed, dropping candidate"),
        }
    }
    let filtered = market::filter_by_liquidity(fetch_pairs, &position_symbols, LIQUIDITY_FLOOR_USD);
    for (symbol, snapshot) in filtered {
        market_snapshots.insert(symbol, snapshot);
    }
    let final_candidate_symbols: Vec<String> = wanted
        .into_iter()
        .filter(|s| market_snapshots.contains_key(s))
        .collect();

    // Step 4: trailing performance.
    let recent_records = trader.logger.get_latest_records(TRAILING_WINDOW);
    let trailing_performance = prompt::summarize_trailing_performance(&recent_records);

    // Step 5: render prompt.
    let renderer = prompt::active_renderer();
    let system_prompt = renderer.render_system(&account, &trader.config.risk);
    let prompt_context = PromptContext {
        account: &account,
        positions: &positions,
        candidates: &final_candidate_symbols,
        risk: &trader.config.risk,
        trailing_performance: &trailing_performance,
    };
    let user_prompt = renderer.render_user(&prompt_context);

    if let Some(reason) = snapshot_error {
        return failed_record(
            cycle_number,
            timestamp,
            account,
            positions,
            final_candidate_symbols,
            user_prompt,
            reason,
        );
    }

    // Step 6: call the LLM.
    let llm_output = match trader.llm.chat_completion(&system_prompt, &user_prompt).await {
        Ok(output) => output,
        Err(e) => {
            return failed_record(
                cycle_number,
                timestamp,
                account,
                positions,
                final_candidate_symbols,
                user_prompt,
                format!("llm call failed: {e}"),
            );
        }
    };

    // Step 7: parse + validate.
    let equity = account.total_equity;
    let market_price_for = |symbol: &str| -> f64 {
        market_snapshots.get(symbol).map(|s| s.price).unwrap_or(0.0)
    };
    let batch = match decision::parse_and_validate(&llm_output.text, &trader.config.risk, equity, market_price_for) {
        Ok(batch) => batch,
        Err(e) => {
            return failed_record(
                cycle_number,
                timestamp,
                account,
                positions,
                final_candidate_symbols,
                user_prompt,
                format!("parse failed: {e}"),
            );
        }
    };

    for (symbol, reason) in &batch.rejections {
        warn!(trader = %trader.id(), symbol, reason, "decision rejected by validator");
    }

    // Step 8/9: dispatch executions (if enabled) before finalizing the
    // record, in the order the model returned them.
    let halted = trader.risk_limiter.is_halted(timestamp);
    let mut execution_log = Vec::new();
    if trader.execution_enabled() {
        for decision in &batch.decisions {
            if halted && decision.is_open() {
                execution_log.push(ExecutionLogLine {
                    symbol: decision.symbol().to_string(),
                    action: decision.action_name().to_string(),
                    success: false,
                    message: "trading halted by risk limiter".to_string(),
                });
                continue;
            }
            execution_log.push(dispatch(trader, decision).await);
        }
    }

    DecisionRecord {
        cycle_number,
        timestamp,
        account,
        positions,
        candidate_symbols: final_candidate_symbols,
        prompt: user_prompt,
        cot_trace: batch.cot_trace,
        decisions: batch.decisions,
        execution_log,
        success: true,
        error: None,
    }
}

async fn dispatch(trader: &AutoTrader, decision: &Decision) -> ExecutionLogLine {
    let symbol = decision.symbol().to_string();
    let action = decision.action_name().to_string();

    let result: Result<(), AppError> = match decision {
        Decision::OpenLong {
            symbol,
            leverage,
            position_size_usd,
            stop_loss,
            take_profit,
            ..
        } => open_position(trader, symbol, true, *leverage, *position_size_usd, *stop_loss, *take_profit).await,
        Decision::OpenShort {
            symbol,
            leverage,
            position_size_usd,
            stop_loss,
            take_profit,
            ..
        } => open_position(trader, symbol, false, *leverage, *position_size_usd, *stop_loss, *take_profit).await,
        Decision::CloseLong { symbol, .. } => trader.adapter.close_long(symbol, 0.0).await.map(|_| ()),
        Decision::CloseShort { symbol, .. } => trader.adapter.close_short(symbol, 0.0).await.map(|_| ()),
        Decision::Hold { .. } | Decision::Wait { .. } => Ok(()),
    };

    match result {
        Ok(()) => ExecutionLogLine {
            symbol,
            action,
            success: true,
            message: "ok".to_string(),
        },
        Err(e) => {
            error!(symbol, action, error = %e, "order dispatch failed");
            ExecutionLogLine {
                symbol,
                action,
                success: false,
                message: e.to_string(),
            }
        }
    }
}

async fn open_position(
    trader: &AutoTrader,
    symbol: &str,
    is_long: bool,
    leverage: u32,
    position_size_usd: f64,
    stop_loss: f64,
    take_profit: f64,
) -> Result<(), AppError> {
    let price = trader.adapter.get_market_price(symbol).await?;
    if price <= 0.0 {
        return Err(AppError::ValidationFailed {
            reason: format!("non-positive market price for {symbol}"),
        });
    }
    let base_qty = (position_size_usd * leverage as f64) / price;

    let handle = if is_long {
        trader.adapter.open_long(symbol, base_qty, leverage).await?
    } else {
        trader.adapter.open_short(symbol, base_qty, leverage).await?
    };

    let side = handle.side;
    if let Err(e) = trader.adapter.set_stop_loss(symbol, side, handle.quantity, stop_loss).await {
        warn!(symbol, error = %e, "stop-loss placement failed after open");
    }
    if let Err(e) = trader.adapter.set_take_profit(symbol, side, handle.quantity, take_profit).await {
        warn!(symbol, error = %e, "take-profit placement failed after open");
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn failed_record(
    cycle_number: u64,
    timestamp: chrono::DateTime<Utc>,
    account: AccountSnapshot,
    positions: Vec<crate::models::Position>,
    candidate_symbols: Vec<String>,
    prompt: String,
    error: String,
) -> DecisionRecord {
    DecisionRecord {
        cycle_number,
        timestamp,
        account,
        positions,
        candidate_symbols,
        prompt,
        cot_trace: String::new(),
        decisions: Vec::new(),
        execution_log: Vec::new(),
        success: false,
        error: Some(error),
    }
}
