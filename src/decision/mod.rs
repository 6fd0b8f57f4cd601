//! LLM response parsing and risk-rule validation (spec §4.3), plus the
//! decision/record types they operate on.

pub mod parser;
pub mod types;
pub mod validator;

pub use types::{Decision, DecisionRecord, ExecutionLogLine, RawDecision};

use crate::error::AppError;
use crate::models::RiskParams;

/// Full pipeline: tolerant-parse an LLM reply, then validate each resulting
/// raw decision against the trader's risk params and a symbol's market
/// price. A decision that fails validation is dropped with its reason kept
/// only in logs — it never aborts the rest of the batch (spec §7).
pub struct ValidatedBatch {
    pub cot_trace: String,
    pub decisions: Vec<Decision>,
    pub rejections: Vec<(String, String)>,
}

pub fn parse_and_validate<F>(
    reply: &str,
    risk: &RiskParams,
    equity: f64,
    mut market_price_for: F,
) -> Result<ValidatedBatch, AppError>
where
    F: FnMut(&str) -> f64,
{
    let outcome = parser::parse_llm_reply(reply)?;
    let mut decisions = Vec::new();
    let mut rejections = Vec::new();

    for raw in &outcome.raw_decisions {
        let price = market_price_for(&raw.symbol);
        match validator::validate_decision(raw, risk, equity, price) {
            Ok(decision) => decisions.push(decision),
            Err(e) => rejections.push((raw.symbol.clone(), e.to_string())),
        }
    }

    Ok(ValidatedBatch {
        cot_trace: outcome.cot_trace,
        decisions,
        rejections,
    })
}
