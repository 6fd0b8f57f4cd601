//! Prompt Renderer (spec §4.4 step 5): delegated to an opaque collaborator
//! keyed by `NOFX_PROMPT_VARIANT` so prompt wording can change without
//! touching the engine.

use crate::decision::DecisionRecord;
use crate::models::{AccountSnapshot, Position, RiskParams};

pub struct PromptContext<'a> {
    pub account: &'a AccountSnapshot,
    pub positions: &'a [Position],
    pub candidates: &'a [String],
    pub risk: &'a RiskParams,
    pub trailing_performance: &'a str,
}

pub trait PromptRenderer: Send + Sync {
    fn render_system(&self, account: &AccountSnapshot, risk: &RiskParams) -> String;
    fn render_user(&self, ctx: &PromptContext<'_>) -> String;
}

/// The `default` variant: plain, information-dense prompt text. Other
/// variants are registered by name and selected at startup; unknown names
/// fall back to this one.
pub struct DefaultPromptRenderer;

impl PromptRenderer for DefaultPromptRenderer {
    fn render_system(&self, account: &AccountSnapshot, risk: &RiskParams) -> String {
        format!(
            "You are a disciplined perpetual-futures trading assistant. \
             Account equity is {:.2} USD. Leverage caps: BTC/ETH {}x, altcoins {}x. \
             Respond with a JSON array of decisions and nothing else outside an \
             optional reasoning section.",
            account.total_equity, risk.btc_eth_leverage, risk.altcoin_leverage
        )
    }

    fn render_user(&self, ctx: &PromptContext<'_>) -> String {
        let positions = if ctx.positions.is_empty() {
            "none".to_string()
        } else {
            ctx.positions
                .iter()
                .map(|p| {
                    format!(
                        "{} {:?} qty={:.6} entry={:.4} mark={:.4} lev={}x pnl={:.2}",
                        p.symbol, p.side, p.quantity, p.entry_price, p.mark_price, p.leverage, p.unrealized_pnl
                    )
                })
                .collect::<Vec<_>>()
                .join("; ")
        };
        format!(
            "Open positions: {positions}\nCandidate symbols: {}\nTrailing performance: {}\n\
             Decide open/close/hold/wait for each relevant symbol.",
            ctx.candidates.join(", "),
            ctx.trailing_performance
        )
    }
}

/// Resolves the active renderer from `NOFX_PROMPT_VARIANT` (default
/// `default`). New variants are added here as they're registered; unknown
/// values fall back rather than failing the cycle.
pub fn renderer_for_variant(variant: &str) -> Box<dyn PromptRenderer> {
    match variant {
        "default" | "" => Box::new(DefaultPromptRenderer),
        _ => Box::new(DefaultPromptRenderer),
    }
}

pub fn active_renderer() -> Box<dyn PromptRenderer> {
    let variant = std::env::var("NOFX_PROMPT_VARIANT").unwrap_or_else(|_| "default".to_string());
    renderer_for_variant(&variant)
}

/// Renders a short trailing-performance summary string fed into the user
/// prompt (spec §4.4 step 4's output consumed by step 5).
pub fn summarize_trailing_performance(recent: &[DecisionRecord]) -> String {
    if recent.is_empty() {
        return "no prior cycles".to_string();
    }
    let total = recent.len();
    let successful = recent.iter().filter(|r| r.success).count();
    format!("{successful}/{total} recent cycles completed without error")
}
