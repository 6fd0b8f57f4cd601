//! Decision types: the wire-shaped `RawDecision` the LLM actually emits, and
//! the validated `Decision` sum type the rest of the engine consumes (spec
//! §3, §9 design note preferring tagged variants over optional-everything
//! structs).

use serde::{Deserialize, Serialize};

/// Flat shape produced by `serde_json::from_value` straight off the model's
/// JSON array. Every field beyond `symbol`/`action` is optional because the
/// model only fills in what the action needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawDecision {
    pub symbol: String,
    pub action: String,
    #[serde(default)]
    pub leverage: Option<f64>,
    #[serde(default)]
    pub position_size_usd: Option<f64>,
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub take_profit: Option<f64>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub risk_usd: Option<f64>,
    #[serde(default)]
    pub reasoning: String,
}

/// Validated decision. Only `OpenLong`/`OpenShort` carry the full order
/// parameter set; the rest carry just enough to log and, for closes,
/// execute.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Decision {
    OpenLong {
        symbol: String,
        leverage: u32,
        position_size_usd: f64,
        stop_loss: f64,
        take_profit: f64,
        confidence: Option<f64>,
        risk_usd: f64,
        reasoning: String,
    },
    OpenShort {
        symbol: String,
        leverage: u32,
        position_size_usd: f64,
        stop_loss: f64,
        take_profit: f64,
        confidence: Option<f64>,
        risk_usd: f64,
        reasoning: String,
    },
    CloseLong {
        symbol: String,
        reasoning: String,
    },
    CloseShort {
        symbol: String,
        reasoning: String,
    },
    Hold {
        symbol: String,
        reasoning: String,
    },
    Wait {
        symbol: String,
        reasoning: String,
    },
}

impl Decision {
    pub fn symbol(&self) -> &str {
        match self {
            Decision::OpenLong { symbol, .. }
            | Decision::OpenShort { symbol, .. }
            | Decision::CloseLong { symbol, .. }
            | Decision::CloseShort { symbol, .. }
            | Decision::Hold { symbol, .. }
            | Decision::Wait { symbol, .. } => symbol,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, Decision::OpenLong { .. } | Decision::OpenShort { .. })
    }

    pub fn is_close(&self) -> bool {
        matches!(self, Decision::CloseLong { .. } | Decision::CloseShort { .. })
    }

    pub fn action_name(&self) -> &'static str {
        match self {
            Decision::OpenLong { .. } => "open_long",
            Decision::OpenShort { .. } => "open_short",
            Decision::CloseLong { .. } => "close_long",
            Decision::CloseShort { .. } => "close_short",
            Decision::Hold { .. } => "hold",
            Decision::Wait { .. } => "wait",
        }
    }
}

/// One line of the per-decision execution outcome, recorded in dispatch
/// order inside a `DecisionRecord` (spec §4.4 step 9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLogLine {
    pub symbol: String,
    pub action: String,
    pub success: bool,
    pub message: String,
}

/// A single cycle's audit log entry (spec §3 `DecisionRecord`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub cycle_number: u64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub account: crate::models::AccountSnapshot,
    pub positions: Vec<crate::models::Position>,
    pub candidate_symbols: Vec<String>,
    pub prompt: String,
    pub cot_trace: String,
    pub decisions: Vec<Decision>,
    pub execution_log: Vec<ExecutionLogLine>,
    pub success: bool,
    pub error: Option<String>,
}
