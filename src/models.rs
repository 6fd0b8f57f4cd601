//! Core domain types shared across the controller: trader identity,
//! account/position snapshots, candidate coins, and the investment ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Exchange {
    Binance,
    Hyperliquid,
    Aster,
    Okx,
}

impl Exchange {
    pub fn as_str(&self) -> &'static str {
        match self {
            Exchange::Binance => "binance",
            Exchange::Hyperliquid => "hyperliquid",
            Exchange::Aster => "aster",
            Exchange::Okx => "okx",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AiModel {
    Qwen,
    Deepseek,
    Custom,
}

/// Venue credentials. Exactly one variant is populated per trader, and it
/// must match the trader's chosen `Exchange` (spec §3 invariant).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "exchange", rename_all = "snake_case")]
pub enum Credentials {
    Binance { api_key: String, api_secret: String },
    Aster { api_key: String, api_secret: String },
    Okx {
        api_key: String,
        api_secret: String,
        passphrase: String,
    },
    Hyperliquid {
        wallet_address: String,
        private_key: String,
    },
}

impl Credentials {
    pub fn exchange(&self) -> Exchange {
        match self {
            Credentials::Binance { .. } => Exchange::Binance,
            Credentials::Aster { .. } => Exchange::Aster,
            Credentials::Okx { .. } => Exchange::Okx,
            Credentials::Hyperliquid { .. } => Exchange::Hyperliquid,
        }
    }
}

/// Per-trader risk parameters (spec §3). `stop_trading_duration_minutes`
/// is how long the risk limiter (§4.8) holds a trader in cooldown after a
/// daily-loss or drawdown breach.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RiskParams {
    pub btc_eth_leverage: u32,
    pub altcoin_leverage: u32,
    pub max_daily_loss: f64,
    pub max_drawdown: f64,
    pub stop_trading_duration_minutes: u64,
}

impl RiskParams {
    pub fn leverage_cap(&self, symbol: &str) -> u32 {
        if symbol == "BTCUSDT" || symbol == "ETHUSDT" {
            self.btc_eth_leverage
        } else {
            self.altcoin_leverage
        }
    }

    /// Multiplier on equity, not a percentage: `position_size_usd <= equity * P_max`.
    pub fn position_cap_multiplier(symbol: &str) -> f64 {
        if symbol == "BTCUSDT" || symbol == "ETHUSDT" {
            10.0
        } else {
            1.5
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trader {
    pub id: String,
    pub name: String,
    pub ai_model: AiModel,
    pub exchange: Exchange,
    pub credentials: Credentials,
    pub risk: RiskParams,
    pub scan_interval_minutes: u64,
    pub initial_balance: f64,
    /// OKX-only: explicit `long_short_mode` / `net_mode` override, consulted
    /// before the adapter's `account/config` probe (spec §9 open question).
    /// Ignored by every other venue.
    #[serde(default)]
    pub position_mode_override: Option<String>,
    /// Only consulted when `ai_model == AiModel::Custom`.
    #[serde(default)]
    pub custom_model: Option<String>,
    pub coin_pool_top_k: usize,
}

impl Trader {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.credentials.exchange() != self.exchange {
            return Err(AppError::ConfigInvalid(format!(
                "trader {}: credentials are for {:?} but exchange is {:?}",
                self.id,
                self.credentials.exchange(),
                self.exchange
            )));
        }
        if self.initial_balance <= 0.0 {
            return Err(AppError::ConfigInvalid(format!(
                "trader {}: initial_balance must be > 0",
                self.id
            )));
        }
        if self.scan_interval_minutes == 0 {
            return Err(AppError::ConfigInvalid(format!(
                "trader {}: scan_interval_minutes must be > 0",
                self.id
            )));
        }
        Ok(())
    }

    pub fn scan_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.scan_interval_minutes.max(1) * 60)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub total_equity: f64,
    pub wallet_balance: f64,
    pub unrealized_profit: f64,
    pub available_balance: f64,
    pub margin_used: f64,
    pub margin_used_pct: f64,
    pub position_count: u32,
}

impl AccountSnapshot {
    /// Degraded snapshot used when the adapter call fails (spec §4.4 step 1).
    pub fn zero_position(initial_balance: f64) -> Self {
        Self {
            total_equity: initial_balance,
            wallet_balance: initial_balance,
            unrealized_profit: 0.0,
            available_balance: initial_balance,
            margin_used: 0.0,
            margin_used_pct: 0.0,
            position_count: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Long,
    Short,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub entry_price: f64,
    pub mark_price: f64,
    pub leverage: u32,
    pub unrealized_pnl: f64,
    pub liquidation_price: f64,
    pub update_time_ms: i64,
}

impl Position {
    pub fn margin_used(&self) -> f64 {
        if self.leverage == 0 {
            0.0
        } else {
            self.quantity * self.entry_price / self.leverage as f64
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoinSource {
    Ai500,
    OiTop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateCoin {
    pub symbol: String,
    pub rank: u32,
    pub sources: Vec<CoinSource>,
}

/// A signed deposit (positive) or withdrawal (negative) against a trader's
/// investment baseline (spec §3 `InvestmentAdjustment`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvestmentAdjustment {
    pub amount: f64,
    pub timestamp: DateTime<Utc>,
    pub note: String,
}

/// Append-only ledger of `InvestmentAdjustment`s plus the trader's baseline.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct InvestmentLedger {
    pub initial_balance: f64,
    pub adjustments: Vec<InvestmentAdjustment>,
    /// Dedup keys for OKX auto-calibration (`okx_deposit:<txid>` etc).
    #[serde(default)]
    pub seen_keys: std::collections::HashSet<String>,
}

impl InvestmentLedger {
    pub fn new(initial_balance: f64) -> Self {
        Self {
            initial_balance,
            adjustments: Vec::new(),
            seen_keys: std::collections::HashSet::new(),
        }
    }

    pub fn set_initial_balance(&mut self, value: f64) {
        self.initial_balance = value;
    }

    pub fn add(&mut self, amount: f64, note: impl Into<String>) {
        self.adjustments.push(InvestmentAdjustment {
            amount,
            timestamp: Utc::now(),
            note: note.into(),
        });
    }

    /// `add_investment_delta` with a dedup key (used by OKX auto-calibration,
    /// spec §4.5). Returns `false` if the key was already recorded.
    pub fn add_deduped(&mut self, amount: f64, note: impl Into<String>, key: impl Into<String>) -> bool {
        let key = key.into();
        if !self.seen_keys.insert(key) {
            return false;
        }
        self.add(amount, note);
        true
    }

    /// Baseline at time `at`: `initial_balance + sum(amount where ts <= at)`.
    pub fn invested_at(&self, at: DateTime<Utc>) -> f64 {
        let delta: f64 = self
            .adjustments
            .iter()
            .filter(|a| a.timestamp <= at)
            .map(|a| a.amount)
            .sum();
        self.initial_balance + delta
    }
}
