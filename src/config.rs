//! Configuration loading and validation (spec §6). JSON config file plus a
//! handful of environment overrides; validation is strict and fail-fast —
//! a bad config never starts the process.

use std::fs;
use std::path::{Path, PathBuf};

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::models::{AiModel, Credentials, Exchange, RiskParams, Trader};

#[derive(Parser, Debug)]
#[command(name = "nofx-controller")]
#[command(about = "Multi-tenant autonomous perpetual-futures trading controller")]
pub struct Cli {
    /// Path to the JSON config file.
    #[arg(long, env = "NOFX_CONFIG_PATH", default_value = "config.json")]
    pub config_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeverageConfig {
    pub btc_eth_leverage: u32,
    pub altcoin_leverage: u32,
}

/// Flat credential fields as they appear in the config file; only the
/// subset matching `exchange` is expected to be populated. Kept separate
/// from `Credentials` (an internally-tagged enum) because flattening a
/// tagged enum alongside a sibling `exchange` field is ambiguous over the
/// same JSON key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CredentialFields {
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    api_secret: Option<String>,
    #[serde(default)]
    passphrase: Option<String>,
    #[serde(default)]
    wallet_address: Option<String>,
    #[serde(default)]
    private_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraderEntry {
    pub id: String,
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub ai_model: AiModel,
    pub exchange: Exchange,
    #[serde(flatten)]
    credential_fields: CredentialFields,
    pub initial_balance: f64,
    #[serde(default = "default_scan_interval_minutes")]
    pub scan_interval_minutes: u64,
    #[serde(default)]
    pub position_mode_override: Option<String>,
    #[serde(default)]
    pub custom_model: Option<String>,
}

impl TraderEntry {
    fn credentials(&self) -> Result<Credentials, AppError> {
        let f = &self.credential_fields;
        let missing = |field: &str| {
            AppError::CredentialMissing {
                exchange: self.exchange.as_str().to_string(),
                detail: format!("{field} is required for trader {}", self.id),
            }
        };
        match self.exchange {
            Exchange::Binance => Ok(Credentials::Binance {
                api_key: f.api_key.clone().ok_or_else(|| missing("api_key"))?,
                api_secret: f.api_secret.clone().ok_or_else(|| missing("api_secret"))?,
            }),
            Exchange::Aster => Ok(Credentials::Aster {
                api_key: f.api_key.clone().ok_or_else(|| missing("api_key"))?,
                api_secret: f.api_secret.clone().ok_or_else(|| missing("api_secret"))?,
            }),
            Exchange::Okx => Ok(Credentials::Okx {
                api_key: f.api_key.clone().ok_or_else(|| missing("api_key"))?,
                api_secret: f.api_secret.clone().ok_or_else(|| missing("api_secret"))?,
                passphrase: f.passphrase.clone().ok_or_else(|| missing("passphrase"))?,
            }),
            Exchange::Hyperliquid => Ok(Credentials::Hyperliquid {
                wallet_address: f.wallet_address.clone().ok_or_else(|| missing("wallet_address"))?,
                private_key: f.private_key.clone().ok_or_else(|| missing("private_key"))?,
            }),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_scan_interval_minutes() -> u64 {
    3
}

fn default_api_port() -> u16 {
    8080
}

fn default_top_k() -> usize {
    20
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub traders: Vec<TraderEntry>,
    #[serde(default)]
    pub use_default_coins: bool,
    #[serde(default)]
    pub default_coins: Vec<String>,
    #[serde(default)]
    pub coin_pool_api_url: Option<String>,
    #[serde(default)]
    pub oi_top_api_url: Option<String>,
    #[serde(default = "default_api_port")]
    pub api_server_port: u16,
    pub max_daily_loss: f64,
    pub max_drawdown: f64,
    pub stop_trading_minutes: u64,
    pub leverage: LeverageConfig,
    #[serde(default = "default_top_k")]
    pub coin_pool_top_k: usize,
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self, AppError> {
        let body = fs::read_to_string(path).map_err(|e| {
            AppError::ConfigInvalid(format!("failed to read config at {}: {e}", path.display()))
        })?;
        let mut config: AppConfig = serde_json::from_str(&body)
            .map_err(|e| AppError::ConfigInvalid(format!("failed to parse config: {e}")))?;

        apply_env_overrides(&mut config);
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), AppError> {
        if self.traders.is_empty() {
            return Err(AppError::ConfigInvalid("traders[] must not be empty".into()));
        }
        if self.max_daily_loss <= 0.0 || self.max_daily_loss >= 1.0 {
            return Err(AppError::ConfigInvalid("max_daily_loss must be in (0, 1)".into()));
        }
        if self.max_drawdown <= 0.0 || self.max_drawdown >= 1.0 {
            return Err(AppError::ConfigInvalid("max_drawdown must be in (0, 1)".into()));
        }
        if self.leverage.btc_eth_leverage == 0 || self.leverage.altcoin_leverage == 0 {
            return Err(AppError::ConfigInvalid("leverage caps must be >= 1".into()));
        }
        if !self.use_default_coins && self.coin_pool_api_url.is_none() {
            return Err(AppError::ConfigInvalid(
                "coin_pool_api_url is required unless use_default_coins is set".into(),
            ));
        }

        let mut seen_ids = std::collections::HashSet::new();
        for entry in &self.traders {
            if !seen_ids.insert(entry.id.clone()) {
                return Err(AppError::ConfigInvalid(format!("duplicate trader id: {}", entry.id)));
            }
            entry.credentials()?;
            if entry.initial_balance <= 0.0 {
                return Err(AppError::ConfigInvalid(format!(
                    "trader {}: initial_balance must be > 0",
                    entry.id
                )));
            }
            if entry.scan_interval_minutes == 0 {
                return Err(AppError::ConfigInvalid(format!(
                    "trader {}: scan_interval_minutes must be > 0",
                    entry.id
                )));
            }
        }
        Ok(())
    }

    /// Builds the per-trader domain config shared with the engine, pairing
    /// each entry with the process-wide risk caps (spec §3 `Trader`).
    pub fn trader_configs(&self) -> Result<Vec<Trader>, AppError> {
        self.traders
            .iter()
            .filter(|e| e.enabled)
            .map(|entry| {
                Ok(Trader {
                    id: entry.id.clone(),
                    name: entry.name.clone(),
                    ai_model: entry.ai_model,
                    exchange: entry.exchange,
                    credentials: entry.credentials()?,
                    risk: RiskParams {
                        btc_eth_leverage: self.leverage.btc_eth_leverage,
                        altcoin_leverage: self.leverage.altcoin_leverage,
                        max_daily_loss: self.max_daily_loss,
                        max_drawdown: self.max_drawdown,
                        stop_trading_duration_minutes: self.stop_trading_minutes,
                    },
                    scan_interval_minutes: scan_interval_override().unwrap_or(entry.scan_interval_minutes),
                    initial_balance: entry.initial_balance,
                    position_mode_override: entry.position_mode_override.clone(),
                    custom_model: entry.custom_model.clone(),
                    coin_pool_top_k: self.coin_pool_top_k,
                })
            })
            .collect()
    }
}

fn scan_interval_override() -> Option<u64> {
    std::env::var("NOFX_SCAN_INTERVAL_MINUTES").ok()?.parse().ok()
}

/// `API_PORT` and `NOFX_SCAN_INTERVAL_MINUTES` override the file; proxy
/// vars are read directly by the HTTP clients and not mirrored here.
fn apply_env_overrides(config: &mut AppConfig) {
    if let Ok(port) = std::env::var("API_PORT") {
        if let Ok(parsed) = port.parse() {
            config.api_server_port = parsed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_json() -> &'static str {
        r#"{
            "traders": [
                {
                    "id": "t1",
                    "name": "Trader One",
                    "ai_model": "qwen",
                    "exchange": "binance",
                    "api_key": "k",
                    "api_secret": "s",
                    "initial_balance": 1000.0
                }
            ],
            "use_default_coins": true,
            "default_coins": ["BTCUSDT"],
            "max_daily_loss": 0.1,
            "max_drawdown": 0.2,
            "stop_trading_minutes": 60,
            "leverage": {"btc_eth_leverage": 5, "altcoin_leverage": 3}
        }"#
    }

    #[test]
    fn parses_and_validates_a_minimal_config() {
        let config: AppConfig = serde_json::from_str(minimal_json()).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.trader_configs().unwrap().len(), 1);
    }

    #[test]
    fn rejects_mismatched_credentials_and_exchange() {
        let bad = minimal_json().replace("\"exchange\": \"binance\"", "\"exchange\": \"okx\"");
        let config: AppConfig = serde_json::from_str(&bad).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_missing_coin_pool_source() {
        let bad = minimal_json().replace("\"use_default_coins\": true,", "\"use_default_coins\": false,");
        let config: AppConfig = serde_json::from_str(&bad).unwrap();
        assert!(config.validate().is_err());
    }
}
