//! nofx-controller entrypoint: loads config, wires one `AutoTrader` per
//! enabled trader entry, starts every trader, and serves the admin API.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::Value;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use nofx_controller::api::{build_router, ApiState};
use nofx_controller::coinpool::{CoinPoolSource, HttpCoinPoolSource, StaticCoinPoolSource};
use nofx_controller::config::{AppConfig, Cli};
use nofx_controller::error::AppError;
use nofx_controller::exchange::aster::AsterAdapter;
use nofx_controller::exchange::binance::BinanceAdapter;
use nofx_controller::exchange::hyperliquid::{HyperliquidAdapter, Signer};
use nofx_controller::exchange::okx::OkxAdapter;
use nofx_controller::exchange::{DepositWithdrawalSource, ExchangeAdapter, FillsSource};
use nofx_controller::llm::LlmClient;
use nofx_controller::logger::DecisionLogger;
use nofx_controller::manager::TraderManager;
use nofx_controller::market::{AdapterBackedMarketData, MarketData};
use nofx_controller::models::{Credentials, Exchange, Trader as TraderConfig};
use nofx_controller::risk::RiskLimiter;
use nofx_controller::trader::AutoTrader;

const LOG_BASE_DIR: &str = "decision_logs";

/// Hyperliquid orders are authorized by an EIP-712 signature over the action
/// payload; this workspace carries no ECDSA dependency to produce one, so
/// this stub surfaces a clear, immediate error rather than pretending to
/// sign. A real deployment swaps this for a wallet/KMS-backed `Signer`.
struct UnavailableSigner {
    wallet_address: String,
}

impl Signer for UnavailableSigner {
    fn sign_action(&self, _connection_id: &str, _payload: &Value) -> Result<Value, AppError> {
        Err(AppError::Fatal(
            "hyperliquid signing is not available in this deployment".to_string(),
        ))
    }

    fn wallet_address(&self) -> &str {
        &self.wallet_address
    }
}

fn build_adapter(exchange: Exchange, credentials: &Credentials) -> Arc<dyn ExchangeAdapter> {
    match credentials {
        Credentials::Binance { api_key, api_secret } => {
            Arc::new(BinanceAdapter::new(api_key.clone(), api_secret.clone()))
        }
        Credentials::Aster { api_key, api_secret } => {
            Arc::new(AsterAdapter::new(api_key.clone(), api_secret.clone()))
        }
        Credentials::Okx { .. } => unreachable!("okx built via build_okx_adapter: {exchange:?}"),
        Credentials::Hyperliquid { wallet_address, .. } => {
            let signer = Box::new(UnavailableSigner {
                wallet_address: wallet_address.clone(),
            });
            Arc::new(HyperliquidAdapter::new(signer))
        }
    }
}

fn build_coin_pool(config: &AppConfig) -> Arc<dyn CoinPoolSource> {
    if config.use_default_coins {
        Arc::new(StaticCoinPoolSource::new(config.default_coins.clone()))
    } else {
        let ai500_url = config.coin_pool_api_url.clone().unwrap_or_default();
        let oi_top_url = config.oi_top_api_url.clone().unwrap_or_else(|| ai500_url.clone());
        Arc::new(HttpCoinPoolSource::new(ai500_url, oi_top_url))
    }
}

fn build_trader(entry: &TraderConfig, config: &AppConfig) -> Result<Arc<AutoTrader>, AppError> {
    let (adapter, calibration_source, fills_source): (
        Arc<dyn ExchangeAdapter>,
        Option<Arc<dyn DepositWithdrawalSource>>,
        Option<Arc<dyn FillsSource>>,
    ) = match &entry.credentials {
        Credentials::Okx { api_key, api_secret, passphrase } => {
            let okx: Arc<OkxAdapter> = Arc::new(OkxAdapter::new(
                api_key.clone(),
                api_secret.clone(),
                passphrase.clone(),
                entry.position_mode_override.clone(),
            ));
            let adapter: Arc<dyn ExchangeAdapter> = okx.clone();
            let calibration: Arc<dyn DepositWithdrawalSource> = okx.clone();
            let fills: Arc<dyn FillsSource> = okx;
            (adapter, Some(calibration), Some(fills))
        }
        other => (build_adapter(entry.exchange, other), None, None),
    };

    let market: Arc<dyn MarketData> = Arc::new(AdapterBackedMarketData::new(adapter.clone()));

    let llm = LlmClient::from_env(entry.ai_model, entry.custom_model.clone())?;
    let logger = DecisionLogger::new(LOG_BASE_DIR, &entry.id);
    let risk_limiter = RiskLimiter::new(
        entry.risk.max_daily_loss,
        entry.risk.max_drawdown,
        entry.risk.stop_trading_duration_minutes,
        entry.initial_balance,
        chrono::Utc::now(),
    );
    let coin_pool = build_coin_pool(config);

    let trader = AutoTrader::new(
        entry.clone(),
        adapter,
        logger,
        llm,
        market,
        coin_pool,
        risk_limiter,
        calibration_source,
        fills_source,
    );
    Ok(Arc::new(trader))
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nofx_controller=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenv::dotenv();
    init_tracing();

    let cli = Cli::parse();
    let config = AppConfig::load(&cli.config_path)
        .with_context(|| format!("failed to load config from {}", cli.config_path.display()))?;

    let trader_configs = config.trader_configs().context("failed to resolve trader credentials")?;
    if trader_configs.is_empty() {
        warn!("no enabled traders in config; starting with an empty registry");
    }

    let manager = Arc::new(TraderManager::new());
    for entry in &trader_configs {
        let trader = build_trader(entry, &config).with_context(|| format!("failed to build trader {}", entry.id))?;
        manager.add(trader).with_context(|| format!("failed to register trader {}", entry.id))?;
        info!(trader = %entry.id, exchange = ?entry.exchange, "trader registered");
    }

    manager.start_all().await;
    info!("all traders started");

    let state = ApiState { manager: manager.clone() };
    let app = build_router(state)
        .layer(axum::middleware::from_fn(
            nofx_controller::middleware::logging::request_logging_simple,
        ))
        .layer(CorsLayer::permissive());

    let addr = format!("0.0.0.0:{}", config.api_server_port);
    let listener = TcpListener::bind(&addr).await.with_context(|| format!("failed to bind {addr}"))?;
    info!(addr, "admin API listening");

    axum::serve(listener, app).await.context("server error")?;

    manager.stop_all();
    Ok(())
}
