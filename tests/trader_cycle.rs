//! End-to-end coverage of one `AutoTrader` cycle against mocked venue and
//! LLM endpoints, plus the single-flight guard under real concurrency.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use nofx_controller::coinpool::StaticCoinPoolSource;
use nofx_controller::exchange::binance::BinanceAdapter;
use nofx_controller::llm::LlmClient;
use nofx_controller::logger::DecisionLogger;
use nofx_controller::market::AdapterBackedMarketData;
use nofx_controller::models::{AiModel, Credentials, Exchange, RiskParams, Trader as TraderConfig};
use nofx_controller::risk::RiskLimiter;
use nofx_controller::trader::AutoTrader;

fn trader_config(id: &str) -> TraderConfig {
    TraderConfig {
        id: id.to_string(),
        name: "Integration Trader".to_string(),
        ai_model: AiModel::Qwen,
        exchange: Exchange::Binance,
        credentials: Credentials::Binance {
            api_key: "key".to_string(),
            api_secret: "secret".to_string(),
        },
        risk: RiskParams {
            btc_eth_leverage: 5,
            altcoin_leverage: 3,
            max_daily_loss: 0.1,
            max_drawdown: 0.2,
            stop_trading_duration_minutes: 60,
        },
        scan_interval_minutes: 3,
        initial_balance: 1000.0,
        position_mode_override: None,
        custom_model: None,
        coin_pool_top_k: 20,
    }
}

async fn mount_account_and_positions(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/fapi/v2/account"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "totalWalletBalance": "1000.0",
            "totalUnrealizedProfit": "0.0",
            "availableBalance": "1000.0",
            "totalMarginBalance": "1000.0"
        })))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/fapi/v2/positionRisk"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/fapi/v1/ticker/price"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "price": "60000.00" })))
        .mount(server)
        .await;
}

fn build_trader(
    id: &str,
    venue_server: &MockServer,
    llm_server: &MockServer,
    tmp_dir: &std::path::Path,
) -> Arc<AutoTrader> {
    let adapter = Arc::new(BinanceAdapter::with_base_url(
        "key".to_string(),
        "secret".to_string(),
        venue_server.uri(),
    ));
    let market = Arc::new(AdapterBackedMarketData::new(adapter.clone()));
    let coin_pool = Arc::new(StaticCoinPoolSource::new(vec!["BTCUSDT".to_string()]));
    let llm = LlmClient::with_base_url("test-key".to_string(), AiModel::Qwen, None, llm_server.uri());
    let logger = DecisionLogger::new(tmp_dir, id);
    let risk_limiter = RiskLimiter::new(0.1, 0.2, 60, 1000.0, Utc::now());

    Arc::new(AutoTrader::new(
        trader_config(id),
        adapter,
        logger,
        llm,
        market,
        coin_pool,
        risk_limiter,
        None,
        None,
    ))
}

#[tokio::test]
async fn one_cycle_produces_exactly_one_successful_record() {
    let venue_server = MockServer::start().await;
    let llm_server = MockServer::start().await;
    mount_account_and_positions(&venue_server).await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": {
                    "content": "[{\"symbol\":\"BTCUSDT\",\"action\":\"hold\",\"reasoning\":\"no edge\"}]"
                }
            }],
            "usage": { "prompt_tokens": 42, "completion_tokens": 7 }
        })))
        .mount(&llm_server)
        .await;

    let tmp = tempfile::tempdir().unwrap();
    let trader = build_trader("t1", &venue_server, &llm_server, tmp.path());

    let record = trader.run_once().await.unwrap();
    assert!(record.success);
    assert_eq!(record.cycle_number, 1);
    assert_eq!(record.decisions.len(), 1);
    assert!(matches!(
        record.decisions[0],
        nofx_controller::decision::Decision::Hold { .. }
    ));
}

#[tokio::test]
async fn venue_failure_still_yields_one_degraded_record() {
    let venue_server = MockServer::start().await;
    let llm_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/fapi/v2/account"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&venue_server)
        .await;

    let tmp = tempfile::tempdir().unwrap();
    let trader = build_trader("t2", &venue_server, &llm_server, tmp.path());

    let record = trader.run_once().await.unwrap();
    assert!(!record.success);
    assert!(record.error.as_deref().unwrap_or("").contains("balance fetch failed"));
    assert!(record.decisions.is_empty());
}

#[tokio::test]
async fn single_flight_guard_rejects_a_concurrent_cycle() {
    let venue_server = MockServer::start().await;
    let llm_server = MockServer::start().await;
    mount_account_and_positions(&venue_server).await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_delay(Duration::from_millis(300))
                .set_body_json(json!({
                    "choices": [{
                        "message": {
                            "content": "[{\"symbol\":\"BTCUSDT\",\"action\":\"wait\",\"reasoning\":\"slow\"}]"
                        }
                    }]
                })),
        )
        .mount(&llm_server)
        .await;

    let tmp = tempfile::tempdir().unwrap();
    let trader = build_trader("t3", &venue_server, &llm_server, tmp.path());

    let first = {
        let trader = trader.clone();
        tokio::spawn(async move { trader.run_once().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = trader.run_once().await;

    assert!(matches!(second, Err(nofx_controller::error::AppError::Conflict(_))));
    let first_result = first.await.unwrap();
    assert!(first_result.is_ok());
}

#[tokio::test]
async fn investment_baseline_reflects_adjustments_made_before_the_cutoff() {
    let venue_server = MockServer::start().await;
    let llm_server = MockServer::start().await;
    let tmp = tempfile::tempdir().unwrap();
    let trader = build_trader("t4", &venue_server, &llm_server, tmp.path());

    let before = trader.get_invested_amount_at(Utc::now());
    assert_eq!(before, 1000.0);

    trader.add_investment_delta(500.0, "deposit");
    tokio::time::sleep(Duration::from_millis(5)).await;
    let after = trader.get_invested_amount_at(Utc::now());
    assert_eq!(after, 1500.0);
}
