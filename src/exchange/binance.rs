//! Binance USDT-M perpetuals adapter. Base-denominated order sizes; HMAC-SHA256
//! query signing with `timestamp`/`recvWindow`; symbol form is already
//! canonical (`<BASE>USDT`), so venue<->canonical conversion is the identity.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::common::{hmac_sha256_hex, TtlCache};
use super::{ExchangeAdapter, OrderHandle};
use crate::error::{AppError, OrderError};
use crate::models::{AccountSnapshot, Exchange, Position, Side};

const BALANCE_TTL: Duration = Duration::from_secs(60);
const POSITIONS_TTL: Duration = Duration::from_secs(30);
const HTTP_TIMEOUT: Duration = Duration::from_secs(20);
const RECV_WINDOW_MS: i64 = 5_000;

pub struct BinanceAdapter {
    http: Client,
    api_key: String,
    api_secret: String,
    base_url: String,
    balance_cache: TtlCache<AccountSnapshot>,
    positions_cache: TtlCache<Vec<Position>>,
}

impl BinanceAdapter {
    pub fn new(api_key: String, api_secret: String) -> Self {
        Self::with_base_url(api_key, api_secret, "https://fapi.binance.com".to_string())
    }

    pub fn with_base_url(api_key: String, api_secret: String, base_url: String) -> Self {
        let http = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .expect("failed to build Binance HTTP client");
        Self {
            http,
            api_key,
            api_secret,
            base_url,
            balance_cache: TtlCache::new(BALANCE_TTL),
            positions_cache: TtlCache::new(POSITIONS_TTL),
        }
    }

    /// Canonical `<BASE>USDT` is already Binance's native form.
    pub fn to_venue_symbol(symbol: &str) -> String {
        symbol.to_string()
    }

    pub fn from_venue_symbol(symbol: &str) -> String {
        symbol.to_string()
    }

    fn invalidate_mutating_caches(&self) {
        self.balance_cache.invalidate();
        self.positions_cache.invalidate();
    }

    fn sign(&self, params: &[(&str, String)]) -> (String, String) {
        let query = params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        let signature = hmac_sha256_hex(&self.api_secret, &query).unwrap_or_default();
        (query, signature)
    }

    async fn signed_request(
        &self,
        method: reqwest::Method,
        path: &str,
        mut params: Vec<(&str, String)>,
    ) -> Result<Value, AppError> {
        let mut attempt = 0;
        loop {
            let timestamp = Utc::now().timestamp_millis();
            let mut call_params = params.clone();
            call_params.push(("timestamp", timestamp.to_string()));
            call_params.push(("recvWindow", RECV_WINDOW_MS.to_string()));
            let (query, signature) = self.sign(&call_params);
            let url = format!("{}{}?{}&signature={}", self.base_url, path, query, signature);

            let req = self
                .http
                .request(method.clone(), &url)
                .header("X-MBX-APIKEY", &self.api_key);
            let resp = req
                .send()
                .await
                .map_err(|e| AppError::TransientNetwork(e.to_string()))?;
            let status = resp.status();
            let body: Value = resp
                .json()
                .await
                .unwrap_or_else(|_| Value::String(String::new()));

            if status.is_success() {
                return Ok(body);
            }

            // -1021: timestamp outside recvWindow (clock skew) -> retry once.
            let code = body.get("code").and_then(Value::as_i64).unwrap_or(0);
            if code == -1021 && attempt == 0 {
                attempt += 1;
                warn!("binance clock skew (-1021), retrying with fresh timestamp");
                continue;
            }
            let message = body
                .get("msg")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string();
            return Err(AppError::VenueError {
                code: code.to_string(),
                message,
            });
        }
    }

    fn friendly_for_code(code: &str) -> (String, String) {
        match code {
            "-2019" => (
                "Insufficient margin".into(),
                "Reduce position size or leverage, or deposit more margin".into(),
            ),
            "-1021" => (
                "Clock skew".into(),
                "Local clock drifted from server time; retry".into(),
            ),
            "-4164" => (
                "Order notional too small".into(),
                "Increase position_size_usd above the venue minimum".into(),
            ),
            _ => ("Order rejected by venue".into(), "Check order parameters".into()),
        }
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        side: &str,
        quantity: f64,
        reduce_only: bool,
        leverage: u32,
    ) -> Result<OrderHandle, AppError> {
        let venue_symbol = Self::to_venue_symbol(symbol);
        let params = vec![
            ("symbol", venue_symbol.clone()),
            ("side", side.to_string()),
            ("type", "MARKET".to_string()),
            ("quantity", format!("{quantity}")),
            ("reduceOnly", reduce_only.to_string()),
        ];

        let result = self
            .signed_request(reqwest::Method::POST, "/fapi/v1/order", params)
            .await;

        self.invalidate_mutating_caches();

        match result {
            Ok(body) => {
                let order_id = body
                    .get("orderId")
                    .map(|v| v.to_string())
                    .unwrap_or_default();
                Ok(OrderHandle {
                    order_id,
                    symbol: symbol.to_string(),
                    side: if side == "BUY" { Side::Long } else { Side::Short },
                    quantity,
                })
            }
            Err(AppError::VenueError { code, message }) => {
                let (friendly, suggestion) = Self::friendly_for_code(&code);
                Err(AppError::order(OrderError {
                    exchange: "binance".into(),
                    symbol: symbol.to_string(),
                    side: side.to_string(),
                    quantity,
                    leverage,
                    required_margin_usd: None,
                    available_usd: None,
                    code,
                    message,
                    friendly,
                    suggestion,
                }))
            }
            Err(other) => Err(other),
        }
    }
}

#[derive(Debug, Deserialize)]
struct BinancePositionRisk {
    symbol: String,
    #[serde(rename = "positionAmt")]
    position_amt: String,
    #[serde(rename = "entryPrice")]
    entry_price: String,
    #[serde(rename = "markPrice")]
    mark_price: String,
    leverage: String,
    #[serde(rename = "unRealizedProfit")]
    unrealized_profit: String,
    #[serde(rename = "liquidationPrice")]
    liquidation_price: String,
    #[serde(rename = "updateTime")]
    update_time: i64,
}

#[async_trait]
impl ExchangeAdapter for BinanceAdapter {
    fn exchange(&self) -> Exchange {
        Exchange::Binance
    }

    async fn get_balance(&self) -> Result<AccountSnapshot, AppError> {
        if let Some(cached) = self.balance_cache.get() {
            return Ok(cached);
        }
        let body = self
            .signed_request(reqwest::Method::GET, "/fapi/v2/account", vec![])
            .await?;

        let total_wallet_balance: f64 = body
            .get("totalWalletBalance")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
            .unwrap_or(0.0);
        let unrealized_profit: f64 = body
            .get("totalUnrealizedProfit")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
            .unwrap_or(0.0);
        let available_balance: f64 = body
            .get("availableBalance")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
            .unwrap_or(0.0);
        let total_margin_balance: f64 = body
            .get("totalMarginBalance")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
            .unwrap_or(total_wallet_balance + unrealized_profit);
        let margin_used = total_margin_balance - available_balance;
        let margin_used_pct = if total_margin_balance > 0.0 {
            (margin_used / total_margin_balance * 100.0).clamp(0.0, 100.0)
        } else {
            0.0
        };
        let position_count = body
            .get("positions")
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter(|p| {
                        p.get("positionAmt")
                            .and_then(Value::as_str)
                            .and_then(|s| s.parse::<f64>().ok())
                            .map(|q| q.abs() > 0.0)
                            .unwrap_or(false)
                    })
                    .count() as u32
            })
            .unwrap_or(0);

        let snapshot = AccountSnapshot {
            total_equity: total_margin_balance,
            wallet_balance: total_wallet_balance,
            unrealized_profit,
            available_balance,
            margin_used,
            margin_used_pct,
            position_count,
        };
        self.balance_cache.set(snapshot);
        Ok(snapshot)
    }

    async fn get_positions(&self) -> Result<Vec<Position>, AppError> {
        if let Some(cached) = self.positions_cache.get() {
            return Ok(cached);
        }
        let body = self
            .signed_request(reqwest::Method::GET, "/fapi/v2/positionRisk", vec![])
            .await?;
        let raw: Vec<BinancePositionRisk> = serde_json::from_value(body)
            .map_err(|e| AppError::ParseError(format!("binance positionRisk: {e}")))?;

        let positions = raw
            .into_iter()
            .filter_map(|p| {
                let qty: f64 = p.position_amt.parse().ok()?;
                if qty == 0.0 {
                    return None;
                }
                Some(Position {
                    symbol: Self::from_venue_symbol(&p.symbol),
                    side: if qty > 0.0 { Side::Long } else { Side::Short },
                    quantity: qty.abs(),
                    entry_price: p.entry_price.parse().unwrap_or(0.0),
                    mark_price: p.mark_price.parse().unwrap_or(0.0),
                    leverage: p.leverage.parse().unwrap_or(1),
                    unrealized_pnl: p.unrealized_profit.parse().unwrap_or(0.0),
                    liquidation_price: p.liquidation_price.parse().unwrap_or(0.0),
                    update_time_ms: p.update_time,
                })
            })
            .collect::<Vec<_>>();

        self.positions_cache.set(positions.clone());
        Ok(positions)
    }

    async fn get_market_price(&self, symbol: &str) -> Result<f64, AppError> {
        let url = format!(
            "{}/fapi/v1/ticker/price?symbol={}",
            self.base_url,
            Self::to_venue_symbol(symbol)
        );
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| AppError::TransientNetwork(e.to_string()))?;
        let body: Value = resp
            .json()
            .await
            .map_err(|e| AppError::ParseError(e.to_string()))?;
        body.get("price")
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<f64>().ok())
            .ok_or_else(|| AppError::ParseError("missing price field".into()))
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), AppError> {
        let params = vec![
            ("symbol", Self::to_venue_symbol(symbol)),
            ("leverage", leverage.to_string()),
        ];
        self.signed_request(reqwest::Method::POST, "/fapi/v1/leverage", params)
            .await?;
        debug!(symbol, leverage, "binance leverage set");
        Ok(())
    }

    async fn open_long(
        &self,
        symbol: &str,
        base_qty: f64,
        leverage: u32,
    ) -> Result<OrderHandle, AppError> {
        self.set_leverage(symbol, leverage).await?;
        self.place_market_order(symbol, "BUY", base_qty, false, leverage)
            .await
    }

    async fn open_short(
        &self,
        symbol: &str,
        base_qty: f64,
        leverage: u32,
    ) -> Result<OrderHandle, AppError> {
        self.set_leverage(symbol, leverage).await?;
        self.place_market_order(symbol, "SELL", base_qty, false, leverage)
            .await
    }

    async fn close_long(&self, symbol: &str, base_qty: f64) -> Result<OrderHandle, AppError> {
        let qty = if base_qty > 0.0 {
            base_qty
        } else {
            self.live_quantity(symbol, Side::Long).await?
        };
        self.place_market_order(symbol, "SELL", qty, true, 1).await
    }

    async fn close_short(&self, symbol: &str, base_qty: f64) -> Result<OrderHandle, AppError> {
        let qty = if base_qty > 0.0 {
            base_qty
        } else {
            self.live_quantity(symbol, Side::Short).await?
        };
        self.place_market_order(symbol, "BUY", qty, true, 1).await
    }

    async fn cancel_all_orders(&self, symbol: &str) -> Result<(), AppError> {
        let params = vec![("symbol", Self::to_venue_symbol(symbol))];
        self.signed_request(reqwest::Method::DELETE, "/fapi/v1/allOpenOrders", params)
            .await?;
        Ok(())
    }

    async fn set_stop_loss(
        &self,
        symbol: &str,
        side: Side,
        qty: f64,
        price: f64,
    ) -> Result<(), AppError> {
        let order_side = match side {
            Side::Long => "SELL",
            Side::Short => "BUY",
        };
        let params = vec![
            ("symbol", Self::to_venue_symbol(symbol)),
            ("side", order_side.to_string()),
            ("type", "STOP_MARKET".to_string()),
            ("stopPrice", format!("{price}")),
            ("quantity", format!("{qty}")),
            ("reduceOnly", "true".to_string()),
        ];
        self.signed_request(reqwest::Method::POST, "/fapi/v1/order", params)
            .await?;
        Ok(())
    }

    async fn set_take_profit(
        &self,
        symbol: &str,
        side: Side,
        qty: f64,
        price: f64,
    ) -> Result<(), AppError> {
        let order_side = match side {
            Side::Long => "SELL",
            Side::Short => "BUY",
        };
        let params = vec![
            ("symbol", Self::to_venue_symbol(symbol)),
            ("side", order_side.to_string()),
            ("type", "TAKE_PROFIT_MARKET".to_string()),
            ("stopPrice", format!("{price}")),
            ("quantity", format!("{qty}")),
            ("reduceOnly", "true".to_string()),
        ];
        self.signed_request(reqwest::Method::POST, "/fapi/v1/order", params)
            .await?;
        Ok(())
    }
}

impl BinanceAdapter {
    async fn live_quantity(&self, symbol: &str, side: Side) -> Result<f64, AppError> {
        let positions = self.get_positions().await?;
        positions
            .into_iter()
            .find(|p| p.symbol == symbol && p.side == side)
            .map(|p| p.quantity)
            .ok_or_else(|| AppError::NotFound(format!("no open {side:?} position on {symbol}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbol_round_trip_is_identity() {
        let venue = BinanceAdapter::to_venue_symbol("BTCUSDT");
        assert_eq!(BinanceAdapter::from_venue_symbol(&venue), "BTCUSDT");
    }
}
