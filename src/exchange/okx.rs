//! OKX perpetual-swap adapter. Contract-denominated sizes (requires the
//! `InstrumentSpec` conversion math in `common`), base64 HMAC-SHA256 signing
//! over `ts+METHOD+path+body`, and a position-mode probe that yields to an
//! explicit per-trader override (spec §9).

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::Client;
use serde_json::Value;
use tracing::debug;

use super::common::{
    base_to_contracts, contracts_to_base, hmac_sha256_base64, InstrumentSpec,
    InstrumentSpecCache, TtlCache,
};
use super::{DepositWithdrawalSource, ExchangeAdapter, FillsSource, OrderHandle, TransferEvent, TransferKind};
use crate::error::{AppError, OrderError};
use crate::models::{AccountSnapshot, Exchange, Position, Side};

const BALANCE_TTL: Duration = Duration::from_secs(60);
const POSITIONS_TTL: Duration = Duration::from_secs(30);
const POSITION_MODE_TTL: Duration = Duration::from_secs(60);
const HTTP_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionMode {
    LongShort,
    Net,
}

impl PositionMode {
    fn from_okx_str(s: &str) -> Option<Self> {
        match s {
            "long_short_mode" => Some(PositionMode::LongShort),
            "net_mode" => Some(PositionMode::Net),
            _ => None,
        }
    }
}

pub struct OkxAdapter {
    http: Client,
    api_key: String,
    api_secret: String,
    passphrase: String,
    base_url: String,
    position_mode_override: Option<PositionMode>,
    balance_cache: TtlCache<AccountSnapshot>,
    positions_cache: TtlCache<Vec<Position>>,
    position_mode_cache: TtlCache<PositionMode>,
    instrument_specs: InstrumentSpecCache,
}

impl OkxAdapter {
    pub fn new(
        api_key: String,
        api_secret: String,
        passphrase: String,
        position_mode_override: Option<String>,
    ) -> Self {
        Self::with_base_url(
            api_key,
            api_secret,
            passphrase,
            position_mode_override,
            "https://www.okx.com".to_string(),
        )
    }

    pub fn with_base_url(
        api_key: String,
        api_secret: String,
        passphrase: String,
        position_mode_override: Option<String>,
        base_url: String,
    ) -> Self {
        let http = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .expect("failed to build OKX HTTP client");
        Self {
            http,
            api_key,
            api_secret,
            passphrase,
            base_url,
            position_mode_override: position_mode_override
                .as_deref()
                .and_then(PositionMode::from_okx_str),
            balance_cache: TtlCache::new(BALANCE_TTL),
            positions_cache: TtlCache::new(POSITIONS_TTL),
            position_mode_cache: TtlCache::new(POSITION_MODE_TTL),
            instrument_specs: InstrumentSpecCache::default(),
        }
    }

    /// `BTCUSDT` -> `BTC-USDT-SWAP`.
    pub fn to_venue_symbol(symbol: &str) -> String {
        if let Some(base) = symbol.strip_suffix("USDT") {
            format!("{base}-USDT-SWAP")
        } else {
            symbol.to_string()
        }
    }

    pub fn from_venue_symbol(inst_id: &str) -> String {
        inst_id.replace("-USDT-SWAP", "USDT").replace('-', "")
    }

    fn invalidate_mutating_caches(&self) {
        self.balance_cache.invalidate();
        self.positions_cache.invalidate();
    }

    fn timestamp(&self) -> String {
        Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
    }

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        body: &str,
    ) -> Result<Value, AppError> {
        let ts = self.timestamp();
        let prehash = format!("{}{}{}{}", ts, method.as_str(), path, body);
        let signature = hmac_sha256_base64(&self.api_secret, &prehash)?;

        let url = format!("{}{}", self.base_url, path);
        let mut req = self
            .http
            .request(method.clone(), &url)
            .header("OK-ACCESS-KEY", &self.api_key)
            .header("OK-ACCESS-SIGN", signature)
            .header("OK-ACCESS-TIMESTAMP", ts)
            .header("OK-ACCESS-PASSPHRASE", &self.passphrase)
            .header("Content-Type", "application/json");
        if !body.is_empty() {
            req = req.body(body.to_string());
        }

        let resp = req
            .send()
            .await
            .map_err(|e| AppError::TransientNetwork(e.to_string()))?;
        let payload: Value = resp
            .json()
            .await
            .map_err(|e| AppError::ParseError(e.to_string()))?;

        let code = payload.get("code").and_then(Value::as_str).unwrap_or("1");
        if code != "0" {
            let message = payload
                .get("msg")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string();
            return Err(AppError::VenueError {
                code: code.to_string(),
                message,
            });
        }
        Ok(payload)
    }

    fn friendly_for_code(code: &str) -> (String, String) {
        match code {
            "51008" => (
                "Insufficient margin".into(),
                "Reduce position size or leverage, or deposit more margin".into(),
            ),
            "51121" => (
                "Order size below lot step".into(),
                "Round the quantity to the instrument's lot size".into(),
            ),
            _ => ("Order rejected by venue".into(), "Check order parameters".into()),
        }
    }

    async fn instrument_spec(&self, venue_symbol: &str) -> Result<InstrumentSpec, AppError> {
        if let Some(spec) = self.instrument_specs.get(venue_symbol) {
            return Ok(spec);
        }
        let path = format!("/api/v5/public/instruments?instType=SWAP&instId={venue_symbol}");
        let body = self.request(reqwest::Method::GET, &path, "").await?;
        let data = body
            .get("data")
            .and_then(Value::as_array)
            .and_then(|arr| arr.first())
            .ok_or_else(|| AppError::NotFound(format!("no instrument spec for {venue_symbol}")))?;
        let parse_f64 = |key: &str| -> f64 {
            data.get(key)
                .and_then(Value::as_str)
                .and_then(|s| s.parse().ok())
                .unwrap_or(0.0)
        };
        let spec = InstrumentSpec {
            ct_val: parse_f64("ctVal"),
            lot_sz: parse_f64("lotSz"),
            min_sz: parse_f64("minSz"),
        };
        self.instrument_specs.set(venue_symbol, spec);
        Ok(spec)
    }

    /// Explicit per-trader override wins; otherwise probe `account/config`
    /// and fall back to inferring from existing positions (spec §9).
    async fn position_mode(&self) -> Result<PositionMode, AppError> {
        if let Some(mode) = self.position_mode_override {
            return Ok(mode);
        }
        if let Some(cached) = self.position_mode_cache.get() {
            return Ok(cached);
        }
        match self.request(reqwest::Method::GET, "/api/v5/account/config", "").await {
            Ok(body) => {
                let mode = body
                    .get("data")
                    .and_then(Value::as_array)
                    .and_then(|arr| arr.first())
                    .and_then(|d| d.get("posMode"))
                    .and_then(Value::as_str)
                    .and_then(PositionMode::from_okx_str)
                    .unwrap_or(PositionMode::Net);
                self.position_mode_cache.set(mode);
                Ok(mode)
            }
            Err(_) => {
                let positions = self.get_positions().await.unwrap_or_default();
                let mode = if positions.is_empty() {
                    PositionMode::Net
                } else {
                    PositionMode::LongShort
                };
                self.position_mode_cache.set(mode);
                Ok(mode)
            }
        }
    }

    async fn place_order(
        &self,
        symbol: &str,
        side: &str,
        pos_side: &str,
        base_qty: f64,
        reduce_only: bool,
        leverage: u32,
    ) -> Result<OrderHandle, AppError> {
        let venue_symbol = Self::to_venue_symbol(symbol);
        let spec = self.instrument_spec(&venue_symbol).await?;
        let contracts = base_to_contracts(base_qty, spec)?;

        let mode = self.position_mode().await?;
        let mut body = serde_json::json!({
            "instId": venue_symbol,
            "tdMode": "cross",
            "side": side,
            "ordType": "market",
            "sz": format!("{contracts}"),
        });
        if mode == PositionMode::LongShort {
            body["posSide"] = Value::String(pos_side.to_string());
        }
        if reduce_only {
            body["reduceOnly"] = Value::Bool(true);
        }

        let result = self
            .request(
                reqwest::Method::POST,
                "/api/v5/trade/order",
                &body.to_string(),
            )
            .await;

        self.invalidate_mutating_caches();

        match result {
            Ok(resp) => {
                let order_id = resp
                    .get("data")
                    .and_then(Value::as_array)
                    .and_then(|arr| arr.first())
                    .and_then(|d| d.get("ordId"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                Ok(OrderHandle {
                    order_id,
                    symbol: symbol.to_string(),
                    side: if side == "buy" { Side::Long } else { Side::Short },
                    quantity: contracts_to_base(contracts, spec),
                })
            }
            Err(AppError::VenueError { code, message }) => {
                let (friendly, suggestion) = Self::friendly_for_code(&code);
                Err(AppError::order(OrderError {
                    exchange: "okx".into(),
                    symbol: symbol.to_string(),
                    side: side.to_string(),
                    quantity: base_qty,
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

    async fn live_quantity(&self, symbol: &str, side: Side) -> Result<f64, AppError> {
        let positions = self.get_positions().await?;
        positions
            .into_iter()
            .find(|p| p.symbol == symbol && p.side == side)
            .map(|p| p.quantity)
            .ok_or_else(|| AppError::NotFound(format!("no open {side:?} position on {symbol}")))
    }
}

#[async_trait]
impl ExchangeAdapter for OkxAdapter {
    fn exchange(&self) -> Exchange {
        Exchange::Okx
    }

    async fn get_balance(&self) -> Result<AccountSnapshot, AppError> {
        if let Some(cached) = self.balance_cache.get() {
            return Ok(cached);
        }
        let body = self
            .request(reqwest::Method::GET, "/api/v5/account/balance", "")
            .await?;
        let details = body
            .get("data")
            .and_then(Value::as_array)
            .and_then(|arr| arr.first())
            .ok_or_else(|| AppError::ParseError("empty okx balance response".into()))?;

        let parse_f64 = |key: &str| -> f64 {
            details
                .get(key)
                .and_then(Value::as_str)
                .and_then(|s| s.parse().ok())
                .unwrap_or(0.0)
        };
        let total_equity = parse_f64("totalEq");
        let available_balance = parse_f64("availEq");
        let margin_used = (total_equity - available_balance).max(0.0);
        let margin_used_pct = if total_equity > 0.0 {
            (margin_used / total_equity * 100.0).clamp(0.0, 100.0)
        } else {
            0.0
        };
        let position_count = self.get_positions().await.map(|p| p.len() as u32).unwrap_or(0);

        let snapshot = AccountSnapshot {
            total_equity,
            wallet_balance: total_equity - parse_f64("upl"),
            unrealized_profit: parse_f64("upl"),
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
            .request(
                reqwest::Method::GET,
                "/api/v5/account/positions?instType=SWAP",
                "",
            )
            .await?;
        let data = body
            .get("data")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut positions = Vec::new();
        for entry in data {
            let qty: f64 = entry
                .get("pos")
                .and_then(Value::as_str)
                .and_then(|s| s.parse().ok())
                .unwrap_or(0.0);
            if qty == 0.0 {
                continue;
            }
            let inst_id = entry.get("instId").and_then(Value::as_str).unwrap_or("");
            let spec = self.instrument_spec(inst_id).await.unwrap_or(InstrumentSpec {
                ct_val: 1.0,
                lot_sz: 1.0,
                min_sz: 1.0,
            });
            let pos_side = entry.get("posSide").and_then(Value::as_str).unwrap_or("net");
            let side = match pos_side {
                "long" => Side::Long,
                "short" => Side::Short,
                _ => {
                    if qty > 0.0 {
                        Side::Long
                    } else {
                        Side::Short
                    }
                }
            };
            positions.push(Position {
                symbol: Self::from_venue_symbol(inst_id),
                side,
                quantity: contracts_to_base(qty.abs(), spec),
                entry_price: entry
                    .get("avgPx")
                    .and_then(Value::as_str)
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0.0),
                mark_price: entry
                    .get("markPx")
                    .and_then(Value::as_str)
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0.0),
                leverage: entry
                    .get("lever")
                    .and_then(Value::as_str)
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(1),
                unrealized_pnl: entry
                    .get("upl")
                    .and_then(Value::as_str)
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0.0),
                liquidation_price: entry
                    .get("liqPx")
                    .and_then(Value::as_str)
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0.0),
                update_time_ms: entry
                    .get("uTime")
                    .and_then(Value::as_str)
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0),
            });
        }

        self.positions_cache.set(positions.clone());
        Ok(positions)
    }

    async fn get_market_price(&self, symbol: &str) -> Result<f64, AppError> {
        let venue_symbol = Self::to_venue_symbol(symbol);
        let path = format!("/api/v5/market/ticker?instId={venue_symbol}");
        let body = self.request(reqwest::Method::GET, &path, "").await?;
        body.get("data")
            .and_then(Value::as_array)
            .and_then(|arr| arr.first())
            .and_then(|d| d.get("last"))
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<f64>().ok())
            .ok_or_else(|| AppError::ParseError("missing last price field".into()))
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), AppError> {
        let venue_symbol = Self::to_venue_symbol(symbol);
        let body = serde_json::json!({
            "instId": venue_symbol,
            "lever": leverage.to_string(),
            "mgnMode": "cross",
        });
        self.request(
            reqwest::Method::POST,
            "/api/v5/account/set-leverage",
            &body.to_string(),
        )
        .await?;
        debug!(symbol, leverage, "okx leverage set");
        Ok(())
    }

    async fn open_long(
        &self,
        symbol: &str,
        base_qty: f64,
        leverage: u32,
    ) -> Result<OrderHandle, AppError> {
        self.set_leverage(symbol, leverage).await?;
        self.place_order(symbol, "buy", "long", base_qty, false, leverage)
            .await
    }

    async fn open_short(
        &self,
        symbol: &str,
        base_qty: f64,
        leverage: u32,
    ) -> Result<OrderHandle, AppError> {
        self.set_leverage(symbol, leverage).await?;
        self.place_order(symbol, "sell", "short", base_qty, false, leverage)
            .await
    }

    async fn close_long(&self, symbol: &str, base_qty: f64) -> Result<OrderHandle, AppError> {
        let qty = if base_qty > 0.0 {
            base_qty
        } else {
            self.live_quantity(symbol, Side::Long).await?
        };
        self.place_order(symbol, "sell", "long", qty, true, 1).await
    }

    async fn close_short(&self, symbol: &str, base_qty: f64) -> Result<OrderHandle, AppError> {
        let qty = if base_qty > 0.0 {
            base_qty
        } else {
            self.live_quantity(symbol, Side::Short).await?
        };
        self.place_order(symbol, "buy", "short", qty, true, 1).await
    }

    async fn cancel_all_orders(&self, symbol: &str) -> Result<(), AppError> {
        let venue_symbol = Self::to_venue_symbol(symbol);
        let path = format!("/api/v5/trade/orders-pending?instId={venue_symbol}");
        let open = self.request(reqwest::Method::GET, &path, "").await?;
        let order_ids: Vec<Value> = open
            .get("data")
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(|o| o.get("ordId").cloned())
                    .map(|ord_id| serde_json::json!({"instId": venue_symbol, "ordId": ord_id}))
                    .collect()
            })
            .unwrap_or_default();
        if order_ids.is_empty() {
            return Ok(());
        }
        self.request(
            reqwest::Method::POST,
            "/api/v5/trade/cancel-batch-orders",
            &Value::Array(order_ids).to_string(),
        )
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
        self.place_algo_trigger(symbol, side, qty, price, "sl").await
    }

    async fn set_take_profit(
        &self,
        symbol: &str,
        side: Side,
        qty: f64,
        price: f64,
    ) -> Result<(), AppError> {
        self.place_algo_trigger(symbol, side, qty, price, "tp").await
    }
}

impl OkxAdapter {
    async fn place_algo_trigger(
        &self,
        symbol: &str,
        side: Side,
        base_qty: f64,
        price: f64,
        kind: &str,
    ) -> Result<(), AppError> {
        let venue_symbol = Self::to_venue_symbol(symbol);
        let spec = self.instrument_spec(&venue_symbol).await?;
        let contracts = base_to_contracts(base_qty, spec)?;
        let order_side = match side {
            Side::Long => "sell",
            Side::Short => "buy",
        };
        let mode = self.position_mode().await?;
        let pos_side = match side {
            Side::Long => "long",
            Side::Short => "short",
        };

        let mut body = serde_json::json!({
            "instId": venue_symbol,
            "tdMode": "cross",
            "side": order_side,
            "ordType": "conditional",
            "sz": format!("{contracts}"),
            "reduceOnly": true,
        });
        if mode == PositionMode::LongShort {
            body["posSide"] = Value::String(pos_side.to_string());
        }
        if kind == "sl" {
            body["slTriggerPx"] = Value::String(format!("{price}"));
            body["slOrdPx"] = Value::String("-1".to_string());
        } else {
            body["tpTriggerPx"] = Value::String(format!("{price}"));
            body["tpOrdPx"] = Value::String("-1".to_string());
        }

        self.request(
            reqwest::Method::POST,
            "/api/v5/trade/order-algo",
            &body.to_string(),
        )
        .await?;
        Ok(())
    }

    async fn fetch_recent_fills(&self, limit: u32) -> Result<Vec<Value>, AppError> {
        let path = format!("/api/v5/trade/fills-history?instType=SWAP&limit={limit}");
        let payload = self.request(reqwest::Method::GET, &path, "").await?;
        Ok(payload.get("data").and_then(Value::as_array).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl FillsSource for OkxAdapter {
    /// Raw fills off `/api/v5/trade/fills-history`, exposed as-is through
    /// the admin API (spec §6) rather than mapped into a domain type.
    async fn list_recent_fills(&self, limit: u32) -> Result<Vec<Value>, AppError> {
        self.fetch_recent_fills(limit).await
    }
}

#[async_trait]
impl DepositWithdrawalSource for OkxAdapter {
    /// Combines `/api/v5/asset/deposit-history` and `/api/v5/asset/withdrawal-history`,
    /// both since `since` (spec §4.5 auto-calibration).
    async fn list_transfers_since(&self, since: DateTime<Utc>) -> Result<Vec<TransferEvent>, AppError> {
        let after_ms = since.timestamp_millis();
        let mut events = Vec::new();

        let deposits = self
            .request(
                reqwest::Method::GET,
                &format!("/api/v5/asset/deposit-history?after={after_ms}"),
                "",
            )
            .await?;
        for entry in deposits.get("data").and_then(Value::as_array).cloned().unwrap_or_default() {
            if let Some(event) = parse_transfer(&entry, TransferKind::Deposit) {
                events.push(event);
            }
        }

        let withdrawals = self
            .request(
                reqwest::Method::GET,
                &format!("/api/v5/asset/withdrawal-history?after={after_ms}"),
                "",
            )
            .await?;
        for entry in withdrawals.get("data").and_then(Value::as_array).cloned().unwrap_or_default() {
            if let Some(event) = parse_transfer(&entry, TransferKind::Withdrawal) {
                events.push(event);
            }
        }

        Ok(events)
    }
}

fn parse_transfer(entry: &Value, kind: TransferKind) -> Option<TransferEvent> {
    let amount: f64 = entry.get("amt").and_then(Value::as_str)?.parse().ok()?;
    let ts_ms: i64 = entry.get("ts").and_then(Value::as_str)?.parse().ok()?;
    let timestamp = Utc.timestamp_millis_opt(ts_ms).single()?;
    let tx_id = entry
        .get("txId")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    let signed_amount = match kind {
        TransferKind::Deposit => amount.abs(),
        TransferKind::Withdrawal => -amount.abs(),
    };
    Some(TransferEvent {
        tx_id,
        amount: signed_amount,
        timestamp,
        kind,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn venue_symbol_round_trips() {
        let venue = OkxAdapter::to_venue_symbol("BTCUSDT");
        assert_eq!(venue, "BTC-USDT-SWAP");
        assert_eq!(OkxAdapter::from_venue_symbol(&venue), "BTCUSDT");
    }

    #[test]
    fn explicit_override_parses() {
        assert_eq!(
            PositionMode::from_okx_str("long_short_mode"),
            Some(PositionMode::LongShort)
        );
        assert_eq!(PositionMode::from_okx_str("net_mode"), Some(PositionMode::Net));
        assert_eq!(PositionMode::from_okx_str("bogus"), None);
    }
}
