//! Exchange Adapter — a uniform capability set over four heterogeneous
//! perpetual-futures venues (spec §4.1).
//!
//! One concrete type per venue implements `ExchangeAdapter`; venue-specific
//! concerns (unit conversion, signing, position mode) stay inside each
//! implementation rather than leaking into a generic "venue tag" (spec §9).

pub mod aster;
pub mod binance;
pub mod common;
pub mod hyperliquid;
pub mod okx;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::models::{AccountSnapshot, Position, Side};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderHandle {
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
}

/// Uniform capability set implemented by each venue adapter. All operations
/// are fallible; failures surface as `AppError`, with order placement using
/// the structured `AppError::OrderError` variant specifically.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    fn exchange(&self) -> crate::models::Exchange;

    async fn get_balance(&self) -> Result<AccountSnapshot, AppError>;

    /// Zero-quantity positions are filtered out before returning (spec §4.1).
    async fn get_positions(&self) -> Result<Vec<Position>, AppError>;

    async fn get_market_price(&self, symbol: &str) -> Result<f64, AppError>;

    /// Must be called before an open order at the venue's required margin
    /// mode; idempotent.
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), AppError>;

    async fn open_long(
        &self,
        symbol: &str,
        base_qty: f64,
        leverage: u32,
    ) -> Result<OrderHandle, AppError>;

    async fn open_short(
        &self,
        symbol: &str,
        base_qty: f64,
        leverage: u32,
    ) -> Result<OrderHandle, AppError>;

    /// `base_qty == 0.0` means "close the full position" (spec §9 open
    /// question, resolved at the adapter boundary — the caller need not
    /// query the live quantity first).
    async fn close_long(&self, symbol: &str, base_qty: f64) -> Result<OrderHandle, AppError>;

    async fn close_short(&self, symbol: &str, base_qty: f64) -> Result<OrderHandle, AppError>;

    async fn cancel_all_orders(&self, symbol: &str) -> Result<(), AppError>;

    async fn set_stop_loss(
        &self,
        symbol: &str,
        side: Side,
        qty: f64,
        price: f64,
    ) -> Result<(), AppError>;

    async fn set_take_profit(
        &self,
        symbol: &str,
        side: Side,
        qty: f64,
        price: f64,
    ) -> Result<(), AppError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Deposit,
    Withdrawal,
}

#[derive(Debug, Clone)]
pub struct TransferEvent {
    pub tx_id: Option<String>,
    pub amount: f64,
    pub timestamp: DateTime<Utc>,
    pub kind: TransferKind,
}

/// OKX-only capability (spec §4.5 auto-calibration): not part of
/// `ExchangeAdapter` because no other venue exposes a comparable history
/// endpoint through this controller.
#[async_trait]
pub trait DepositWithdrawalSource: Send + Sync {
    async fn list_transfers_since(&self, since: DateTime<Utc>) -> Result<Vec<TransferEvent>, AppError>;
}

/// OKX-only capability backing `GET /api/okx/fills` (spec §6): raw venue
/// fills, exposed unmapped rather than forced into a shared domain shape.
#[async_trait]
pub trait FillsSource: Send + Sync {
    async fn list_recent_fills(&self, limit: u32) -> Result<Vec<serde_json::Value>, AppError>;
}
