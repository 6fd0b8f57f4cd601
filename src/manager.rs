//! Trader Manager (spec §4.6): the id -> trader registry. Enumeration
//! always returns snapshots; the manager never hands out a live reference
//! into its internal map.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::warn;

use crate::decision::DecisionRecord;
use crate::error::AppError;
use crate::exchange::ExchangeAdapter;
use crate::trader::AutoTrader;

#[derive(Debug, Clone, Serialize)]
pub struct TraderComparison {
    pub trader_id: String,
    pub trader_name: String,
    pub equity: f64,
    pub pnl: f64,
    pub pnl_pct: f64,
    pub call_count: u64,
    pub is_running: bool,
    pub position_count: u32,
    pub margin_used_pct: f64,
}

/// Registry of every trader in the process, guarded by a read-write lock
/// (spec §5 shared-resource policy). Traders own their own state; the
/// manager only owns the lookup.
pub struct TraderManager {
    traders: RwLock<HashMap<String, Arc<AutoTrader>>>,
}

impl Default for TraderManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TraderManager {
    pub fn new() -> Self {
        Self {
            traders: RwLock::new(HashMap::new()),
        }
    }

    pub fn add(&self, trader: Arc<AutoTrader>) -> Result<(), AppError> {
        let id = trader.id().to_string();
        let mut traders = self.traders.write();
        if traders.contains_key(&id) {
            return Err(AppError::ConfigInvalid(format!("duplicate trader id: {id}")));
        }
        traders.insert(id, trader);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<AutoTrader>> {
        self.traders.read().get(id).cloned()
    }

    pub fn all(&self) -> Vec<Arc<AutoTrader>> {
        self.traders.read().values().cloned().collect()
    }

    pub fn ids(&self) -> Vec<String> {
        self.traders.read().keys().cloned().collect()
    }

    /// The convention used when an API request omits `trader_id` (spec §6).
    pub fn first(&self) -> Option<Arc<AutoTrader>> {
        let traders = self.traders.read();
        let mut ids: Vec<&String> = traders.keys().collect();
        ids.sort();
        ids.first().and_then(|id| traders.get(*id)).cloned()
    }

    pub async fn start_all(&self) {
        let traders = self.all();
        let handles = traders.into_iter().map(|t| tokio::spawn(async move { t.start().await }));
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "trader start task panicked");
            }
        }
    }

    pub fn stop_all(&self) {
        for trader in self.all() {
            trader.stop();
        }
    }

    /// For each trader, for each open position, dispatch the matching
    /// close. Failures are isolated per trader/position (spec §4.6).
    /// Traders are dispatched in parallel (spec §5) so one slow venue call
    /// can't serialize every other trader's close-all.
    pub async fn close_all_positions(&self) -> HashMap<String, Vec<Result<(), String>>> {
        let tasks = self.all().into_iter().map(|trader| async move {
            let positions = trader.adapter.get_positions().await.unwrap_or_default();
            let mut per_trader = Vec::new();
            for position in positions {
                let outcome = match position.side {
                    crate::models::Side::Long => trader.adapter.close_long(&position.symbol, 0.0).await,
                    crate::models::Side::Short => trader.adapter.close_short(&position.symbol, 0.0).await,
                };
                per_trader.push(outcome.map(|_| ()).map_err(|e| e.to_string()));
            }
            (trader.id().to_string(), per_trader)
        });
        futures::future::join_all(tasks).await.into_iter().collect()
    }

    pub async fn run_once_all(&self) -> HashMap<String, Result<DecisionRecord, AppError>> {
        let tasks = self
            .all()
            .into_iter()
            .map(|trader| async move { (trader.id().to_string(), trader.run_once().await) });
        futures::future::join_all(tasks).await.into_iter().collect()
    }

    pub async fn run_ai_close_then_open_all(&self) -> HashMap<String, Result<(DecisionRecord, DecisionRecord), AppError>> {
        let tasks = self
            .all()
            .into_iter()
            .map(|trader| async move { (trader.id().to_string(), trader.run_ai_close_then_open().await) });
        futures::future::join_all(tasks).await.into_iter().collect()
    }

    pub async fn comparison(&self) -> Vec<TraderComparison> {
        let tasks = self.all().into_iter().map(|trader| async move {
            let account = trader.adapter.get_balance().await.ok();
            let equity = account.as_ref().map(|a| a.total_equity).unwrap_or(trader.config.initial_balance);
            let invested = trader.get_invested_amount_at(chrono::Utc::now());
            let pnl = equity - invested;
            let pnl_pct = if invested > 0.0 { pnl / invested * 100.0 } else { 0.0 };
            TraderComparison {
                trader_id: trader.id().to_string(),
                trader_name: trader.config.name.clone(),
                equity,
                pnl,
                pnl_pct,
                call_count: trader.call_count(),
                is_running: trader.is_running(),
                position_count: account.as_ref().map(|a| a.position_count).unwrap_or(0),
                margin_used_pct: account.map(|a| a.margin_used_pct).unwrap_or(0.0),
            }
        });
        futures::future::join_all(tasks).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_manager_has_no_first_trader() {
        let manager = TraderManager::new();
        assert!(manager.first().is_none());
        assert!(manager.ids().is_empty());
    }
}
