//! Auto-Trader (spec §4.5): the per-tenant cycle state machine. Owns its
//! adapter, logger, LLM client, and investment ledger exclusively — nothing
//! here is shared across traders.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::coinpool::CoinPoolSource;
use crate::decision::DecisionRecord;
use crate::engine;
use crate::error::AppError;
use crate::exchange::{DepositWithdrawalSource, ExchangeAdapter, FillsSource, TransferKind};
use crate::llm::LlmClient;
use crate::logger::DecisionLogger;
use crate::market::MarketData;
use crate::models::{InvestmentLedger, Trader as TraderConfig};
use crate::risk::RiskLimiter;

fn min_calibration_interval() -> ChronoDuration {
    ChronoDuration::minutes(5)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraderState {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
}

pub struct AutoTrader {
    pub config: TraderConfig,
    pub adapter: Arc<dyn ExchangeAdapter>,
    pub logger: DecisionLogger,
    pub llm: LlmClient,
    pub market: Arc<dyn MarketData>,
    pub coin_pool: Arc<dyn CoinPoolSource>,
    pub risk_limiter: RiskLimiter,
    calibration_source: Option<Arc<dyn DepositWithdrawalSource>>,
    fills_source: Option<Arc<dyn FillsSource>>,
    ledger: RwLock<InvestmentLedger>,
    state: RwLock<TraderState>,
    in_flight: AtomicBool,
    stop_requested: AtomicBool,
    execution_enabled: AtomicBool,
    auto_calibration_enabled: AtomicBool,
    call_count: AtomicU64,
    cycle_number: AtomicU64,
    start_time: RwLock<Option<DateTime<Utc>>>,
    last_calibration: RwLock<Option<DateTime<Utc>>>,
    loop_handle: RwLock<Option<JoinHandle<()>>>,
}

impl AutoTrader {
    pub fn new(
        config: TraderConfig,
        adapter: Arc<dyn ExchangeAdapter>,
        logger: DecisionLogger,
        llm: LlmClient,
        market: Arc<dyn MarketData>,
        coin_pool: Arc<dyn CoinPoolSource>,
        risk_limiter: RiskLimiter,
        calibration_source: Option<Arc<dyn DepositWithdrawalSource>>,
        fills_source: Option<Arc<dyn FillsSource>>,
    ) -> Self {
        let initial_balance = config.initial_balance;
        Self {
            config,
            adapter,
            logger,
            llm,
            market,
            coin_pool,
            risk_limiter,
            calibration_source,
            fills_source,
            ledger: RwLock::new(InvestmentLedger::new(initial_balance)),
            state: RwLock::new(TraderState::Idle),
            in_flight: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            execution_enabled: AtomicBool::new(false),
            auto_calibration_enabled: AtomicBool::new(false),
            call_count: AtomicU64::new(0),
            cycle_number: AtomicU64::new(0),
            start_time: RwLock::new(None),
            last_calibration: RwLock::new(None),
            loop_handle: RwLock::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn state(&self) -> TraderState {
        *self.state.read()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), TraderState::Running | TraderState::Starting)
    }

    pub fn execution_enabled(&self) -> bool {
        self.execution_enabled.load(Ordering::SeqCst)
    }

    pub fn set_execution_enabled(&self, enabled: bool) {
        self.execution_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn set_auto_calibration_enabled(&self, enabled: bool) {
        self.auto_calibration_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn call_count(&self) -> u64 {
        self.call_count.load(Ordering::SeqCst)
    }

    pub fn set_initial_balance(&self, value: f64) {
        self.ledger.write().set_initial_balance(value);
    }

    pub fn add_investment_delta(&self, amount: f64, note: impl Into<String>) {
        self.ledger.write().add(amount, note);
    }

    pub fn get_invested_amount_at(&self, at: DateTime<Utc>) -> f64 {
        let baseline = self.ledger.read().invested_at(at);
        if baseline > 0.0 {
            baseline
        } else {
            self.config.initial_balance
        }
    }

    pub fn investment_ledger(&self) -> InvestmentLedger {
        self.ledger.read().clone()
    }

    /// `None` for every venue but OKX (spec §6 `/api/okx/fills`).
    pub async fn list_recent_fills(&self, limit: u32) -> Result<Vec<serde_json::Value>, AppError> {
        match &self.fills_source {
            Some(source) => source.list_recent_fills(limit).await,
            None => Ok(Vec::new()),
        }
    }

    fn try_begin_cycle(&self) -> bool {
        self.in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn end_cycle(&self) {
        self.in_flight.store(false, Ordering::SeqCst);
    }

    async fn run_cycle_locked(self: &Arc<Self>) -> DecisionRecord {
        let cycle_number = self.cycle_number.fetch_add(1, Ordering::SeqCst) + 1;
        self.call_count.fetch_add(1, Ordering::SeqCst);
        self.maybe_auto_calibrate(Utc::now()).await;
        let record = engine::run_decision_cycle(self, cycle_number).await;
        self.logger.log_decision(&record);
        record
    }

    /// Out-of-band single cycle; returns `Conflict` if one is already in
    /// flight rather than queueing (spec §4.5, invariant 2).
    pub async fn run_once(self: &Arc<Self>) -> Result<DecisionRecord, AppError> {
        if !self.try_begin_cycle() {
            return Err(AppError::Conflict(format!("cycle already in flight for trader {}", self.config.id)));
        }
        let record = self.run_cycle_locked().await;
        self.end_cycle();
        Ok(record)
    }

    /// Two cycles back-to-back under a single claim on the guard so the
    /// ticker cannot interleave between the close pass and the open pass.
    pub async fn run_ai_close_then_open(self: &Arc<Self>) -> Result<(DecisionRecord, DecisionRecord), AppError> {
        if !self.try_begin_cycle() {
            return Err(AppError::Conflict(format!("cycle already in flight for trader {}", self.config.id)));
        }
        let first = self.run_cycle_locked().await;
        let second = self.run_cycle_locked().await;
        self.end_cycle();
        Ok((first, second))
    }

    /// Idle -> Starting: runs one cycle synchronously before entering
    /// Running with a ticker at `scan_interval` (spec §4.5).
    pub async fn start(self: &Arc<Self>) {
        {
            let mut state = self.state.write();
            if *state != TraderState::Idle {
                return;
            }
            *state = TraderState::Starting;
        }
        *self.start_time.write() = Some(Utc::now());
        self.stop_requested.store(false, Ordering::SeqCst);

        if self.try_begin_cycle() {
            self.run_cycle_locked().await;
            self.end_cycle();
        }

        *self.state.write() = TraderState::Running;

        let trader = self.clone();
        let handle = tokio::spawn(async move { trader.run_ticker().await });
        *self.loop_handle.write() = Some(handle);
    }

    async fn run_ticker(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.scan_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        interval.tick().await;

        loop {
            interval.tick().await;
            if self.stop_requested.load(Ordering::SeqCst) {
                break;
            }
            if !self.try_begin_cycle() {
                warn!(trader = %self.config.id, "scan tick skipped: cycle already in flight");
                continue;
            }
            self.run_cycle_locked().await;
            self.end_cycle();
        }

        *self.state.write() = TraderState::Stopped;
    }

    /// Cooperative: the in-flight cycle finishes, no new cycle starts.
    pub fn stop(&self) {
        {
            let mut state = self.state.write();
            if *state == TraderState::Running {
                *state = TraderState::Stopping;
            }
        }
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    /// Polls deposit/withdrawal history every ≥5 minutes and folds unseen
    /// entries into the ledger, deduplicated by tx id (spec §4.5).
    async fn maybe_auto_calibrate(&self, now: DateTime<Utc>) {
        if !self.auto_calibration_enabled.load(Ordering::SeqCst) {
            return;
        }
        let Some(source) = &self.calibration_source else {
            return;
        };

        let since = {
            let last = *self.last_calibration.read();
            match last {
                Some(t) if now - t < min_calibration_interval() => return,
                Some(t) => t,
                None => (*self.start_time.read()).unwrap_or(now),
            }
        };

        match source.list_transfers_since(since).await {
            Ok(transfers) => {
                let mut ledger = self.ledger.write();
                for transfer in transfers {
                    let key = match (&transfer.kind, &transfer.tx_id) {
                        (TransferKind::Deposit, Some(id)) => format!("okx_deposit:{id}"),
                        (TransferKind::Withdrawal, Some(id)) => format!("okx_withdrawal:{id}"),
                        (TransferKind::Deposit, None) => {
                            format!("okx_deposit:ts:{}", transfer.timestamp.timestamp_millis())
                        }
                        (TransferKind::Withdrawal, None) => {
                            format!("okx_withdrawal:ts:{}", transfer.timestamp.timestamp_millis())
                        }
                    };
                    let note = match transfer.kind {
                        TransferKind::Deposit => "okx auto-calibration: deposit",
                        TransferKind::Withdrawal => "okx auto-calibration: withdrawal",
                    };
                    ledger.add_deduped(transfer.amount, note, key);
                }
            }
            Err(e) => warn!(trader = %self.config.id, error = %e, "okx auto-calibration poll failed"),
        }
        *self.last_calibration.write() = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invested_amount_falls_back_to_initial_balance_when_baseline_nonpositive() {
        let ledger = InvestmentLedger::new(0.0);
        assert_eq!(ledger.invested_at(Utc::now()), 0.0);
    }

    #[test]
    fn single_flight_guard_rejects_concurrent_claim() {
        let flag = AtomicBool::new(false);
        let first = flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst);
        let second = flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst);
        assert!(first.is_ok());
        assert!(second.is_err());
    }
}
