//! Risk Limiter (spec §4.8): per-trader daily-loss and max-drawdown breach
//! detection with a cooldown that forces `execution_enabled=false` for new
//! opens. Generalized from a throttle-the-position-size design into a
//! hard trading halt, since this controller has no Kelly sizing to throttle.

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RiskLimiterStatus {
    pub halted: bool,
    pub halted_until: Option<DateTime<Utc>>,
    pub daily_pnl_pct: f64,
    pub drawdown_pct: f64,
    pub reason: Option<RiskBreachReason>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskBreachReason {
    DailyLoss,
    MaxDrawdown,
}

struct State {
    day_start_equity: f64,
    day_start_date: NaiveDate,
    peak_equity: f64,
    cooldown_until: Option<DateTime<Utc>>,
}

/// Tracks one trader's equity curve and decides whether new opens should be
/// blocked. `max_daily_loss`/`max_drawdown` are fractions of equity (e.g.
/// `0.1` = 10%).
pub struct RiskLimiter {
    max_daily_loss: f64,
    max_drawdown: f64,
    cooldown: chrono::Duration,
    state: RwLock<State>,
}

impl RiskLimiter {
    pub fn new(
        max_daily_loss: f64,
        max_drawdown: f64,
        stop_trading_duration_minutes: u64,
        initial_equity: f64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            max_daily_loss,
            max_drawdown,
            cooldown: chrono::Duration::minutes(stop_trading_duration_minutes as i64),
            state: RwLock::new(State {
                day_start_equity: initial_equity,
                day_start_date: now.date_naive(),
                peak_equity: initial_equity,
                cooldown_until: None,
            }),
        }
    }

    /// Feed the latest equity reading; returns whether trading is currently
    /// halted and why. Rolls the daily baseline over at UTC midnight.
    pub fn record_equity(&self, equity: f64, now: DateTime<Utc>) -> RiskLimiterStatus {
        let mut state = self.state.write();

        if now.date_naive() != state.day_start_date {
            state.day_start_date = now.date_naive();
            state.day_start_equity = equity;
        }

        if equity > state.peak_equity {
            state.peak_equity = equity;
        }

        let daily_pnl_pct = if state.day_start_equity > 0.0 {
            (equity - state.day_start_equity) / state.day_start_equity
        } else {
            0.0
        };
        let drawdown_pct = if state.peak_equity > 0.0 {
            ((state.peak_equity - equity) / state.peak_equity).max(0.0)
        } else {
            0.0
        };

        let already_cooling = state
            .cooldown_until
            .map(|until| now < until)
            .unwrap_or(false);

        let reason = if !already_cooling && daily_pnl_pct <= -self.max_daily_loss {
            Some(RiskBreachReason::DailyLoss)
        } else if !already_cooling && drawdown_pct >= self.max_drawdown {
            Some(RiskBreachReason::MaxDrawdown)
        } else {
            None
        };

        if reason.is_some() {
            state.cooldown_until = Some(now + self.cooldown);
        }

        let halted = state
            .cooldown_until
            .map(|until| now < until)
            .unwrap_or(false);

        RiskLimiterStatus {
            halted,
            halted_until: state.cooldown_until.filter(|_| halted),
            daily_pnl_pct,
            drawdown_pct,
            reason,
        }
    }

    pub fn is_halted(&self, now: DateTime<Utc>) -> bool {
        self.state
            .read()
            .cooldown_until
            .map(|until| now < until)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breaches_daily_loss_and_halts() {
        let now = DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let limiter = RiskLimiter::new(0.1, 0.2, 60, 1000.0, now);
        let status = limiter.record_equity(890.0, now);
        assert!(status.halted);
        assert_eq!(status.reason, Some(RiskBreachReason::DailyLoss));
    }

    #[test]
    fn cooldown_expires_after_duration() {
        let now = DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let limiter = RiskLimiter::new(0.1, 0.2, 60, 1000.0, now);
        limiter.record_equity(890.0, now);
        assert!(limiter.is_halted(now + chrono::Duration::minutes(30)));
        assert!(!limiter.is_halted(now + chrono::Duration::minutes(61)));
    }

    #[test]
    fn drawdown_from_peak_triggers_halt_even_without_daily_loss() {
        let now = DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let limiter = RiskLimiter::new(0.5, 0.15, 60, 1000.0, now);
        limiter.record_equity(1200.0, now);
        let later = now + chrono::Duration::hours(1);
        let status = limiter.record_equity(1000.0, later);
        assert!(status.halted);
        assert_eq!(status.reason, Some(RiskBreachReason::MaxDrawdown));
    }
}
