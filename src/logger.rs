//! Decision Logger (spec §4.2): durable append-only per-trader audit log
//! plus read-side analytics. One JSON file per cycle; no compaction.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use tracing::error;

use crate::decision::{Decision, DecisionRecord};
use crate::models::Side;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LogStatistics {
    pub total_cycles: usize,
    pub successful_cycles: usize,
    pub cycles_with_trades: usize,
    pub span_start: Option<DateTime<Utc>>,
    pub span_end: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SymbolPerformance {
    pub trades: u32,
    pub wins: u32,
    pub losses: u32,
    pub total_pnl: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeOutcome {
    pub symbol: String,
    pub pnl: f64,
    pub won: bool,
    pub closed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PerformanceAnalysis {
    pub total_trades: u32,
    pub winning_trades: u32,
    pub losing_trades: u32,
    pub win_rate: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub profit_factor: f64,
    pub sharpe_ratio: f64,
    pub best_symbol: Option<String>,
    pub worst_symbol: Option<String>,
    pub per_symbol: HashMap<String, SymbolPerformance>,
    pub recent_outcomes: Vec<TradeOutcome>,
}

const PROFIT_FACTOR_CLAMP: f64 = 999.0;

struct OpenLeg {
    side: Side,
}

/// Append-only per-trader store at `<base_dir>/<trader_id>/decision_<ts>.json`.
pub struct DecisionLogger {
    dir: PathBuf,
}

impl DecisionLogger {
    pub fn new(base_dir: impl AsRef<Path>, trader_id: &str) -> Self {
        let dir = base_dir.as_ref().join(trader_id);
        Self { dir }
    }

    /// Best-effort append; failures are logged but never propagated — the
    /// cycle itself is authoritative (spec §4.2).
    pub fn log_decision(&self, record: &DecisionRecord) {
        if let Err(e) = self.try_log_decision(record) {
            error!(error = %e, cycle = record.cycle_number, "failed to persist decision record");
        }
    }

    fn try_log_decision(&self, record: &DecisionRecord) -> std::io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let filename = format!("decision_{}.json", record.timestamp.timestamp_millis());
        let path = self.dir.join(filename);
        let body = serde_json::to_vec_pretty(record)
            .unwrap_or_else(|_| b"{}".to_vec());
        fs::write(path, body)
    }

    fn list_cycle_files(&self) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = match fs::read_dir(&self.dir) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.extension().map(|ext| ext == "json").unwrap_or(false))
                .collect(),
            Err(_) => Vec::new(),
        };
        files.sort();
        files
    }

    fn load_record(path: &Path) -> Option<DecisionRecord> {
        let body = fs::read(path).ok()?;
        serde_json::from_slice(&body).ok()
    }

    /// Oldest-first (chart-ready); callers reverse for newest-first display.
    pub fn get_latest_records(&self, n: usize) -> Vec<DecisionRecord> {
        let files = self.list_cycle_files();
        let start = files.len().saturating_sub(n);
        files[start..]
            .iter()
            .filter_map(|p| Self::load_record(p))
            .collect()
    }

    pub fn get_statistics(&self) -> LogStatistics {
        let records: Vec<DecisionRecord> = self
            .list_cycle_files()
            .iter()
            .filter_map(|p| Self::load_record(p))
            .collect();

        if records.is_empty() {
            return LogStatistics::default();
        }

        let successful_cycles = records.iter().filter(|r| r.success).count();
        let cycles_with_trades = records
            .iter()
            .filter(|r| r.decisions.iter().any(|d| d.is_open() || d.is_close()))
            .count();

        LogStatistics {
            total_cycles: records.len(),
            successful_cycles,
            cycles_with_trades,
            span_start: records.first().map(|r| r.timestamp),
            span_end: records.last().map(|r| r.timestamp),
        }
    }

    /// Reconstructs realized trades by pairing sequential open/close
    /// decisions per symbol+side, reading entry/mark prices off the
    /// position snapshot taken at the close decision's cycle (spec §4.2).
    pub fn analyze_performance(&self, max_cycles: usize) -> PerformanceAnalysis {
        let files = self.list_cycle_files();
        let start = files.len().saturating_sub(max_cycles);
        let records: Vec<DecisionRecord> = files[start..]
            .iter()
            .filter_map(|p| Self::load_record(p))
            .collect();

        let mut open_legs: HashMap<String, OpenLeg> = HashMap::new();
        let mut outcomes: Vec<TradeOutcome> = Vec::new();
        let mut per_symbol: HashMap<String, SymbolPerformance> = HashMap::new();

        for record in &records {
            for decision in &record.decisions {
                match decision {
                    Decision::OpenLong { symbol, .. } => {
                        open_legs.insert(symbol.clone(), OpenLeg { side: Side::Long });
                    }
                    Decision::OpenShort { symbol, .. } => {
                        open_legs.insert(symbol.clone(), OpenLeg { side: Side::Short });
                    }
                    Decision::CloseLong { symbol, .. } | Decision::CloseShort { symbol, .. } => {
                        let expected_side = if matches!(decision, Decision::CloseLong { .. }) {
                            Side::Long
                        } else {
                            Side::Short
                        };
                        if open_legs
                            .get(symbol)
                            .map(|leg| leg.side == expected_side)
                            .unwrap_or(false)
                        {
                            open_legs.remove(symbol);
                            if let Some(position) =
                                record.positions.iter().find(|p| &p.symbol == symbol && p.side == expected_side)
                            {
                                let pnl = match expected_side {
                                    Side::Long => position.quantity * (position.mark_price - position.entry_price),
                                    Side::Short => position.quantity * (position.entry_price - position.mark_price),
                                };
                                let won = pnl > 0.0;
                                let entry = per_symbol.entry(symbol.clone()).or_default();
                                entry.trades += 1;
                                entry.total_pnl += pnl;
                                if won {
                                    entry.wins += 1;
                                } else {
                                    entry.losses += 1;
                                }
                                outcomes.push(TradeOutcome {
                                    symbol: symbol.clone(),
                                    pnl,
                                    won,
                                    closed_at: record.timestamp,
                                });
                            }
                        }
                    }
                    _ => {}
                }
            }
        }

        let total_trades = outcomes.len() as u32;
        let winning_trades = outcomes.iter().filter(|o| o.won).count() as u32;
        let losing_trades = total_trades - winning_trades;
        let win_rate = if total_trades > 0 {
            winning_trades as f64 / total_trades as f64
        } else {
            0.0
        };

        let win_sum: f64 = outcomes.iter().filter(|o| o.won).map(|o| o.pnl).sum();
        let loss_sum: f64 = outcomes.iter().filter(|o| !o.won).map(|o| o.pnl).sum();
        let avg_win = if winning_trades > 0 {
            win_sum / winning_trades as f64
        } else {
            0.0
        };
        let avg_loss = if losing_trades > 0 {
            loss_sum / losing_trades as f64
        } else {
            0.0
        };
        let profit_factor = if loss_sum.abs() > 0.0 {
            win_sum / loss_sum.abs()
        } else if win_sum > 0.0 {
            PROFIT_FACTOR_CLAMP
        } else {
            0.0
        };

        let best_symbol = per_symbol
            .iter()
            .max_by(|a, b| a.1.total_pnl.partial_cmp(&b.1.total_pnl).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(s, _)| s.clone());
        let worst_symbol = per_symbol
            .iter()
            .min_by(|a, b| a.1.total_pnl.partial_cmp(&b.1.total_pnl).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(s, _)| s.clone());

        let sharpe_ratio = sharpe_from_equity_curve(&records);

        let recent_outcomes = outcomes
            .into_iter()
            .rev()
            .take(20)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();

        PerformanceAnalysis {
            total_trades,
            winning_trades,
            losing_trades,
            win_rate,
            avg_win,
            avg_loss,
            profit_factor,
            sharpe_ratio,
            best_symbol,
            worst_symbol,
            per_symbol,
            recent_outcomes,
        }
    }
}

/// Mean/stdev of per-cycle equity returns, annualized by observed cycle
/// frequency rather than per-trade (spec §4.2).
fn sharpe_from_equity_curve(records: &[DecisionRecord]) -> f64 {
    if records.len() < 3 {
        return 0.0;
    }
    let equities: Vec<f64> = records.iter().map(|r| r.account.total_equity).collect();
    let returns: Vec<f64> = equities
        .windows(2)
        .filter_map(|w| {
            if w[0].abs() > f64::EPSILON {
                Some((w[1] - w[0]) / w[0])
            } else {
                None
            }
        })
        .collect();
    if returns.len() < 2 {
        return 0.0;
    }

    let mean = returns.clone().mean();
    let stdev = returns.clone().std_dev();
    if stdev <= 0.0 || !stdev.is_finite() {
        return 0.0;
    }

    let span_minutes = (records.last().unwrap().timestamp - records.first().unwrap().timestamp)
        .num_minutes()
        .max(1) as f64;
    let avg_interval_minutes = span_minutes / (records.len() - 1) as f64;
    let periods_per_year = if avg_interval_minutes > 0.0 {
        (365.0 * 24.0 * 60.0) / avg_interval_minutes
    } else {
        252.0
    };

    (mean / stdev) * periods_per_year.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::ExecutionLogLine;
    use crate::models::{AccountSnapshot, Position};

    fn snapshot(equity: f64) -> AccountSnapshot {
        AccountSnapshot {
            total_equity: equity,
            wallet_balance: equity,
            unrealized_profit: 0.0,
            available_balance: equity,
            margin_used: 0.0,
            margin_used_pct: 0.0,
            position_count: 0,
        }
    }

    fn record(cycle: u64, ts: DateTime<Utc>, decisions: Vec<Decision>, positions: Vec<Position>) -> DecisionRecord {
        DecisionRecord {
            cycle_number: cycle,
            timestamp: ts,
            account: snapshot(1000.0),
            positions,
            candidate_symbols: vec![],
            prompt: String::new(),
            cot_trace: String::new(),
            decisions,
            execution_log: Vec::<ExecutionLogLine>::new(),
            success: true,
            error: None,
        }
    }

    #[test]
    fn log_and_read_back_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let logger = DecisionLogger::new(dir.path(), "trader-1");
        let ts = Utc::now();
        let rec = record(1, ts, vec![], vec![]);
        logger.log_decision(&rec);

        let latest = logger.get_latest_records(10);
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].cycle_number, 1);
    }

    #[test]
    fn pairs_open_and_close_into_a_winning_trade() {
        let dir = tempfile::tempdir().unwrap();
        let logger = DecisionLogger::new(dir.path(), "trader-1");
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::minutes(3);

        let open_record = record(
            1,
            t0,
            vec![Decision::OpenLong {
                symbol: "BTCUSDT".into(),
                leverage: 5,
                position_size_usd: 100.0,
                stop_loss: 59000.0,
                take_profit: 62000.0,
                confidence: None,
                risk_usd: 0.0,
                reasoning: "x".into(),
            }],
            vec![],
        );
        let close_record = record(
            2,
            t1,
            vec![Decision::CloseLong {
                symbol: "BTCUSDT".into(),
                reasoning: "y".into(),
            }],
            vec![Position {
                symbol: "BTCUSDT".into(),
                side: Side::Long,
                quantity: 0.01,
                entry_price: 60000.0,
                mark_price: 61000.0,
                leverage: 5,
                unrealized_pnl: 10.0,
                liquidation_price: 50000.0,
                update_time_ms: 0,
            }],
        );
        logger.log_decision(&open_record);
        logger.log_decision(&close_record);

        let analysis = logger.analyze_performance(100);
        assert_eq!(analysis.total_trades, 1);
        assert_eq!(analysis.winning_trades, 1);
        assert!(analysis.per_symbol.contains_key("BTCUSDT"));
    }

    #[test]
    fn profit_factor_clamps_when_there_are_no_losses() {
        let dir = tempfile::tempdir().unwrap();
        let logger = DecisionLogger::new(dir.path(), "trader-1");
        assert_eq!(logger.analyze_performance(10).profit_factor, 0.0);
    }
}
