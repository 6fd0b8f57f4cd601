//! Risk-rule validation for parsed decisions (spec §4.3). Converts a
//! `RawDecision` into a typed `Decision`, applying leverage caps,
//! soft-capped position sizing, stop/take ordering, and the reward/risk
//! floor.

use super::types::{Decision, RawDecision};
use crate::error::AppError;
use crate::models::RiskParams;

const POSITION_SIZE_TOLERANCE: f64 = 1.02;
const MIN_REWARD_RISK_RATIO: f64 = 2.6;

/// Validates one raw decision against the trader's risk params and the
/// current market price for its symbol. `equity` is the account's current
/// total equity (used for the position-size cap).
pub fn validate_decision(
    raw: &RawDecision,
    risk: &RiskParams,
    equity: f64,
    market_price: f64,
) -> Result<Decision, AppError> {
    match raw.action.as_str() {
        "open_long" => validate_open(raw, risk, equity, market_price, true),
        "open_short" => validate_open(raw, risk, equity, market_price, false),
        "close_long" => Ok(Decision::CloseLong {
            symbol: raw.symbol.clone(),
            reasoning: raw.reasoning.clone(),
        }),
        "close_short" => Ok(Decision::CloseShort {
            symbol: raw.symbol.clone(),
            reasoning: raw.reasoning.clone(),
        }),
        "hold" => Ok(Decision::Hold {
            symbol: raw.symbol.clone(),
            reasoning: raw.reasoning.clone(),
        }),
        "wait" => Ok(Decision::Wait {
            symbol: raw.symbol.clone(),
            reasoning: raw.reasoning.clone(),
        }),
        other => Err(AppError::ValidationFailed {
            reason: format!("unknown action \"{other}\""),
        }),
    }
}

fn validate_open(
    raw: &RawDecision,
    risk: &RiskParams,
    equity: f64,
    market_price: f64,
    is_long: bool,
) -> Result<Decision, AppError> {
    let leverage = raw.leverage.ok_or_else(|| AppError::ValidationFailed {
        reason: format!("{}: missing leverage", raw.symbol),
    })?;
    let position_size_usd =
        raw.position_size_usd
            .ok_or_else(|| AppError::ValidationFailed {
                reason: format!("{}: missing position_size_usd", raw.symbol),
            })?;
    let stop_loss = raw.stop_loss.ok_or_else(|| AppError::ValidationFailed {
        reason: format!("{}: missing stop_loss", raw.symbol),
    })?;
    let take_profit = raw.take_profit.ok_or_else(|| AppError::ValidationFailed {
        reason: format!("{}: missing take_profit", raw.symbol),
    })?;

    let leverage_cap = risk.leverage_cap(&raw.symbol);
    if leverage < 1.0 || leverage > leverage_cap as f64 {
        return Err(AppError::ValidationFailed {
            reason: format!(
                "{}: leverage {leverage} outside [1, {leverage_cap}]",
                raw.symbol
            ),
        });
    }

    if stop_loss <= 0.0 || take_profit <= 0.0 {
        return Err(AppError::ValidationFailed {
            reason: format!("{}: stop_loss and take_profit must be positive", raw.symbol),
        });
    }

    if is_long && stop_loss >= take_profit {
        return Err(AppError::ValidationFailed {
            reason: format!(
                "{}: open_long requires stop_loss < take_profit",
                raw.symbol
            ),
        });
    }
    if !is_long && stop_loss <= take_profit {
        return Err(AppError::ValidationFailed {
            reason: format!(
                "{}: open_short requires stop_loss > take_profit",
                raw.symbol
            ),
        });
    }

    if market_price <= 0.0 {
        return Err(AppError::ValidationFailed {
            reason: format!("{}: market price unavailable", raw.symbol),
        });
    }

    let (risk_pct, reward_pct) = if is_long {
        (
            (market_price - stop_loss) / market_price,
            (take_profit - market_price) / market_price,
        )
    } else {
        (
            (stop_loss - market_price) / market_price,
            (market_price - take_profit) / market_price,
        )
    };

    if risk_pct <= 0.0 {
        return Err(AppError::ValidationFailed {
            reason: format!(
                "{}: stop_loss/take_profit must bracket the current price ({market_price})",
                raw.symbol
            ),
        });
    }

    let reward_risk = reward_pct / risk_pct;
    if reward_risk < MIN_REWARD_RISK_RATIO {
        return Err(AppError::ValidationFailed {
            reason: format!(
                "{}: reward/risk {reward_risk:.2} below {MIN_REWARD_RISK_RATIO} (risk {:.2}%, reward {:.2}%)",
                raw.symbol,
                risk_pct * 100.0,
                reward_pct * 100.0
            ),
        });
    }

    // Sizing is never hard-rejected: overage beyond the 2% tolerance band is
    // soft-capped down to the limit (spec §4.3).
    let cap = equity * RiskParams::position_cap_multiplier(&raw.symbol);
    let tolerance_band = cap * POSITION_SIZE_TOLERANCE;
    let position_size_usd = if position_size_usd > tolerance_band {
        cap
    } else {
        position_size_usd
    };

    let confidence = raw.confidence.map(normalize_confidence);
    let risk_usd = raw.risk_usd.unwrap_or(0.0).max(0.0);

    let symbol = raw.symbol.clone();
    let reasoning = raw.reasoning.clone();
    Ok(if is_long {
        Decision::OpenLong {
            symbol,
            leverage: leverage as u32,
            position_size_usd,
            stop_loss,
            take_profit,
            confidence,
            risk_usd,
            reasoning,
        }
    } else {
        Decision::OpenShort {
            symbol,
            leverage: leverage as u32,
            position_size_usd,
            stop_loss,
            take_profit,
            confidence,
            risk_usd,
            reasoning,
        }
    })
}

/// Values in `(1, 100]` are treated as percentages and normalized to `[0,1]`.
fn normalize_confidence(value: f64) -> f64 {
    if value > 1.0 && value <= 100.0 {
        value / 100.0
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn risk() -> RiskParams {
        RiskParams {
            btc_eth_leverage: 5,
            altcoin_leverage: 3,
            max_daily_loss: 0.1,
            max_drawdown: 0.2,
            stop_trading_duration_minutes: 60,
        }
    }

    fn open_long_raw(symbol: &str, stop_loss: f64, take_profit: f64, position_size_usd: f64) -> RawDecision {
        RawDecision {
            symbol: symbol.to_string(),
            action: "open_long".to_string(),
            leverage: Some(5.0),
            position_size_usd: Some(position_size_usd),
            stop_loss: Some(stop_loss),
            take_profit: Some(take_profit),
            confidence: None,
            risk_usd: Some(0.0),
            reasoning: "x".to_string(),
        }
    }

    #[test]
    fn scenario_one_tolerant_parse_decision_passes_validation() {
        let raw = open_long_raw("BTCUSDT", 59400.0, 62300.0, 100.0);
        let decision = validate_decision(&raw, &risk(), 1000.0, 60000.0).unwrap();
        assert!(matches!(decision, Decision::OpenLong { .. }));
    }

    #[test]
    fn scenario_two_rejects_low_reward_risk() {
        let raw = open_long_raw("BTCUSDT", 59400.0, 60600.0, 100.0);
        let err = validate_decision(&raw, &risk(), 1000.0, 60000.0).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("1.00%") || message.contains("1.0"));
    }

    #[test]
    fn scenario_three_soft_caps_oversized_position() {
        let raw = open_long_raw("DOGEUSDT", 0.10, 0.115, 1700.0);
        let decision = validate_decision(&raw, &risk(), 1000.0, 0.112).unwrap();
        match decision {
            Decision::OpenLong {
                position_size_usd, ..
            } => assert!((position_size_usd - 1500.0).abs() < 1e-6),
            other => panic!("expected OpenLong, got {other:?}"),
        }
    }

    #[test]
    fn leverage_above_cap_is_rejected() {
        let mut raw = open_long_raw("BTCUSDT", 59400.0, 62300.0, 100.0);
        raw.leverage = Some(10.0);
        let err = validate_decision(&raw, &risk(), 1000.0, 60000.0).unwrap_err();
        assert!(err.to_string().contains("leverage"));
    }

    #[test]
    fn percentage_confidence_is_normalized() {
        let mut raw = open_long_raw("BTCUSDT", 59400.0, 62300.0, 100.0);
        raw.confidence = Some(80.0);
        let decision = validate_decision(&raw, &risk(), 1000.0, 60000.0).unwrap();
        match decision {
            Decision::OpenLong { confidence, .. } => {
                assert!((confidence.unwrap() - 0.8).abs() < 1e-9);
            }
            other => panic!("expected OpenLong, got {other:?}"),
        }
    }
}
