//! Market Data Collaborator (spec §4.4 step 3): fetches price and open
//! interest for a set of symbols so the decision engine can filter out thin
//! candidate symbols without ever dropping symbols the trader already holds
//! a position in.

use async_trait::async_trait;

use crate::error::AppError;
use crate::exchange::ExchangeAdapter;

#[derive(Debug, Clone, Copy)]
pub struct MarketSnapshot {
    pub price: f64,
    /// Open interest in base-asset units; `open_interest * price` is the
    /// USD-denominated figure the liquidity filter compares against.
    pub open_interest: f64,
}

#[async_trait]
pub trait MarketData: Send + Sync {
    async fn get(&self, symbol: &str) -> Result<MarketSnapshot, AppError>;
}

/// Default implementation: price comes from the trader's own exchange
/// adapter; open interest has no uniform adapter operation, so it defaults
/// to a value that never triggers the liquidity filter unless a venue can
/// report it (only OKX's public endpoint can here, and adapters that can't
/// decompose simply return `f64::MAX`).
pub struct AdapterBackedMarketData<A: ExchangeAdapter + ?Sized> {
    adapter: std::sync::Arc<A>,
}

impl<A: ExchangeAdapter + ?Sized> AdapterBackedMarketData<A> {
    pub fn new(adapter: std::sync::Arc<A>) -> Self {
        Self { adapter }
    }
}

#[async_trait]
impl<A: ExchangeAdapter + ?Sized> MarketData for AdapterBackedMarketData<A> {
    async fn get(&self, symbol: &str) -> Result<MarketSnapshot, AppError> {
        let price = self.adapter.get_market_price(symbol).await?;
        Ok(MarketSnapshot {
            price,
            open_interest: f64::MAX,
        })
    }
}

/// Filters candidate (non-position) symbols whose open interest times
/// price is below the liquidity floor; position symbols always survive
/// (spec §4.4 step 3).
pub fn filter_by_liquidity(
    candidates: Vec<(String, MarketSnapshot)>,
    position_symbols: &[String],
    floor_usd: f64,
) -> Vec<(String, MarketSnapshot)> {
    candidates
        .into_iter()
        .filter(|(symbol, snapshot)| {
            position_symbols.contains(symbol) || snapshot.open_interest * snapshot.price >= floor_usd
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_symbols_survive_low_liquidity_filter() {
        let candidates = vec![(
            "DOGEUSDT".to_string(),
            MarketSnapshot {
                price: 0.1,
                open_interest: 1.0,
            },
        )];
        let positions = vec!["DOGEUSDT".to_string()];
        let kept = filter_by_liquidity(candidates, &positions, 15_000_000.0);
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn thin_non_position_candidates_are_dropped() {
        let candidates = vec![(
            "SHIBUSDT".to_string(),
            MarketSnapshot {
                price: 0.00001,
                open_interest: 1000.0,
            },
        )];
        let kept = filter_by_liquidity(candidates, &[], 15_000_000.0);
        assert!(kept.is_empty());
    }
}
