//! Coin Pool (spec §4.7): merges two ranked candidate streams, preserving
//! the best rank across sources and tagging each symbol with every source
//! that surfaced it, then truncates to the top K.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use crate::error::AppError;
use crate::models::{CandidateCoin, CoinSource};

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Supplies the two ranked streams the engine merges each cycle (spec §4.4
/// step 2). Kept behind a trait so the engine never hardcodes an HTTP shape.
#[async_trait]
pub trait CoinPoolSource: Send + Sync {
    async fn fetch_ai500(&self) -> Result<Vec<(String, u32)>, AppError>;
    async fn fetch_oi_top(&self) -> Result<Vec<(String, u32)>, AppError>;

    async fn fetch_merged(&self, top_k: usize) -> Vec<CandidateCoin> {
        let ai500 = self.fetch_ai500().await.unwrap_or_default();
        let oi_top = self.fetch_oi_top().await.unwrap_or_default();
        merge_candidate_streams(ai500, oi_top, top_k)
    }
}

/// Ranked score list at `ai500_url`, open-interest-ranked list at
/// `oi_top_url`; both expected to return a JSON array of symbol strings in
/// rank order.
pub struct HttpCoinPoolSource {
    http: Client,
    ai500_url: String,
    oi_top_url: String,
}

impl HttpCoinPoolSource {
    pub fn new(ai500_url: String, oi_top_url: String) -> Self {
        let http = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .expect("failed to build coin pool HTTP client");
        Self {
            http,
            ai500_url,
            oi_top_url,
        }
    }

    async fn fetch_ranked_symbols(&self, url: &str) -> Result<Vec<(String, u32)>, AppError> {
        let symbols: Vec<String> = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| AppError::TransientNetwork(e.to_string()))?
            .json()
            .await
            .map_err(|e| AppError::ParseError(format!("coin pool decode: {e}")))?;
        Ok(symbols
            .into_iter()
            .enumerate()
            .map(|(i, symbol)| (symbol, i as u32 + 1))
            .collect())
    }
}

#[async_trait]
impl CoinPoolSource for HttpCoinPoolSource {
    async fn fetch_ai500(&self) -> Result<Vec<(String, u32)>, AppError> {
        self.fetch_ranked_symbols(&self.ai500_url).await
    }

    async fn fetch_oi_top(&self) -> Result<Vec<(String, u32)>, AppError> {
        self.fetch_ranked_symbols(&self.oi_top_url).await
    }
}

/// `use_default_coins: true` fallback: a fixed symbol list, ranked by
/// config order, tagged `ai500` only.
pub struct StaticCoinPoolSource {
    symbols: Vec<String>,
}

impl StaticCoinPoolSource {
    pub fn new(symbols: Vec<String>) -> Self {
        Self { symbols }
    }
}

#[async_trait]
impl CoinPoolSource for StaticCoinPoolSource {
    async fn fetch_ai500(&self) -> Result<Vec<(String, u32)>, AppError> {
        Ok(self
            .symbols
            .iter()
            .enumerate()
            .map(|(i, s)| (s.clone(), i as u32 + 1))
            .collect())
    }

    async fn fetch_oi_top(&self) -> Result<Vec<(String, u32)>, AppError> {
        Ok(Vec::new())
    }
}

pub fn merge_candidate_streams(
    ai500: Vec<(String, u32)>,
    oi_top: Vec<(String, u32)>,
    top_k: usize,
) -> Vec<CandidateCoin> {
    let mut merged: HashMap<String, CandidateCoin> = HashMap::new();

    for (symbol, rank) in ai500 {
        merge_one(&mut merged, symbol, rank, CoinSource::Ai500);
    }
    for (symbol, rank) in oi_top {
        merge_one(&mut merged, symbol, rank, CoinSource::OiTop);
    }

    let mut result: Vec<CandidateCoin> = merged.into_values().collect();
    result.sort_by_key(|c| c.rank);
    result.truncate(top_k);
    result
}

fn merge_one(
    merged: &mut HashMap<String, CandidateCoin>,
    symbol: String,
    rank: u32,
    source: CoinSource,
) {
    merged
        .entry(symbol.clone())
        .and_modify(|existing| {
            if rank < existing.rank {
                existing.rank = rank;
            }
            if !existing.sources.contains(&source) {
                existing.sources.push(source);
            }
        })
        .or_insert_with(|| CandidateCoin {
            symbol,
            rank,
            sources: vec![source],
        });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_symbols_merge_and_keep_best_rank() {
        let ai500 = vec![("BTCUSDT".to_string(), 3), ("ETHUSDT".to_string(), 1)];
        let oi_top = vec![("BTCUSDT".to_string(), 1), ("SOLUSDT".to_string(), 2)];
        let merged = merge_candidate_streams(ai500, oi_top, 10);

        let btc = merged.iter().find(|c| c.symbol == "BTCUSDT").unwrap();
        assert_eq!(btc.rank, 1);
        assert_eq!(btc.sources.len(), 2);
        assert!(btc.sources.contains(&CoinSource::Ai500));
        assert!(btc.sources.contains(&CoinSource::OiTop));
    }

    #[test]
    fn top_k_truncation_keeps_best_ranked() {
        let ai500 = vec![
            ("A".to_string(), 1),
            ("B".to_string(), 2),
            ("C".to_string(), 3),
        ];
        let merged = merge_candidate_streams(ai500, vec![], 2);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].symbol, "A");
        assert_eq!(merged[1].symbol, "B");
    }
}
