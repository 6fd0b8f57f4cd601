//! Shared plumbing used by every venue adapter: a TTL cache, the
//! contract/base unit-conversion math (spec §4.1), and a small signing
//! helper reused by the two HMAC venues (Binance, Aster).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use sha2::Sha256;

use crate::error::AppError;

type HmacSha256 = Hmac<Sha256>;

/// A single-slot cache with a time-to-live, guarded by a shared/exclusive
/// lock so reads never block other reads (spec §5 "shared-resource
/// policy").
pub struct TtlCache<T: Clone> {
    slot: RwLock<Option<(T, Instant)>>,
    ttl: Duration,
}

impl<T: Clone> TtlCache<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            slot: RwLock::new(None),
            ttl,
        }
    }

    pub fn get(&self) -> Option<T> {
        let guard = self.slot.read();
        match &*guard {
            Some((value, at)) if at.elapsed() < self.ttl => Some(value.clone()),
            _ => None,
        }
    }

    pub fn set(&self, value: T) {
        *self.slot.write() = Some((value, Instant::now()));
    }

    pub fn invalidate(&self) {
        *self.slot.write() = None;
    }
}

/// Per-instrument contract metadata, cached indefinitely per session
/// (immutable once fetched — spec §4.1).
#[derive(Debug, Clone, Copy)]
pub struct InstrumentSpec {
    pub ct_val: f64,
    pub lot_sz: f64,
    pub min_sz: f64,
}

/// Indefinite (no-expiry) cache of per-symbol instrument specs.
#[derive(Default)]
pub struct InstrumentSpecCache {
    specs: RwLock<HashMap<String, InstrumentSpec>>,
}

impl InstrumentSpecCache {
    pub fn get(&self, symbol: &str) -> Option<InstrumentSpec> {
        self.specs.read().get(symbol).copied()
    }

    pub fn set(&self, symbol: &str, spec: InstrumentSpec) {
        self.specs.write().insert(symbol.to_string(), spec);
    }
}

/// Convert a base-asset quantity into venue-native integral contracts,
/// rounding down to the nearest lot step. Rejects sizes below `min_sz`.
pub fn base_to_contracts(base_qty: f64, spec: InstrumentSpec) -> Result<f64, AppError> {
    if spec.ct_val <= 0.0 || spec.lot_sz <= 0.0 {
        return Err(AppError::ValidationFailed {
            reason: "instrument spec has non-positive ct_val/lot_sz".into(),
        });
    }
    let raw_contracts = base_qty / spec.ct_val / spec.lot_sz;
    let contracts = raw_contracts.floor() * spec.lot_sz;
    if contracts < spec.min_sz {
        return Err(AppError::ValidationFailed {
            reason: format!(
                "size too small: {base_qty} base -> {contracts} contracts < min {}",
                spec.min_sz
            ),
        });
    }
    Ok(contracts)
}

/// Convert venue-native contracts back into a base-asset quantity for the
/// universal `Position` type.
pub fn contracts_to_base(contracts: f64, spec: InstrumentSpec) -> f64 {
    contracts * spec.ct_val
}

/// Round a quantity down to the venue's `szDecimals` step (Hyperliquid).
pub fn round_to_decimals(qty: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (qty * factor).floor() / factor
}

/// Round a price to 5 significant figures (Hyperliquid price precision rule).
pub fn round_significant(value: f64, sig_figs: u32) -> f64 {
    if value == 0.0 || !value.is_finite() {
        return value;
    }
    let magnitude = value.abs().log10().floor() as i32;
    let factor = 10f64.powi(sig_figs as i32 - magnitude - 1);
    (value * factor).round() / factor
}

/// HMAC-SHA256 signing shared by the Binance/Aster query-signing scheme:
/// hex digest of `secret` over `payload`.
pub fn hmac_sha256_hex(secret: &str, payload: &str) -> Result<String, AppError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| AppError::ConfigInvalid(format!("invalid HMAC key: {e}")))?;
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// HMAC-SHA256 signing used by OKX: base64 digest of `secret` over `payload`.
pub fn hmac_sha256_base64(secret: &str, payload: &str) -> Result<String, AppError> {
    use base64::{engine::general_purpose::STANDARD, Engine};
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| AppError::ConfigInvalid(format!("invalid HMAC key: {e}")))?;
    mac.update(payload.as_bytes());
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contract_rounding_matches_scenario() {
        let spec = InstrumentSpec {
            ct_val: 0.01,
            lot_sz: 0.1,
            min_sz: 0.1,
        };
        let contracts = base_to_contracts(0.034, spec).unwrap();
        assert!((contracts - 3.4).abs() < 1e-9);
    }

    #[test]
    fn contract_rounding_rejects_below_min_size() {
        let spec = InstrumentSpec {
            ct_val: 0.01,
            lot_sz: 0.1,
            min_sz: 0.1,
        };
        // 0.0005 BTC -> 0.05 contracts, below min_sz of 0.1.
        let result = base_to_contracts(0.0005, spec);
        assert!(result.is_err());
    }

    #[test]
    fn conversion_round_trip_is_monotone() {
        let spec = InstrumentSpec {
            ct_val: 0.01,
            lot_sz: 0.1,
            min_sz: 0.1,
        };
        let input = 1.2345;
        let contracts = base_to_contracts(input, spec).unwrap();
        let back = contracts_to_base(contracts, spec);
        assert!(back <= input + 1e-9);
        assert!(back >= input - spec.ct_val * spec.lot_sz - 1e-9);
    }

    #[test]
    fn significant_figure_rounding() {
        assert!((round_significant(60123.456, 5) - 60123.0).abs() < 1e-6);
        assert!((round_significant(1.234567, 5) - 1.2346).abs() < 1e-6);
    }
}
