//! The persisted Asset record (§3) and its invariants.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Contract status, normalized to one of five enumerated strings (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AssetStatus {
    Trading,
    Suspended,
    Delisted,
    Maintenance,
    Unknown,
}

impl AssetStatus {
    /// Status-code mapping from §6.5: 1→TRADING, 0→SUSPENDED, 2→DELISTED,
    /// 3→MAINTENANCE, any other or missing→UNKNOWN.
    pub fn from_upstream_code(code: Option<i64>) -> Self {
        match code {
            Some(1) => AssetStatus::Trading,
            Some(0) => AssetStatus::Suspended,
            Some(2) => AssetStatus::Delisted,
            Some(3) => AssetStatus::Maintenance,
            _ => AssetStatus::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AssetStatus::Trading => "TRADING",
            AssetStatus::Suspended => "SUSPENDED",
            AssetStatus::Delisted => "DELISTED",
            AssetStatus::Maintenance => "MAINTENANCE",
            AssetStatus::Unknown => "UNKNOWN",
        }
    }

    pub fn from_str_loose(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "TRADING" => AssetStatus::Trading,
            "SUSPENDED" => AssetStatus::Suspended,
            "DELISTED" => AssetStatus::Delisted,
            "MAINTENANCE" => AssetStatus::Maintenance,
            _ => AssetStatus::Unknown,
        }
    }
}

/// The merged, persisted record. Uniquely identified by `symbol`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Asset {
    pub symbol: String,

    // Contract metadata (slowly changing).
    pub name: String,
    pub base_currency: String,
    pub quote_currency: String,
    pub status: AssetStatus,
    pub min_qty: f64,
    pub max_qty: f64,
    pub tick_size: f64,
    pub step_size: f64,
    pub max_leverage: f64,
    pub maint_margin_rate: f64,

    // Market state (fast changing).
    pub last_price: f64,
    pub price_change_percent: f64,
    pub base_volume_24h: f64,
    pub quote_volume_24h: f64,
    pub high_price_24h: f64,
    pub low_price_24h: f64,
    pub open_interest: f64,

    pub updated_at: DateTime<Utc>,
}

impl Asset {
    /// Coerce every numeric field to a finite value, replacing
    /// `NaN`/±∞ with the documented default for that field (§3 invariant).
    pub fn sanitize(&mut self) {
        self.min_qty = finite_or(self.min_qty, 0.0);
        self.max_qty = finite_or(self.max_qty, 999_999_999.0);
        self.tick_size = finite_or(self.tick_size, 0.0001);
        self.step_size = finite_or(self.step_size, 0.001);
        self.max_leverage = finite_or(self.max_leverage, 100.0);
        self.maint_margin_rate = finite_or(self.maint_margin_rate, 0.0);

        self.last_price = finite_or(self.last_price, 0.0);
        self.price_change_percent = finite_or(self.price_change_percent, 0.0);
        self.base_volume_24h = finite_or(self.base_volume_24h, 0.0);
        self.quote_volume_24h = finite_or(self.quote_volume_24h, 0.0);
        self.high_price_24h = finite_or(self.high_price_24h, 0.0);
        self.low_price_24h = finite_or(self.low_price_24h, 0.0);
        self.open_interest = finite_or(self.open_interest, 0.0);
    }

    /// `symbol` is non-empty, trimmed, and uppercase - returns an error
    /// message (counted but not fatal, per the Bulk Upsert Engine design)
    /// rather than panicking.
    pub fn validate_symbol(&self) -> Result<(), String> {
        let trimmed = self.symbol.trim();
        if trimmed.is_empty() {
            return Err("empty symbol".to_string());
        }
        if trimmed != trimmed.to_ascii_uppercase() {
            return Err(format!("symbol {trimmed} is not uppercase"));
        }
        Ok(())
    }

    pub fn zero_market_state(&mut self) {
        self.last_price = 0.0;
        self.price_change_percent = 0.0;
        self.base_volume_24h = 0.0;
        self.quote_volume_24h = 0.0;
        self.high_price_24h = 0.0;
        self.low_price_24h = 0.0;
        self.open_interest = 0.0;
    }
}

fn finite_or(v: f64, default: f64) -> f64 {
    if v.is_finite() {
        v
    } else {
        default
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Asset {
        Asset {
            symbol: "BTC-USDT".to_string(),
            name: "Bitcoin".to_string(),
            base_currency: "BTC".to_string(),
            quote_currency: "USDT".to_string(),
            status: AssetStatus::Trading,
            min_qty: 0.0,
            max_qty: 1.0,
            tick_size: 0.1,
            step_size: 0.1,
            max_leverage: 50.0,
            maint_margin_rate: 0.01,
            last_price: 100.0,
            price_change_percent: 1.0,
            base_volume_24h: 1.0,
            quote_volume_24h: 1.0,
            high_price_24h: 1.0,
            low_price_24h: 1.0,
            open_interest: 1.0,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn sanitize_replaces_non_finite() {
        let mut a = sample();
        a.last_price = f64::NAN;
        a.open_interest = f64::INFINITY;
        a.max_qty = f64::NEG_INFINITY;
        a.sanitize();
        assert_eq!(a.last_price, 0.0);
        assert_eq!(a.open_interest, 0.0);
        assert_eq!(a.max_qty, 999_999_999.0);
    }

    #[test]
    fn status_code_mapping() {
        assert_eq!(AssetStatus::from_upstream_code(Some(1)), AssetStatus::Trading);
        assert_eq!(AssetStatus::from_upstream_code(Some(0)), AssetStatus::Suspended);
        assert_eq!(AssetStatus::from_upstream_code(Some(2)), AssetStatus::Delisted);
        assert_eq!(AssetStatus::from_upstream_code(Some(3)), AssetStatus::Maintenance);
        assert_eq!(AssetStatus::from_upstream_code(Some(99)), AssetStatus::Unknown);
        assert_eq!(AssetStatus::from_upstream_code(None), AssetStatus::Unknown);
    }

    #[test]
    fn validate_symbol_rejects_empty_and_lowercase() {
        let mut a = sample();
        a.symbol = "".to_string();
        assert!(a.validate_symbol().is_err());
        a.symbol = "btc-usdt".to_string();
        assert!(a.validate_symbol().is_err());
        a.symbol = "BTC-USDT".to_string();
        assert!(a.validate_symbol().is_ok());
    }
}
