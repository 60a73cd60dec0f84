//! Raw price snapshot from the Tickers endpoint (transient, §3).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Ticker {
    pub symbol: String,
    #[serde(rename = "lastPrice", default)]
    pub last_price: f64,
    #[serde(rename = "priceChangePercent", default)]
    pub price_change_percent: f64,
    #[serde(rename = "baseVolume", default)]
    pub base_volume: f64,
    #[serde(rename = "quoteVolume", default)]
    pub quote_volume: f64,
    #[serde(rename = "highPrice", default)]
    pub high_price: f64,
    #[serde(rename = "lowPrice", default)]
    pub low_price: f64,
    #[serde(rename = "openInterest", default)]
    pub open_interest: f64,
}
