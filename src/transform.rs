//! Contract→Asset transform (§6.5): the Transform & Enrich stage's mapping
//! from a raw contract descriptor plus its matching ticker into the
//! persisted `Asset` shape.

use std::collections::HashMap;

use chrono::Utc;

use crate::models::{Asset, AssetStatus, Contract, Ticker};
use crate::symbol;

/// Build a symbol-keyed lookup of tickers for O(1) matching during the
/// transform stage.
pub fn index_tickers(tickers: &[Ticker]) -> HashMap<String, &Ticker> {
    let mut map = HashMap::with_capacity(tickers.len());
    for t in tickers {
        if let Some(normalized) = symbol::normalize(&t.symbol) {
            map.insert(normalized, t);
        }
    }
    map
}

/// Map one contract (and its matching ticker, if any) to an `Asset`.
/// `index` and `now_millis` feed the synthesized-symbol fallback so two
/// calls in the same batch never collide.
pub fn contract_to_asset(contract: &Contract, tickers: &HashMap<String, &Ticker>, index: usize, now_millis: i64) -> Asset {
    let symbol = contract
        .symbol
        .as_deref()
        .and_then(symbol::normalize)
        .unwrap_or_else(|| format!("UNKNOWN_{index}_{now_millis}"));

    let (prefix, suffix) = split_symbol(&symbol);

    let name = contract
        .display_name
        .clone()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| symbol.clone());

    let base_currency = contract
        .asset
        .clone()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| prefix.unwrap_or_else(|| "UNKNOWN".to_string()));

    let quote_currency = contract
        .currency
        .clone()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| suffix.unwrap_or_else(|| "USDT".to_string()));

    let status = AssetStatus::from_upstream_code(contract.status);

    let min_qty = contract
        .trade_min_quantity
        .or(contract.size)
        .unwrap_or(0.0);

    let max_qty = contract.max_qty.unwrap_or(999_999_999.0);

    let tick_size = contract
        .price_precision
        .map(|p| 10f64.powi(-p))
        .unwrap_or(0.0001);

    let step_size = contract
        .quantity_precision
        .map(|p| 10f64.powi(-p))
        .unwrap_or(0.001);

    let max_leverage = contract.max_leverage.unwrap_or(100.0);
    let maint_margin_rate = contract.fee_rate.unwrap_or(0.0);

    let mut asset = Asset {
        symbol: symbol.clone(),
        name,
        base_currency,
        quote_currency,
        status,
        min_qty,
        max_qty,
        tick_size,
        step_size,
        max_leverage,
        maint_margin_rate,
        last_price: 0.0,
        price_change_percent: 0.0,
        base_volume_24h: 0.0,
        quote_volume_24h: 0.0,
        high_price_24h: 0.0,
        low_price_24h: 0.0,
        open_interest: 0.0,
        updated_at: Utc::now(),
    };

    if let Some(ticker) = tickers.get(&symbol) {
        asset.last_price = ticker.last_price;
        asset.price_change_percent = ticker.price_change_percent;
        asset.base_volume_24h = ticker.base_volume;
        asset.quote_volume_24h = ticker.quote_volume;
        asset.high_price_24h = ticker.high_price;
        asset.low_price_24h = ticker.low_price;
        asset.open_interest = ticker.open_interest;
    }

    asset.sanitize();
    asset
}

fn split_symbol(symbol: &str) -> (Option<String>, Option<String>) {
    match symbol.split_once('-') {
        Some((base, quote)) => (Some(base.to_string()), Some(quote.to_string())),
        None => (None, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contract(symbol: &str) -> Contract {
        Contract {
            symbol: Some(symbol.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn falls_back_to_symbol_derived_fields_when_source_missing() {
        let c = contract("dot/usdt");
        let asset = contract_to_asset(&c, &HashMap::new(), 0, 0);
        assert_eq!(asset.symbol, "DOT-USDT");
        assert_eq!(asset.name, "DOT-USDT");
        assert_eq!(asset.base_currency, "DOT");
        assert_eq!(asset.quote_currency, "USDT");
        assert_eq!(asset.status, AssetStatus::Unknown);
        assert_eq!(asset.min_qty, 0.0);
        assert_eq!(asset.max_qty, 999_999_999.0);
        assert_eq!(asset.tick_size, 0.0001);
        assert_eq!(asset.step_size, 0.001);
    }

    #[test]
    fn synthesizes_symbol_when_missing() {
        let c = Contract::default();
        let asset = contract_to_asset(&c, &HashMap::new(), 7, 123);
        assert_eq!(asset.symbol, "UNKNOWN_7_123");
    }

    #[test]
    fn precision_maps_to_tick_and_step_size() {
        let mut c = contract("BTC-USDT");
        c.price_precision = Some(2);
        c.quantity_precision = Some(3);
        let asset = contract_to_asset(&c, &HashMap::new(), 0, 0);
        assert!((asset.tick_size - 0.01).abs() < 1e-12);
        assert!((asset.step_size - 0.001).abs() < 1e-12);
    }

    #[test]
    fn matching_ticker_populates_market_state() {
        let c = contract("ETH-USDT");
        let ticker = Ticker {
            symbol: "ETH-USDT".to_string(),
            last_price: 2500.0,
            price_change_percent: 1.5,
            base_volume: 10.0,
            quote_volume: 25000.0,
            high_price: 2600.0,
            low_price: 2400.0,
            open_interest: 500.0,
        };
        let tickers = index_tickers(std::slice::from_ref(&ticker));
        let asset = contract_to_asset(&c, &tickers, 0, 0);
        assert_eq!(asset.last_price, 2500.0);
        assert_eq!(asset.open_interest, 500.0);
    }

    #[test]
    fn status_code_mapping_applied() {
        let mut c = contract("SOL-USDT");
        c.status = Some(3);
        let asset = contract_to_asset(&c, &HashMap::new(), 0, 0);
        assert_eq!(asset.status, AssetStatus::Maintenance);
    }
}
