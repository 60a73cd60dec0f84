//! Integration test for the transform + bulk-upsert path the Refresh
//! Orchestrator drives: contracts and tickers in, asset rows out.

use std::collections::HashMap;

use perpfeed::models::{Asset, AssetStatus, Contract, Ticker};
use perpfeed::store::{AssetFilter, AssetStore, BulkUpsertEngine, SortOrder};
use perpfeed::transform;

fn contract(symbol: &str, status: i64) -> Contract {
    Contract {
        symbol: Some(symbol.to_string()),
        display_name: Some(format!("{symbol} perp")),
        asset: None,
        currency: None,
        status: Some(status),
        trade_min_quantity: Some(0.001),
        size: None,
        max_qty: Some(10_000.0),
        price_precision: Some(2),
        quantity_precision: Some(3),
        max_leverage: Some(75.0),
        fee_rate: Some(0.0004),
    }
}

fn ticker(symbol: &str, last_price: f64) -> Ticker {
    Ticker {
        symbol: symbol.to_string(),
        last_price,
        price_change_percent: 2.5,
        base_volume: 1000.0,
        quote_volume: last_price * 1000.0,
        high_price: last_price * 1.05,
        low_price: last_price * 0.95,
        open_interest: 500.0,
    }
}

#[tokio::test]
async fn contracts_and_tickers_merge_dedupe_and_persist() {
    let dir = tempfile::tempdir().unwrap();
    let store = AssetStore::open(dir.path().join("refresh.sqlite3").to_str().unwrap()).unwrap();

    let contracts = vec![
        contract("BTC-USDT", 1),
        contract("ETH-USDT", 1),
        contract("BTC-USDT", 1), // duplicate, first occurrence wins
        contract("SOL-USDT", 0),
    ];
    let tickers = vec![ticker("BTC-USDT", 65000.0), ticker("ETH-USDT", 3400.0)];

    let mut seen = std::collections::HashSet::new();
    let mut deduped = Vec::new();
    let mut duplicates = 0u64;
    for c in contracts {
        let key = c.symbol.clone().unwrap_or_default();
        if seen.insert(key) {
            deduped.push(c);
        } else {
            duplicates += 1;
        }
    }
    assert_eq!(duplicates, 1);
    assert_eq!(deduped.len(), 3);

    let ticker_index = transform::index_tickers(&tickers);
    let assets: Vec<Asset> = deduped
        .iter()
        .enumerate()
        .map(|(i, c)| transform::contract_to_asset(c, &ticker_index, i, 0))
        .collect();

    let engine = BulkUpsertEngine::new(&store);
    let mut progress_calls = Vec::new();
    let outcome = engine.bulk_upsert(assets, |processed, total| progress_calls.push((processed, total))).await;

    assert_eq!(outcome.created, 3);
    assert_eq!(outcome.updated, 0);
    assert_eq!(outcome.errors, 0);
    assert_eq!(progress_calls, vec![(3, 3)]);

    let btc = store.find_by_symbol("BTC-USDT").unwrap().unwrap();
    assert_eq!(btc.last_price, 65000.0);
    assert_eq!(btc.status, AssetStatus::Trading);

    let sol = store.find_by_symbol("SOL-USDT").unwrap().unwrap();
    assert_eq!(sol.last_price, 0.0, "contract without a matching ticker gets zeroed market state");
    assert_eq!(sol.status, AssetStatus::Suspended);

    let total = store.count(&AssetFilter::default()).unwrap();
    assert_eq!(total, 3);

    let by_volume = store.top_by("quote_volume_24h", SortOrder::Desc, 5).unwrap();
    assert_eq!(by_volume.first().unwrap().symbol, "BTC-USDT");
}

#[tokio::test]
async fn rerunning_the_same_batch_counts_as_updates_not_creates() {
    let dir = tempfile::tempdir().unwrap();
    let store = AssetStore::open(dir.path().join("rerun.sqlite3").to_str().unwrap()).unwrap();
    let engine = BulkUpsertEngine::new(&store);

    let tickers: HashMap<String, &Ticker> = HashMap::new();
    let contracts = vec![contract("DOGE-USDT", 1)];
    let assets: Vec<Asset> = contracts
        .iter()
        .enumerate()
        .map(|(i, c)| transform::contract_to_asset(c, &tickers, i, 0))
        .collect();

    let first = engine.bulk_upsert(assets.clone(), |_, _| {}).await;
    assert_eq!(first.created, 1);
    assert_eq!(first.updated, 0);

    let second = engine.bulk_upsert(assets, |_, _| {}).await;
    assert_eq!(second.created, 0);
    assert_eq!(second.updated, 1);
}
