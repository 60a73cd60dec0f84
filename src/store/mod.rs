//! Asset Store (§4.6): a symbol-keyed persistent collection backed by
//! SQLite, with ordered paginated reads and the bulk-merge primitive the
//! Bulk Upsert Engine drives transactions through.

mod bulk_upsert;

pub use bulk_upsert::{BulkUpsertEngine, BulkUpsertOutcome};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::models::{Asset, AssetStatus};

/// Columns a caller may sort by (§4.6). Anything else is rejected with
/// a descriptive error, matching the HTTP 400 at the API boundary.
pub const SORTABLE_COLUMNS: &[&str] = &[
    "symbol",
    "name",
    "updated_at",
    "last_price",
    "price_change_percent",
    "base_volume_24h",
    "quote_volume_24h",
    "open_interest",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    fn as_sql(self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

/// Filter applied to `findAll`/`count` (§4.6 `where`). Kept as an explicit
/// struct rather than a free-form query object per the config-object
/// design note in §9.
#[derive(Debug, Clone, Default)]
pub struct AssetFilter {
    pub search: Option<String>,
    pub status: Option<AssetStatus>,
}

pub struct AssetStore {
    conn: Mutex<Connection>,
}

/// Outcome of merging one row via the atomic merge primitive (§4.3 step 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeResult {
    Inserted,
    Updated,
}

impl AssetStore {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path).with_context(|| format!("opening sqlite store at {path}"))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        let store = Self { conn: Mutex::new(conn) };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS assets (
                symbol TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                base_currency TEXT NOT NULL,
                quote_currency TEXT NOT NULL,
                status TEXT NOT NULL,
                min_qty REAL NOT NULL,
                max_qty REAL NOT NULL,
                tick_size REAL NOT NULL,
                step_size REAL NOT NULL,
                max_leverage REAL NOT NULL,
                maint_margin_rate REAL NOT NULL,
                last_price REAL NOT NULL,
                price_change_percent REAL NOT NULL,
                base_volume_24h REAL NOT NULL,
                quote_volume_24h REAL NOT NULL,
                high_price_24h REAL NOT NULL,
                low_price_24h REAL NOT NULL,
                open_interest REAL NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_assets_status_quote_volume ON assets(status, quote_volume_24h);
            CREATE INDEX IF NOT EXISTS idx_assets_status_price_change ON assets(status, price_change_percent);
            CREATE INDEX IF NOT EXISTS idx_assets_updated_at ON assets(updated_at);",
        )?;
        Ok(())
    }

    /// The atomic merge primitive (§4.3 step 3, §4.6 `upsertBatch`):
    /// within one transaction, insert new symbols and update all
    /// non-key columns plus `updated_at` for existing ones.
    pub fn upsert_batch(&self, records: &[Asset]) -> Result<Vec<MergeResult>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut results = Vec::with_capacity(records.len());
        {
            let mut exists_stmt = tx.prepare_cached("SELECT 1 FROM assets WHERE symbol = ?1")?;
            let mut stmt = tx.prepare_cached(
                "INSERT INTO assets (
                    symbol, name, base_currency, quote_currency, status,
                    min_qty, max_qty, tick_size, step_size, max_leverage, maint_margin_rate,
                    last_price, price_change_percent, base_volume_24h, quote_volume_24h,
                    high_price_24h, low_price_24h, open_interest, updated_at
                ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19)
                ON CONFLICT(symbol) DO UPDATE SET
                    name = excluded.name,
                    base_currency = excluded.base_currency,
                    quote_currency = excluded.quote_currency,
                    status = excluded.status,
                    min_qty = excluded.min_qty,
                    max_qty = excluded.max_qty,
                    tick_size = excluded.tick_size,
                    step_size = excluded.step_size,
                    max_leverage = excluded.max_leverage,
                    maint_margin_rate = excluded.maint_margin_rate,
                    last_price = excluded.last_price,
                    price_change_percent = excluded.price_change_percent,
                    base_volume_24h = excluded.base_volume_24h,
                    quote_volume_24h = excluded.quote_volume_24h,
                    high_price_24h = excluded.high_price_24h,
                    low_price_24h = excluded.low_price_24h,
                    open_interest = excluded.open_interest,
                    updated_at = excluded.updated_at",
            )?;
            for asset in records {
                let existed = exists_stmt.exists(params![asset.symbol])?;
                stmt.execute(params![
                    asset.symbol,
                    asset.name,
                    asset.base_currency,
                    asset.quote_currency,
                    asset.status.as_str(),
                    asset.min_qty,
                    asset.max_qty,
                    asset.tick_size,
                    asset.step_size,
                    asset.max_leverage,
                    asset.maint_margin_rate,
                    asset.last_price,
                    asset.price_change_percent,
                    asset.base_volume_24h,
                    asset.quote_volume_24h,
                    asset.high_price_24h,
                    asset.low_price_24h,
                    asset.open_interest,
                    asset.updated_at.to_rfc3339(),
                ])?;
                results.push(if existed { MergeResult::Updated } else { MergeResult::Inserted });
            }
        }
        tx.commit()?;
        Ok(results)
    }

    /// Update only the market-state columns for rows that already exist,
    /// identified by symbol (delta refresh, §4.4). Returns the number of
    /// rows actually touched.
    pub fn update_market_state_batch(&self, updates: &[Asset]) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut touched = 0usize;
        {
            let mut stmt = tx.prepare_cached(
                "UPDATE assets SET
                    last_price = ?2,
                    price_change_percent = ?3,
                    base_volume_24h = ?4,
                    quote_volume_24h = ?5,
                    high_price_24h = ?6,
                    low_price_24h = ?7,
                    open_interest = ?8,
                    updated_at = ?9
                WHERE symbol = ?1",
            )?;
            for asset in updates {
                let changed = stmt.execute(params![
                    asset.symbol,
                    asset.last_price,
                    asset.price_change_percent,
                    asset.base_volume_24h,
                    asset.quote_volume_24h,
                    asset.high_price_24h,
                    asset.low_price_24h,
                    asset.open_interest,
                    asset.updated_at.to_rfc3339(),
                ])?;
                touched += changed;
            }
        }
        tx.commit()?;
        Ok(touched)
    }

    pub fn upsert_one(&self, asset: &Asset) -> Result<MergeResult> {
        let results = self.upsert_batch(std::slice::from_ref(asset))?;
        Ok(results.into_iter().next().expect("single-row batch returns one result"))
    }

    pub fn find_by_symbol(&self, symbol: &str) -> Result<Option<Asset>> {
        let conn = self.conn.lock();
        conn.query_row("SELECT * FROM assets WHERE symbol = ?1", params![symbol], row_to_asset)
            .optional()
            .context("querying asset by symbol")
    }

    pub fn find_all(&self, filter: &AssetFilter, order_by: &str, order: SortOrder, limit: i64, offset: i64) -> Result<Vec<Asset>> {
        anyhow::ensure!(SORTABLE_COLUMNS.contains(&order_by), "unsupported sort column: {order_by}");
        let conn = self.conn.lock();
        let (clause, args) = filter.where_clause();
        let sql = format!(
            "SELECT * FROM assets {clause} ORDER BY {order_by} {} LIMIT ?{} OFFSET ?{}",
            order.as_sql(),
            args.len() + 1,
            args.len() + 2,
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut params_dyn: Vec<&dyn rusqlite::ToSql> = args.iter().map(|s| s as &dyn rusqlite::ToSql).collect();
        params_dyn.push(&limit);
        params_dyn.push(&offset);
        let rows = stmt.query_map(params_dyn.as_slice(), row_to_asset)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().context("collecting asset rows")
    }

    pub fn count(&self, filter: &AssetFilter) -> Result<i64> {
        let conn = self.conn.lock();
        let (clause, args) = filter.where_clause();
        let sql = format!("SELECT COUNT(*) FROM assets {clause}");
        let params_dyn: Vec<&dyn rusqlite::ToSql> = args.iter().map(|s| s as &dyn rusqlite::ToSql).collect();
        conn.query_row(&sql, params_dyn.as_slice(), |row| row.get(0))
            .context("counting assets")
    }

    /// Latest `updated_at` across every row, used to decide whether a
    /// delta refresh is eligible (§4.4).
    pub fn most_recent_update(&self) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn.lock();
        let raw: Option<String> = conn
            .query_row("SELECT MAX(updated_at) FROM assets", [], |row| row.get(0))
            .optional()?
            .flatten();
        Ok(raw.and_then(|s| DateTime::parse_from_rfc3339(&s).ok()).map(|dt| dt.with_timezone(&Utc)))
    }

    pub fn truncate(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM assets", [], |row| row.get(0))?;
        conn.execute("DELETE FROM assets", [])?;
        Ok(count as usize)
    }

    /// Stats overview (§6.1 `/stats/overview`): ranked reads reuse the
    /// ordered-read primitive with a different column and a fixed limit.
    pub fn top_by(&self, column: &str, order: SortOrder, limit: i64) -> Result<Vec<Asset>> {
        self.find_all(&AssetFilter::default(), column, order, limit, 0)
    }

    pub fn count_trading(&self) -> Result<i64> {
        self.count(&AssetFilter {
            status: Some(AssetStatus::Trading),
            ..Default::default()
        })
    }
}

impl AssetFilter {
    fn where_clause(&self) -> (String, Vec<String>) {
        let mut clauses = Vec::new();
        let mut args = Vec::new();
        if let Some(search) = &self.search {
            clauses.push(format!("symbol LIKE ?{}", args.len() + 1));
            args.push(format!("%{}%", search.to_ascii_uppercase()));
        }
        if let Some(status) = self.status {
            clauses.push(format!("status = ?{}", args.len() + 1));
            args.push(status.as_str().to_string());
        }
        if clauses.is_empty() {
            (String::new(), args)
        } else {
            (format!("WHERE {}", clauses.join(" AND ")), args)
        }
    }
}

fn row_to_asset(row: &Row<'_>) -> rusqlite::Result<Asset> {
    let status: String = row.get("status")?;
    let updated_at: String = row.get("updated_at")?;
    Ok(Asset {
        symbol: row.get("symbol")?,
        name: row.get("name")?,
        base_currency: row.get("base_currency")?,
        quote_currency: row.get("quote_currency")?,
        status: AssetStatus::from_str_loose(&status),
        min_qty: row.get("min_qty")?,
        max_qty: row.get("max_qty")?,
        tick_size: row.get("tick_size")?,
        step_size: row.get("step_size")?,
        max_leverage: row.get("max_leverage")?,
        maint_margin_rate: row.get("maint_margin_rate")?,
        last_price: row.get("last_price")?,
        price_change_percent: row.get("price_change_percent")?,
        base_volume_24h: row.get("base_volume_24h")?,
        quote_volume_24h: row.get("quote_volume_24h")?,
        high_price_24h: row.get("high_price_24h")?,
        low_price_24h: row.get("low_price_24h")?,
        open_interest: row.get("open_interest")?,
        updated_at: DateTime::parse_from_rfc3339(&updated_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}
