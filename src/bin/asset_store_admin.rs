//! Asset Store Admin CLI
//!
//! Operator tool for inspecting and clearing the asset store outside of
//! the HTTP surface - useful when the server is down or when a truncate
//! needs to happen without exposing `DELETE /clear` publicly.
//!
//! Usage:
//!   cargo run --bin asset_store_admin -- --db ./data/dev.sqlite3 stats
//!   cargo run --bin asset_store_admin -- --db ./data/dev.sqlite3 truncate

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use perpfeed::store::{AssetFilter, AssetStore};

#[derive(Parser, Debug)]
#[command(name = "asset_store_admin")]
#[command(about = "Inspect or clear the perpfeed asset store")]
struct Args {
    /// Path to the SQLite database
    #[arg(long, env = "DATABASE_URL")]
    db: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print row counts and the most recent update timestamp
    Stats,
    /// Delete every row from the asset store
    Truncate,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let store = AssetStore::open(&args.db).context("failed to open asset store")?;

    match args.command {
        Command::Stats => print_stats(&store)?,
        Command::Truncate => {
            let removed = store.truncate().context("truncate failed")?;
            println!("removed {removed} rows");
        }
    }

    Ok(())
}

fn print_stats(store: &AssetStore) -> Result<()> {
    let total = store.count(&AssetFilter::default())?;
    let trading = store.count_trading()?;
    let last_update = store.most_recent_update()?;

    println!("=== Asset Store ===");
    println!("total assets:   {total}");
    println!("trading assets: {trading}");
    match last_update {
        Some(ts) => println!("last updated:   {ts}"),
        None => println!("last updated:   (never)"),
    }
    Ok(())
}
