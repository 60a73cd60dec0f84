//! Exchange Client: typed REST operations over the upstream exchange,
//! gated by the Rate Governor and ranked by proven-endpoint success (§4.2).

pub mod auth;
mod client;
mod endpoints;
mod types;

pub use client::{ExchangeClient, ExchangeConfig, ExchangeOps};
pub use types::{Balance, Depth, DepthLevel, Kline, OrderAck, OrderRequest, Position};
