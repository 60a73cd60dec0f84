//! Raw contract descriptor from the Symbols endpoint (transient, §3).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Contract {
    pub symbol: Option<String>,
    #[serde(rename = "displayName")]
    pub display_name: Option<String>,
    pub asset: Option<String>,
    pub currency: Option<String>,
    pub status: Option<i64>,
    #[serde(rename = "tradeMinQuantity")]
    pub trade_min_quantity: Option<f64>,
    pub size: Option<f64>,
    #[serde(rename = "maxQty")]
    pub max_qty: Option<f64>,
    #[serde(rename = "pricePrecision")]
    pub price_precision: Option<i32>,
    #[serde(rename = "quantityPrecision")]
    pub quantity_precision: Option<i32>,
    #[serde(rename = "maxLeverage")]
    pub max_leverage: Option<f64>,
    #[serde(rename = "feeRate")]
    pub fee_rate: Option<f64>,
}
