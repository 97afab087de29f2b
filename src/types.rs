//! Record types shared by the normalizer, the store and the CLI

use bigdecimal::BigDecimal;

/// One row of the items-pricing tab, keyed by item name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceRecord {
    pub item_name: String,
    pub price: BigDecimal,
    pub currency: Option<String>,
    pub unit: Option<String>,
    pub category: Option<String>,
}

impl PriceRecord {
    pub fn new(item_name: impl Into<String>, price: BigDecimal) -> Self {
        Self {
            item_name: item_name.into(),
            price,
            currency: None,
            unit: None,
            category: None,
        }
    }
}

/// One row of the shipping tab, keyed by zone or shipping method
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShippingRecord {
    pub zone: String,
    pub price: BigDecimal,
}

impl ShippingRecord {
    pub fn new(zone: impl Into<String>, price: BigDecimal) -> Self {
        Self {
            zone: zone.into(),
            price,
        }
    }
}

/// Outcome of a sync cycle as stored in `sync_runs`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Success,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Success => "success",
            SyncStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "success" => SyncStatus::Success,
            _ => SyncStatus::Failed,
        }
    }
}

/// A finished sync cycle, successful or not
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRun {
    /// RFC 3339 timestamps (UTC)
    pub started_at: String,
    pub finished_at: String,
    pub status: SyncStatus,
    pub pricing_rows: usize,
    pub shipping_rows: usize,
    /// "Last updated" note read from the pricing tab, when one is configured
    pub prices_updated: Option<String>,
    pub error: Option<String>,
}
