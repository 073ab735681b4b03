use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Point-in-time view of the daily spend ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetSnapshot {
    pub day: NaiveDate,
    pub spent_usd: f64,
    pub reserved_usd: f64,
    pub remaining_usd: f64,
    pub cap_usd: f64,
    pub calls_today: u64,
}

/// Point-in-time view of the deduplication cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub in_flight: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub coalesced: u64,
}
