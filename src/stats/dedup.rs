use super::EventKind;
use chrono::NaiveDate;
use moka::future::Cache;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub ad_id: i64,
    pub visitor: String,
    pub date: NaiveDate,
    pub kind: EventKind,
}

/// Remembers which visitors were already counted as unique for an ad on a day.
///
/// Entries expire after the configured TTL. The date is part of the key, so a
/// visitor seen just before midnight is unique again the next day.
#[derive(Clone)]
pub struct DedupStore {
    seen: Cache<DedupKey, ()>,
}

impl DedupStore {
    pub fn new(max_entries: u64, ttl: Duration) -> Self {
        let seen = Cache::builder()
            .max_capacity(max_entries)
            .time_to_live(ttl)
            .build();

        Self { seen }
    }

    /// True exactly once per key while the entry lives, even when called
    /// concurrently.
    pub async fn first_sighting(&self, key: DedupKey) -> bool {
        self.seen.entry(key).or_insert(()).await.is_fresh()
    }
}
