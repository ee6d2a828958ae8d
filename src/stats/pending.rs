use super::EventKind;
use crate::models::{BreakdownDimension, Money};
use crate::storage::CounterDelta;
use chrono::NaiveDate;
use dashmap::DashMap;

/// Identity of a batch of recordings that can be merged into one delta.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PendingKey {
    pub ad_id: i64,
    pub campaign_id: Option<i64>,
    pub date: NaiveDate,
    pub hour: u32,
    pub kind: EventKind,
    pub country: Option<String>,
    pub device: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingCounts {
    pub events: i64,
    pub unique: i64,
    pub spent: Money,
    pub revenue: Money,
}

impl PendingCounts {
    fn absorb(&mut self, other: &PendingCounts) {
        self.events += other.events;
        self.unique += other.unique;
        self.spent += other.spent;
        self.revenue += other.revenue;
    }
}

impl PendingKey {
    /// Counter increments for `counts` events of this kind.
    pub fn delta(&self, counts: &PendingCounts) -> CounterDelta {
        let mut delta = CounterDelta::new(self.ad_id, self.campaign_id, self.date);
        delta.spent = counts.spent;
        delta.revenue = counts.revenue;

        match self.kind {
            EventKind::Impression => {
                delta.impressions = counts.events;
                delta.unique_impressions = counts.unique;
            }
            EventKind::Click => {
                delta.clicks = counts.events;
                delta.unique_clicks = counts.unique;
            }
            EventKind::Conversion => {
                delta.conversions = counts.events;
                return delta;
            }
        }

        delta
            .breakdowns
            .push((BreakdownDimension::Hour, format!("{:02}", self.hour)));
        if let Some(country) = &self.country {
            delta
                .breakdowns
                .push((BreakdownDimension::Country, country.clone()));
        }
        if let Some(device) = &self.device {
            delta
                .breakdowns
                .push((BreakdownDimension::Device, device.clone()));
        }
        delta
    }
}

/// Recordings that could not be written yet, merged per key until the next
/// flush.
#[derive(Debug, Default)]
pub struct PendingBuffer {
    entries: DashMap<PendingKey, PendingCounts>,
}

impl PendingBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn merge(&self, key: PendingKey, counts: PendingCounts) {
        self.entries.entry(key).or_default().absorb(&counts);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove and return everything buffered so far. Concurrent merges that
    /// land after a key was taken start a fresh entry.
    pub fn take_all(&self) -> Vec<(PendingKey, PendingCounts)> {
        let keys: Vec<PendingKey> = self.entries.iter().map(|entry| entry.key().clone()).collect();

        keys.into_iter()
            .filter_map(|key| self.entries.remove(&key))
            .collect()
    }
}
