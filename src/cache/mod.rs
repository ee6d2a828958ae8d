//! Short-lived cache of filtered candidate sets.
//!
//! An entry holds the ads of one placement that passed targeting and the
//! budget guard for one coarse context bucket. The final weighted pick is
//! never cached.

use crate::models::{Ad, AdAbTest, AdCampaign, AdPlacement, RequestContext};
use moka::future::Cache;
use std::collections::HashMap;
use std::future::Future;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CandidateKey {
    pub placement_slug: String,
    pub country_code: Option<String>,
    pub device_type: Option<String>,
    /// Sorted, deduplicated page category ids.
    pub category_bucket: Vec<i64>,
    /// Hours since the unix epoch (UTC). Time-of-day targeting and daily caps
    /// only change on hour boundaries.
    pub hour_bucket: i64,
}

impl CandidateKey {
    pub fn new(placement_slug: &str, ctx: &RequestContext) -> Self {
        let mut category_bucket = ctx.page_category_ids.clone();
        category_bucket.sort_unstable();
        category_bucket.dedup();

        Self {
            placement_slug: placement_slug.to_string(),
            country_code: ctx
                .country_code
                .as_deref()
                .map(|code| code.trim().to_ascii_uppercase()),
            device_type: ctx
                .device_type
                .as_deref()
                .map(|device| device.trim().to_ascii_lowercase()),
            category_bucket,
            hour_bucket: ctx.now.timestamp().div_euclid(3600),
        }
    }
}

/// Output of the filter stage for one key.
#[derive(Debug, Default)]
pub struct CandidateSet {
    /// `None` when the slug is unknown or the placement is switched off.
    pub placement: Option<AdPlacement>,
    pub ads: Vec<Arc<Ad>>,
    /// A/B tests referenced by `ads`, by id.
    pub ab_tests: HashMap<i64, AdAbTest>,
    /// Campaigns of `ads`, by id.
    pub campaigns: HashMap<i64, AdCampaign>,
}

impl CandidateSet {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Whether `ad` and its campaign are both inside their flight windows at
    /// `now`. Entries live longer than a request, so this runs per request.
    pub fn is_servable(&self, ad: &Ad, now: DateTime<Utc>) -> bool {
        if !ad.is_running(now) {
            return false;
        }
        match ad.campaign_id {
            Some(campaign_id) => self
                .campaigns
                .get(&campaign_id)
                .is_some_and(|campaign| campaign.is_running(now)),
            None => true,
        }
    }

    fn touches_campaign(&self, campaign_id: i64) -> bool {
        self.ads.iter().any(|ad| ad.campaign_id == Some(campaign_id))
    }
}

#[derive(Clone)]
pub struct CandidateCache {
    entries: Cache<CandidateKey, Arc<CandidateSet>>,
}

impl CandidateCache {
    pub fn new(max_entries: u64, ttl: Duration) -> Self {
        let entries = Cache::builder()
            .max_capacity(max_entries)
            .time_to_live(ttl)
            .support_invalidation_closures()
            .build();

        Self { entries }
    }

    /// Return the cached set for `key`, or run `compute` and cache its result.
    /// Concurrent misses on the same key share one computation. Errors are not
    /// cached.
    pub async fn get_or_compute<F>(
        &self,
        key: CandidateKey,
        compute: F,
    ) -> Result<Arc<CandidateSet>, Arc<anyhow::Error>>
    where
        F: Future<Output = anyhow::Result<Arc<CandidateSet>>>,
    {
        self.entries.try_get_with(key, compute).await
    }

    /// Drop every entry built for the placement with this id.
    pub fn invalidate_placement(&self, placement_id: i64) {
        self.invalidate_where(move |_, set| {
            set.placement
                .as_ref()
                .is_some_and(|placement| placement.id == placement_id)
        });
    }

    /// Drop every entry looked up under this slug, including negative ones.
    pub fn invalidate_slug(&self, slug: &str) {
        let slug = slug.to_string();
        self.invalidate_where(move |key, _| key.placement_slug == slug);
    }

    /// Drop every entry holding an ad of this campaign.
    pub fn invalidate_campaign(&self, campaign_id: i64) {
        self.invalidate_where(move |_, set| set.touches_campaign(campaign_id));
    }

    pub fn invalidate_all(&self) {
        self.entries.invalidate_all();
    }

    fn invalidate_where<F>(&self, predicate: F)
    where
        F: Fn(&CandidateKey, &Arc<CandidateSet>) -> bool + Send + Sync + 'static,
    {
        if let Err(e) = self.entries.invalidate_entries_if(predicate) {
            warn!("Selective cache invalidation failed, clearing everything: {}", e);
            self.entries.invalidate_all();
        }
    }

    #[cfg(test)]
    pub(crate) async fn contains(&self, key: &CandidateKey) -> bool {
        self.entries.get(key).await.is_some()
    }
}
