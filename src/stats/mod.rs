//! Impression, click and conversion recording.
//!
//! Every event becomes one `CounterDelta` applied through the storage layer's
//! upsert-increment. Failures never reach the caller: transient conflicts are
//! retried a bounded number of times, anything else parks the event in the
//! pending buffer for the reconciler to replay.

pub mod dedup;
pub mod pending;

pub use dedup::{DedupKey, DedupStore};
pub use pending::{PendingBuffer, PendingCounts, PendingKey};

use crate::budget::guard::crossed_limit;
use crate::cache::CandidateCache;
use crate::config::EngineConfig;
use crate::models::{Ad, Money, RequestContext};
use crate::storage::{CounterDelta, Storage, StorageResult};
use chrono::Timelike;
use moka::future::Cache;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Impression,
    Click,
    Conversion,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Impression => "impression",
            EventKind::Click => "click",
            EventKind::Conversion => "conversion",
        }
    }
}

/// Where a click should send the visitor. `url` is `None` when the ad has no
/// landing page configured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClickRedirect {
    pub url: Option<String>,
    pub open_in_new_tab: bool,
}

pub struct StatisticsRecorder {
    storage: Arc<dyn Storage>,
    cache: CandidateCache,
    ads: Cache<i64, Option<Arc<Ad>>>,
    dedup: DedupStore,
    pending: PendingBuffer,
    retry_attempts: u32,
}

impl StatisticsRecorder {
    pub fn new(storage: Arc<dyn Storage>, cache: CandidateCache, config: &EngineConfig) -> Self {
        let ads = Cache::builder()
            .max_capacity(config.candidate_cache_max_entries)
            .time_to_live(config.ad_cache_ttl())
            .build();

        Self {
            storage,
            cache,
            ads,
            dedup: DedupStore::new(config.dedup_max_entries, config.dedup_ttl()),
            pending: PendingBuffer::new(),
            retry_attempts: config.record_retry_attempts.max(1),
        }
    }

    pub async fn record_impression(&self, ad_id: i64, ctx: &RequestContext) {
        let Some(ad) = self.lookup(ad_id).await else {
            return;
        };

        let unique = self.is_unique(&ad, ctx, EventKind::Impression).await;
        let counts = PendingCounts {
            events: 1,
            unique: unique as i64,
            spent: ad.cpm.map(Money::per_mille).unwrap_or_default(),
            revenue: Money::ZERO,
        };

        self.apply(&ad, event_key(&ad, ctx, EventKind::Impression), counts)
            .await;
    }

    /// Record a click and return the redirect target. The target is returned
    /// even when the click could not be written. `None` for unknown or
    /// switched-off ads.
    pub async fn record_click(&self, ad_id: i64, ctx: &RequestContext) -> Option<ClickRedirect> {
        let ad = self.lookup(ad_id).await?;

        let unique = self.is_unique(&ad, ctx, EventKind::Click).await;
        let counts = PendingCounts {
            events: 1,
            unique: unique as i64,
            spent: ad.cpc.unwrap_or_default(),
            revenue: Money::ZERO,
        };

        self.apply(&ad, event_key(&ad, ctx, EventKind::Click), counts)
            .await;

        Some(ClickRedirect {
            url: ad.click_url.clone().filter(|url| !url.is_empty()),
            open_in_new_tab: ad.open_in_new_tab,
        })
    }

    /// Record a conversion worth `value` in revenue. Returns false for unknown
    /// or switched-off ads.
    pub async fn record_conversion(&self, ad_id: i64, value: f64, ctx: &RequestContext) -> bool {
        let Some(ad) = self.lookup(ad_id).await else {
            return false;
        };

        let counts = PendingCounts {
            events: 1,
            unique: 0,
            spent: Money::ZERO,
            revenue: Money::from_units(value.max(0.0)),
        };

        self.apply(&ad, event_key(&ad, ctx, EventKind::Conversion), counts)
            .await;
        true
    }

    /// Replay buffered recordings. Stops at the first failure and puts it and
    /// everything not yet replayed back into the buffer. A replayed batch that
    /// pushes an ad over a limit drops its cached candidates like a live write.
    pub async fn flush_pending(&self) -> anyhow::Result<usize> {
        let mut entries = self.pending.take_all().into_iter();
        let mut applied = 0;

        while let Some((key, counts)) = entries.next() {
            let delta = key.delta(&counts);
            let written = match self.cached_ad(key.ad_id).await {
                Some(ad) => self.write_with_retry(&ad, &delta).await,
                None => self.storage.apply_counters(&delta).await.map(|_| ()),
            };

            if let Err(e) = written {
                self.pending.merge(key, counts);
                for (key, counts) in entries {
                    self.pending.merge(key, counts);
                }
                return Err(e.into());
            }
            applied += 1;
        }

        Ok(applied)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Drop the cached copy of an ad after its configuration changed.
    pub async fn forget_ad(&self, ad_id: i64) {
        self.ads.invalidate(&ad_id).await;
    }

    async fn cached_ad(&self, ad_id: i64) -> Option<Arc<Ad>> {
        let storage = Arc::clone(&self.storage);
        let found = self
            .ads
            .try_get_with(ad_id, async move {
                storage
                    .find_ad(ad_id)
                    .await
                    .map(|ad| ad.map(Arc::new))
            })
            .await;

        match found {
            Ok(ad) => {
                if ad.is_none() {
                    debug!(ad_id, "no such ad");
                }
                ad
            }
            Err(e) => {
                warn!(ad_id, error = %e, "ad lookup failed");
                None
            }
        }
    }

    /// The ad behind a recording, `None` when it is unknown or switched off.
    async fn lookup(&self, ad_id: i64) -> Option<Arc<Ad>> {
        let ad = self.cached_ad(ad_id).await?;
        if !ad.is_active {
            debug!(ad_id, "recording for switched-off ad ignored");
            return None;
        }
        Some(ad)
    }

    async fn is_unique(&self, ad: &Ad, ctx: &RequestContext, kind: EventKind) -> bool {
        let Some(visitor) = ctx.visitor_key() else {
            return false;
        };

        self.dedup
            .first_sighting(DedupKey {
                ad_id: ad.id,
                visitor: visitor.to_string(),
                date: ctx.now.date_naive(),
                kind,
            })
            .await
    }

    async fn apply(&self, ad: &Ad, key: PendingKey, counts: PendingCounts) {
        let delta = key.delta(&counts);

        if let Err(e) = self.write_with_retry(ad, &delta).await {
            warn!(
                ad_id = ad.id,
                kind = key.kind.as_str(),
                error = %e,
                "recording failed, buffered for retry"
            );
            self.pending.merge(key, counts);
        }
    }

    async fn write_with_retry(&self, ad: &Ad, delta: &CounterDelta) -> StorageResult<()> {
        let mut attempt = 1;
        loop {
            match self.storage.apply_counters(delta).await {
                Ok(snapshot) => {
                    if crossed_limit(ad, delta, &snapshot) {
                        debug!(ad_id = ad.id, "limit reached, dropping cached candidates");
                        self.cache.invalidate_placement(ad.placement_id);
                        if let Some(campaign_id) = ad.campaign_id {
                            self.cache.invalidate_campaign(campaign_id);
                        }
                    }
                    return Ok(());
                }
                Err(e) if e.is_retryable() && attempt < self.retry_attempts => {
                    debug!(ad_id = ad.id, attempt, "transient conflict, retrying");
                    tokio::time::sleep(Duration::from_millis(5 * u64::from(attempt))).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn event_key(ad: &Ad, ctx: &RequestContext, kind: EventKind) -> PendingKey {
    PendingKey {
        ad_id: ad.id,
        campaign_id: ad.campaign_id,
        date: ctx.now.date_naive(),
        hour: ctx.now.hour(),
        kind,
        country: ctx
            .country_code
            .as_deref()
            .map(str::trim)
            .filter(|code| !code.is_empty())
            .map(str::to_ascii_uppercase),
        device: ctx
            .device_type
            .as_deref()
            .map(str::trim)
            .filter(|device| !device.is_empty())
            .map(str::to_ascii_lowercase),
    }
}
