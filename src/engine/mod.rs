//! The ad serving facade.
//!
//! `AdServer` answers "which ads go into this placement for this request" and
//! records what happened afterwards. None of its serving operations return
//! errors: every failure ends in "serve nothing" or "count nothing" and a log
//! line.

use crate::abtest::{self, AbTestOutcome};
use crate::budget::{BudgetGuard, BudgetReconciler};
use crate::cache::{CandidateCache, CandidateKey, CandidateSet};
use crate::config::EngineConfig;
use crate::models::{
    AbVariant, Ad, AdStatus, BreakdownDimension, BreakdownEntry, CampaignStatus, RequestContext,
    StatisticsSummary,
};
use crate::segments::{self, SegmentResolver};
use crate::selection;
use crate::stats::{ClickRedirect, StatisticsRecorder};
use crate::storage::Storage;
use crate::targeting;
use anyhow::{Context, Result};
use chrono::{Duration as DateDuration, NaiveDate, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

pub struct AdServer {
    storage: Arc<dyn Storage>,
    cache: CandidateCache,
    recorder: Arc<StatisticsRecorder>,
    segments: Option<Arc<dyn SegmentResolver>>,
    rng: Mutex<StdRng>,
    selection_timeout: Duration,
}

impl AdServer {
    pub fn new(storage: Arc<dyn Storage>, config: &EngineConfig) -> Self {
        let cache = CandidateCache::new(
            config.candidate_cache_max_entries,
            config.candidate_cache_ttl(),
        );
        let recorder = Arc::new(StatisticsRecorder::new(
            Arc::clone(&storage),
            cache.clone(),
            config,
        ));

        Self {
            storage,
            cache,
            recorder,
            segments: None,
            rng: Mutex::new(StdRng::seed_from_u64(rand::random())),
            selection_timeout: config.selection_timeout(),
        }
    }

    /// Fix the random source so that draws are reproducible.
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    /// Resolve segment membership for requests that arrive without it.
    pub fn with_segment_resolver(mut self, resolver: Arc<dyn SegmentResolver>) -> Self {
        self.segments = Some(resolver);
        self
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn cache(&self) -> &CandidateCache {
        &self.cache
    }

    pub fn recorder(&self) -> &Arc<StatisticsRecorder> {
        &self.recorder
    }

    pub fn reconciler(&self) -> BudgetReconciler {
        BudgetReconciler::new(
            Arc::clone(&self.storage),
            self.cache.clone(),
            Arc::clone(&self.recorder),
        )
    }

    pub async fn select_ad(&self, placement_slug: &str, ctx: &RequestContext) -> Option<Arc<Ad>> {
        self.select_ads(placement_slug, 1, ctx).await.pop()
    }

    /// Up to `limit` distinct ads in draw order. Empty when nothing can be
    /// served, the placement is unknown, or the selection ran out of time.
    pub async fn select_ads(
        &self,
        placement_slug: &str,
        limit: usize,
        ctx: &RequestContext,
    ) -> Vec<Arc<Ad>> {
        if limit == 0 {
            return Vec::new();
        }

        match tokio::time::timeout(
            self.selection_timeout,
            self.select_within_deadline(placement_slug, limit, ctx),
        )
        .await
        {
            Ok(ads) => ads,
            Err(_) => {
                warn!(placement = placement_slug, "ad selection timed out");
                Vec::new()
            }
        }
    }

    async fn select_within_deadline(
        &self,
        placement_slug: &str,
        limit: usize,
        ctx: &RequestContext,
    ) -> Vec<Arc<Ad>> {
        let key = CandidateKey::new(placement_slug, ctx);
        let candidates = match self
            .cache
            .get_or_compute(key, build_candidates(self.storage.as_ref(), placement_slug, ctx))
            .await
        {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!(placement = placement_slug, error = %e, "candidate lookup failed");
                return Vec::new();
            }
        };

        let Some(placement) = &candidates.placement else {
            debug!(placement = placement_slug, "unknown or inactive placement");
            return Vec::new();
        };
        if !placement.allows_page(ctx.page_route.as_deref()) {
            debug!(
                placement = placement_slug,
                page = ?ctx.page_route,
                "placement not allowed on page"
            );
            return Vec::new();
        }

        let running: Vec<Arc<Ad>> = candidates
            .ads
            .iter()
            .filter(|ad| candidates.is_servable(ad, ctx.now))
            .cloned()
            .collect();

        let resolved = match (&ctx.segment_ids, &self.segments) {
            (None, Some(resolver)) => {
                let gated: BTreeSet<i64> = running
                    .iter()
                    .flat_map(|ad| ad.segment_ids.iter().copied())
                    .collect();
                if gated.is_empty() {
                    None
                } else {
                    let gated: Vec<i64> = gated.into_iter().collect();
                    segments::resolve_memberships(
                        resolver.as_ref(),
                        ctx.visitor_key(),
                        &gated,
                        self.selection_timeout / 2,
                    )
                    .await
                }
            }
            _ => None,
        };
        let memberships: Option<&HashSet<i64>> = ctx.segment_ids.as_ref().or(resolved.as_ref());

        let eligible: Vec<Arc<Ad>> = running
            .into_iter()
            .filter(|ad| segments::admits(ad, memberships))
            .collect();

        self.pick(&candidates, &eligible, limit, ctx)
    }

    fn pick(
        &self,
        candidates: &CandidateSet,
        eligible: &[Arc<Ad>],
        limit: usize,
        ctx: &RequestContext,
    ) -> Vec<Arc<Ad>> {
        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let variants =
            abtest::resolve_candidates(eligible, &candidates.ab_tests, ctx.visitor_key(), &mut *rng);
        selection::select(&variants, limit, &mut *rng)
    }

    /// Record an impression in the background.
    pub fn track_impression(&self, ad_id: i64, ctx: RequestContext) {
        let recorder = Arc::clone(&self.recorder);
        tokio::spawn(async move {
            recorder.record_impression(ad_id, &ctx).await;
        });
    }

    /// Record an impression and wait for the write.
    pub async fn record_impression(&self, ad_id: i64, ctx: &RequestContext) {
        self.recorder.record_impression(ad_id, ctx).await;
    }

    pub async fn record_click(&self, ad_id: i64, ctx: &RequestContext) -> Option<ClickRedirect> {
        self.recorder.record_click(ad_id, ctx).await
    }

    pub async fn record_conversion(&self, ad_id: i64, value: f64, ctx: &RequestContext) -> bool {
        self.recorder.record_conversion(ad_id, value, ctx).await
    }

    /// Change an ad's status and drop every cached candidate set of its
    /// placement.
    pub async fn set_ad_status(&self, ad_id: i64, status: AdStatus) -> Result<bool> {
        let Some(ad) = self.storage.find_ad(ad_id).await? else {
            return Ok(false);
        };

        let changed = self.storage.set_ad_status(ad_id, status).await?;
        self.cache.invalidate_placement(ad.placement_id);
        self.recorder.forget_ad(ad_id).await;
        Ok(changed)
    }

    pub async fn pause_ad(&self, ad_id: i64) -> Result<bool> {
        self.set_ad_status(ad_id, AdStatus::Paused).await
    }

    pub async fn activate_ad(&self, ad_id: i64) -> Result<bool> {
        self.set_ad_status(ad_id, AdStatus::Active).await
    }

    /// Flip the independent kill switch of an ad.
    pub async fn set_ad_active(&self, ad_id: i64, is_active: bool) -> Result<bool> {
        let Some(ad) = self.storage.find_ad(ad_id).await? else {
            return Ok(false);
        };

        let changed = self.storage.set_ad_active(ad_id, is_active).await?;
        self.cache.invalidate_placement(ad.placement_id);
        self.recorder.forget_ad(ad_id).await;
        Ok(changed)
    }

    pub async fn set_campaign_status(&self, campaign_id: i64, status: CampaignStatus) -> Result<bool> {
        let changed = self.storage.set_campaign_status(campaign_id, status).await?;
        // paused campaigns have no ads in the cache to match on
        self.cache.invalidate_all();
        Ok(changed)
    }

    /// Rollup of the last `days` days (today included) for one ad.
    pub async fn statistics(&self, ad_id: i64, days: u32) -> Result<StatisticsSummary> {
        let today = Utc::now().date_naive();
        let from = today - DateDuration::days(i64::from(days.max(1)) - 1);
        let rows = self.storage.statistics_range(ad_id, from, today).await?;
        Ok(StatisticsSummary::from_rows(&rows))
    }

    pub async fn breakdown(
        &self,
        ad_id: i64,
        date: NaiveDate,
        dimension: BreakdownDimension,
    ) -> Result<Vec<BreakdownEntry>> {
        self.storage.statistic_breakdown(ad_id, date, dimension).await
    }

    /// Compare both variants of a test over their whole history, store the
    /// winner and confidence, and return the outcome. `None` when the test is
    /// unknown.
    pub async fn evaluate_ab_test(&self, test_id: i64) -> Result<Option<AbTestOutcome>> {
        let Some(test) = self.storage.find_ab_test(test_id).await? else {
            return Ok(None);
        };

        let summary_a = self.variant_summary(test_id, AbVariant::A).await?;
        let summary_b = self.variant_summary(test_id, AbVariant::B).await?;
        let outcome = abtest::evaluate(test.winner_metric, &summary_a, &summary_b);

        self.storage
            .set_ab_test_result(test_id, outcome.winner, outcome.confidence)
            .await
            .with_context(|| format!("failed to store result of A/B test {test_id}"))?;
        self.cache.invalidate_all();

        Ok(Some(outcome))
    }

    async fn variant_summary(&self, test_id: i64, variant: AbVariant) -> Result<StatisticsSummary> {
        let Some(ad) = self.storage.find_ab_variant(test_id, variant).await? else {
            return Ok(StatisticsSummary::default());
        };

        let today = Utc::now().date_naive();
        let rows = self
            .storage
            .statistics_range(ad.id, NaiveDate::default(), today)
            .await?;
        Ok(StatisticsSummary::from_rows(&rows))
    }
}

/// Filter stage: placement lookup, targeting and the budget guard.
async fn build_candidates(
    storage: &dyn Storage,
    placement_slug: &str,
    ctx: &RequestContext,
) -> Result<Arc<CandidateSet>> {
    let placement = match storage.find_placement(placement_slug).await? {
        Some(placement) if placement.is_active => placement,
        _ => return Ok(Arc::new(CandidateSet::empty())),
    };

    let targeted: Vec<Ad> = storage
        .ads_for_placement(placement.id)
        .await?
        .into_iter()
        .filter(|ad| targeting::matches(&ad.targeting, ctx))
        .collect();

    let guard = BudgetGuard::load(storage, &targeted, ctx.now.date_naive()).await?;
    let ads: Vec<Arc<Ad>> = targeted
        .into_iter()
        .filter(|ad| match guard.exclusion(ad, ctx.now) {
            Some(reason) => {
                debug!(ad_id = ad.id, ?reason, "ad excluded by budget guard");
                false
            }
            None => true,
        })
        .map(Arc::new)
        .collect();

    let test_ids: Vec<i64> = ads
        .iter()
        .filter_map(|ad| ad.ab_test_id)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let ab_tests = storage
        .ab_tests_by_ids(&test_ids)
        .await?
        .into_iter()
        .map(|test| (test.id, test))
        .collect();

    let campaigns = ads
        .iter()
        .filter_map(|ad| ad.campaign_id)
        .filter_map(|id| guard.campaign(id).map(|campaign| (id, campaign.clone())))
        .collect();

    Ok(Arc::new(CandidateSet {
        placement: Some(placement),
        ads,
        ab_tests,
        campaigns,
    }))
}
