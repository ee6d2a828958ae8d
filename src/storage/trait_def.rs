use crate::models::{
    AbVariant, Ad, AdAbTest, AdCampaign, AdPlacement, AdSegment, AdStatistic, AdStatus,
    BreakdownDimension, BreakdownEntry, CampaignStatus, Money, NewAbTest, NewAd, NewCampaign,
    NewPlacement, NewSegment,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    /// Transient write conflict (lock contention, serialization failure) or a
    /// uniqueness violation on insert. Safe to retry for counter writes.
    #[error("storage conflict")]
    Conflict,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StorageError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Conflict)
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// One batch of counter increments for an ad on a given day.
///
/// Applied with upsert-increment statements only, so concurrent writers from
/// any number of processes never lose updates.
#[derive(Debug, Clone, PartialEq)]
pub struct CounterDelta {
    pub ad_id: i64,
    pub campaign_id: Option<i64>,
    pub date: NaiveDate,
    pub impressions: i64,
    pub clicks: i64,
    pub unique_impressions: i64,
    pub unique_clicks: i64,
    pub spent: Money,
    pub revenue: Money,
    pub conversions: i64,
    /// Breakdown buckets that receive the same impression/click increments.
    pub breakdowns: Vec<(BreakdownDimension, String)>,
}

impl CounterDelta {
    pub fn new(ad_id: i64, campaign_id: Option<i64>, date: NaiveDate) -> Self {
        Self {
            ad_id,
            campaign_id,
            date,
            impressions: 0,
            clicks: 0,
            unique_impressions: 0,
            unique_clicks: 0,
            spent: Money::ZERO,
            revenue: Money::ZERO,
            conversions: 0,
            breakdowns: Vec::new(),
        }
    }
}

/// Counter values as they stand right after a `CounterDelta` was applied.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CounterSnapshot {
    pub ad_impressions: i64,
    pub ad_clicks: i64,
    pub ad_spent: Money,
    pub day_impressions: i64,
    pub day_clicks: i64,
    pub day_spent: Money,
    pub campaign: Option<CampaignCounters>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CampaignCounters {
    pub spent: Money,
    pub total_budget: Option<Money>,
}

#[async_trait]
pub trait Storage: Send + Sync {
    /// Initialize the storage (create tables and indexes)
    async fn init(&self) -> Result<()>;

    async fn insert_placement(&self, placement: &NewPlacement) -> StorageResult<AdPlacement>;

    async fn insert_campaign(&self, campaign: &NewCampaign) -> Result<AdCampaign>;

    async fn insert_ab_test(&self, test: &NewAbTest) -> Result<AdAbTest>;

    async fn insert_segment(&self, segment: &NewSegment) -> StorageResult<AdSegment>;

    /// Insert an ad and its segment links. Fails with `Conflict` when the A/B
    /// test already has an ad for the same variant.
    async fn insert_ad(&self, ad: &NewAd) -> StorageResult<Ad>;

    async fn set_ad_status(&self, ad_id: i64, status: AdStatus) -> Result<bool>;

    async fn set_ad_active(&self, ad_id: i64, is_active: bool) -> Result<bool>;

    async fn set_campaign_status(&self, campaign_id: i64, status: CampaignStatus) -> Result<bool>;

    /// Look up a placement by slug regardless of its active flag
    async fn find_placement(&self, slug: &str) -> Result<Option<AdPlacement>>;

    async fn find_placement_by_id(&self, placement_id: i64) -> Result<Option<AdPlacement>>;

    /// Ads of a placement that are switched on and in status `active`, with
    /// their active segment ids attached.
    async fn ads_for_placement(&self, placement_id: i64) -> Result<Vec<Ad>>;

    async fn find_ad(&self, ad_id: i64) -> Result<Option<Ad>>;

    async fn find_campaign(&self, campaign_id: i64) -> Result<Option<AdCampaign>>;

    async fn campaigns_by_ids(&self, campaign_ids: &[i64]) -> Result<Vec<AdCampaign>>;

    async fn find_ab_test(&self, test_id: i64) -> Result<Option<AdAbTest>>;

    async fn ab_tests_by_ids(&self, test_ids: &[i64]) -> Result<Vec<AdAbTest>>;

    /// Indexed lookup of the ad playing `variant` in a test
    async fn find_ab_variant(&self, test_id: i64, variant: AbVariant) -> Result<Option<Ad>>;

    async fn set_ab_test_result(
        &self,
        test_id: i64,
        winner: Option<AbVariant>,
        significance: Option<f64>,
    ) -> Result<bool>;

    /// Daily statistic rows for the given ads on one date
    async fn daily_statistics(&self, ad_ids: &[i64], date: NaiveDate) -> Result<Vec<AdStatistic>>;

    /// Sum of today's spend per campaign, for daily budget checks
    async fn campaign_daily_spend(
        &self,
        campaign_ids: &[i64],
        date: NaiveDate,
    ) -> Result<Vec<(i64, Money)>>;

    /// Statistic rows of one ad between two dates (inclusive), oldest first
    async fn statistics_range(
        &self,
        ad_id: i64,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<AdStatistic>>;

    async fn statistic_breakdown(
        &self,
        ad_id: i64,
        date: NaiveDate,
        dimension: BreakdownDimension,
    ) -> Result<Vec<BreakdownEntry>>;

    /// Atomically apply counter increments to the ad, its daily statistic row
    /// (created if absent), its breakdown buckets and its campaign.
    async fn apply_counters(&self, delta: &CounterDelta) -> StorageResult<CounterSnapshot>;

    async fn list_ads_by_status(&self, status: AdStatus) -> Result<Vec<Ad>>;

    async fn list_campaigns_by_status(&self, status: CampaignStatus) -> Result<Vec<AdCampaign>>;

    /// Flip an ad from `active` to `completed`. Returns false when the ad is
    /// no longer `active`, so a concurrent pause or rejection is kept.
    async fn complete_ad(&self, ad_id: i64) -> Result<bool>;

    /// Flip a campaign from `active` to `completed`. Returns false when the
    /// campaign is no longer `active`.
    async fn complete_campaign(&self, campaign_id: i64) -> Result<bool>;
}
