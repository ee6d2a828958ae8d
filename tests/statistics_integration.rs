//! Statistics recording integration tests
//!
//! These verify counter accuracy under concurrency, unique counting, the
//! breakdown buckets, and that writes which fail are retried or buffered
//! instead of lost.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tubeads::config::EngineConfig;
use tubeads::engine::AdServer;
use tubeads::models::{
    AbVariant, Ad, AdAbTest, AdCampaign, AdPlacement, AdSegment, AdStatistic, AdStatus,
    BreakdownDimension, BreakdownEntry, CampaignStatus, Money, NewAbTest, NewAd, NewCampaign,
    NewPlacement, NewSegment, RequestContext,
};
use tubeads::storage::{
    CounterDelta, CounterSnapshot, SqliteStorage, Storage, StorageError, StorageResult,
};

async fn create_test_storage() -> Arc<dyn Storage> {
    let storage = SqliteStorage::new("sqlite::memory:", 1).await.unwrap();
    storage.init().await.unwrap();
    Arc::new(storage)
}

fn noon() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap()
}

fn visitor_context(visitor: Option<&str>) -> RequestContext {
    let mut ctx = RequestContext::new(noon());
    ctx.session_id = visitor.map(str::to_string);
    ctx
}

async fn create_ad(storage: &Arc<dyn Storage>, new_ad: impl FnOnce(i64) -> NewAd) -> Ad {
    let placement = storage
        .insert_placement(&NewPlacement::new("sidebar"))
        .await
        .unwrap();
    storage.insert_ad(&new_ad(placement.id)).await.unwrap()
}

async fn stats_for(storage: &Arc<dyn Storage>, ad_id: i64) -> Vec<AdStatistic> {
    storage
        .daily_statistics(&[ad_id], noon().date_naive())
        .await
        .unwrap()
}

/// Storage that fails the next `failures` counter writes.
struct FlakyStorage {
    inner: Arc<dyn Storage>,
    failures: AtomicUsize,
    retryable: bool,
}

impl FlakyStorage {
    fn new(inner: Arc<dyn Storage>, failures: usize, retryable: bool) -> Self {
        Self {
            inner,
            failures: AtomicUsize::new(failures),
            retryable,
        }
    }
}

#[async_trait]
impl Storage for FlakyStorage {
    async fn init(&self) -> Result<()> {
        self.inner.init().await
    }

    async fn insert_placement(&self, placement: &NewPlacement) -> StorageResult<AdPlacement> {
        self.inner.insert_placement(placement).await
    }

    async fn insert_campaign(&self, campaign: &NewCampaign) -> Result<AdCampaign> {
        self.inner.insert_campaign(campaign).await
    }

    async fn insert_ab_test(&self, test: &NewAbTest) -> Result<AdAbTest> {
        self.inner.insert_ab_test(test).await
    }

    async fn insert_segment(&self, segment: &NewSegment) -> StorageResult<AdSegment> {
        self.inner.insert_segment(segment).await
    }

    async fn insert_ad(&self, ad: &NewAd) -> StorageResult<Ad> {
        self.inner.insert_ad(ad).await
    }

    async fn set_ad_status(&self, ad_id: i64, status: AdStatus) -> Result<bool> {
        self.inner.set_ad_status(ad_id, status).await
    }

    async fn set_ad_active(&self, ad_id: i64, is_active: bool) -> Result<bool> {
        self.inner.set_ad_active(ad_id, is_active).await
    }

    async fn set_campaign_status(&self, campaign_id: i64, status: CampaignStatus) -> Result<bool> {
        self.inner.set_campaign_status(campaign_id, status).await
    }

    async fn find_placement(&self, slug: &str) -> Result<Option<AdPlacement>> {
        self.inner.find_placement(slug).await
    }

    async fn find_placement_by_id(&self, placement_id: i64) -> Result<Option<AdPlacement>> {
        self.inner.find_placement_by_id(placement_id).await
    }

    async fn ads_for_placement(&self, placement_id: i64) -> Result<Vec<Ad>> {
        self.inner.ads_for_placement(placement_id).await
    }

    async fn find_ad(&self, ad_id: i64) -> Result<Option<Ad>> {
        self.inner.find_ad(ad_id).await
    }

    async fn find_campaign(&self, campaign_id: i64) -> Result<Option<AdCampaign>> {
        self.inner.find_campaign(campaign_id).await
    }

    async fn campaigns_by_ids(&self, campaign_ids: &[i64]) -> Result<Vec<AdCampaign>> {
        self.inner.campaigns_by_ids(campaign_ids).await
    }

    async fn find_ab_test(&self, test_id: i64) -> Result<Option<AdAbTest>> {
        self.inner.find_ab_test(test_id).await
    }

    async fn ab_tests_by_ids(&self, test_ids: &[i64]) -> Result<Vec<AdAbTest>> {
        self.inner.ab_tests_by_ids(test_ids).await
    }

    async fn find_ab_variant(&self, test_id: i64, variant: AbVariant) -> Result<Option<Ad>> {
        self.inner.find_ab_variant(test_id, variant).await
    }

    async fn set_ab_test_result(
        &self,
        test_id: i64,
        winner: Option<AbVariant>,
        significance: Option<f64>,
    ) -> Result<bool> {
        self.inner
            .set_ab_test_result(test_id, winner, significance)
            .await
    }

    async fn daily_statistics(&self, ad_ids: &[i64], date: NaiveDate) -> Result<Vec<AdStatistic>> {
        self.inner.daily_statistics(ad_ids, date).await
    }

    async fn campaign_daily_spend(
        &self,
        campaign_ids: &[i64],
        date: NaiveDate,
    ) -> Result<Vec<(i64, Money)>> {
        self.inner.campaign_daily_spend(campaign_ids, date).await
    }

    async fn statistics_range(
        &self,
        ad_id: i64,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<AdStatistic>> {
        self.inner.statistics_range(ad_id, from, to).await
    }

    async fn statistic_breakdown(
        &self,
        ad_id: i64,
        date: NaiveDate,
        dimension: BreakdownDimension,
    ) -> Result<Vec<BreakdownEntry>> {
        self.inner.statistic_breakdown(ad_id, date, dimension).await
    }

    async fn apply_counters(&self, delta: &CounterDelta) -> StorageResult<CounterSnapshot> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(if self.retryable {
                StorageError::Conflict
            } else {
                StorageError::Other(anyhow!("database unavailable"))
            });
        }
        self.inner.apply_counters(delta).await
    }

    async fn list_ads_by_status(&self, status: AdStatus) -> Result<Vec<Ad>> {
        self.inner.list_ads_by_status(status).await
    }

    async fn list_campaigns_by_status(&self, status: CampaignStatus) -> Result<Vec<AdCampaign>> {
        self.inner.list_campaigns_by_status(status).await
    }

    async fn complete_ad(&self, ad_id: i64) -> Result<bool> {
        self.inner.complete_ad(ad_id).await
    }

    async fn complete_campaign(&self, campaign_id: i64) -> Result<bool> {
        self.inner.complete_campaign(campaign_id).await
    }
}

#[tokio::test]
async fn test_concurrent_impressions_single_row_and_unique_counts() {
    let storage = create_test_storage().await;
    let ad = create_ad(&storage, |placement_id| {
        let mut new_ad = NewAd::new("busy", placement_id);
        new_ad.cpm = Some(Money::from_units(2.0));
        new_ad
    })
    .await;
    let server = Arc::new(AdServer::new(Arc::clone(&storage), &EngineConfig::default()));

    let mut handles = vec![];
    for i in 0..50 {
        let server = Arc::clone(&server);
        let ad_id = ad.id;
        handles.push(tokio::spawn(async move {
            let visitor = format!("visitor-{}", i % 10);
            server
                .record_impression(ad_id, &visitor_context(Some(&visitor)))
                .await;
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let rows = stats_for(&storage, ad.id).await;
    assert_eq!(rows.len(), 1, "one row per ad and day");
    assert_eq!(rows[0].impressions, 50);
    assert_eq!(rows[0].unique_impressions, 10);
    assert_eq!(rows[0].spent, Money::from_units(0.1));

    let stored = storage.find_ad(ad.id).await.unwrap().unwrap();
    assert_eq!(stored.impressions_count, 50);
    assert_eq!(stored.unique_impressions_count, 10);
}

#[tokio::test]
async fn test_anonymous_events_are_never_unique() {
    let storage = create_test_storage().await;
    let ad = create_ad(&storage, |placement_id| NewAd::new("anon", placement_id)).await;
    let server = AdServer::new(Arc::clone(&storage), &EngineConfig::default());

    for _ in 0..3 {
        server.record_impression(ad.id, &visitor_context(None)).await;
        server.record_click(ad.id, &visitor_context(None)).await.unwrap();
    }

    let rows = stats_for(&storage, ad.id).await;
    assert_eq!(rows[0].impressions, 3);
    assert_eq!(rows[0].clicks, 3);
    assert_eq!(rows[0].unique_impressions, 0);
    assert_eq!(rows[0].unique_clicks, 0);
}

#[tokio::test]
async fn test_breakdowns_by_hour_country_device() {
    let storage = create_test_storage().await;
    let ad = create_ad(&storage, |placement_id| NewAd::new("global", placement_id)).await;
    let server = AdServer::new(Arc::clone(&storage), &EngineConfig::default());

    for (country, device) in [("us", "mobile"), ("US", "desktop"), ("DE", "Mobile")] {
        let mut ctx = visitor_context(None);
        ctx.country_code = Some(country.to_string());
        ctx.device_type = Some(device.to_string());
        server.record_impression(ad.id, &ctx).await;
    }
    let mut ctx = visitor_context(None);
    ctx.country_code = Some("US".to_string());
    server.record_click(ad.id, &ctx).await.unwrap();

    let date = noon().date_naive();
    let by_country = server
        .breakdown(ad.id, date, BreakdownDimension::Country)
        .await
        .unwrap();
    let us = by_country.iter().find(|entry| entry.bucket == "US").unwrap();
    assert_eq!((us.impressions, us.clicks), (2, 1));
    let de = by_country.iter().find(|entry| entry.bucket == "DE").unwrap();
    assert_eq!((de.impressions, de.clicks), (1, 0));

    let by_device = server
        .breakdown(ad.id, date, BreakdownDimension::Device)
        .await
        .unwrap();
    let mobile = by_device.iter().find(|entry| entry.bucket == "mobile").unwrap();
    assert_eq!(mobile.impressions, 2);

    let by_hour = server
        .breakdown(ad.id, date, BreakdownDimension::Hour)
        .await
        .unwrap();
    assert_eq!(by_hour.len(), 1);
    assert_eq!(by_hour[0].bucket, "12");
    assert_eq!((by_hour[0].impressions, by_hour[0].clicks), (3, 1));
}

#[tokio::test]
async fn test_conversions_and_unknown_ads() {
    let storage = create_test_storage().await;
    let ad = create_ad(&storage, |placement_id| NewAd::new("shop", placement_id)).await;
    let server = AdServer::new(Arc::clone(&storage), &EngineConfig::default());

    assert!(server.record_conversion(ad.id, 19.5, &visitor_context(None)).await);
    assert!(server.record_conversion(ad.id, 0.5, &visitor_context(None)).await);
    assert!(!server.record_conversion(9_999, 5.0, &visitor_context(None)).await);
    assert!(server.record_click(9_999, &visitor_context(None)).await.is_none());
    server.record_impression(9_999, &visitor_context(None)).await;

    let rows = stats_for(&storage, ad.id).await;
    assert_eq!(rows[0].conversions, 2);
    assert_eq!(rows[0].revenue, Money::from_units(20.0));
    assert!(stats_for(&storage, 9_999).await.is_empty());

    let summary = server.statistics(ad.id, 36_500).await.unwrap();
    assert_eq!(summary.conversions, 2);
}

#[tokio::test]
async fn test_switched_off_ad_is_not_counted() {
    let storage = create_test_storage().await;
    let ad = create_ad(&storage, |placement_id| {
        let mut new_ad = NewAd::new("off", placement_id);
        new_ad.is_active = false;
        new_ad
    })
    .await;
    let server = AdServer::new(Arc::clone(&storage), &EngineConfig::default());

    server.record_impression(ad.id, &visitor_context(None)).await;
    assert!(server.record_click(ad.id, &visitor_context(None)).await.is_none());
    assert!(stats_for(&storage, ad.id).await.is_empty());
}

#[tokio::test]
async fn test_transient_conflicts_are_retried() {
    let inner = create_test_storage().await;
    let ad = create_ad(&inner, |placement_id| NewAd::new("retried", placement_id)).await;
    let storage: Arc<dyn Storage> = Arc::new(FlakyStorage::new(Arc::clone(&inner), 2, true));
    let config = EngineConfig {
        record_retry_attempts: 3,
        ..EngineConfig::default()
    };
    let server = AdServer::new(storage, &config);

    server.record_impression(ad.id, &visitor_context(None)).await;

    assert_eq!(server.recorder().pending_len(), 0);
    assert_eq!(stats_for(&inner, ad.id).await[0].impressions, 1);
}

#[tokio::test]
async fn test_failed_writes_are_buffered_and_replayed() {
    let inner = create_test_storage().await;
    let ad = create_ad(&inner, |placement_id| {
        let mut new_ad = NewAd::new("buffered", placement_id);
        new_ad.cpc = Some(Money::from_units(0.5));
        new_ad
    })
    .await;
    let storage: Arc<dyn Storage> = Arc::new(FlakyStorage::new(Arc::clone(&inner), 4, false));
    let server = AdServer::new(storage, &EngineConfig::default());

    for _ in 0..3 {
        server.record_impression(ad.id, &visitor_context(None)).await;
    }
    let redirect = server.record_click(ad.id, &visitor_context(None)).await;
    assert!(redirect.is_some(), "the visitor is redirected even when the write fails");

    // same ad, day, hour and kind merge into one entry
    assert_eq!(server.recorder().pending_len(), 2);
    assert!(stats_for(&inner, ad.id).await.is_empty());

    assert_eq!(server.recorder().flush_pending().await.unwrap(), 2);
    assert_eq!(server.recorder().pending_len(), 0);

    let rows = stats_for(&inner, ad.id).await;
    assert_eq!(rows[0].impressions, 3);
    assert_eq!(rows[0].clicks, 1);
    assert_eq!(rows[0].spent, Money::from_units(0.5));
}

#[tokio::test]
async fn test_flush_keeps_entries_while_storage_is_down() {
    let inner = create_test_storage().await;
    let ad = create_ad(&inner, |placement_id| NewAd::new("down", placement_id)).await;
    let storage: Arc<dyn Storage> = Arc::new(FlakyStorage::new(Arc::clone(&inner), 2, false));
    let server = AdServer::new(storage, &EngineConfig::default());

    server.record_impression(ad.id, &visitor_context(None)).await;
    assert_eq!(server.recorder().pending_len(), 1);

    assert!(server.recorder().flush_pending().await.is_err());
    assert_eq!(server.recorder().pending_len(), 1);

    assert_eq!(server.recorder().flush_pending().await.unwrap(), 1);
    assert_eq!(stats_for(&inner, ad.id).await[0].impressions, 1);
}

#[tokio::test]
async fn test_replay_that_reaches_daily_cap_stops_serving() {
    let inner = create_test_storage().await;
    let ad = create_ad(&inner, |placement_id| {
        let mut new_ad = NewAd::new("capped", placement_id);
        new_ad.daily_impression_limit = Some(100);
        new_ad
    })
    .await;
    let storage: Arc<dyn Storage> = Arc::new(FlakyStorage::new(Arc::clone(&inner), 100, false));
    let config = EngineConfig {
        selection_timeout_ms: 5_000,
        ..EngineConfig::default()
    };
    let server = AdServer::new(storage, &config);
    let ctx = visitor_context(None);

    assert_eq!(server.select_ad("sidebar", &ctx).await.map(|ad| ad.id), Some(ad.id));

    for _ in 0..100 {
        server.record_impression(ad.id, &ctx).await;
    }
    assert_eq!(server.recorder().pending_len(), 1);

    assert_eq!(server.recorder().flush_pending().await.unwrap(), 1);
    assert_eq!(stats_for(&inner, ad.id).await[0].impressions, 100);
    assert!(server.select_ad("sidebar", &ctx).await.is_none());
}
