//! Ad selection integration tests
//!
//! These run the whole serving path against an in-memory SQLite database:
//! placement lookup, targeting, budget filtering, caching, segments, A/B
//! variants and the weighted draw.

use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tubeads::abtest;
use tubeads::config::EngineConfig;
use tubeads::engine::AdServer;
use tubeads::models::{
    AbVariant, AdStatus, CampaignStatus, Money, NewAbTest, NewAd, NewCampaign, NewPlacement,
    NewSegment, RequestContext,
};
use tubeads::segments::StaticSegments;
use tubeads::storage::{SqliteStorage, Storage};

async fn create_test_storage() -> Arc<dyn Storage> {
    let storage = SqliteStorage::new("sqlite::memory:", 1).await.unwrap();
    storage.init().await.unwrap();
    Arc::new(storage)
}

fn test_config() -> EngineConfig {
    EngineConfig {
        selection_timeout_ms: 5_000,
        ..EngineConfig::default()
    }
}

fn server(storage: &Arc<dyn Storage>) -> AdServer {
    AdServer::new(Arc::clone(storage), &test_config()).with_rng_seed(17)
}

fn noon() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap()
}

fn context_at(now: DateTime<Utc>) -> RequestContext {
    RequestContext::new(now)
}

async fn placement(storage: &Arc<dyn Storage>, slug: &str) -> i64 {
    storage
        .insert_placement(&NewPlacement::new(slug))
        .await
        .unwrap()
        .id
}

async fn selected_id(server: &AdServer, slug: &str, ctx: &RequestContext) -> Option<i64> {
    server.select_ad(slug, ctx).await.map(|ad| ad.id)
}

#[tokio::test]
async fn test_unknown_placement_serves_nothing() {
    let storage = create_test_storage().await;
    let server = server(&storage);

    assert!(server.select_ad("nowhere", &context_at(noon())).await.is_none());
    assert!(server
        .select_ads("nowhere", 3, &context_at(noon()))
        .await
        .is_empty());
}

#[tokio::test]
async fn test_inactive_placement_serves_nothing() {
    let storage = create_test_storage().await;
    let mut new_placement = NewPlacement::new("sidebar");
    new_placement.is_active = false;
    let placement_id = storage.insert_placement(&new_placement).await.unwrap().id;
    storage
        .insert_ad(&NewAd::new("orphan", placement_id))
        .await
        .unwrap();

    let server = server(&storage);
    assert!(server.select_ad("sidebar", &context_at(noon())).await.is_none());
}

#[tokio::test]
async fn test_geo_targeting_excludes_other_countries() {
    let storage = create_test_storage().await;
    let placement_id = placement(&storage, "header").await;

    let mut new_ad = NewAd::new("us only", placement_id);
    new_ad.geo_targeting = Some(serde_json::json!(["US"]));
    let ad = storage.insert_ad(&new_ad).await.unwrap();

    let server = server(&storage);

    let mut ctx = context_at(noon());
    ctx.country_code = Some("DE".to_string());
    assert_eq!(selected_id(&server, "header", &ctx).await, None);

    ctx.country_code = Some("us".to_string());
    assert_eq!(selected_id(&server, "header", &ctx).await, Some(ad.id));

    // an unknown country cannot match a restricted ad
    ctx.country_code = None;
    assert_eq!(selected_id(&server, "header", &ctx).await, None);
}

#[tokio::test]
async fn test_daily_impression_cap_resets_next_day() {
    let storage = create_test_storage().await;
    let placement_id = placement(&storage, "preroll").await;

    let mut new_ad = NewAd::new("capped", placement_id);
    new_ad.daily_impression_limit = Some(100);
    let ad = storage.insert_ad(&new_ad).await.unwrap();

    let server = server(&storage);
    let today = context_at(noon());

    assert_eq!(selected_id(&server, "preroll", &today).await, Some(ad.id));

    for _ in 0..100 {
        server.record_impression(ad.id, &today).await;
    }

    let stats = storage
        .daily_statistics(&[ad.id], today.now.date_naive())
        .await
        .unwrap();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].impressions, 100);

    // the cached candidate set was dropped when the cap was reached
    assert_eq!(selected_id(&server, "preroll", &today).await, None);

    let tomorrow = context_at(noon() + Duration::days(1));
    assert_eq!(selected_id(&server, "preroll", &tomorrow).await, Some(ad.id));
}

#[tokio::test]
async fn test_budget_exhaustion_stops_serving() {
    let storage = create_test_storage().await;
    let placement_id = placement(&storage, "sidebar").await;

    let mut new_ad = NewAd::new("small budget", placement_id);
    new_ad.budget = Some(Money::from_units(0.75));
    new_ad.cpc = Some(Money::from_units(0.25));
    new_ad.click_url = Some("https://example.com/landing".to_string());
    let ad = storage.insert_ad(&new_ad).await.unwrap();

    let server = server(&storage);
    let ctx = context_at(noon());
    assert_eq!(selected_id(&server, "sidebar", &ctx).await, Some(ad.id));

    for _ in 0..3 {
        let redirect = server.record_click(ad.id, &ctx).await.unwrap();
        assert_eq!(redirect.url.as_deref(), Some("https://example.com/landing"));
    }

    let stored = storage.find_ad(ad.id).await.unwrap().unwrap();
    assert_eq!(stored.clicks_count, 3);
    assert_eq!(stored.spent_amount, Money::from_units(0.75));

    assert_eq!(selected_id(&server, "sidebar", &ctx).await, None);
}

#[tokio::test]
async fn test_cpm_budget_stops_after_exact_impression_count() {
    let storage = create_test_storage().await;
    let placement_id = placement(&storage, "sidebar").await;

    // 100 per thousand buys exactly ten impressions out of 1.0
    let mut new_ad = NewAd::new("cpm budget", placement_id);
    new_ad.budget = Some(Money::from_units(1.0));
    new_ad.cpm = Some(Money::from_units(100.0));
    let ad = storage.insert_ad(&new_ad).await.unwrap();

    let server = server(&storage);
    let ctx = context_at(noon());
    assert_eq!(selected_id(&server, "sidebar", &ctx).await, Some(ad.id));

    for _ in 0..10 {
        server.record_impression(ad.id, &ctx).await;
    }

    let stored = storage.find_ad(ad.id).await.unwrap().unwrap();
    assert_eq!(stored.spent_amount, Money::from_units(1.0));
    assert_eq!(selected_id(&server, "sidebar", &ctx).await, None);
}

#[tokio::test]
async fn test_campaign_end_is_checked_per_request() {
    let storage = create_test_storage().await;
    let placement_id = placement(&storage, "sidebar").await;

    let mut new_campaign = NewCampaign::new("flash sale");
    new_campaign.end_date = Some(noon() + Duration::minutes(30));
    let campaign = storage.insert_campaign(&new_campaign).await.unwrap();
    let mut new_ad = NewAd::new("flash banner", placement_id);
    new_ad.campaign_id = Some(campaign.id);
    let ad = storage.insert_ad(&new_ad).await.unwrap();

    let server = server(&storage);
    assert_eq!(
        selected_id(&server, "sidebar", &context_at(noon() + Duration::minutes(5))).await,
        Some(ad.id)
    );
    // same hour, so the cached candidate set is reused
    assert_eq!(
        selected_id(&server, "sidebar", &context_at(noon() + Duration::minutes(40))).await,
        None
    );
}

#[tokio::test]
async fn test_unreadable_ad_row_only_drops_that_ad() {
    let sqlite = Arc::new(SqliteStorage::new("sqlite::memory:", 1).await.unwrap());
    sqlite.init().await.unwrap();
    let storage: Arc<dyn Storage> = sqlite.clone();
    let placement_id = placement(&storage, "sidebar").await;

    let good = storage
        .insert_ad(&NewAd::new("good", placement_id))
        .await
        .unwrap();
    let broken = storage
        .insert_ad(&NewAd::new("broken", placement_id))
        .await
        .unwrap();
    sqlx::query("UPDATE ads SET format = 'native' WHERE id = ?")
        .bind(broken.id)
        .execute(sqlite.pool())
        .await
        .unwrap();

    let server = server(&storage);
    let ids: Vec<i64> = server
        .select_ads("sidebar", 5, &context_at(noon()))
        .await
        .iter()
        .map(|ad| ad.id)
        .collect();
    assert_eq!(ids, vec![good.id]);

    assert!(storage.find_ad(broken.id).await.unwrap().is_none());
    let active = storage.list_ads_by_status(AdStatus::Active).await.unwrap();
    assert_eq!(active.len(), 1);
}

#[tokio::test]
async fn test_campaign_budget_excludes_all_its_ads() {
    let storage = create_test_storage().await;
    let placement_id = placement(&storage, "sidebar").await;

    let mut new_campaign = NewCampaign::new("spring");
    new_campaign.total_budget = Some(Money::from_units(0.5));
    let campaign = storage.insert_campaign(&new_campaign).await.unwrap();

    let mut ids = HashSet::new();
    for name in ["first", "second"] {
        let mut new_ad = NewAd::new(name, placement_id);
        new_ad.campaign_id = Some(campaign.id);
        new_ad.cpc = Some(Money::from_units(0.25));
        ids.insert(storage.insert_ad(&new_ad).await.unwrap().id);
    }
    let outsider = storage
        .insert_ad(&NewAd::new("outsider", placement_id))
        .await
        .unwrap();

    let server = server(&storage);
    let ctx = context_at(noon());

    for ad_id in &ids {
        server.record_click(*ad_id, &ctx).await.unwrap();
    }

    let stored = storage.find_campaign(campaign.id).await.unwrap().unwrap();
    assert!(stored.is_budget_exhausted());

    for _ in 0..20 {
        assert_eq!(selected_id(&server, "sidebar", &ctx).await, Some(outsider.id));
    }
}

#[tokio::test]
async fn test_paused_campaign_and_ad_are_not_served() {
    let storage = create_test_storage().await;
    let placement_id = placement(&storage, "sidebar").await;

    let campaign = storage
        .insert_campaign(&NewCampaign::new("autumn"))
        .await
        .unwrap();
    let mut new_ad = NewAd::new("in campaign", placement_id);
    new_ad.campaign_id = Some(campaign.id);
    let ad = storage.insert_ad(&new_ad).await.unwrap();

    let server = server(&storage);
    let ctx = context_at(noon());
    assert_eq!(selected_id(&server, "sidebar", &ctx).await, Some(ad.id));

    assert!(server
        .set_campaign_status(campaign.id, CampaignStatus::Paused)
        .await
        .unwrap());
    assert_eq!(selected_id(&server, "sidebar", &ctx).await, None);

    server
        .set_campaign_status(campaign.id, CampaignStatus::Active)
        .await
        .unwrap();
    assert_eq!(selected_id(&server, "sidebar", &ctx).await, Some(ad.id));

    assert!(server.pause_ad(ad.id).await.unwrap());
    assert_eq!(selected_id(&server, "sidebar", &ctx).await, None);
    let stored = storage.find_ad(ad.id).await.unwrap().unwrap();
    assert_eq!(stored.status, AdStatus::Paused);

    assert!(server.activate_ad(ad.id).await.unwrap());
    assert_eq!(selected_id(&server, "sidebar", &ctx).await, Some(ad.id));

    assert!(server.set_ad_active(ad.id, false).await.unwrap());
    assert_eq!(selected_id(&server, "sidebar", &ctx).await, None);
}

#[tokio::test]
async fn test_schedule_window_is_checked_per_request() {
    let storage = create_test_storage().await;
    let placement_id = placement(&storage, "sidebar").await;

    let mut new_ad = NewAd::new("ends soon", placement_id);
    new_ad.end_date = Some(noon() + Duration::minutes(10));
    let ad = storage.insert_ad(&new_ad).await.unwrap();

    let server = server(&storage);
    assert_eq!(
        selected_id(&server, "sidebar", &context_at(noon())).await,
        Some(ad.id)
    );
    // same hour, so the cached candidate set is reused
    assert_eq!(
        selected_id(&server, "sidebar", &context_at(noon() + Duration::minutes(20))).await,
        None
    );
}

#[tokio::test]
async fn test_allowed_pages() {
    let storage = create_test_storage().await;
    let mut new_placement = NewPlacement::new("watch-sidebar");
    new_placement.allowed_pages = vec!["/watch".to_string()];
    let placement_id = storage.insert_placement(&new_placement).await.unwrap().id;
    let ad = storage
        .insert_ad(&NewAd::new("video", placement_id))
        .await
        .unwrap();

    let server = server(&storage);
    let mut ctx = context_at(noon());

    ctx.page_route = Some("/watch".to_string());
    assert_eq!(selected_id(&server, "watch-sidebar", &ctx).await, Some(ad.id));

    ctx.page_route = Some("/home".to_string());
    assert_eq!(selected_id(&server, "watch-sidebar", &ctx).await, None);

    ctx.page_route = None;
    assert_eq!(selected_id(&server, "watch-sidebar", &ctx).await, None);
}

#[tokio::test]
async fn test_segment_gated_ads() {
    let storage = create_test_storage().await;
    let placement_id = placement(&storage, "sidebar").await;
    let segment = storage
        .insert_segment(&NewSegment::new("gamers"))
        .await
        .unwrap();

    let mut new_ad = NewAd::new("gated", placement_id);
    new_ad.segment_ids = vec![segment.id];
    let ad = storage.insert_ad(&new_ad).await.unwrap();

    let plain = server(&storage);
    let mut ctx = context_at(noon());
    ctx.user_id = Some("user-1".to_string());

    // membership unknown and nobody to ask
    assert_eq!(selected_id(&plain, "sidebar", &ctx).await, None);

    ctx.segment_ids = Some(HashSet::new());
    assert_eq!(selected_id(&plain, "sidebar", &ctx).await, None);

    ctx.segment_ids = Some(HashSet::from([segment.id]));
    assert_eq!(selected_id(&plain, "sidebar", &ctx).await, Some(ad.id));

    let resolving = server(&storage)
        .with_segment_resolver(Arc::new(StaticSegments::new().with_member("user-1", segment.id)));
    ctx.segment_ids = None;
    assert_eq!(selected_id(&resolving, "sidebar", &ctx).await, Some(ad.id));

    ctx.user_id = Some("user-2".to_string());
    assert_eq!(selected_id(&resolving, "sidebar", &ctx).await, None);
}

#[tokio::test]
async fn test_ab_variant_is_sticky_per_visitor() {
    let storage = create_test_storage().await;
    let placement_id = placement(&storage, "preroll").await;
    let test = storage
        .insert_ab_test(&NewAbTest::new("thumbnail", 50))
        .await
        .unwrap();

    let mut variant_ids = Vec::new();
    for variant in [AbVariant::A, AbVariant::B] {
        let mut new_ad = NewAd::new(variant.as_str(), placement_id);
        new_ad.ab_test_id = Some(test.id);
        new_ad.ab_test_variant = Some(variant);
        variant_ids.push(storage.insert_ad(&new_ad).await.unwrap().id);
    }

    let server = server(&storage);
    let mut seen = HashSet::new();

    for visitor in 0..20 {
        let key = format!("session-{visitor}");
        let mut ctx = context_at(noon());
        ctx.session_id = Some(key.clone());

        let expected = match abtest::assign(&test, &key) {
            AbVariant::A => variant_ids[0],
            AbVariant::B => variant_ids[1],
        };
        for _ in 0..10 {
            assert_eq!(selected_id(&server, "preroll", &ctx).await, Some(expected));
        }
        seen.insert(expected);
    }

    // twenty visitors on a 50/50 split land in both buckets
    assert_eq!(seen.len(), 2);

    // only one variant of a test is ever served in the same response
    let mut ctx = context_at(noon());
    ctx.session_id = Some("session-multi".to_string());
    assert_eq!(server.select_ads("preroll", 2, &ctx).await.len(), 1);
}

#[tokio::test]
async fn test_priority_wins_and_seeded_draws_repeat() {
    let storage = create_test_storage().await;
    let placement_id = placement(&storage, "sidebar").await;

    let mut premium = NewAd::new("premium", placement_id);
    premium.priority = 10;
    premium.weight = 1;
    let premium = storage.insert_ad(&premium).await.unwrap();

    let mut filler_ids = Vec::new();
    for name in ["filler-a", "filler-b", "filler-c"] {
        let mut new_ad = NewAd::new(name, placement_id);
        new_ad.weight = 100;
        filler_ids.push(storage.insert_ad(&new_ad).await.unwrap().id);
    }

    let first = server(&storage);
    let ctx = context_at(noon());
    for _ in 0..50 {
        assert_eq!(selected_id(&first, "sidebar", &ctx).await, Some(premium.id));
    }

    let picks = first.select_ads("sidebar", 4, &ctx).await;
    let ids: Vec<i64> = picks.iter().map(|ad| ad.id).collect();
    assert_eq!(ids.len(), 4);
    assert_eq!(ids[0], premium.id);
    assert_eq!(ids.iter().collect::<HashSet<_>>().len(), 4);

    let draws = |server: AdServer| async move {
        let mut ids = Vec::new();
        for _ in 0..30 {
            let picked = server.select_ads("sidebar", 2, &ctx_at_noon()).await;
            ids.push(picked[1].id);
        }
        ids
    };
    let run_a = draws(server(&storage)).await;
    let run_b = draws(server(&storage)).await;
    assert_eq!(run_a, run_b);
    assert!(run_a.iter().all(|id| filler_ids.contains(id)));
}

fn ctx_at_noon() -> RequestContext {
    context_at(noon())
}
