use crate::models::{
    AbVariant, Ad, AdAbTest, AdCampaign, AdPlacement, AdSegment, AdStatistic, AdStatus,
    BreakdownDimension, BreakdownEntry, CampaignStatus, Money, NewAbTest, NewAd, NewCampaign,
    NewPlacement, NewSegment,
};
use crate::storage::rows::{
    attach_segments, date_key, map_sqlx_error, now_secs, readable_campaigns, AbTestRow, AdRow,
    CampaignRow, PlacementRow, SegmentRow, StatisticRow, AB_TEST_COLUMNS, AD_COLUMNS,
    CAMPAIGN_COLUMNS, PLACEMENT_COLUMNS, SEGMENT_COLUMNS, STATISTIC_COLUMNS,
};
use crate::storage::{
    CampaignCounters, CounterDelta, CounterSnapshot, Storage, StorageError, StorageResult,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

pub struct SqliteStorage {
    pool: Arc<SqlitePool>,
}

impl SqliteStorage {
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Underlying connection pool, for maintenance queries.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn segment_links(&self, ad_ids: &[i64]) -> Result<Vec<(i64, i64)>> {
        if ad_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut query = QueryBuilder::<Sqlite>::new(
            r#"
            SELECT l.ad_id, l.segment_id
            FROM ad_segment_links l
            JOIN ad_segments s ON s.id = l.segment_id
            WHERE s.is_active = 1 AND l.ad_id IN ("#,
        );
        let mut ids = query.separated(", ");
        for id in ad_ids {
            ids.push_bind(*id);
        }
        ids.push_unseparated(")");

        let links = query
            .build_query_as::<(i64, i64)>()
            .fetch_all(self.pool.as_ref())
            .await?;
        Ok(links)
    }

    async fn load_ads(&self, rows: Vec<AdRow>) -> Result<Vec<Ad>> {
        let ids: Vec<i64> = rows.iter().map(|row| row.id).collect();
        let links = self.segment_links(&ids).await?;
        Ok(attach_segments(rows, &links))
    }
}

fn json_text(value: &Option<serde_json::Value>) -> Option<String> {
    value.as_ref().map(|value| value.to_string())
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ad_placements (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                slug TEXT NOT NULL UNIQUE,
                placement_type TEXT NOT NULL,
                position TEXT NOT NULL,
                width INTEGER,
                height INTEGER,
                is_active INTEGER NOT NULL DEFAULT 1,
                allowed_pages TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ad_campaigns (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                status TEXT NOT NULL,
                start_date INTEGER,
                end_date INTEGER,
                -- money in micro-units
                total_budget INTEGER,
                daily_budget INTEGER,
                spent_amount INTEGER NOT NULL DEFAULT 0,
                total_impressions INTEGER NOT NULL DEFAULT 0,
                total_clicks INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ad_ab_tests (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                status TEXT NOT NULL,
                traffic_split_a INTEGER NOT NULL,
                traffic_split_b INTEGER NOT NULL,
                winner_metric TEXT NOT NULL,
                winner TEXT,
                statistical_significance REAL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ad_segments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                slug TEXT NOT NULL UNIQUE,
                segment_type TEXT NOT NULL,
                rules TEXT,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ads (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                placement_id INTEGER NOT NULL REFERENCES ad_placements(id),
                campaign_id INTEGER REFERENCES ad_campaigns(id),
                ab_test_id INTEGER REFERENCES ad_ab_tests(id),
                ab_test_variant TEXT,
                format TEXT NOT NULL,
                status TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                click_url TEXT,
                open_in_new_tab INTEGER NOT NULL DEFAULT 1,
                image_url TEXT,
                video_url TEXT,
                vast_url TEXT,
                html_content TEXT,
                script_code TEXT,
                alt_text TEXT,
                start_date INTEGER,
                end_date INTEGER,
                priority INTEGER NOT NULL DEFAULT 0,
                weight INTEGER NOT NULL DEFAULT 100,
                -- money in micro-units
                budget INTEGER,
                cpm INTEGER,
                cpc INTEGER,
                impression_limit INTEGER,
                click_limit INTEGER,
                daily_impression_limit INTEGER,
                daily_click_limit INTEGER,
                impressions_count INTEGER NOT NULL DEFAULT 0,
                clicks_count INTEGER NOT NULL DEFAULT 0,
                unique_impressions_count INTEGER NOT NULL DEFAULT 0,
                unique_clicks_count INTEGER NOT NULL DEFAULT 0,
                spent_amount INTEGER NOT NULL DEFAULT 0,
                geo_targeting TEXT,
                time_targeting TEXT,
                device_targeting TEXT,
                category_targeting TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                UNIQUE (ab_test_id, ab_test_variant)
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_ads_placement ON ads(placement_id, status)")
            .execute(self.pool.as_ref())
            .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_ads_campaign ON ads(campaign_id)")
            .execute(self.pool.as_ref())
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ad_segment_links (
                ad_id INTEGER NOT NULL REFERENCES ads(id),
                segment_id INTEGER NOT NULL REFERENCES ad_segments(id),
                PRIMARY KEY (ad_id, segment_id)
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ad_statistics (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ad_id INTEGER NOT NULL REFERENCES ads(id),
                stat_date TEXT NOT NULL,
                impressions INTEGER NOT NULL DEFAULT 0,
                clicks INTEGER NOT NULL DEFAULT 0,
                unique_impressions INTEGER NOT NULL DEFAULT 0,
                unique_clicks INTEGER NOT NULL DEFAULT 0,
                spent INTEGER NOT NULL DEFAULT 0,
                revenue INTEGER NOT NULL DEFAULT 0,
                conversions INTEGER NOT NULL DEFAULT 0,
                UNIQUE (ad_id, stat_date)
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ad_statistic_breakdowns (
                ad_id INTEGER NOT NULL REFERENCES ads(id),
                stat_date TEXT NOT NULL,
                dimension TEXT NOT NULL,
                bucket TEXT NOT NULL,
                impressions INTEGER NOT NULL DEFAULT 0,
                clicks INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (ad_id, stat_date, dimension, bucket)
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        Ok(())
    }

    async fn insert_placement(&self, placement: &NewPlacement) -> StorageResult<AdPlacement> {
        let now = now_secs();
        let allowed_pages = serde_json::to_string(&placement.allowed_pages)
            .map_err(|e| StorageError::Other(e.into()))?;

        let row = sqlx::query_as::<_, PlacementRow>(&format!(
            r#"
            INSERT INTO ad_placements
                (name, slug, placement_type, position, width, height, is_active, allowed_pages, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING {PLACEMENT_COLUMNS}
            "#
        ))
        .bind(&placement.name)
        .bind(&placement.slug)
        .bind(&placement.placement_type)
        .bind(&placement.position)
        .bind(placement.width)
        .bind(placement.height)
        .bind(placement.is_active)
        .bind(allowed_pages)
        .bind(now)
        .bind(now)
        .fetch_one(self.pool.as_ref())
        .await
        .map_err(map_sqlx_error)?;

        Ok(row.into())
    }

    async fn insert_campaign(&self, campaign: &NewCampaign) -> Result<AdCampaign> {
        let now = now_secs();

        let row = sqlx::query_as::<_, CampaignRow>(&format!(
            r#"
            INSERT INTO ad_campaigns
                (name, status, start_date, end_date, total_budget, daily_budget, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING {CAMPAIGN_COLUMNS}
            "#
        ))
        .bind(&campaign.name)
        .bind(campaign.status.as_str())
        .bind(campaign.start_date.map(|d| d.timestamp()))
        .bind(campaign.end_date.map(|d| d.timestamp()))
        .bind(campaign.total_budget.map(Money::micros))
        .bind(campaign.daily_budget.map(Money::micros))
        .bind(now)
        .bind(now)
        .fetch_one(self.pool.as_ref())
        .await?;

        row.try_into()
    }

    async fn insert_ab_test(&self, test: &NewAbTest) -> Result<AdAbTest> {
        let now = now_secs();
        let split_a = test.traffic_split_a.clamp(0, 100);

        let row = sqlx::query_as::<_, AbTestRow>(&format!(
            r#"
            INSERT INTO ad_ab_tests
                (name, status, traffic_split_a, traffic_split_b, winner_metric, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            RETURNING {AB_TEST_COLUMNS}
            "#
        ))
        .bind(&test.name)
        .bind(test.status.as_str())
        .bind(split_a)
        .bind(100 - split_a)
        .bind(test.winner_metric.as_str())
        .bind(now)
        .bind(now)
        .fetch_one(self.pool.as_ref())
        .await?;

        row.try_into()
    }

    async fn insert_segment(&self, segment: &NewSegment) -> StorageResult<AdSegment> {
        let row = sqlx::query_as::<_, SegmentRow>(&format!(
            r#"
            INSERT INTO ad_segments (name, slug, segment_type, rules, is_active, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            RETURNING {SEGMENT_COLUMNS}
            "#
        ))
        .bind(&segment.name)
        .bind(&segment.slug)
        .bind(&segment.segment_type)
        .bind(segment.rules.to_string())
        .bind(segment.is_active)
        .bind(now_secs())
        .fetch_one(self.pool.as_ref())
        .await
        .map_err(map_sqlx_error)?;

        Ok(row.into())
    }

    async fn insert_ad(&self, ad: &NewAd) -> StorageResult<Ad> {
        let now = now_secs();
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        let ad_id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO ads (
                name, placement_id, campaign_id, ab_test_id, ab_test_variant, format, status,
                is_active, click_url, open_in_new_tab, image_url, video_url, vast_url,
                html_content, script_code, alt_text, start_date, end_date, priority, weight,
                budget, cpm, cpc, impression_limit, click_limit, daily_impression_limit,
                daily_click_limit, geo_targeting, time_targeting, device_targeting,
                category_targeting, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(&ad.name)
        .bind(ad.placement_id)
        .bind(ad.campaign_id)
        .bind(ad.ab_test_id)
        .bind(ad.ab_test_variant.map(|v| v.as_str()))
        .bind(ad.format.as_str())
        .bind(ad.status.as_str())
        .bind(ad.is_active)
        .bind(&ad.click_url)
        .bind(ad.open_in_new_tab)
        .bind(&ad.creative.image_url)
        .bind(&ad.creative.video_url)
        .bind(&ad.creative.vast_url)
        .bind(&ad.creative.html_content)
        .bind(&ad.creative.script_code)
        .bind(&ad.creative.alt_text)
        .bind(ad.start_date.map(|d| d.timestamp()))
        .bind(ad.end_date.map(|d| d.timestamp()))
        .bind(ad.priority)
        .bind(ad.weight)
        .bind(ad.budget.map(Money::micros))
        .bind(ad.cpm.map(Money::micros))
        .bind(ad.cpc.map(Money::micros))
        .bind(ad.impression_limit)
        .bind(ad.click_limit)
        .bind(ad.daily_impression_limit)
        .bind(ad.daily_click_limit)
        .bind(json_text(&ad.geo_targeting))
        .bind(json_text(&ad.time_targeting))
        .bind(json_text(&ad.device_targeting))
        .bind(json_text(&ad.category_targeting))
        .bind(now)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        for segment_id in &ad.segment_ids {
            sqlx::query(
                "INSERT INTO ad_segment_links (ad_id, segment_id) VALUES (?, ?) ON CONFLICT DO NOTHING",
            )
            .bind(ad_id)
            .bind(segment_id)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
        }

        tx.commit().await.map_err(map_sqlx_error)?;

        self.find_ad(ad_id)
            .await?
            .ok_or_else(|| StorageError::Other(anyhow!("ad {ad_id} vanished after insert")))
    }

    async fn set_ad_status(&self, ad_id: i64, status: AdStatus) -> Result<bool> {
        let result = sqlx::query("UPDATE ads SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(now_secs())
            .bind(ad_id)
            .execute(self.pool.as_ref())
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn set_ad_active(&self, ad_id: i64, is_active: bool) -> Result<bool> {
        let result = sqlx::query("UPDATE ads SET is_active = ?, updated_at = ? WHERE id = ?")
            .bind(is_active)
            .bind(now_secs())
            .bind(ad_id)
            .execute(self.pool.as_ref())
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn set_campaign_status(&self, campaign_id: i64, status: CampaignStatus) -> Result<bool> {
        let result = sqlx::query("UPDATE ad_campaigns SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(now_secs())
            .bind(campaign_id)
            .execute(self.pool.as_ref())
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn find_placement(&self, slug: &str) -> Result<Option<AdPlacement>> {
        let row = sqlx::query_as::<_, PlacementRow>(&format!(
            "SELECT {PLACEMENT_COLUMNS} FROM ad_placements WHERE slug = ?"
        ))
        .bind(slug)
        .fetch_optional(self.pool.as_ref())
        .await?;

        Ok(row.map(Into::into))
    }

    async fn find_placement_by_id(&self, placement_id: i64) -> Result<Option<AdPlacement>> {
        let row = sqlx::query_as::<_, PlacementRow>(&format!(
            "SELECT {PLACEMENT_COLUMNS} FROM ad_placements WHERE id = ?"
        ))
        .bind(placement_id)
        .fetch_optional(self.pool.as_ref())
        .await?;

        Ok(row.map(Into::into))
    }

    async fn ads_for_placement(&self, placement_id: i64) -> Result<Vec<Ad>> {
        let rows = sqlx::query_as::<_, AdRow>(&format!(
            r#"
            SELECT {AD_COLUMNS}
            FROM ads
            WHERE placement_id = ? AND is_active = 1 AND status = 'active'
            ORDER BY id
            "#
        ))
        .bind(placement_id)
        .fetch_all(self.pool.as_ref())
        .await?;

        self.load_ads(rows).await
    }

    async fn find_ad(&self, ad_id: i64) -> Result<Option<Ad>> {
        let row = sqlx::query_as::<_, AdRow>(&format!("SELECT {AD_COLUMNS} FROM ads WHERE id = ?"))
            .bind(ad_id)
            .fetch_optional(self.pool.as_ref())
            .await?;

        match row {
            Some(row) => Ok(self.load_ads(vec![row]).await?.pop()),
            None => Ok(None),
        }
    }

    async fn find_campaign(&self, campaign_id: i64) -> Result<Option<AdCampaign>> {
        Ok(self.campaigns_by_ids(&[campaign_id]).await?.pop())
    }

    async fn campaigns_by_ids(&self, campaign_ids: &[i64]) -> Result<Vec<AdCampaign>> {
        if campaign_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut query = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {CAMPAIGN_COLUMNS} FROM ad_campaigns WHERE id IN ("
        ));
        let mut ids = query.separated(", ");
        for id in campaign_ids {
            ids.push_bind(*id);
        }
        ids.push_unseparated(")");

        let rows = query
            .build_query_as::<CampaignRow>()
            .fetch_all(self.pool.as_ref())
            .await?;
        Ok(readable_campaigns(rows))
    }

    async fn find_ab_test(&self, test_id: i64) -> Result<Option<AdAbTest>> {
        Ok(self.ab_tests_by_ids(&[test_id]).await?.pop())
    }

    async fn ab_tests_by_ids(&self, test_ids: &[i64]) -> Result<Vec<AdAbTest>> {
        if test_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut query = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {AB_TEST_COLUMNS} FROM ad_ab_tests WHERE id IN ("
        ));
        let mut ids = query.separated(", ");
        for id in test_ids {
            ids.push_bind(*id);
        }
        ids.push_unseparated(")");

        query
            .build_query_as::<AbTestRow>()
            .fetch_all(self.pool.as_ref())
            .await?
            .into_iter()
            .map(TryInto::try_into)
            .collect()
    }

    async fn find_ab_variant(&self, test_id: i64, variant: AbVariant) -> Result<Option<Ad>> {
        let row = sqlx::query_as::<_, AdRow>(&format!(
            "SELECT {AD_COLUMNS} FROM ads WHERE ab_test_id = ? AND ab_test_variant = ?"
        ))
        .bind(test_id)
        .bind(variant.as_str())
        .fetch_optional(self.pool.as_ref())
        .await?;

        match row {
            Some(row) => Ok(self.load_ads(vec![row]).await?.pop()),
            None => Ok(None),
        }
    }

    async fn set_ab_test_result(
        &self,
        test_id: i64,
        winner: Option<AbVariant>,
        significance: Option<f64>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE ad_ab_tests
            SET winner = ?, statistical_significance = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(winner.map(|w| w.as_str()))
        .bind(significance)
        .bind(now_secs())
        .bind(test_id)
        .execute(self.pool.as_ref())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn daily_statistics(&self, ad_ids: &[i64], date: NaiveDate) -> Result<Vec<AdStatistic>> {
        if ad_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut query = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {STATISTIC_COLUMNS} FROM ad_statistics WHERE stat_date = "
        ));
        query.push_bind(date_key(date));
        query.push(" AND ad_id IN (");
        let mut ids = query.separated(", ");
        for id in ad_ids {
            ids.push_bind(*id);
        }
        ids.push_unseparated(")");

        query
            .build_query_as::<StatisticRow>()
            .fetch_all(self.pool.as_ref())
            .await?
            .into_iter()
            .map(TryInto::try_into)
            .collect()
    }

    async fn campaign_daily_spend(
        &self,
        campaign_ids: &[i64],
        date: NaiveDate,
    ) -> Result<Vec<(i64, Money)>> {
        if campaign_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut query = QueryBuilder::<Sqlite>::new(
            r#"
            SELECT a.campaign_id, SUM(s.spent)
            FROM ad_statistics s
            JOIN ads a ON a.id = s.ad_id
            WHERE s.stat_date = "#,
        );
        query.push_bind(date_key(date));
        query.push(" AND a.campaign_id IN (");
        let mut ids = query.separated(", ");
        for id in campaign_ids {
            ids.push_bind(*id);
        }
        ids.push_unseparated(")");
        query.push(" GROUP BY a.campaign_id");

        let spend = query
            .build_query_as::<(i64, i64)>()
            .fetch_all(self.pool.as_ref())
            .await?;
        Ok(spend
            .into_iter()
            .map(|(campaign_id, micros)| (campaign_id, Money::from_micros(micros)))
            .collect())
    }

    async fn statistics_range(
        &self,
        ad_id: i64,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<AdStatistic>> {
        sqlx::query_as::<_, StatisticRow>(&format!(
            r#"
            SELECT {STATISTIC_COLUMNS}
            FROM ad_statistics
            WHERE ad_id = ? AND stat_date >= ? AND stat_date <= ?
            ORDER BY stat_date ASC
            "#
        ))
        .bind(ad_id)
        .bind(date_key(from))
        .bind(date_key(to))
        .fetch_all(self.pool.as_ref())
        .await?
        .into_iter()
        .map(TryInto::try_into)
        .collect()
    }

    async fn statistic_breakdown(
        &self,
        ad_id: i64,
        date: NaiveDate,
        dimension: BreakdownDimension,
    ) -> Result<Vec<BreakdownEntry>> {
        let rows = sqlx::query_as::<_, (String, i64, i64)>(
            r#"
            SELECT bucket, impressions, clicks
            FROM ad_statistic_breakdowns
            WHERE ad_id = ? AND stat_date = ? AND dimension = ?
            ORDER BY impressions DESC, bucket ASC
            "#,
        )
        .bind(ad_id)
        .bind(date_key(date))
        .bind(dimension.as_str())
        .fetch_all(self.pool.as_ref())
        .await?;

        Ok(rows
            .into_iter()
            .map(|(bucket, impressions, clicks)| BreakdownEntry {
                bucket,
                impressions,
                clicks,
            })
            .collect())
    }

    async fn apply_counters(&self, delta: &CounterDelta) -> StorageResult<CounterSnapshot> {
        let now = now_secs();
        let stat_date = date_key(delta.date);
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        let (ad_impressions, ad_clicks, ad_spent) = sqlx::query_as::<_, (i64, i64, i64)>(
            r#"
            UPDATE ads
            SET impressions_count = impressions_count + ?,
                clicks_count = clicks_count + ?,
                unique_impressions_count = unique_impressions_count + ?,
                unique_clicks_count = unique_clicks_count + ?,
                spent_amount = spent_amount + ?,
                updated_at = ?
            WHERE id = ?
            RETURNING impressions_count, clicks_count, spent_amount
            "#,
        )
        .bind(delta.impressions)
        .bind(delta.clicks)
        .bind(delta.unique_impressions)
        .bind(delta.unique_clicks)
        .bind(delta.spent.micros())
        .bind(now)
        .bind(delta.ad_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_sqlx_error)?
        .ok_or_else(|| StorageError::Other(anyhow!("ad {} not found", delta.ad_id)))?;

        let (day_impressions, day_clicks, day_spent) = sqlx::query_as::<_, (i64, i64, i64)>(
            r#"
            INSERT INTO ad_statistics
                (ad_id, stat_date, impressions, clicks, unique_impressions, unique_clicks, spent, revenue, conversions)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (ad_id, stat_date) DO UPDATE SET
                impressions = ad_statistics.impressions + excluded.impressions,
                clicks = ad_statistics.clicks + excluded.clicks,
                unique_impressions = ad_statistics.unique_impressions + excluded.unique_impressions,
                unique_clicks = ad_statistics.unique_clicks + excluded.unique_clicks,
                spent = ad_statistics.spent + excluded.spent,
                revenue = ad_statistics.revenue + excluded.revenue,
                conversions = ad_statistics.conversions + excluded.conversions
            RETURNING impressions, clicks, spent
            "#,
        )
        .bind(delta.ad_id)
        .bind(&stat_date)
        .bind(delta.impressions)
        .bind(delta.clicks)
        .bind(delta.unique_impressions)
        .bind(delta.unique_clicks)
        .bind(delta.spent.micros())
        .bind(delta.revenue.micros())
        .bind(delta.conversions)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        for (dimension, bucket) in &delta.breakdowns {
            sqlx::query(
                r#"
                INSERT INTO ad_statistic_breakdowns (ad_id, stat_date, dimension, bucket, impressions, clicks)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT (ad_id, stat_date, dimension, bucket) DO UPDATE SET
                    impressions = ad_statistic_breakdowns.impressions + excluded.impressions,
                    clicks = ad_statistic_breakdowns.clicks + excluded.clicks
                "#,
            )
            .bind(delta.ad_id)
            .bind(&stat_date)
            .bind(dimension.as_str())
            .bind(bucket)
            .bind(delta.impressions)
            .bind(delta.clicks)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
        }

        let campaign = match delta.campaign_id {
            Some(campaign_id) => sqlx::query_as::<_, (i64, Option<i64>)>(
                r#"
                UPDATE ad_campaigns
                SET spent_amount = spent_amount + ?,
                    total_impressions = total_impressions + ?,
                    total_clicks = total_clicks + ?,
                    updated_at = ?
                WHERE id = ?
                RETURNING spent_amount, total_budget
                "#,
            )
            .bind(delta.spent.micros())
            .bind(delta.impressions)
            .bind(delta.clicks)
            .bind(now)
            .bind(campaign_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_sqlx_error)?
            .map(|(spent, total_budget)| CampaignCounters {
                spent: Money::from_micros(spent),
                total_budget: total_budget.map(Money::from_micros),
            }),
            None => None,
        };

        tx.commit().await.map_err(map_sqlx_error)?;

        Ok(CounterSnapshot {
            ad_impressions,
            ad_clicks,
            ad_spent: Money::from_micros(ad_spent),
            day_impressions,
            day_clicks,
            day_spent: Money::from_micros(day_spent),
            campaign,
        })
    }

    async fn list_ads_by_status(&self, status: AdStatus) -> Result<Vec<Ad>> {
        let rows = sqlx::query_as::<_, AdRow>(&format!(
            "SELECT {AD_COLUMNS} FROM ads WHERE status = ? ORDER BY id"
        ))
        .bind(status.as_str())
        .fetch_all(self.pool.as_ref())
        .await?;

        self.load_ads(rows).await
    }

    async fn list_campaigns_by_status(&self, status: CampaignStatus) -> Result<Vec<AdCampaign>> {
        let rows = sqlx::query_as::<_, CampaignRow>(&format!(
            "SELECT {CAMPAIGN_COLUMNS} FROM ad_campaigns WHERE status = ? ORDER BY id"
        ))
        .bind(status.as_str())
        .fetch_all(self.pool.as_ref())
        .await?;

        Ok(readable_campaigns(rows))
    }

    async fn complete_ad(&self, ad_id: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE ads
            SET status = 'completed', updated_at = ?
            WHERE id = ? AND status = 'active'
            "#,
        )
        .bind(now_secs())
        .bind(ad_id)
        .execute(self.pool.as_ref())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn complete_campaign(&self, campaign_id: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE ad_campaigns
            SET status = 'completed', updated_at = ?
            WHERE id = ? AND status = 'active'
            "#,
        )
        .bind(now_secs())
        .bind(campaign_id)
        .execute(self.pool.as_ref())
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
