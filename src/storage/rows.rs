//! Row types shared by the SQL backends and their conversion into models.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::FromRow;
use tracing::warn;

use super::trait_def::StorageError;
use crate::models::{
    Ad, AdAbTest, AdCampaign, AdPlacement, AdSegment, AdStatistic, Creative, Money,
};
use crate::targeting::TargetingRules;

pub(crate) const AD_COLUMNS: &str = "id, name, placement_id, campaign_id, ab_test_id, ab_test_variant, \
    format, status, is_active, click_url, open_in_new_tab, image_url, video_url, vast_url, \
    html_content, script_code, alt_text, start_date, end_date, priority, weight, budget, cpm, cpc, \
    impression_limit, click_limit, daily_impression_limit, daily_click_limit, impressions_count, \
    clicks_count, unique_impressions_count, unique_clicks_count, spent_amount, geo_targeting, \
    time_targeting, device_targeting, category_targeting";

pub(crate) const PLACEMENT_COLUMNS: &str =
    "id, name, slug, placement_type, position, width, height, is_active, allowed_pages";

pub(crate) const CAMPAIGN_COLUMNS: &str = "id, name, status, start_date, end_date, total_budget, \
    daily_budget, spent_amount, total_impressions, total_clicks";

pub(crate) const AB_TEST_COLUMNS: &str = "id, name, status, traffic_split_a, traffic_split_b, \
    winner_metric, winner, statistical_significance";

pub(crate) const SEGMENT_COLUMNS: &str = "id, name, slug, segment_type, rules, is_active";

pub(crate) const STATISTIC_COLUMNS: &str = "ad_id, stat_date, impressions, clicks, \
    unique_impressions, unique_clicks, spent, revenue, conversions";

#[derive(Debug, FromRow)]
pub(crate) struct AdRow {
    pub id: i64,
    pub name: String,
    pub placement_id: i64,
    pub campaign_id: Option<i64>,
    pub ab_test_id: Option<i64>,
    pub ab_test_variant: Option<String>,
    pub format: String,
    pub status: String,
    pub is_active: bool,
    pub click_url: Option<String>,
    pub open_in_new_tab: bool,
    pub image_url: Option<String>,
    pub video_url: Option<String>,
    pub vast_url: Option<String>,
    pub html_content: Option<String>,
    pub script_code: Option<String>,
    pub alt_text: Option<String>,
    pub start_date: Option<i64>,
    pub end_date: Option<i64>,
    pub priority: i64,
    pub weight: i64,
    pub budget: Option<i64>,
    pub cpm: Option<i64>,
    pub cpc: Option<i64>,
    pub impression_limit: Option<i64>,
    pub click_limit: Option<i64>,
    pub daily_impression_limit: Option<i64>,
    pub daily_click_limit: Option<i64>,
    pub impressions_count: i64,
    pub clicks_count: i64,
    pub unique_impressions_count: i64,
    pub unique_clicks_count: i64,
    pub spent_amount: i64,
    pub geo_targeting: Option<String>,
    pub time_targeting: Option<String>,
    pub device_targeting: Option<String>,
    pub category_targeting: Option<String>,
}

impl AdRow {
    pub fn into_ad(self, segment_ids: Vec<i64>) -> Result<Ad> {
        let targeting = TargetingRules::parse(
            self.id,
            self.geo_targeting.as_deref(),
            self.time_targeting.as_deref(),
            self.device_targeting.as_deref(),
            self.category_targeting.as_deref(),
        );

        Ok(Ad {
            id: self.id,
            name: self.name,
            placement_id: self.placement_id,
            campaign_id: self.campaign_id,
            ab_test_id: self.ab_test_id,
            ab_test_variant: self
                .ab_test_variant
                .as_deref()
                .map(str::parse)
                .transpose()?,
            format: self.format.parse()?,
            status: self.status.parse()?,
            is_active: self.is_active,
            click_url: self.click_url,
            open_in_new_tab: self.open_in_new_tab,
            creative: Creative {
                image_url: self.image_url,
                video_url: self.video_url,
                vast_url: self.vast_url,
                html_content: self.html_content,
                script_code: self.script_code,
                alt_text: self.alt_text,
            },
            start_date: timestamp(self.start_date)?,
            end_date: timestamp(self.end_date)?,
            priority: self.priority,
            weight: self.weight,
            budget: self.budget.map(Money::from_micros),
            cpm: self.cpm.map(Money::from_micros),
            cpc: self.cpc.map(Money::from_micros),
            impression_limit: self.impression_limit,
            click_limit: self.click_limit,
            daily_impression_limit: self.daily_impression_limit,
            daily_click_limit: self.daily_click_limit,
            impressions_count: self.impressions_count,
            clicks_count: self.clicks_count,
            unique_impressions_count: self.unique_impressions_count,
            unique_clicks_count: self.unique_clicks_count,
            spent_amount: Money::from_micros(self.spent_amount),
            targeting,
            segment_ids,
        })
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct PlacementRow {
    pub id: i64,
    pub name: String,
    pub slug: String,
    pub placement_type: String,
    pub position: String,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub is_active: bool,
    pub allowed_pages: Option<String>,
}

impl From<PlacementRow> for AdPlacement {
    fn from(row: PlacementRow) -> Self {
        let allowed_pages = match row.allowed_pages.as_deref() {
            None | Some("") => Vec::new(),
            Some(raw) => serde_json::from_str(raw).unwrap_or_else(|err| {
                warn!(placement = %row.slug, error = %err, "malformed allowed_pages, allowing all pages");
                Vec::new()
            }),
        };

        AdPlacement {
            id: row.id,
            name: row.name,
            slug: row.slug,
            placement_type: row.placement_type,
            position: row.position,
            width: row.width,
            height: row.height,
            is_active: row.is_active,
            allowed_pages,
        }
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct CampaignRow {
    pub id: i64,
    pub name: String,
    pub status: String,
    pub start_date: Option<i64>,
    pub end_date: Option<i64>,
    pub total_budget: Option<i64>,
    pub daily_budget: Option<i64>,
    pub spent_amount: i64,
    pub total_impressions: i64,
    pub total_clicks: i64,
}

impl TryFrom<CampaignRow> for AdCampaign {
    type Error = anyhow::Error;

    fn try_from(row: CampaignRow) -> Result<Self> {
        Ok(AdCampaign {
            id: row.id,
            name: row.name,
            status: row.status.parse()?,
            start_date: timestamp(row.start_date)?,
            end_date: timestamp(row.end_date)?,
            total_budget: row.total_budget.map(Money::from_micros),
            daily_budget: row.daily_budget.map(Money::from_micros),
            spent_amount: Money::from_micros(row.spent_amount),
            total_impressions: row.total_impressions,
            total_clicks: row.total_clicks,
        })
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct AbTestRow {
    pub id: i64,
    pub name: String,
    pub status: String,
    pub traffic_split_a: i64,
    pub traffic_split_b: i64,
    pub winner_metric: String,
    pub winner: Option<String>,
    pub statistical_significance: Option<f64>,
}

impl TryFrom<AbTestRow> for AdAbTest {
    type Error = anyhow::Error;

    fn try_from(row: AbTestRow) -> Result<Self> {
        Ok(AdAbTest {
            id: row.id,
            name: row.name,
            status: row.status.parse()?,
            traffic_split_a: row.traffic_split_a,
            traffic_split_b: row.traffic_split_b,
            winner_metric: row.winner_metric.parse()?,
            winner: row.winner.as_deref().map(str::parse).transpose()?,
            statistical_significance: row.statistical_significance,
        })
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct SegmentRow {
    pub id: i64,
    pub name: String,
    pub slug: String,
    pub segment_type: String,
    pub rules: Option<String>,
    pub is_active: bool,
}

impl From<SegmentRow> for AdSegment {
    fn from(row: SegmentRow) -> Self {
        let rules = row
            .rules
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or(serde_json::Value::Null);

        AdSegment {
            id: row.id,
            name: row.name,
            slug: row.slug,
            segment_type: row.segment_type,
            rules,
            is_active: row.is_active,
        }
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct StatisticRow {
    pub ad_id: i64,
    pub stat_date: String,
    pub impressions: i64,
    pub clicks: i64,
    pub unique_impressions: i64,
    pub unique_clicks: i64,
    pub spent: i64,
    pub revenue: i64,
    pub conversions: i64,
}

impl TryFrom<StatisticRow> for AdStatistic {
    type Error = anyhow::Error;

    fn try_from(row: StatisticRow) -> Result<Self> {
        Ok(AdStatistic {
            ad_id: row.ad_id,
            date: NaiveDate::parse_from_str(&row.stat_date, "%Y-%m-%d")
                .with_context(|| format!("invalid stat_date '{}'", row.stat_date))?,
            impressions: row.impressions,
            clicks: row.clicks,
            unique_impressions: row.unique_impressions,
            unique_clicks: row.unique_clicks,
            spent: Money::from_micros(row.spent),
            revenue: Money::from_micros(row.revenue),
            conversions: row.conversions,
        })
    }
}

pub(crate) fn timestamp(secs: Option<i64>) -> Result<Option<DateTime<Utc>>> {
    secs.map(|secs| {
        DateTime::from_timestamp(secs, 0).ok_or_else(|| anyhow!("timestamp {secs} out of range"))
    })
    .transpose()
}

pub(crate) fn date_key(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

pub(crate) fn now_secs() -> i64 {
    Utc::now().timestamp()
}

/// Group `(ad_id, segment_id)` link rows by ad. A row that does not convert
/// is logged and left out so it cannot take the rest of the batch down.
pub(crate) fn attach_segments(rows: Vec<AdRow>, links: &[(i64, i64)]) -> Vec<Ad> {
    rows.into_iter()
        .filter_map(|row| {
            let ad_id = row.id;
            let segment_ids = links
                .iter()
                .filter(|(link_ad_id, _)| *link_ad_id == ad_id)
                .map(|(_, segment_id)| *segment_id)
                .collect();
            match row.into_ad(segment_ids) {
                Ok(ad) => Some(ad),
                Err(e) => {
                    warn!(ad_id, error = %e, "skipping unreadable ad row");
                    None
                }
            }
        })
        .collect()
}

/// Convert campaign rows, leaving out the ones that do not convert.
pub(crate) fn readable_campaigns(rows: Vec<CampaignRow>) -> Vec<AdCampaign> {
    rows.into_iter()
        .filter_map(|row| {
            let campaign_id = row.id;
            match AdCampaign::try_from(row) {
                Ok(campaign) => Some(campaign),
                Err(e) => {
                    warn!(campaign_id, error = %e, "skipping unreadable campaign row");
                    None
                }
            }
        })
        .collect()
}

/// SQLSTATE / SQLite result codes that indicate a transient conflict.
const CONFLICT_CODES: &[&str] = &[
    "5",     // SQLITE_BUSY
    "6",     // SQLITE_LOCKED
    "261",   // SQLITE_BUSY_RECOVERY
    "262",   // SQLITE_LOCKED_SHAREDCACHE
    "517",   // SQLITE_BUSY_SNAPSHOT
    "40001", // serialization_failure
    "40P01", // deadlock_detected
];

pub(crate) fn map_sqlx_error(err: sqlx::Error) -> StorageError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.is_unique_violation() {
            return StorageError::Conflict;
        }
        if let Some(code) = db_err.code() {
            if CONFLICT_CODES.contains(&&*code) {
                return StorageError::Conflict;
            }
        }
    }
    StorageError::Other(err.into())
}
