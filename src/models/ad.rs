use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::money::Money;
use crate::targeting::TargetingRules;

/// Largest weight that counts in a draw. Larger weights are treated as this value.
pub const MAX_WEIGHT: i64 = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdFormat {
    Image,
    Html,
    Video,
    Vast,
    Script,
}

impl AdFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdFormat::Image => "image",
            AdFormat::Html => "html",
            AdFormat::Video => "video",
            AdFormat::Vast => "vast",
            AdFormat::Script => "script",
        }
    }
}

impl FromStr for AdFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "image" => Ok(AdFormat::Image),
            "html" => Ok(AdFormat::Html),
            "video" => Ok(AdFormat::Video),
            "vast" => Ok(AdFormat::Vast),
            "script" => Ok(AdFormat::Script),
            other => Err(anyhow::anyhow!("unknown ad format '{other}'")),
        }
    }
}

/// Lifecycle of an ad. `Completed` is terminal and set by the budget reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdStatus {
    Draft,
    Pending,
    Active,
    Paused,
    Completed,
    Rejected,
}

impl AdStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdStatus::Draft => "draft",
            AdStatus::Pending => "pending",
            AdStatus::Active => "active",
            AdStatus::Paused => "paused",
            AdStatus::Completed => "completed",
            AdStatus::Rejected => "rejected",
        }
    }
}

impl FromStr for AdStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(AdStatus::Draft),
            "pending" => Ok(AdStatus::Pending),
            "active" => Ok(AdStatus::Active),
            "paused" => Ok(AdStatus::Paused),
            "completed" => Ok(AdStatus::Completed),
            "rejected" => Ok(AdStatus::Rejected),
            other => Err(anyhow::anyhow!("unknown ad status '{other}'")),
        }
    }
}

impl fmt::Display for AdStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AbVariant {
    A,
    B,
}

impl AbVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            AbVariant::A => "A",
            AbVariant::B => "B",
        }
    }
}

impl FromStr for AbVariant {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "A" | "a" => Ok(AbVariant::A),
            "B" | "b" => Ok(AbVariant::B),
            other => Err(anyhow::anyhow!("unknown A/B variant '{other}'")),
        }
    }
}

/// Creative payload, only carried through for the caller that renders the ad.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Creative {
    pub image_url: Option<String>,
    pub video_url: Option<String>,
    pub vast_url: Option<String>,
    pub html_content: Option<String>,
    pub script_code: Option<String>,
    pub alt_text: Option<String>,
}

/// An advertisement as loaded from storage, with targeting already parsed.
///
/// The counter fields are a snapshot taken at load time. They are never
/// mutated in memory; increments go through `Storage::apply_counters`.
#[derive(Debug, Clone, Serialize)]
pub struct Ad {
    pub id: i64,
    pub name: String,
    pub placement_id: i64,
    pub campaign_id: Option<i64>,
    pub ab_test_id: Option<i64>,
    pub ab_test_variant: Option<AbVariant>,
    pub format: AdFormat,
    pub status: AdStatus,
    pub is_active: bool,
    pub click_url: Option<String>,
    pub open_in_new_tab: bool,
    pub creative: Creative,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub priority: i64,
    pub weight: i64,
    pub budget: Option<Money>,
    pub cpm: Option<Money>,
    pub cpc: Option<Money>,
    pub impression_limit: Option<i64>,
    pub click_limit: Option<i64>,
    pub daily_impression_limit: Option<i64>,
    pub daily_click_limit: Option<i64>,
    pub impressions_count: i64,
    pub clicks_count: i64,
    pub unique_impressions_count: i64,
    pub unique_clicks_count: i64,
    pub spent_amount: Money,
    #[serde(skip)]
    pub targeting: TargetingRules,
    /// Active segments this ad is gated on. Empty means everyone.
    pub segment_ids: Vec<i64>,
}

impl Ad {
    /// Click-through rate in percent, rounded to two decimals.
    pub fn ctr(&self) -> f64 {
        ctr(self.clicks_count, self.impressions_count)
    }

    /// `is_active`, status `active`, and `now` inside `[start_date, end_date]`.
    pub fn is_running(&self, now: DateTime<Utc>) -> bool {
        if !self.is_active || self.status != AdStatus::Active {
            return false;
        }
        within_window(self.start_date, self.end_date, now)
    }

    /// Weight clamped to `1..=MAX_WEIGHT` for selection.
    pub fn effective_weight(&self) -> u64 {
        self.weight.clamp(1, MAX_WEIGHT) as u64
    }

    pub fn is_past_end(&self, now: DateTime<Utc>) -> bool {
        self.end_date.is_some_and(|end| now > end)
    }
}

pub(crate) fn within_window(
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> bool {
    if start.is_some_and(|start| now < start) {
        return false;
    }
    if end.is_some_and(|end| now > end) {
        return false;
    }
    true
}

/// Percentage `numerator / denominator * 100` rounded to two decimals, 0 when
/// the denominator is zero.
pub fn ctr(clicks: i64, impressions: i64) -> f64 {
    if impressions <= 0 {
        return 0.0;
    }
    round_to(clicks as f64 / impressions as f64 * 100.0, 2)
}

pub(crate) fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Insert payload for a new ad.
#[derive(Debug, Clone, Deserialize)]
pub struct NewAd {
    pub name: String,
    pub placement_id: i64,
    #[serde(default)]
    pub campaign_id: Option<i64>,
    #[serde(default)]
    pub ab_test_id: Option<i64>,
    #[serde(default)]
    pub ab_test_variant: Option<AbVariant>,
    pub format: AdFormat,
    pub status: AdStatus,
    pub is_active: bool,
    pub click_url: Option<String>,
    pub open_in_new_tab: bool,
    #[serde(default)]
    pub creative: Creative,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub priority: i64,
    pub weight: i64,
    pub budget: Option<Money>,
    pub cpm: Option<Money>,
    pub cpc: Option<Money>,
    pub impression_limit: Option<i64>,
    pub click_limit: Option<i64>,
    pub daily_impression_limit: Option<i64>,
    pub daily_click_limit: Option<i64>,
    /// Raw JSON rule blobs, stored verbatim and parsed on load.
    #[serde(default)]
    pub geo_targeting: Option<serde_json::Value>,
    #[serde(default)]
    pub time_targeting: Option<serde_json::Value>,
    #[serde(default)]
    pub device_targeting: Option<serde_json::Value>,
    #[serde(default)]
    pub category_targeting: Option<serde_json::Value>,
    #[serde(default)]
    pub segment_ids: Vec<i64>,
}

impl NewAd {
    /// A running image ad with default priority and weight and no limits.
    pub fn new(name: &str, placement_id: i64) -> Self {
        Self {
            name: name.to_string(),
            placement_id,
            campaign_id: None,
            ab_test_id: None,
            ab_test_variant: None,
            format: AdFormat::Image,
            status: AdStatus::Active,
            is_active: true,
            click_url: None,
            open_in_new_tab: true,
            creative: Creative::default(),
            start_date: None,
            end_date: None,
            priority: 0,
            weight: 100,
            budget: None,
            cpm: None,
            cpc: None,
            impression_limit: None,
            click_limit: None,
            daily_impression_limit: None,
            daily_click_limit: None,
            geo_targeting: None,
            time_targeting: None,
            device_targeting: None,
            category_targeting: None,
            segment_ids: Vec::new(),
        }
    }
}

#[cfg(test)]
impl Ad {
    /// Running ad with no limits, weight 100, no targeting.
    pub(crate) fn fixture(id: i64) -> Ad {
        Ad {
            id,
            name: format!("ad-{id}"),
            placement_id: 1,
            campaign_id: None,
            ab_test_id: None,
            ab_test_variant: None,
            format: AdFormat::Image,
            status: AdStatus::Active,
            is_active: true,
            click_url: None,
            open_in_new_tab: true,
            creative: Creative::default(),
            start_date: None,
            end_date: None,
            priority: 0,
            weight: 100,
            budget: None,
            cpm: None,
            cpc: None,
            impression_limit: None,
            click_limit: None,
            daily_impression_limit: None,
            daily_click_limit: None,
            impressions_count: 0,
            clicks_count: 0,
            unique_impressions_count: 0,
            unique_clicks_count: 0,
            spent_amount: Money::ZERO,
            targeting: TargetingRules::default(),
            segment_ids: Vec::new(),
        }
    }
}
