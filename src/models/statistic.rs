use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::ad::ctr;
use super::money::Money;

/// One row per (ad, calendar date).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdStatistic {
    pub ad_id: i64,
    pub date: NaiveDate,
    pub impressions: i64,
    pub clicks: i64,
    pub unique_impressions: i64,
    pub unique_clicks: i64,
    pub spent: Money,
    pub revenue: Money,
    pub conversions: i64,
}

impl AdStatistic {
    pub fn ctr(&self) -> f64 {
        ctr(self.clicks, self.impressions)
    }

    /// Conversions per click in percent.
    pub fn conversion_rate(&self) -> f64 {
        ctr(self.conversions, self.clicks)
    }
}

/// Breakdown dimensions stored next to the daily row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BreakdownDimension {
    Hour,
    Country,
    Device,
}

impl BreakdownDimension {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakdownDimension::Hour => "hour",
            BreakdownDimension::Country => "country",
            BreakdownDimension::Device => "device",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakdownEntry {
    pub bucket: String,
    pub impressions: i64,
    pub clicks: i64,
}

/// Rollup of statistic rows over a date range.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatisticsSummary {
    pub days: usize,
    pub impressions: i64,
    pub clicks: i64,
    pub unique_impressions: i64,
    pub unique_clicks: i64,
    pub spent: Money,
    pub revenue: Money,
    pub conversions: i64,
}

impl StatisticsSummary {
    pub fn from_rows(rows: &[AdStatistic]) -> Self {
        rows.iter().fold(
            Self {
                days: rows.len(),
                ..Self::default()
            },
            |mut acc, row| {
                acc.impressions += row.impressions;
                acc.clicks += row.clicks;
                acc.unique_impressions += row.unique_impressions;
                acc.unique_clicks += row.unique_clicks;
                acc.spent += row.spent;
                acc.revenue += row.revenue;
                acc.conversions += row.conversions;
                acc
            },
        )
    }

    pub fn ctr(&self) -> f64 {
        ctr(self.clicks, self.impressions)
    }
}
