use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::ad::{ctr, round_to, within_window};
use super::money::Money;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CampaignStatus {
    Draft,
    Active,
    Paused,
    Completed,
    Archived,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Draft => "draft",
            CampaignStatus::Active => "active",
            CampaignStatus::Paused => "paused",
            CampaignStatus::Completed => "completed",
            CampaignStatus::Archived => "archived",
        }
    }
}

impl FromStr for CampaignStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(CampaignStatus::Draft),
            "active" => Ok(CampaignStatus::Active),
            "paused" => Ok(CampaignStatus::Paused),
            "completed" => Ok(CampaignStatus::Completed),
            "archived" => Ok(CampaignStatus::Archived),
            other => Err(anyhow::anyhow!("unknown campaign status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdCampaign {
    pub id: i64,
    pub name: String,
    pub status: CampaignStatus,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub total_budget: Option<Money>,
    pub daily_budget: Option<Money>,
    pub spent_amount: Money,
    pub total_impressions: i64,
    pub total_clicks: i64,
}

impl AdCampaign {
    pub fn ctr(&self) -> f64 {
        ctr(self.total_clicks, self.total_impressions)
    }

    /// Share of `total_budget` spent, in percent with one decimal.
    pub fn budget_usage_percent(&self) -> f64 {
        match self.total_budget {
            Some(budget) => round_to(self.spent_amount.percent_of(budget), 1),
            None => 0.0,
        }
    }

    pub fn is_running(&self, now: DateTime<Utc>) -> bool {
        self.status == CampaignStatus::Active && within_window(self.start_date, self.end_date, now)
    }

    pub fn is_budget_exhausted(&self) -> bool {
        self.total_budget
            .is_some_and(|budget| self.spent_amount >= budget)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewCampaign {
    pub name: String,
    pub status: CampaignStatus,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub total_budget: Option<Money>,
    pub daily_budget: Option<Money>,
}

impl NewCampaign {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: CampaignStatus::Active,
            start_date: None,
            end_date: None,
            total_budget: None,
            daily_budget: None,
        }
    }
}
