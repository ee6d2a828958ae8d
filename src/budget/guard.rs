use crate::models::{Ad, AdCampaign, AdStatistic, Money};
use crate::storage::{CounterDelta, CounterSnapshot, Storage};
use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{HashMap, HashSet};

/// Reason an ad was filtered out by the budget guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exclusion {
    AdBudget,
    ImpressionLimit,
    ClickLimit,
    DailyImpressionLimit,
    DailyClickLimit,
    CampaignNotRunning,
    CampaignBudget,
    CampaignDailyBudget,
}

/// Selection-time budget and frequency-cap filter.
///
/// Holds a snapshot of the campaigns and today's statistic rows for one batch
/// of candidate ads. An ad without a statistic row for today has zero daily
/// usage.
#[derive(Debug, Default)]
pub struct BudgetGuard {
    campaigns: HashMap<i64, AdCampaign>,
    today: HashMap<i64, AdStatistic>,
    campaign_spend_today: HashMap<i64, Money>,
}

impl BudgetGuard {
    pub fn new(
        campaigns: Vec<AdCampaign>,
        today: Vec<AdStatistic>,
        campaign_spend_today: Vec<(i64, Money)>,
    ) -> Self {
        Self {
            campaigns: campaigns.into_iter().map(|c| (c.id, c)).collect(),
            today: today.into_iter().map(|s| (s.ad_id, s)).collect(),
            campaign_spend_today: campaign_spend_today.into_iter().collect(),
        }
    }

    /// Load everything needed to judge `ads` on `date`.
    pub async fn load(storage: &dyn Storage, ads: &[Ad], date: NaiveDate) -> Result<Self> {
        let ad_ids: Vec<i64> = ads.iter().map(|ad| ad.id).collect();
        let campaign_ids: Vec<i64> = ads
            .iter()
            .filter_map(|ad| ad.campaign_id)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();

        let campaigns = storage.campaigns_by_ids(&campaign_ids).await?;
        let today = storage.daily_statistics(&ad_ids, date).await?;

        let budgeted: Vec<i64> = campaigns
            .iter()
            .filter(|c| c.daily_budget.is_some())
            .map(|c| c.id)
            .collect();
        let campaign_spend_today = storage.campaign_daily_spend(&budgeted, date).await?;

        Ok(Self::new(campaigns, today, campaign_spend_today))
    }

    /// The campaign snapshot this guard judged `campaign_id` against.
    pub fn campaign(&self, campaign_id: i64) -> Option<&AdCampaign> {
        self.campaigns.get(&campaign_id)
    }

    pub fn allows(&self, ad: &Ad, now: DateTime<Utc>) -> bool {
        self.exclusion(ad, now).is_none()
    }

    pub fn exclusion(&self, ad: &Ad, now: DateTime<Utc>) -> Option<Exclusion> {
        if let Some(reason) = lifetime_exclusion(ad) {
            return Some(reason);
        }

        if let Some(stat) = self.today.get(&ad.id) {
            if reached(stat.impressions, ad.daily_impression_limit) {
                return Some(Exclusion::DailyImpressionLimit);
            }
            if reached(stat.clicks, ad.daily_click_limit) {
                return Some(Exclusion::DailyClickLimit);
            }
        }

        let campaign_id = ad.campaign_id?;
        let Some(campaign) = self.campaigns.get(&campaign_id) else {
            return Some(Exclusion::CampaignNotRunning);
        };
        if !campaign.is_running(now) {
            return Some(Exclusion::CampaignNotRunning);
        }
        if campaign.is_budget_exhausted() {
            return Some(Exclusion::CampaignBudget);
        }
        if let Some(daily) = campaign.daily_budget {
            let spent = self
                .campaign_spend_today
                .get(&campaign.id)
                .copied()
                .unwrap_or_default();
            if spent >= daily {
                return Some(Exclusion::CampaignDailyBudget);
            }
        }

        None
    }
}

fn reached(used: i64, limit: Option<i64>) -> bool {
    limit.is_some_and(|limit| used >= limit)
}

/// Ad-level exhaustion that never resets: own budget and lifetime caps.
pub fn lifetime_exclusion(ad: &Ad) -> Option<Exclusion> {
    if ad.budget.is_some_and(|budget| ad.spent_amount >= budget) {
        return Some(Exclusion::AdBudget);
    }
    if reached(ad.impressions_count, ad.impression_limit) {
        return Some(Exclusion::ImpressionLimit);
    }
    if reached(ad.clicks_count, ad.click_limit) {
        return Some(Exclusion::ClickLimit);
    }
    None
}

/// Whether applying `delta` moved the ad or its campaign from under a limit to
/// at-or-over it. `snapshot` holds the counters after the increment.
pub fn crossed_limit(ad: &Ad, delta: &CounterDelta, snapshot: &CounterSnapshot) -> bool {
    let count_crossed = |after: i64, step: i64, limit: Option<i64>| {
        step > 0 && limit.is_some_and(|limit| after >= limit && after - step < limit)
    };
    let money_crossed = |after: Money, step: Money, limit: Option<Money>| {
        step.is_positive() && limit.is_some_and(|limit| after >= limit && after - step < limit)
    };

    count_crossed(snapshot.ad_impressions, delta.impressions, ad.impression_limit)
        || count_crossed(snapshot.ad_clicks, delta.clicks, ad.click_limit)
        || count_crossed(snapshot.day_impressions, delta.impressions, ad.daily_impression_limit)
        || count_crossed(snapshot.day_clicks, delta.clicks, ad.daily_click_limit)
        || money_crossed(snapshot.ad_spent, delta.spent, ad.budget)
        || snapshot
            .campaign
            .is_some_and(|c| money_crossed(c.spent, delta.spent, c.total_budget))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CampaignStatus;
    use crate::storage::CampaignCounters;
    use chrono::TimeZone;

    fn ad(id: i64) -> Ad {
        Ad::fixture(id)
    }

    fn campaign(id: i64) -> AdCampaign {
        AdCampaign {
            id,
            name: "launch".to_string(),
            status: CampaignStatus::Active,
            start_date: None,
            end_date: None,
            total_budget: None,
            daily_budget: None,
            spent_amount: Money::ZERO,
            total_impressions: 0,
            total_clicks: 0,
        }
    }

    fn today_row(ad_id: i64, impressions: i64, clicks: i64) -> AdStatistic {
        AdStatistic {
            ad_id,
            date: NaiveDate::from_ymd_opt(2026, 3, 9).unwrap(),
            impressions,
            clicks,
            unique_impressions: 0,
            unique_clicks: 0,
            spent: Money::ZERO,
            revenue: Money::ZERO,
            conversions: 0,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 9, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_ad_budget_spent() {
        let mut ad = ad(1);
        ad.budget = Some(Money::from_units(10.0));
        ad.spent_amount = Money::from_units(9.99);
        let guard = BudgetGuard::default();
        assert!(guard.allows(&ad, now()));

        ad.spent_amount = Money::from_units(10.0);
        assert_eq!(guard.exclusion(&ad, now()), Some(Exclusion::AdBudget));
    }

    #[test]
    fn test_lifetime_limits() {
        let guard = BudgetGuard::default();
        let mut capped = ad(1);
        capped.impression_limit = Some(5);
        capped.impressions_count = 5;
        assert_eq!(guard.exclusion(&capped, now()), Some(Exclusion::ImpressionLimit));

        let mut clicked = ad(2);
        clicked.click_limit = Some(3);
        clicked.clicks_count = 2;
        assert!(guard.allows(&clicked, now()));
        clicked.clicks_count = 3;
        assert_eq!(guard.exclusion(&clicked, now()), Some(Exclusion::ClickLimit));
    }

    #[test]
    fn test_daily_limits_use_today_row() {
        let mut ad = ad(1);
        ad.daily_impression_limit = Some(100);
        ad.daily_click_limit = Some(10);

        // no row for today means nothing used yet
        assert!(BudgetGuard::default().allows(&ad, now()));

        let guard = BudgetGuard::new(vec![], vec![today_row(1, 99, 0)], vec![]);
        assert!(guard.allows(&ad, now()));

        let guard = BudgetGuard::new(vec![], vec![today_row(1, 100, 0)], vec![]);
        assert_eq!(
            guard.exclusion(&ad, now()),
            Some(Exclusion::DailyImpressionLimit)
        );

        let guard = BudgetGuard::new(vec![], vec![today_row(1, 5, 10)], vec![]);
        assert_eq!(guard.exclusion(&ad, now()), Some(Exclusion::DailyClickLimit));
    }

    #[test]
    fn test_campaign_constraints() {
        let mut ad = ad(1);
        ad.campaign_id = Some(7);

        let mut spent = campaign(7);
        spent.total_budget = Some(Money::from_units(50.0));
        spent.spent_amount = Money::from_units(50.0);
        let guard = BudgetGuard::new(vec![spent], vec![], vec![]);
        assert_eq!(guard.exclusion(&ad, now()), Some(Exclusion::CampaignBudget));

        let mut paused = campaign(7);
        paused.status = CampaignStatus::Paused;
        let guard = BudgetGuard::new(vec![paused], vec![], vec![]);
        assert_eq!(
            guard.exclusion(&ad, now()),
            Some(Exclusion::CampaignNotRunning)
        );

        let mut daily = campaign(7);
        daily.daily_budget = Some(Money::from_units(5.0));
        let guard = BudgetGuard::new(
            vec![daily.clone()],
            vec![],
            vec![(7, Money::from_units(4.5))],
        );
        assert!(guard.allows(&ad, now()));
        let guard = BudgetGuard::new(vec![daily], vec![], vec![(7, Money::from_units(5.0))]);
        assert_eq!(
            guard.exclusion(&ad, now()),
            Some(Exclusion::CampaignDailyBudget)
        );
    }

    #[test]
    fn test_crossed_limit_fires_once() {
        let mut ad = ad(1);
        ad.daily_impression_limit = Some(3);
        let date = NaiveDate::from_ymd_opt(2026, 3, 9).unwrap();
        let mut delta = CounterDelta::new(1, None, date);
        delta.impressions = 1;

        let snapshot = |day_impressions| CounterSnapshot {
            ad_impressions: day_impressions,
            ad_clicks: 0,
            ad_spent: Money::ZERO,
            day_impressions,
            day_clicks: 0,
            day_spent: Money::ZERO,
            campaign: None,
        };

        assert!(!crossed_limit(&ad, &delta, &snapshot(2)));
        assert!(crossed_limit(&ad, &delta, &snapshot(3)));
        assert!(!crossed_limit(&ad, &delta, &snapshot(4)));
    }

    #[test]
    fn test_crossed_campaign_budget() {
        let mut ad = ad(1);
        ad.campaign_id = Some(7);
        let date = NaiveDate::from_ymd_opt(2026, 3, 9).unwrap();
        let mut delta = CounterDelta::new(1, Some(7), date);
        delta.clicks = 1;
        delta.spent = Money::from_units(0.5);

        let snapshot = CounterSnapshot {
            ad_impressions: 0,
            ad_clicks: 1,
            ad_spent: Money::from_units(20.0),
            day_impressions: 0,
            day_clicks: 1,
            day_spent: Money::from_units(0.5),
            campaign: Some(CampaignCounters {
                spent: Money::from_units(100.2),
                total_budget: Some(Money::from_units(100.0)),
            }),
        };
        assert!(crossed_limit(&ad, &delta, &snapshot));
    }

    #[test]
    fn test_cpm_budget_exhausted_after_exact_number_of_impressions() {
        let mut ad = ad(1);
        ad.budget = Some(Money::from_units(1.0));
        let per_impression = Money::from_units(100.0).per_mille();

        let date = NaiveDate::from_ymd_opt(2026, 3, 9).unwrap();
        let mut delta = CounterDelta::new(1, None, date);
        delta.impressions = 1;
        delta.spent = per_impression;

        let guard = BudgetGuard::default();
        for n in 1..=10 {
            ad.spent_amount += per_impression;
            let snapshot = CounterSnapshot {
                ad_impressions: n,
                ad_clicks: 0,
                ad_spent: ad.spent_amount,
                day_impressions: n,
                day_clicks: 0,
                day_spent: ad.spent_amount,
                campaign: None,
            };
            assert_eq!(crossed_limit(&ad, &delta, &snapshot), n == 10);
        }
        assert_eq!(guard.exclusion(&ad, now()), Some(Exclusion::AdBudget));
    }

    #[test]
    fn test_unreadable_campaign_excludes_its_ads() {
        let mut ad = ad(1);
        ad.campaign_id = Some(42);
        let guard = BudgetGuard::default();
        assert_eq!(
            guard.exclusion(&ad, now()),
            Some(Exclusion::CampaignNotRunning)
        );
    }
}
