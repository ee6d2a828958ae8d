//! Sticky A/B variant assignment and winner evaluation.

use crate::models::ad::round_to;
use crate::models::{AbTestStatus, AbVariant, Ad, AdAbTest, StatisticsSummary, WinnerMetric};
use rand::{Rng, RngExt};
use serde::Serialize;
use sha2::{Digest, Sha256};
use statrs::distribution::{ContinuousCDF, Normal};
use std::collections::HashMap;
use std::sync::Arc;

/// p-value below which a difference counts as significant.
pub const SIGNIFICANCE_LEVEL: f64 = 0.05;

/// Stable bucket in `0..100` for a visitor in a test.
pub fn bucket(session_key: &str, test_id: i64) -> u8 {
    let mut hasher = Sha256::new();
    hasher.update(session_key.as_bytes());
    hasher.update(b":");
    hasher.update(test_id.to_be_bytes());
    let digest = hasher.finalize();

    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % 100) as u8
}

/// Variant a visitor sees for the life of the test.
pub fn assign(test: &AdAbTest, session_key: &str) -> AbVariant {
    split(test, bucket(session_key, test.id))
}

fn split(test: &AdAbTest, bucket: u8) -> AbVariant {
    if i64::from(bucket) < test.traffic_split_a {
        AbVariant::A
    } else {
        AbVariant::B
    }
}

/// Keep only the ads whose variant matches what this visitor is assigned.
///
/// Ads outside any test pass through. Tests in draft or paused serve both
/// variants, a completed test with a winner serves only the winner. Without a
/// visitor key the variant is drawn once per test from `rng`.
pub fn resolve_candidates<R: Rng + ?Sized>(
    ads: &[Arc<Ad>],
    tests: &HashMap<i64, AdAbTest>,
    visitor_key: Option<&str>,
    rng: &mut R,
) -> Vec<Arc<Ad>> {
    let mut assigned: HashMap<i64, Option<AbVariant>> = HashMap::new();

    ads.iter()
        .filter(|ad| {
            let (Some(test_id), Some(variant)) = (ad.ab_test_id, ad.ab_test_variant) else {
                return true;
            };
            let Some(test) = tests.get(&test_id) else {
                return true;
            };

            let wanted = *assigned.entry(test_id).or_insert_with(|| match test.status {
                AbTestStatus::Running => Some(match visitor_key {
                    Some(key) => assign(test, key),
                    None => split(test, rng.random_range(0..100u8)),
                }),
                AbTestStatus::Completed => test.winner,
                AbTestStatus::Draft | AbTestStatus::Paused => None,
            });

            wanted.is_none_or(|wanted| wanted == variant)
        })
        .cloned()
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AbTestOutcome {
    pub metric: WinnerMetric,
    pub value_a: f64,
    pub value_b: f64,
    /// Two-sided p-value, `None` for metrics compared as totals or when a
    /// variant has no traffic.
    pub p_value: Option<f64>,
    /// Confidence in percent, `(1 - p) * 100`, two decimals.
    pub confidence: Option<f64>,
    pub winner: Option<AbVariant>,
}

impl AbTestOutcome {
    pub fn is_significant(&self) -> bool {
        self.p_value.is_some_and(|p| p < SIGNIFICANCE_LEVEL)
    }
}

/// Compare two variants on `metric`.
///
/// Rate metrics run a two-proportion z-test and only name a winner when the
/// difference is significant. Revenue compares totals.
pub fn evaluate(metric: WinnerMetric, a: &StatisticsSummary, b: &StatisticsSummary) -> AbTestOutcome {
    let (successes_a, trials_a, successes_b, trials_b) = match metric {
        WinnerMetric::Ctr => (a.clicks, a.impressions, b.clicks, b.impressions),
        WinnerMetric::UniqueClicks => (
            a.unique_clicks,
            a.unique_impressions,
            b.unique_clicks,
            b.unique_impressions,
        ),
        WinnerMetric::Conversions => (a.conversions, a.clicks, b.conversions, b.clicks),
        WinnerMetric::Revenue => {
            let winner = if a.revenue > b.revenue {
                Some(AbVariant::A)
            } else if b.revenue > a.revenue {
                Some(AbVariant::B)
            } else {
                None
            };
            return AbTestOutcome {
                metric,
                value_a: a.revenue.units(),
                value_b: b.revenue.units(),
                p_value: None,
                confidence: None,
                winner,
            };
        }
    };

    let rate = |successes: i64, trials: i64| {
        if trials > 0 {
            successes as f64 / trials as f64
        } else {
            0.0
        }
    };
    let rate_a = rate(successes_a, trials_a);
    let rate_b = rate(successes_b, trials_b);

    let p_value = two_proportion_p_value(successes_a, trials_a, successes_b, trials_b);
    let winner = match p_value {
        Some(p) if p < SIGNIFICANCE_LEVEL && rate_a > rate_b => Some(AbVariant::A),
        Some(p) if p < SIGNIFICANCE_LEVEL && rate_b > rate_a => Some(AbVariant::B),
        _ => None,
    };

    AbTestOutcome {
        metric,
        value_a: round_to(rate_a * 100.0, 2),
        value_b: round_to(rate_b * 100.0, 2),
        p_value,
        confidence: p_value.map(|p| round_to((1.0 - p) * 100.0, 2)),
        winner,
    }
}

fn two_proportion_p_value(
    successes_a: i64,
    trials_a: i64,
    successes_b: i64,
    trials_b: i64,
) -> Option<f64> {
    if trials_a <= 0 || trials_b <= 0 {
        return None;
    }

    let (n_a, n_b) = (trials_a as f64, trials_b as f64);
    let pooled = (successes_a + successes_b) as f64 / (n_a + n_b);
    let se = (pooled * (1.0 - pooled) * (1.0 / n_a + 1.0 / n_b)).sqrt();
    if !se.is_finite() || se == 0.0 {
        return None;
    }

    let z = (successes_a as f64 / n_a - successes_b as f64 / n_b) / se;
    let normal = Normal::new(0.0, 1.0).ok()?;
    Some((2.0 * (1.0 - normal.cdf(z.abs()))).clamp(0.0, 1.0))
}
