//! Priority-tiered, weight-proportional sampling without replacement.

use crate::models::Ad;
use rand::{Rng, RngExt};
use std::sync::Arc;

/// Pick up to `limit` distinct ads.
///
/// Higher priority tiers are drained before any lower tier is touched. Inside
/// a tier each draw picks an ad with probability proportional to its weight
/// among the ads not yet chosen. Candidates are laid out by ascending id, so a
/// seeded `rng` always reproduces the same picks.
pub fn select<R: Rng + ?Sized>(candidates: &[Arc<Ad>], limit: usize, rng: &mut R) -> Vec<Arc<Ad>> {
    let mut remaining: Vec<&Arc<Ad>> = candidates.iter().collect();
    remaining.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
    remaining.dedup_by_key(|ad| ad.id);

    let mut chosen = Vec::with_capacity(limit.min(remaining.len()));
    let mut tier_start = 0;

    while chosen.len() < limit && tier_start < remaining.len() {
        let priority = remaining[tier_start].priority;
        let tier_end = remaining[tier_start..]
            .iter()
            .position(|ad| ad.priority != priority)
            .map_or(remaining.len(), |offset| tier_start + offset);

        let mut tier: Vec<&Arc<Ad>> = remaining[tier_start..tier_end].to_vec();
        while chosen.len() < limit && !tier.is_empty() {
            let index = draw(&tier, rng);
            chosen.push(Arc::clone(tier.remove(index)));
        }

        tier_start = tier_end;
    }

    chosen
}

/// Pick a single ad, or `None` when there is nothing to serve.
pub fn select_one<R: Rng + ?Sized>(candidates: &[Arc<Ad>], rng: &mut R) -> Option<Arc<Ad>> {
    select(candidates, 1, rng).pop()
}

/// Index into `tier` for a uniform draw over the cumulative weights.
fn draw<R: Rng + ?Sized>(tier: &[&Arc<Ad>], rng: &mut R) -> usize {
    let total = tier
        .iter()
        .fold(0u64, |total, ad| total.saturating_add(ad.effective_weight()));
    let mut point = rng.random_range(0..total);

    for (index, ad) in tier.iter().enumerate() {
        let weight = ad.effective_weight();
        if point < weight {
            return index;
        }
        point -= weight;
    }

    tier.len() - 1
}
