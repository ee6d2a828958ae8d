//! Targeting evaluation
//!
//! An ad matches a request only if every dimension matches (AND across
//! geo, time, device and category); inside one dimension any listed value
//! is enough (OR). An empty dimension never restricts.

pub mod rules;

pub use rules::{CategoryRule, DeviceRule, GeoRule, RuleError, TargetingRules, TimeRule, TimeWindow};

use crate::models::RequestContext;

/// Pure targeting check of one ad's rules against a request.
pub fn matches(rules: &TargetingRules, ctx: &RequestContext) -> bool {
    rules.geo.matches(ctx.country_code.as_deref())
        && rules.device.matches(ctx.device_type.as_deref())
        && rules.category.matches(&ctx.page_category_ids)
        && rules.time.matches(ctx.now)
}
