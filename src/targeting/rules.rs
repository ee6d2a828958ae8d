//! Typed targeting rules
//!
//! Ads store their targeting as opaque JSON blobs. They are parsed exactly
//! once, when the ad is loaded from storage, into the rule types below.
//! Anything that fails to parse becomes an empty rule ("no restriction") and
//! is logged, so a bad blob can never block selection.

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported rule shape")]
    Shape,
    #[error("{0} out of range")]
    OutOfRange(&'static str),
}

/// Country whitelist, stored upper-cased.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GeoRule {
    pub countries: Vec<String>,
}

impl GeoRule {
    pub fn matches(&self, country_code: Option<&str>) -> bool {
        if self.countries.is_empty() {
            return true;
        }
        country_code.is_some_and(|code| {
            self.countries
                .iter()
                .any(|country| country.eq_ignore_ascii_case(code))
        })
    }
}

/// Device type whitelist (`desktop`, `mobile`, `tablet`, ...), lower-cased.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceRule {
    pub devices: Vec<String>,
}

impl DeviceRule {
    pub fn matches(&self, device_type: Option<&str>) -> bool {
        if self.devices.is_empty() {
            return true;
        }
        device_type.is_some_and(|device| {
            self.devices
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(device))
        })
    }
}

/// Page category ids; the page must carry at least one of them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CategoryRule {
    pub categories: Vec<i64>,
}

impl CategoryRule {
    pub fn matches(&self, page_category_ids: &[i64]) -> bool {
        if self.categories.is_empty() {
            return true;
        }
        page_category_ids
            .iter()
            .any(|id| self.categories.contains(id))
    }
}

/// ISO weekdays (1 = Monday) and hours of day during which an ad may run.
/// An empty list in either field means "any".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimeWindow {
    pub days: Vec<u32>,
    pub hours: Vec<u32>,
}

impl TimeWindow {
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        let day = now.weekday().number_from_monday();
        let hour = now.hour();
        (self.days.is_empty() || self.days.contains(&day))
            && (self.hours.is_empty() || self.hours.contains(&hour))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimeRule {
    pub windows: Vec<TimeWindow>,
}

impl TimeRule {
    pub fn matches(&self, now: DateTime<Utc>) -> bool {
        self.windows.is_empty() || self.windows.iter().any(|window| window.contains(now))
    }
}

/// All four targeting dimensions of one ad.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetingRules {
    pub geo: GeoRule,
    pub time: TimeRule,
    pub device: DeviceRule,
    pub category: CategoryRule,
}

impl TargetingRules {
    /// Parse the stored blobs of one ad. Never fails; malformed dimensions are
    /// logged and treated as unrestricted.
    pub fn parse(
        ad_id: i64,
        geo: Option<&str>,
        time: Option<&str>,
        device: Option<&str>,
        category: Option<&str>,
    ) -> Self {
        Self {
            geo: GeoRule {
                countries: lenient(ad_id, "geo", geo, |raw| {
                    parse_list::<String>(raw, "countries")
                        .map(|list| list.into_iter().map(|c| c.trim().to_uppercase()).collect())
                }),
            },
            time: TimeRule {
                windows: lenient(ad_id, "time", time, parse_windows),
            },
            device: DeviceRule {
                devices: lenient(ad_id, "device", device, |raw| {
                    parse_list::<String>(raw, "devices")
                        .map(|list| list.into_iter().map(|d| d.trim().to_lowercase()).collect())
                }),
            },
            category: CategoryRule {
                categories: lenient(ad_id, "category", category, |raw| {
                    parse_list::<CategoryId>(raw, "categories")?
                        .into_iter()
                        .map(CategoryId::into_id)
                        .collect()
                }),
            },
        }
    }

    pub fn is_unrestricted(&self) -> bool {
        self == &Self::default()
    }
}

fn lenient<T: Default>(
    ad_id: i64,
    dimension: &'static str,
    raw: Option<&str>,
    parse: impl FnOnce(&str) -> Result<T, RuleError>,
) -> T {
    let Some(raw) = raw.map(str::trim).filter(|raw| !raw.is_empty()) else {
        return T::default();
    };
    match parse(raw) {
        Ok(parsed) => parsed,
        Err(err) => {
            warn!(ad_id, dimension, error = %err, "malformed targeting rule, treating as unrestricted");
            T::default()
        }
    }
}

/// Accepts either a bare array or an object holding the array under `key`.
fn parse_list<T: DeserializeOwned>(raw: &str, key: &str) -> Result<Vec<T>, RuleError> {
    match serde_json::from_str::<Value>(raw)? {
        Value::Null => Ok(Vec::new()),
        list @ Value::Array(_) => Ok(serde_json::from_value(list)?),
        Value::Object(mut map) => match map.remove(key) {
            Some(list @ Value::Array(_)) => Ok(serde_json::from_value(list)?),
            None if map.is_empty() => Ok(Vec::new()),
            _ => Err(RuleError::Shape),
        },
        _ => Err(RuleError::Shape),
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CategoryId {
    Number(i64),
    Text(String),
}

impl CategoryId {
    fn into_id(self) -> Result<i64, RuleError> {
        match self {
            CategoryId::Number(id) => Ok(id),
            CategoryId::Text(text) => text.trim().parse().map_err(|_| RuleError::Shape),
        }
    }
}

#[derive(Deserialize)]
struct WindowShape {
    #[serde(default)]
    days: Vec<u32>,
    #[serde(default)]
    hours: Vec<u32>,
    #[serde(default)]
    start_hour: Option<u32>,
    #[serde(default)]
    end_hour: Option<u32>,
}

impl TryFrom<WindowShape> for TimeWindow {
    type Error = RuleError;

    fn try_from(shape: WindowShape) -> Result<Self, Self::Error> {
        if shape.days.iter().any(|day| !(1..=7).contains(day)) {
            return Err(RuleError::OutOfRange("weekday"));
        }
        if shape.hours.iter().any(|hour| *hour > 23) {
            return Err(RuleError::OutOfRange("hour"));
        }

        let mut hours = shape.hours;
        match (shape.start_hour, shape.end_hour) {
            (None, None) => {}
            (Some(start), Some(end)) => {
                if start > 23 || end > 24 {
                    return Err(RuleError::OutOfRange("hour"));
                }
                // end is exclusive; start > end wraps past midnight
                if start < end {
                    hours.extend(start..end);
                } else if start > end {
                    hours.extend(start..24);
                    hours.extend(0..end);
                }
            }
            _ => return Err(RuleError::Shape),
        }
        hours.sort_unstable();
        hours.dedup();

        let mut days = shape.days;
        days.sort_unstable();
        days.dedup();

        Ok(TimeWindow { days, hours })
    }
}

fn parse_windows(raw: &str) -> Result<Vec<TimeWindow>, RuleError> {
    match serde_json::from_str::<Value>(raw)? {
        Value::Null => Ok(Vec::new()),
        Value::Object(map) if map.is_empty() => Ok(Vec::new()),
        object @ Value::Object(_) => {
            let shape: WindowShape = serde_json::from_value(object)?;
            Ok(vec![TimeWindow::try_from(shape)?])
        }
        Value::Array(items) => items
            .into_iter()
            .map(|item| {
                let shape: WindowShape = serde_json::from_value(item)?;
                TimeWindow::try_from(shape)
            })
            .collect(),
        _ => Err(RuleError::Shape),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_geo_shapes() {
        let bare = TargetingRules::parse(1, Some(r#"["us","ca"]"#), None, None, None);
        assert_eq!(bare.geo.countries, vec!["US", "CA"]);

        let keyed = TargetingRules::parse(1, Some(r#"{"countries":["de"]}"#), None, None, None);
        assert_eq!(keyed.geo.countries, vec!["DE"]);

        let empty = TargetingRules::parse(1, Some("{}"), Some("[]"), Some(""), Some("null"));
        assert!(empty.is_unrestricted());
    }

    #[test]
    fn test_malformed_rules_are_unrestricted() {
        let rules = TargetingRules::parse(
            1,
            Some("not json"),
            Some(r#"{"hours":[25]}"#),
            Some(r#"{"devices":"mobile"}"#),
            Some(r#"["abc"]"#),
        );
        assert!(rules.is_unrestricted());
    }

    #[test]
    fn test_parse_categories_accepts_numeric_strings() {
        let rules = TargetingRules::parse(1, None, None, None, Some(r#"[3, "7"]"#));
        assert_eq!(rules.category.categories, vec![3, 7]);
    }

    #[test]
    fn test_parse_time_hours_and_days_object() {
        let rules = TargetingRules::parse(1, None, Some(r#"{"hours":[9,10],"days":[1,5]}"#), None, None);
        assert_eq!(
            rules.time.windows,
            vec![TimeWindow {
                days: vec![1, 5],
                hours: vec![9, 10],
            }]
        );
    }

    #[test]
    fn test_time_window_wraps_midnight() {
        let rules = TargetingRules::parse(
            1,
            None,
            Some(r#"[{"start_hour":22,"end_hour":2}]"#),
            None,
            None,
        );
        assert_eq!(rules.time.windows[0].hours, vec![0, 1, 22, 23]);

        let late = Utc.with_ymd_and_hms(2026, 3, 10, 23, 30, 0).unwrap();
        let early = Utc.with_ymd_and_hms(2026, 3, 11, 1, 59, 0).unwrap();
        let noon = Utc.with_ymd_and_hms(2026, 3, 11, 12, 0, 0).unwrap();
        assert!(rules.time.matches(late));
        assert!(rules.time.matches(early));
        assert!(!rules.time.matches(noon));
    }

    #[test]
    fn test_time_rule_or_across_windows() {
        // 2026-03-09 is a Monday
        let monday_morning = Utc.with_ymd_and_hms(2026, 3, 9, 9, 0, 0).unwrap();
        let saturday_evening = Utc.with_ymd_and_hms(2026, 3, 14, 20, 0, 0).unwrap();
        let saturday_morning = Utc.with_ymd_and_hms(2026, 3, 14, 9, 0, 0).unwrap();

        let rules = TargetingRules::parse(
            1,
            None,
            Some(
                r#"[{"days":[1,2,3,4,5],"start_hour":8,"end_hour":12},
                    {"days":[6,7],"start_hour":18,"end_hour":24}]"#,
            ),
            None,
            None,
        );
        assert!(rules.time.matches(monday_morning));
        assert!(rules.time.matches(saturday_evening));
        assert!(!rules.time.matches(saturday_morning));
    }

    #[test]
    fn test_geo_and_device_case_insensitive() {
        let geo = GeoRule {
            countries: vec!["US".to_string()],
        };
        assert!(geo.matches(Some("us")));
        assert!(!geo.matches(Some("de")));
        assert!(!geo.matches(None));

        let device = DeviceRule {
            devices: vec!["mobile".to_string()],
        };
        assert!(device.matches(Some("Mobile")));
        assert!(!device.matches(Some("desktop")));
    }

    #[test]
    fn test_category_intersection() {
        let rule = CategoryRule {
            categories: vec![4, 9],
        };
        assert!(rule.matches(&[1, 9]));
        assert!(!rule.matches(&[1, 2]));
        assert!(!rule.matches(&[]));
        assert!(CategoryRule::default().matches(&[]));
    }
}
