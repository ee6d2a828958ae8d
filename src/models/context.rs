use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashSet;

/// Per-request inputs to ad selection. Geo, device and segment membership are
/// resolved by the caller before selection starts.
#[derive(Debug, Clone, Deserialize)]
pub struct RequestContext {
    #[serde(default)]
    pub page_route: Option<String>,
    #[serde(default)]
    pub page_category_ids: Vec<i64>,
    #[serde(default)]
    pub country_code: Option<String>,
    #[serde(default)]
    pub device_type: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    /// Segments the visitor belongs to. `None` means membership could not be
    /// resolved, which excludes every segment-gated ad.
    #[serde(default)]
    pub segment_ids: Option<HashSet<i64>>,
    #[serde(default = "Utc::now")]
    pub now: DateTime<Utc>,
}

impl RequestContext {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            page_route: None,
            page_category_ids: Vec::new(),
            country_code: None,
            device_type: None,
            user_id: None,
            session_id: None,
            segment_ids: None,
            now,
        }
    }

    /// Sticky key for A/B bucketing and unique-event dedup: the user id when
    /// logged in, else the session id.
    pub fn visitor_key(&self) -> Option<&str> {
        [self.user_id.as_deref(), self.session_id.as_deref()]
            .into_iter()
            .flatten()
            .find(|key| !key.is_empty())
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}
