use serde::{Deserialize, Serialize};

/// Named audience rule-set. Membership is decided outside the engine by a
/// `SegmentResolver`; `rules` is opaque here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdSegment {
    pub id: i64,
    pub name: String,
    pub slug: String,
    pub segment_type: String,
    pub rules: serde_json::Value,
    pub is_active: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewSegment {
    pub name: String,
    pub slug: String,
    #[serde(default = "NewSegment::default_type")]
    pub segment_type: String,
    #[serde(default)]
    pub rules: serde_json::Value,
    pub is_active: bool,
}

impl NewSegment {
    fn default_type() -> String {
        "custom".to_string()
    }

    pub fn new(slug: &str) -> Self {
        Self {
            name: slug.to_string(),
            slug: slug.to_string(),
            segment_type: Self::default_type(),
            rules: serde_json::Value::Null,
            is_active: true,
        }
    }
}
