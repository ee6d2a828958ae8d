use serde::{Deserialize, Serialize};

/// A named slot on a page where ads may render.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdPlacement {
    pub id: i64,
    pub name: String,
    pub slug: String,
    pub placement_type: String,
    pub position: String,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub is_active: bool,
    /// Empty means every page, otherwise a whitelist of page routes.
    pub allowed_pages: Vec<String>,
}

impl AdPlacement {
    pub fn allows_page(&self, page_route: Option<&str>) -> bool {
        if self.allowed_pages.is_empty() {
            return true;
        }
        match page_route {
            Some(route) => self.allowed_pages.iter().any(|page| page == route),
            None => false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewPlacement {
    pub name: String,
    pub slug: String,
    #[serde(default = "NewPlacement::default_type")]
    pub placement_type: String,
    #[serde(default = "NewPlacement::default_position")]
    pub position: String,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub is_active: bool,
    #[serde(default)]
    pub allowed_pages: Vec<String>,
}

impl NewPlacement {
    fn default_type() -> String {
        "banner".to_string()
    }

    fn default_position() -> String {
        "sidebar".to_string()
    }

    pub fn new(slug: &str) -> Self {
        Self {
            name: slug.to_string(),
            slug: slug.to_string(),
            placement_type: Self::default_type(),
            position: Self::default_position(),
            width: None,
            height: None,
            is_active: true,
            allowed_pages: Vec::new(),
        }
    }
}
