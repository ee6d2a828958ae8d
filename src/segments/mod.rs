//! Audience segment gating.

use crate::models::Ad;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::{debug, warn};

/// Answers whether a visitor belongs to a segment.
#[async_trait]
pub trait SegmentResolver: Send + Sync {
    async fn is_member(&self, visitor_key: &str, segment_id: i64) -> Result<bool>;
}

/// Resolver backed by a fixed visitor to segments table.
#[derive(Debug, Default, Clone)]
pub struct StaticSegments {
    members: HashMap<String, HashSet<i64>>,
}

impl StaticSegments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_member(mut self, visitor_key: &str, segment_id: i64) -> Self {
        self.members
            .entry(visitor_key.to_string())
            .or_default()
            .insert(segment_id);
        self
    }
}

#[async_trait]
impl SegmentResolver for StaticSegments {
    async fn is_member(&self, visitor_key: &str, segment_id: i64) -> Result<bool> {
        Ok(self
            .members
            .get(visitor_key)
            .is_some_and(|segments| segments.contains(&segment_id)))
    }
}

/// Resolve which of `segment_ids` the visitor belongs to.
///
/// Returns `None` when the resolver fails or does not answer within
/// `deadline`, so that segment-gated ads are left out instead of stalling the
/// request. A visitor without a key belongs to no segment.
pub async fn resolve_memberships(
    resolver: &dyn SegmentResolver,
    visitor_key: Option<&str>,
    segment_ids: &[i64],
    deadline: Duration,
) -> Option<HashSet<i64>> {
    let Some(visitor_key) = visitor_key else {
        return Some(HashSet::new());
    };

    let lookups = async {
        let mut members = HashSet::new();
        for &segment_id in segment_ids {
            if resolver.is_member(visitor_key, segment_id).await? {
                members.insert(segment_id);
            }
        }
        Ok::<_, anyhow::Error>(members)
    };

    match tokio::time::timeout(deadline, lookups).await {
        Ok(Ok(members)) => Some(members),
        Ok(Err(e)) => {
            warn!(error = %e, "segment resolution failed, gated ads excluded");
            None
        }
        Err(_) => {
            debug!("segment resolution timed out, gated ads excluded");
            None
        }
    }
}

/// Whether `ad` may be shown given the visitor's resolved memberships.
pub fn admits(ad: &Ad, memberships: Option<&HashSet<i64>>) -> bool {
    if ad.segment_ids.is_empty() {
        return true;
    }
    memberships.is_some_and(|members| ad.segment_ids.iter().any(|id| members.contains(id)))
}
