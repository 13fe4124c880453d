//! Invalidation cascade run after every confirmed mutation.

use crate::cache::service::CacheService;
use std::fmt;
use tracing::info;

/// Which cache entries a mutation makes stale
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationTarget {
    pub prefix: String,
    pub id: Option<String>,
}

impl InvalidationTarget {
    /// Everything under a namespace (listing composition changed)
    pub fn namespace(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            id: None,
        }
    }

    /// One entity's detail views plus the listings derived from its namespace
    pub fn entity(prefix: impl Into<String>, id: impl fmt::Display) -> Self {
        Self {
            prefix: prefix.into(),
            id: Some(id.to_string()),
        }
    }

    /// Key prefixes selected by this target
    pub fn prefixes(&self) -> Vec<String> {
        match &self.id {
            None => vec![self.prefix.clone()],
            Some(id) => vec![
                format!("{}.item.{}", self.prefix, id),
                format!("{}.list", self.prefix),
            ],
        }
    }
}

impl fmt::Display for InvalidationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.id {
            Some(id) => write!(f, "{}#{}", self.prefix, id),
            None => f.write_str(&self.prefix),
        }
    }
}

impl CacheService {
    /// Drop cached entries made stale by a successful write.
    ///
    /// Must be called right after the backend confirms the mutation. Running
    /// fetches under the same prefixes are detached so they cannot repopulate
    /// the store with pre-mutation data. Returns the number of entries removed.
    pub fn invalidate(&self, prefix: &str, id: Option<&str>) -> usize {
        let target = match id {
            Some(id) => InvalidationTarget::entity(prefix, id),
            None => InvalidationTarget::namespace(prefix),
        };
        self.invalidate_target(&target)
    }

    pub fn invalidate_target(&self, target: &InvalidationTarget) -> usize {
        let mut removed = 0;
        let mut detached = 0;
        for prefix in target.prefixes() {
            detached += self.flights.detach_prefix(&prefix);
            removed += self.store.delete_by_prefix(&prefix);
        }

        info!(
            target = %target,
            removed = removed,
            detached_fetches = detached,
            "Cache invalidated"
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_invalidation(namespace_of(&target.prefix), removed);
        }
        removed
    }
}

fn namespace_of(prefix: &str) -> &str {
    prefix.split('.').next().unwrap_or(prefix)
}
