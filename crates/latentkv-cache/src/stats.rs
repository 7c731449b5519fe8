//! Lookup and maintenance counters kept by the cache engine.

use serde::Serialize;

/// Lookup and maintenance counters. Observability only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Recurrent lookups.
    pub total_queries: u64,
    /// Recurrent lookups served from a pool.
    pub hits: u64,
    /// Root lookups of continuing episodes.
    pub root_queries: u64,
    pub root_hits: u64,
    /// Contexts written to the init or recurrent pools.
    pub stores: u64,
    pub window_shrinks: u64,
    /// Index entries rejected because their slot was reused.
    pub stale_rejections: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        ratio(self.hits, self.total_queries)
    }

    pub fn root_hit_rate(&self) -> f64 {
        ratio(self.root_hits, self.root_queries)
    }
}

fn ratio(num: u64, den: u64) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}
