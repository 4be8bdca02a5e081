//! Store configuration.

use serde::{Deserialize, Serialize};

/// Behavior switches for a [`crate::core::store::DocStore`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Permit `$where` filters and `$mapReduce`.
    pub allow_js_queries: bool,
    /// Permit `$aggregate`.
    pub allow_aggregate_queries: bool,
    /// Reconstruct op ranges with a bounded forward read instead of a
    /// snapshot-anchored walk.
    pub get_ops_without_strict_linking: bool,
    /// Versions covered by each lenient read after the first.
    pub lenient_window: usize,
    /// Delay applied before each poll query.
    pub poll_delay_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            allow_js_queries: false,
            allow_aggregate_queries: false,
            get_ops_without_strict_linking: false,
            lenient_window: 8,
            poll_delay_ms: 0,
        }
    }
}

impl StoreConfig {
    /// Parses a JSON config document; absent keys take their defaults.
    pub fn from_json_str(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Enables every query form.
    pub fn allow_all_queries(mut self) -> Self {
        self.allow_js_queries = true;
        self.allow_aggregate_queries = true;
        self
    }

    /// Enables lenient op reconstruction.
    pub fn lenient(mut self) -> Self {
        self.get_ops_without_strict_linking = true;
        self
    }
}

/// Per-call read options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadOptions {
    /// Return the recoverable suffix instead of failing on a gap.
    pub ignore_missing_ops: bool,
    /// Include `m` on snapshots and ops.
    pub metadata: bool,
}
