//! Metrics emitted through the `metrics` facade
//!
//! The library never installs a recorder; embedding applications pick one.

use std::time::Duration;

/// Where a resolve request was satisfied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTier {
    Memory,
    Disk,
    Bundled,
    Network,
}

impl CacheTier {
    fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Disk => "disk",
            Self::Bundled => "bundled",
            Self::Network => "network",
        }
    }
}

/// Record which tier served a resolve request
pub fn record_resolved(tier: CacheTier) {
    metrics::counter!("model_depot_resolved_total",
        "tier" => tier.as_str()
    )
    .increment(1);
}

/// Record a failed resolve request
pub fn record_resolve_failure(key: &str) {
    metrics::counter!("model_depot_resolve_failures_total",
        "model" => key.to_string()
    )
    .increment(1);
}

/// Record a network task start (fresh, resumed or restarted)
pub fn record_download_started(key: &str, kind: &'static str) {
    metrics::counter!("model_depot_downloads_started_total",
        "model" => key.to_string(),
        "kind" => kind
    )
    .increment(1);
}

/// Record a terminal download outcome
pub fn record_download_finished(key: &str, outcome: &'static str) {
    metrics::counter!("model_depot_downloads_finished_total",
        "model" => key.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

/// Record an artifact install
pub fn record_install(key: &str) {
    metrics::counter!("model_depot_installs_total",
        "model" => key.to_string()
    )
    .increment(1);
}

/// Record how long a compile step took
pub fn record_compile_duration(elapsed: Duration) {
    metrics::histogram!("model_depot_compile_seconds").record(elapsed.as_secs_f64());
}

/// Update the in-memory cache size gauge
pub fn update_cached_models(count: usize) {
    metrics::gauge!("model_depot_cached_models").set(count as f64);
}

/// Update the active download gauge
pub fn update_active_downloads(count: usize) {
    metrics::gauge!("model_depot_active_downloads").set(count as f64);
}
