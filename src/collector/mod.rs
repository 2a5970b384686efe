/// Collector module
///
/// This module groups all logic responsible for:
/// - Downloading a source's listing page
/// - Fanning detail links out to a worker pool
/// - Publishing the resulting batch to the aggregator
///
/// The collector layer sits between:
/// - Source adapters (provider1, provider2, …)
/// - The transport (`refresh` in, `providers` out)
///
/// Design notes:
/// - Site-specific extraction MUST NOT live here
/// - Every detail link yields exactly one outcome; a failed link is
///   counted, never fatal
pub mod fetch;
pub mod listing;
pub mod pool;
pub mod runner;

use std::sync::Arc;
use std::time::Duration;

pub use fetch::{FetchError, HttpFetcher, PageFetcher, StaticPages};
pub use listing::{CollectError, Harvest, LinkSelection, ListingFetcher, ListingSettings, select_links};
pub use pool::{CollectorPool, Outcome, PoolSettings};
pub use runner::{SourceCollector, run_collector};

use crate::config::ProviderConfig;
use crate::metrics::RuntimeMetrics;
use crate::retry::RetryPolicy;
use crate::sources::SourceAdapter;
use crate::telemetry::Telemetry;

/// Per-request timeout for listing and detail pages.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Wires a collector for one source from its configuration.
///
/// The pool is started here and lives as long as the collector.
pub fn build_collector(
    provider: &ProviderConfig,
    adapter: Arc<dyn SourceAdapter>,
    fetcher: Arc<dyn PageFetcher>,
    retry: RetryPolicy,
    run_id: &str,
    telemetry: Telemetry,
    metrics: Arc<RuntimeMetrics>,
) -> SourceCollector {
    let source = provider.source.identity().to_string();

    let pool = CollectorPool::start(
        PoolSettings {
            workers: provider.scrap_workers_count,
            capacity: provider.providers_count,
            source: source.clone(),
            retry,
        },
        fetcher.clone(),
        adapter.clone(),
        metrics.clone(),
    );

    let listing = ListingFetcher::new(
        fetcher,
        adapter,
        pool,
        ListingSettings {
            url: provider.source.url.clone(),
            domain: provider.source.domain.clone(),
            selector: provider.selector.clone(),
            max_elements: provider.providers_count,
        },
        metrics.clone(),
    );

    SourceCollector::new(listing, source, run_id, telemetry, metrics)
}
