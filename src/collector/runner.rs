use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::sleep;

use crate::metrics::RuntimeMetrics;
use crate::telemetry::{Point, Telemetry};
use crate::transport::{BatchSink, REFRESH_CHANNEL, Transport};

use super::listing::{Harvest, ListingFetcher};

/// Delay before re-subscribing after the refresh subscription died.
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(5);

/// One source's collector: a listing fetcher plus what a cycle reports
/// to.
pub struct SourceCollector {
    listing: ListingFetcher,
    source: String,
    run_id: String,
    telemetry: Telemetry,
    metrics: Arc<RuntimeMetrics>,
}

impl SourceCollector {
    pub fn new(
        listing: ListingFetcher,
        source: impl Into<String>,
        run_id: impl Into<String>,
        telemetry: Telemetry,
        metrics: Arc<RuntimeMetrics>,
    ) -> Self {
        Self {
            listing,
            source: source.into(),
            run_id: run_id.into(),
            telemetry,
            metrics,
        }
    }

    /// Runs one cycle and publishes its batch.
    ///
    /// GUARANTEES:
    /// - At most one batch is published per cycle
    /// - A cycle whose listing page fails publishes nothing
    /// - An empty batch is still published; the aggregator skips it
    pub async fn run_cycle(&self, sink: &dyn BatchSink) -> anyhow::Result<Harvest> {
        let started = Instant::now();
        RuntimeMetrics::incr(&self.metrics.cycles_run);

        let result = async {
            let harvest = self.listing.harvest().await?;
            sink.publish_batch(&harvest.records).await?;
            RuntimeMetrics::incr(&self.metrics.batches_published);
            anyhow::Ok(harvest)
        }
        .await;

        let mut point = Point::new("provider_process")
            .tag("source", self.source.as_str())
            .tag("run_uuid", self.run_id.as_str())
            .field("elapsed_ms", started.elapsed())
            .field("success", result.is_ok());
        if let Ok(harvest) = &result {
            point = point
                .field("records_sent", harvest.records.len())
                .field("matched", harvest.matched)
                .field("skipped", harvest.skipped)
                .field("failed", harvest.failed);
        }
        self.telemetry.record(point);

        match &result {
            Ok(harvest) => log::info!(
                "[{}] cycle done: {} records sent, {} failed, {} skipped",
                self.source,
                harvest.records.len(),
                harvest.failed,
                harvest.skipped
            ),
            Err(e) => {
                RuntimeMetrics::incr(&self.metrics.cycles_failed);
                log::error!("[{}] cycle failed: {e:#}", self.source);
            }
        }

        result
    }
}

/// ============================================================
/// Collector loop
/// ============================================================
///
/// Waits for refresh signals and runs one cycle per signal.
///
/// GUARANTEES:
/// - This loop never exits voluntarily
/// - A lost subscription is re-established after a delay
/// - A failed cycle never stops the loop
///
/// Signals arriving while a cycle runs are queued by the subscription
/// and handled one after another.
pub async fn run_collector(collector: &SourceCollector, transport: &Transport) {
    loop {
        match transport.subscribe_refresh().await {
            Ok(mut signals) => {
                log::info!("[{}] waiting for `{REFRESH_CHANNEL}` signals", collector.source);

                while signals.next().await.is_some() {
                    RuntimeMetrics::incr(&collector.metrics.refreshes_received);
                    let _ = collector.run_cycle(transport).await;
                }

                log::warn!("[{}] refresh subscription closed", collector.source);
            }
            Err(e) => {
                RuntimeMetrics::incr(&collector.metrics.transport_errors);
                log::warn!("[{}] subscribe failed: {e}", collector.source);
            }
        }

        sleep(RESUBSCRIBE_DELAY).await;
    }
}
