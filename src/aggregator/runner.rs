use std::time::Duration;

use tokio::time::sleep;

use crate::metrics::RuntimeMetrics;
use crate::transport::{BATCH_QUEUE, Transport};

use super::{Aggregator, BatchOutcome};

/// Delay before touching the broker again after a receive error.
const RECEIVE_BACKOFF: Duration = Duration::from_secs(5);

/// ============================================================
/// Aggregator loop
/// ============================================================
///
/// Consumes the `providers` queue forever, one batch at a time.
///
/// - A batch that fails to decode or reconcile is logged and dropped.
/// - A broker error backs off, reconnects and keeps consuming.
///
/// Batches are handled strictly in arrival order; reconciliation of one
/// batch completes before the next is taken off the queue.
pub async fn run_aggregator(
    aggregator: &mut Aggregator,
    transport: &Transport,
    metrics: &RuntimeMetrics,
) {
    log::info!("Consuming batches from `{BATCH_QUEUE}`");

    loop {
        let payload = match transport.next_batch().await {
            Ok(payload) => payload,
            Err(e) => {
                RuntimeMetrics::incr(&metrics.transport_errors);
                log::warn!("Receive failed: {e} – reconnecting in {}s", RECEIVE_BACKOFF.as_secs());
                sleep(RECEIVE_BACKOFF).await;
                if let Err(e) = transport.reconnect().await {
                    log::error!("Reconnect failed: {e}");
                }
                continue;
            }
        };

        RuntimeMetrics::incr(&metrics.batches_received);

        match aggregator.handle_payload(&payload).await {
            Ok(BatchOutcome::Reconciled { source, report, .. }) => {
                log::debug!("Batch from {source} committed: {report:?}");
            }
            Ok(BatchOutcome::Skipped { .. }) => {}
            Err(e) => log::error!("Dropping batch: {e}"),
        }
    }
}
