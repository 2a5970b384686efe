use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::sleep;

/// Runtime counters for one process.
///
/// Purpose:
/// - Track collector cycles and per-link outcomes
/// - Track batches through the transport
/// - Track validation and reconciliation results
///
/// Design:
/// - Lock-free (Atomics)
/// - Cheap to update
/// - Owned by the process context and shared through `Arc`,
///   never a global
#[derive(Default, Debug)]
pub struct RuntimeMetrics {
    // Collector
    pub cycles_run: AtomicUsize,
    pub cycles_failed: AtomicUsize,
    pub links_dispatched: AtomicUsize,
    pub links_skipped: AtomicUsize,
    pub records_collected: AtomicUsize,
    pub fetch_failures: AtomicUsize,

    // Transport
    pub batches_published: AtomicUsize,
    pub batches_received: AtomicUsize,
    pub refreshes_received: AtomicUsize,
    pub transport_errors: AtomicUsize,

    // Aggregator
    pub records_rejected: AtomicUsize,
    pub reconciliations: AtomicUsize,
    pub reconcile_failures: AtomicUsize,
    pub batches_skipped: AtomicUsize,

    // Telemetry
    pub telemetry_dropped: AtomicUsize,
}

impl RuntimeMetrics {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn incr(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicUsize, n: usize) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// One log line with every counter.
    pub fn summary(&self) -> String {
        let v = |c: &AtomicUsize| c.load(Ordering::Relaxed);
        format!(
            "cycles={} cycle_err={} dispatched={} skipped={} collected={} fetch_err={} \
             published={} received={} refresh={} transport_err={} \
             rejected={} reconciled={} reconcile_err={} empty={} telemetry_dropped={}",
            v(&self.cycles_run),
            v(&self.cycles_failed),
            v(&self.links_dispatched),
            v(&self.links_skipped),
            v(&self.records_collected),
            v(&self.fetch_failures),
            v(&self.batches_published),
            v(&self.batches_received),
            v(&self.refreshes_received),
            v(&self.transport_errors),
            v(&self.records_rejected),
            v(&self.reconciliations),
            v(&self.reconcile_failures),
            v(&self.batches_skipped),
            v(&self.telemetry_dropped),
        )
    }
}

/// Starts the periodic, low-noise metrics reporter.
pub fn spawn_reporter(metrics: Arc<RuntimeMetrics>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            sleep(every).await;
            log::info!("[METRICS] {}", metrics.summary());
        }
    })
}
