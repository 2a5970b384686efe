//! Aggregator: turns received batches into stored providers.
//!
//! For every batch:
//! - decode the payload
//! - validate and partition the records
//! - reconcile the accepted records of the batch source in one
//!   transaction
//! - refresh the cached zone/source dictionaries after a commit
//!
//! A batch that fails anywhere is logged and dropped; the next batch is
//! processed normally.

pub mod reconcile;
pub mod runner;
pub mod validate;

pub use reconcile::{ReconcileError, ReconcileReport, reconcile};
pub use runner::run_aggregator;
pub use validate::{RejectReason, Rejected, Validated, check_record, validate_batch};

use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;

use crate::metrics::RuntimeMetrics;
use crate::schema::{Record, decode_batch};
use crate::store::{Dictionaries, ProviderStore, StoreError};
use crate::telemetry::{Point, Telemetry};

#[derive(Debug, Error)]
pub enum AggregateError {
    #[error("undecodable batch: {0}")]
    Decode(#[from] serde_json::Error),

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    Reconciled {
        source: String,
        received: usize,
        rejected: usize,
        report: ReconcileReport,
    },

    /// Nothing valid in the batch; the store was not touched.
    Skipped { received: usize, rejected: usize },
}

pub struct Aggregator {
    store: Arc<dyn ProviderStore>,
    dictionaries: Dictionaries,
    telemetry: Telemetry,
    metrics: Arc<RuntimeMetrics>,
    run_id: String,
}

impl Aggregator {
    /// Loads the dictionaries; failure here is fatal for startup.
    pub async fn new(
        store: Arc<dyn ProviderStore>,
        telemetry: Telemetry,
        metrics: Arc<RuntimeMetrics>,
        run_id: impl Into<String>,
    ) -> Result<Self, StoreError> {
        let dictionaries = Dictionaries::load(store.as_ref()).await?;
        log::info!(
            "Loaded {} zones and {} sources",
            dictionaries.zones.len(),
            dictionaries.sources.len()
        );

        Ok(Self {
            store,
            dictionaries,
            telemetry,
            metrics,
            run_id: run_id.into(),
        })
    }

    pub fn dictionaries(&self) -> &Dictionaries {
        &self.dictionaries
    }

    /// Decodes and handles one transported batch.
    pub async fn handle_payload(&mut self, payload: &[u8]) -> Result<BatchOutcome, AggregateError> {
        let batch = decode_batch(payload)?;
        self.handle_batch(batch).await
    }

    pub async fn handle_batch(&mut self, batch: Vec<Record>) -> Result<BatchOutcome, AggregateError> {
        let started = Instant::now();
        let received = batch.len();

        let validated = validate_batch(batch);
        let rejected = validated.rejected.len();
        RuntimeMetrics::add(&self.metrics.records_rejected, rejected);

        for r in &validated.rejected {
            let reasons: Vec<String> = r.reasons.iter().map(ToString::to_string).collect();
            log::debug!("Rejected {:?} from {}: {}", r.record.phone, r.record.link, reasons.join(", "));
        }

        let source = match validated.source {
            Some(source) if !validated.accepted.is_empty() => source,
            _ => {
                RuntimeMetrics::incr(&self.metrics.batches_skipped);
                log::info!("Batch of {received} records has nothing to store ({rejected} rejected)");
                return Ok(BatchOutcome::Skipped { received, rejected });
            }
        };

        let result = reconcile(
            self.store.as_ref(),
            &self.dictionaries,
            &source,
            &validated.accepted,
        )
        .await;

        self.telemetry.record(
            Point::new("core_process")
                .tag("source", source.as_str())
                .tag("run_uuid", self.run_id.as_str())
                .field("elapsed_ms", started.elapsed())
                .field("received", received)
                .field("accepted", validated.accepted.len())
                .field("rejected", rejected)
                .field("success", result.is_ok()),
        );

        let report = match result {
            Ok(report) => report,
            Err(e) => {
                RuntimeMetrics::incr(&self.metrics.reconcile_failures);
                return Err(e.into());
            }
        };

        RuntimeMetrics::incr(&self.metrics.reconciliations);
        log::info!(
            "Reconciled {source}: -{} +{} providers, {} pictures, {} new zones ({rejected} rejected)",
            report.deleted,
            report.providers,
            report.pictures,
            report.new_zones,
        );

        self.refresh_dictionaries().await;

        Ok(BatchOutcome::Reconciled {
            source,
            received,
            rejected,
            report,
        })
    }

    /// Reloads both dictionaries. On failure the previous ones stay.
    async fn refresh_dictionaries(&mut self) {
        match Dictionaries::load(self.store.as_ref()).await {
            Ok(fresh) => self.dictionaries = fresh,
            Err(e) => log::warn!("Keeping cached dictionaries, refresh failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, TxOp};

    fn record(phone: &str, place: &str) -> Record {
        Record {
            name: "Ana".into(),
            phone: phone.into(),
            place: place.into(),
            source: "s1".into(),
            pics: vec!["https://cdn/1.jpg".into()],
            ..Record::default()
        }
    }

    async fn aggregator(store: &MemoryStore) -> Aggregator {
        let metrics = RuntimeMetrics::shared();
        Aggregator::new(
            Arc::new(store.clone()),
            Telemetry::disabled(metrics.clone()),
            metrics,
            "test-run",
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn commit_refreshes_dictionaries() {
        let store = MemoryStore::new();
        let mut agg = aggregator(&store).await;

        let outcome = agg.handle_batch(vec![record("1122334455", "Palermo")]).await.unwrap();

        assert!(matches!(outcome, BatchOutcome::Reconciled { rejected: 0, .. }));
        assert!(agg.dictionaries().zones.contains_key("Palermo"));
        assert!(agg.dictionaries().sources.contains_key("s1"));
    }

    #[tokio::test]
    async fn all_rejected_batch_is_skipped() {
        let store = MemoryStore::new();
        let mut agg = aggregator(&store).await;

        let outcome = agg.handle_batch(vec![record("123", "Palermo")]).await.unwrap();

        assert_eq!(outcome, BatchOutcome::Skipped { received: 1, rejected: 1 });
        assert!(store.zones().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn garbage_payload_is_a_decode_error() {
        let store = MemoryStore::new();
        let mut agg = aggregator(&store).await;

        assert!(matches!(
            agg.handle_payload(b"{not json").await,
            Err(AggregateError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn failed_batch_leaves_dictionaries_alone() {
        let store = MemoryStore::new();
        let mut agg = aggregator(&store).await;
        store.fail_next(TxOp::InsertProviders);

        let err = agg.handle_batch(vec![record("1122334455", "Palermo")]).await.unwrap_err();

        assert!(matches!(err, AggregateError::Reconcile(ReconcileError { op: TxOp::InsertProviders, .. })));
        assert!(agg.dictionaries().zones.is_empty());
    }
}
