use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use scraper::Html;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use crate::metrics::RuntimeMetrics;
use crate::retry::{RetryPolicy, retry};
use crate::schema::Record;
use crate::sources::{ExtractError, SourceAdapter};
use crate::util::resolve_link;

use super::fetch::PageFetcher;

/// Result of one detail link. Every dispatched link produces exactly
/// one outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Collected(Record),
    Failed { link: String, reason: String },
}

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub workers: usize,
    /// Bound of both the job and the result queue
    pub capacity: usize,
    /// Stamped on every collected record
    pub source: String,
    pub retry: RetryPolicy,
}

struct WorkerContext {
    fetcher: Arc<dyn PageFetcher>,
    adapter: Arc<dyn SourceAdapter>,
    source: String,
    retry: RetryPolicy,
    metrics: Arc<RuntimeMetrics>,
}

/// ============================================================
/// Detail worker pool
/// ============================================================
///
/// Fixed number of workers pulling links from one bounded queue and
/// pushing outcomes to another.
///
/// CONTRACT:
/// - `dispatch` waits while the job queue is full
/// - one outcome per dispatched link, in completion order
/// - a failing link never stops a worker
///
/// THREADING:
/// - `scraper::Html` is not `Send`; parsing happens in a sync helper and
///   the document never lives across an await
pub struct CollectorPool {
    jobs: mpsc::Sender<String>,
    results: Mutex<mpsc::Receiver<Outcome>>,
    workers: Vec<JoinHandle<()>>,
}

impl CollectorPool {
    pub fn start(
        settings: PoolSettings,
        fetcher: Arc<dyn PageFetcher>,
        adapter: Arc<dyn SourceAdapter>,
        metrics: Arc<RuntimeMetrics>,
    ) -> Self {
        let capacity = settings.capacity.max(1);
        let (jobs, job_rx) = mpsc::channel::<String>(capacity);
        let (result_tx, results) = mpsc::channel::<Outcome>(capacity);
        let job_rx = Arc::new(Mutex::new(job_rx));

        let ctx = Arc::new(WorkerContext {
            fetcher,
            adapter,
            source: settings.source,
            retry: settings.retry,
            metrics,
        });

        let workers = (0..settings.workers.max(1))
            .map(|_| tokio::spawn(worker(job_rx.clone(), result_tx.clone(), ctx.clone())))
            .collect();

        Self {
            jobs,
            results: Mutex::new(results),
            workers,
        }
    }

    /// Queues one detail link. Errors once every worker is gone.
    pub async fn dispatch(&self, link: String) -> Result<(), String> {
        self.jobs.send(link).await.map_err(|e| e.0)
    }

    /// Waits for exactly `expected` outcomes.
    ///
    /// Returns what was received so far as `Err` if the pool shuts down
    /// early.
    pub async fn collect(&self, expected: usize) -> Result<Vec<Outcome>, Vec<Outcome>> {
        let mut results = self.results.lock().await;
        let mut outcomes = Vec::with_capacity(expected);

        while outcomes.len() < expected {
            match results.recv().await {
                Some(outcome) => outcomes.push(outcome),
                None => return Err(outcomes),
            }
        }

        Ok(outcomes)
    }

    pub fn shutdown(&self) {
        for worker in &self.workers {
            worker.abort();
        }
    }
}

impl Drop for CollectorPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn worker(
    jobs: Arc<Mutex<mpsc::Receiver<String>>>,
    results: mpsc::Sender<Outcome>,
    ctx: Arc<WorkerContext>,
) {
    loop {
        let next = jobs.lock().await.recv().await;
        let Some(link) = next else { break };

        let outcome = AssertUnwindSafe(ctx.process(link.clone()))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Outcome::Failed {
                link,
                reason: "extraction panicked".into(),
            });

        if results.send(outcome).await.is_err() {
            break;
        }
    }
}

impl WorkerContext {
    async fn process(&self, link: String) -> Outcome {
        let page = retry(
            &self.retry,
            "detail fetch",
            || self.fetcher.fetch(&link),
            || async { Ok(()) },
        )
        .await;

        let body = match page {
            Ok(body) => body,
            Err(e) => {
                RuntimeMetrics::incr(&self.metrics.fetch_failures);
                log::warn!("[{}] fetch failed for {link}: {e}", self.adapter.name());
                return Outcome::Failed {
                    link,
                    reason: e.to_string(),
                };
            }
        };

        match extract(self.adapter.as_ref(), &body) {
            Ok(mut record) => {
                record.pics = record
                    .pics
                    .iter()
                    .filter_map(|pic| resolve_link(&link, pic))
                    .collect();
                record.link = link;
                record.source = self.source.clone();
                RuntimeMetrics::incr(&self.metrics.records_collected);
                Outcome::Collected(record)
            }
            Err(e) => {
                log::info!("[{}] skipping {link}: {e}", self.adapter.name());
                Outcome::Failed {
                    link,
                    reason: e.to_string(),
                }
            }
        }
    }
}

fn extract(adapter: &dyn SourceAdapter, body: &str) -> Result<Record, ExtractError> {
    let document = Html::parse_document(body);
    adapter.extract_details(&document)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::fetch::StaticPages;
    use scraper::ElementRef;

    struct NameOnly;

    impl SourceAdapter for NameOnly {
        fn name(&self) -> &'static str {
            "name-only"
        }

        fn listing_selector(&self) -> &'static str {
            "a"
        }

        fn extract_link(&self, element: ElementRef<'_>) -> Option<String> {
            element.value().attr("href").map(str::to_string)
        }

        fn extract_details(&self, document: &Html) -> Result<Record, ExtractError> {
            let name = crate::sources::adapter::first_text(document, "h1")?
                .ok_or(ExtractError::NoMatch("name"))?;
            if name == "boom" {
                panic!("adapter bug");
            }
            Ok(Record {
                name,
                pics: vec!["/img/1.jpg".into()],
                ..Record::default()
            })
        }
    }

    fn pool(pages: StaticPages) -> CollectorPool {
        CollectorPool::start(
            PoolSettings {
                workers: 3,
                capacity: 2,
                source: "site".into(),
                retry: RetryPolicy {
                    attempts: 1,
                    ..RetryPolicy::default()
                },
            },
            Arc::new(pages),
            Arc::new(NameOnly),
            RuntimeMetrics::shared(),
        )
    }

    #[tokio::test]
    async fn one_outcome_per_link() {
        let pages = StaticPages::new()
            .with_page("https://s.com/p/1", "<h1>Ana</h1>")
            .with_page("https://s.com/p/2", "<p>no heading</p>")
            .with_page("https://s.com/p/3", "<h1>boom</h1>");
        let pool = pool(pages);
        let links = ["https://s.com/p/1", "https://s.com/p/2", "https://s.com/p/3", "https://s.com/p/4"];

        let dispatch = async {
            for link in links {
                pool.dispatch(link.to_string()).await?;
            }
            Ok::<_, String>(())
        };
        let (dispatched, outcomes) = tokio::join!(dispatch, pool.collect(links.len()));
        dispatched.unwrap();
        let outcomes = outcomes.unwrap();

        assert_eq!(outcomes.len(), 4);
        let collected: Vec<&Record> = outcomes
            .iter()
            .filter_map(|o| match o {
                Outcome::Collected(r) => Some(r),
                Outcome::Failed { .. } => None,
            })
            .collect();
        assert_eq!(collected.len(), 1);
        assert_eq!(collected[0].link, "https://s.com/p/1");
        assert_eq!(collected[0].source, "site");
        assert_eq!(collected[0].pics, vec!["https://s.com/img/1.jpg"]);
    }

    #[tokio::test]
    async fn collect_of_nothing_returns_immediately() {
        let pool = pool(StaticPages::new());
        assert_eq!(pool.collect(0).await.unwrap(), Vec::new());
    }
}
