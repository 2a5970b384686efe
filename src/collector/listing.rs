use std::sync::Arc;

use scraper::Html;
use thiserror::Error;

use crate::metrics::RuntimeMetrics;
use crate::schema::Record;
use crate::sources::adapter::selector;
use crate::sources::{ExtractError, SourceAdapter};
use crate::util::resolve_link;

use super::fetch::{FetchError, PageFetcher};
use super::pool::{CollectorPool, Outcome};

#[derive(Debug, Error)]
pub enum CollectError {
    #[error("listing page unavailable: {0}")]
    Listing(#[from] FetchError),

    #[error("listing page unusable: {0}")]
    Parse(#[from] ExtractError),

    #[error("worker pool closed after {received} of {expected} results")]
    PoolClosed { expected: usize, received: usize },
}

/// Where and how to read the listing page.
#[derive(Debug, Clone)]
pub struct ListingSettings {
    pub url: String,
    /// Base for relative links
    pub domain: String,
    /// Overrides the adapter's listing selector
    pub selector: Option<String>,
    /// Cap on listing elements considered per cycle
    pub max_elements: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkSelection {
    pub links: Vec<String>,
    /// Listing elements considered (after the cap)
    pub matched: usize,
    /// Elements without a usable link
    pub skipped: usize,
}

/// Outcome of one listing cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Harvest {
    pub records: Vec<Record>,
    pub matched: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Picks detail links out of a listing page.
///
/// Only the first `max_elements` matches are considered. An element
/// whose link is missing or does not resolve to http(s) is skipped and
/// never dispatched.
pub fn select_links(
    html: &str,
    css: &str,
    max_elements: usize,
    domain: &str,
    adapter: &dyn SourceAdapter,
) -> Result<LinkSelection, ExtractError> {
    let document = Html::parse_document(html);
    let sel = selector(css)?;
    let mut selection = LinkSelection::default();

    for element in document.select(&sel).take(max_elements) {
        selection.matched += 1;
        match adapter
            .extract_link(element)
            .and_then(|raw| resolve_link(domain, &raw))
        {
            Some(link) => selection.links.push(link),
            None => selection.skipped += 1,
        }
    }

    Ok(selection)
}

/// Runs listing cycles for one source against a worker pool.
pub struct ListingFetcher {
    fetcher: Arc<dyn PageFetcher>,
    adapter: Arc<dyn SourceAdapter>,
    pool: CollectorPool,
    settings: ListingSettings,
    metrics: Arc<RuntimeMetrics>,
}

impl ListingFetcher {
    pub fn new(
        fetcher: Arc<dyn PageFetcher>,
        adapter: Arc<dyn SourceAdapter>,
        pool: CollectorPool,
        settings: ListingSettings,
        metrics: Arc<RuntimeMetrics>,
    ) -> Self {
        Self {
            fetcher,
            adapter,
            pool,
            settings,
            metrics,
        }
    }

    /// Fetches the listing, dispatches every detail link and waits for
    /// all of their outcomes.
    ///
    /// Dispatch and collection run concurrently so a full job queue
    /// cannot stall the cycle.
    pub async fn harvest(&self) -> Result<Harvest, CollectError> {
        let page = self.fetcher.fetch(&self.settings.url).await?;

        let css = self
            .settings
            .selector
            .as_deref()
            .unwrap_or_else(|| self.adapter.listing_selector());
        let selection = select_links(
            &page,
            css,
            self.settings.max_elements,
            &self.settings.domain,
            self.adapter.as_ref(),
        )?;
        let LinkSelection {
            links,
            matched,
            skipped,
        } = selection;

        let expected = links.len();
        RuntimeMetrics::add(&self.metrics.links_dispatched, expected);
        RuntimeMetrics::add(&self.metrics.links_skipped, skipped);
        log::info!(
            "[{}] {matched} listing elements, {expected} links dispatched, {skipped} skipped",
            self.adapter.name(),
        );

        let dispatch = async {
            for (sent, link) in links.into_iter().enumerate() {
                if self.pool.dispatch(link).await.is_err() {
                    return Err(CollectError::PoolClosed {
                        expected,
                        received: sent,
                    });
                }
            }
            Ok(())
        };
        let collect = async {
            self.pool
                .collect(expected)
                .await
                .map_err(|partial| CollectError::PoolClosed {
                    expected,
                    received: partial.len(),
                })
        };

        let ((), outcomes) = tokio::try_join!(dispatch, collect)?;

        let mut harvest = Harvest {
            matched,
            skipped,
            ..Harvest::default()
        };
        for outcome in outcomes {
            match outcome {
                Outcome::Collected(record) => harvest.records.push(record),
                Outcome::Failed { .. } => harvest.failed += 1,
            }
        }

        Ok(harvest)
    }
}
