use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;

use crate::schema::Record;

/// Why a detail page did not produce a record.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("invalid selector `{0}`")]
    Selector(String),

    #[error("invalid pattern: {0}")]
    Pattern(String),

    #[error("no data match: {0}")]
    NoMatch(&'static str),

    /// The page is well formed but the listing is deliberately skipped
    /// (e.g. a zone this source should not publish).
    #[error("ignored: {0}")]
    Ignored(String),
}

/// SourceAdapter is the capability each scraped site provides to the
/// generic collector runtime.
///
/// Each source implementation must:
/// - Name the listing-page elements that point to detail pages
/// - Pull a detail link out of one such element
/// - Turn a detail page into a `Record`
///
/// DESIGN GOALS:
/// - Zero site-specific logic outside adapters
/// - One adapter per source, selected by service name at startup
/// - Uniform output format across all sources
///
/// THREAD SAFETY:
/// - Must be Send + Sync
/// - Adapter instances are shared across pool workers
///
/// MUST NOT:
/// - Perform network I/O
/// - Panic on unexpected markup
///
pub trait SourceAdapter: Send + Sync {
    /// Canonical adapter name. Matches the service name in configuration.
    fn name(&self) -> &'static str;

    /// CSS selector matching one element per listed provider.
    fn listing_selector(&self) -> &'static str;

    /// Extracts the raw detail link of one listing element.
    ///
    /// RETURNS:
    /// - `Some(link)` (absolute or relative; resolved by the caller)
    /// - `None` when the element carries no usable link; the element is
    ///   then skipped and not counted as dispatched
    fn extract_link(&self, element: ElementRef<'_>) -> Option<String>;

    /// Extracts name, phone, zone and pictures from a detail page.
    ///
    /// `link` and `source` are stamped by the worker, adapters leave
    /// them empty.
    fn extract_details(&self, document: &Html) -> Result<Record, ExtractError>;
}

/// Parses a CSS selector, mapping failures into `ExtractError`.
pub fn selector(css: &str) -> Result<Selector, ExtractError> {
    Selector::parse(css).map_err(|e| ExtractError::Selector(format!("{css}: {e:?}")))
}

/// Text content of the first element matching `css`, trimmed.
pub fn first_text(document: &Html, css: &str) -> Result<Option<String>, ExtractError> {
    let sel = selector(css)?;
    Ok(document
        .select(&sel)
        .next()
        .map(|el| el.text().collect::<String>().trim().to_string()))
}

/// Inner HTML of the first element matching `css`.
pub fn first_inner_html(document: &Html, css: &str) -> Result<Option<String>, ExtractError> {
    let sel = selector(css)?;
    Ok(document.select(&sel).next().map(|el| el.inner_html()))
}

/// Borrows a lazily compiled pattern, surfacing a compile failure as
/// an extraction error instead of a panic.
pub fn compiled(
    re: &'static Lazy<Result<Regex, regex::Error>>,
) -> Result<&'static Regex, ExtractError> {
    Lazy::force(re)
        .as_ref()
        .map_err(|e| ExtractError::Pattern(e.to_string()))
}
