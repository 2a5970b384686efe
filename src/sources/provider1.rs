use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html};

use crate::schema::Record;

use super::adapter::{ExtractError, SourceAdapter, compiled, first_inner_html, selector};
use super::pics::{PicRule, collect_pics};

/// Article-style listing.
///
/// Every provider is an `<article>` on the listing page. The detail
/// page title packs everything into one heading:
///
/// ```text
/// <h1 class="page-title">Ana Lopez 25<img …>Palermo<span>11-2233-4455</span></h1>
/// ```
///
/// Pictures live in `div#galeria figure`.
pub struct Provider1Adapter;

/// Zones this source lists but that are out of coverage.
const IGNORED_ZONES: [&str; 3] = ["Zona Norte", "Zona Oeste", "Zona Sur"];

static TITLE: Lazy<Result<Regex, regex::Error>> = Lazy::new(|| {
    Regex::new(
        r"^\s*([\p{L}\s.]+?)\s+\d{2}\s*<img[^>]*>\s*([\p{L}\s]+?)\s*<[\w\W]*?>\s*([0-9][0-9\- ]{6,})",
    )
});

static PIC_SRC: Lazy<Result<Regex, regex::Error>> =
    Lazy::new(|| Regex::new(r#"src="([^"]+)""#));

impl SourceAdapter for Provider1Adapter {
    fn name(&self) -> &'static str {
        "provider1"
    }

    fn listing_selector(&self) -> &'static str {
        "article"
    }

    fn extract_link(&self, element: ElementRef<'_>) -> Option<String> {
        let anchor = selector("a").ok()?;
        element
            .select(&anchor)
            .next()?
            .value()
            .attr("href")
            .map(str::to_string)
    }

    fn extract_details(&self, document: &Html) -> Result<Record, ExtractError> {
        let title = first_inner_html(document, "article h1.page-title")?
            .ok_or(ExtractError::NoMatch("page title"))?;

        let caps = compiled(&TITLE)?
            .captures(&title)
            .ok_or(ExtractError::NoMatch("title layout"))?;

        let field = |i: usize| caps.get(i).map_or("", |m| m.as_str()).trim().to_string();
        let (name, place, phone) = (field(1), field(2), field(3));

        if IGNORED_ZONES.contains(&place.as_str()) {
            return Err(ExtractError::Ignored(format!("zone {place}")));
        }

        let pics = collect_pics(
            document,
            &PicRule {
                css: "div#galeria figure",
                pattern: Some(compiled(&PIC_SRC)?),
                must_contain: None,
            },
        )?;

        Ok(Record {
            name,
            phone: phone.replace(['-', ' '], ""),
            place,
            pics,
            ..Record::default()
        })
    }
}
