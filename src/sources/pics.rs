use regex::Regex;
use scraper::Html;

use super::adapter::{ExtractError, selector};

/// How a source exposes its pictures on a detail page.
pub struct PicRule<'a> {
    /// Elements holding one picture each
    pub css: &'a str,

    /// When set, the first capture group of this pattern, run over the
    /// element's HTML, is the picture URL. Otherwise the element's
    /// `src` attribute is used.
    pub pattern: Option<&'a Regex>,

    /// Keeps only URLs containing this fragment
    pub must_contain: Option<&'a str>,
}

/// Collects picture URLs in document order.
///
/// Elements without a match are skipped, never an error.
pub fn collect_pics(document: &Html, rule: &PicRule<'_>) -> Result<Vec<String>, ExtractError> {
    let sel = selector(rule.css)?;
    let mut pics = Vec::new();

    for element in document.select(&sel) {
        let found = match rule.pattern {
            Some(pattern) => pattern
                .captures(&element.html())
                .and_then(|caps| caps.get(1))
                .map(|m| m.as_str().to_string()),
            None => element.value().attr("src").map(str::to_string),
        };

        let Some(pic) = found.map(|p| p.trim().to_string()).filter(|p| !p.is_empty()) else {
            log::debug!("no picture in element: {}", element.html());
            continue;
        };

        if rule.must_contain.is_none_or(|fragment| pic.contains(fragment)) {
            pics.push(pic);
        }
    }

    Ok(pics)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"
        <div id="galeria">
          <figure><img src="https://cdn.site.com/a.jpg"></figure>
          <figure><img data-x="1"></figure>
          <figure><img src="/thumbs/b.jpg"></figure>
        </div>
        <center><img src="https://cdn.site.com/c.jpg"></center>
        <center><img src="https://ads.other.com/banner.gif"></center>
    "#;

    #[test]
    fn pattern_rule_reads_capture_group() {
        let doc = Html::parse_document(PAGE);
        let src = Regex::new(r#"src="([^"]+)""#).unwrap();

        let pics = collect_pics(
            &doc,
            &PicRule {
                css: "div#galeria figure",
                pattern: Some(&src),
                must_contain: None,
            },
        )
        .unwrap();

        assert_eq!(pics, vec!["https://cdn.site.com/a.jpg", "/thumbs/b.jpg"]);
    }

    #[test]
    fn attribute_rule_filters_by_fragment() {
        let doc = Html::parse_document(PAGE);

        let pics = collect_pics(
            &doc,
            &PicRule {
                css: "center > img",
                pattern: None,
                must_contain: Some("cdn.site.com"),
            },
        )
        .unwrap();

        assert_eq!(pics, vec!["https://cdn.site.com/c.jpg"]);
    }

    #[test]
    fn bad_selector_is_an_error() {
        let doc = Html::parse_document(PAGE);
        let rule = PicRule {
            css: "div[",
            pattern: None,
            must_contain: None,
        };
        assert!(matches!(collect_pics(&doc, &rule), Err(ExtractError::Selector(_))));
    }
}
