/// Utility helpers shared by collectors and the aggregator.
///
/// This module contains:
/// - Link resolution against a source domain
/// - Phone normalisation
///
/// IMPORTANT:
/// - No site-specific extraction logic should live here.
/// - This module must remain lightweight and deterministic.
///
use url::Url;

/// Phone values some sites publish instead of a real number.
pub const PLACEHOLDER_PHONES: [&str; 1] = ["vacaciones"];

/// Resolve a candidate link into an absolute http(s) URL.
///
/// Examples:
/// - ("https://site.com", "/p/12")           -> "https://site.com/p/12"
/// - ("https://site.com", "https://x.com/a") -> "https://x.com/a"
/// - ("https://site.com", "")                -> None
/// - ("https://site.com", "javascript:;")    -> None
///
/// Relative paths are joined onto the configured source domain.
pub fn resolve_link(domain: &str, raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(url) = Url::parse(raw) {
        return matches!(url.scheme(), "http" | "https").then(|| url.into());
    }

    let base = Url::parse(domain).ok()?;
    base.join(raw).ok().map(Into::into)
}

/// Normalise a phone into exactly ten digits.
///
/// Accepted separators: space, tab, '-', '.', '(' and ')'.
/// A leading "+549" country/mobile prefix is dropped.
///
/// Returns `None` if anything other than ten digits remains.
///
/// Examples:
/// - "11-2233-4455"        -> Some("1122334455")
/// - "+54 9 11 2233 4455"  -> Some("1122334455")
/// - "12345"               -> None
/// - "vacaciones"          -> None
///
pub fn normalize_phone(raw: &str) -> Option<String> {
    let compact: String = raw
        .trim()
        .chars()
        .filter(|c| !matches!(c, ' ' | '\t' | '-' | '.' | '(' | ')'))
        .collect();

    let digits = compact.strip_prefix("+549").unwrap_or(&compact);

    (digits.len() == 10 && digits.chars().all(|c| c.is_ascii_digit()))
        .then(|| digits.to_string())
}

/// True if the raw phone is a known placeholder.
pub fn is_placeholder_phone(raw: &str) -> bool {
    let raw = raw.trim();
    PLACEHOLDER_PHONES
        .iter()
        .any(|placeholder| raw.eq_ignore_ascii_case(placeholder))
}
