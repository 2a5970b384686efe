use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html};

use crate::schema::Record;

use super::adapter::{ExtractError, SourceAdapter, compiled, first_text};
use super::pics::{PicRule, collect_pics};

/// Table-layout listing.
///
/// The listing page shows one thumbnail per provider, wrapped in an
/// anchor to the profile. Detail pages are nested tables with name,
/// zone and phone in fixed rows.
///
/// Zone text is free-form ("Zona de Belgrano R", "Palermo - CABA", …)
/// and gets normalised before it reaches the zone dictionary.
pub struct Provider2Adapter;

/// Only anchors to this path are profile pages.
const PROFILE_PATH: &str = ".com/perl/site2/individual";

const NAME_CSS: &str = "td:nth-child(2) > center > table > tbody > tr > td > table > tbody > tr:nth-child(3) > td > center > b > div";
const PLACE_CSS: &str = "td:nth-child(2) > center > table > tbody > tr > td > table > tbody > tr:nth-child(5) > td > center > div";
const PHONE_CSS: &str = "tr:nth-child(7) > td > center > div";

const IGNORED_ZONES: [&str; 2] = ["norte", "Oeste y CABA"];

/// Applied in order; every matching alias rewrites the zone once.
const ZONE_ALIASES: [(&str, &str); 6] = [
    (" CABA", ""),
    ("las cañitas", "Palermo"),
    ("Las Cañitas", "Palermo"),
    ("Palermo -", "Palermo"),
    ("Belgrano R", "Belgrano"),
    ("Belgrano ", "Belgrano"),
];

static ZONA_DE: Lazy<Result<Regex, regex::Error>> =
    Lazy::new(|| Regex::new(r"Zona de ([\p{L}\s]*)"));

static ZONA: Lazy<Result<Regex, regex::Error>> = Lazy::new(|| Regex::new(r"Zona ([\p{L}\s]*)"));

impl SourceAdapter for Provider2Adapter {
    fn name(&self) -> &'static str {
        "provider2"
    }

    fn listing_selector(&self) -> &'static str {
        "tbody > tr:nth-child(1) > td > center > a > img"
    }

    fn extract_link(&self, element: ElementRef<'_>) -> Option<String> {
        let parent = ElementRef::wrap(element.parent()?)?;
        let href = parent.value().attr("href")?;
        href.contains(PROFILE_PATH).then(|| href.to_string())
    }

    fn extract_details(&self, document: &Html) -> Result<Record, ExtractError> {
        let place = normalize_zone(&first_text(document, PLACE_CSS)?.unwrap_or_default())?;

        let phone = first_text(document, PHONE_CSS)?
            .unwrap_or_default()
            .replacen("Cel", "", 1)
            .trim()
            .to_string();

        let pics = collect_pics(
            document,
            &PicRule {
                css: "center > img",
                pattern: None,
                must_contain: None,
            },
        )?;

        Ok(Record {
            name: first_text(document, NAME_CSS)?.unwrap_or_default(),
            phone,
            place,
            pics,
            ..Record::default()
        })
    }
}

/// Reduces the zone cell to a dictionary-friendly zone name.
fn normalize_zone(raw: &str) -> Result<String, ExtractError> {
    let mut zone = raw.trim().to_string();

    let prefixes: [(&str, &'static Lazy<Result<Regex, regex::Error>>); 2] =
        [("Zona de ", &ZONA_DE), ("Zona ", &ZONA)];

    for (marker, re) in prefixes {
        if zone.contains(marker) {
            zone = compiled(re)?
                .captures(&zone)
                .and_then(|caps| caps.get(1))
                .map(|m| m.as_str().trim().to_string())
                .ok_or(ExtractError::NoMatch("zone"))?;
        }
    }

    if IGNORED_ZONES.contains(&zone.as_str()) {
        return Err(ExtractError::Ignored(format!("zone {zone}")));
    }

    for (from, to) in ZONE_ALIASES {
        if zone.contains(from) {
            zone = zone.replacen(from, to, 1);
        }
    }

    Ok(zone.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::adapter::selector;

    fn detail(name: &str, place: &str, phone: &str) -> Html {
        let filler = "<tr><td>-</td></tr>";
        Html::parse_document(&format!(
            r#"<table><tr><td>left</td><td><center><table><tr><td><table>
                 {filler}{filler}
                 <tr><td><center><b><div>{name}</div></b></center></td></tr>
                 {filler}
                 <tr><td><center><div>{place}</div></center></td></tr>
                 {filler}
                 <tr><td><center><div>{phone}</div></center></td></tr>
               </table></td></tr></table>
               <center><img src="https://img.site.com/1.jpg"></center>
               </center></td></tr></table>"#
        ))
    }

    #[test]
    fn extracts_table_fields() {
        let doc = detail("Luz", "Zona de Belgrano R", "Cel  11-2233-4455");

        let record = Provider2Adapter.extract_details(&doc).unwrap();

        assert_eq!(record.name, "Luz");
        assert_eq!(record.place, "Belgrano");
        assert_eq!(record.phone, "11-2233-4455");
        assert_eq!(record.pics, vec!["https://img.site.com/1.jpg"]);
    }

    #[test]
    fn zone_aliases_collapse_to_canonical_names() {
        assert_eq!(normalize_zone("Las Cañitas").unwrap(), "Palermo");
        assert_eq!(normalize_zone("Palermo - Soho").unwrap(), "Palermo Soho");
        assert_eq!(normalize_zone("Zona Recoleta CABA").unwrap(), "Recoleta");
        assert_eq!(normalize_zone("Caballito").unwrap(), "Caballito");
    }

    #[test]
    fn out_of_coverage_zones_are_ignored() {
        assert!(matches!(normalize_zone("Zona norte"), Err(ExtractError::Ignored(_))));
        assert!(matches!(normalize_zone("Oeste y CABA"), Err(ExtractError::Ignored(_))));
    }

    #[test]
    fn only_profile_anchors_yield_links() {
        let page = Html::parse_document(
            r#"<table><tbody><tr><td><center>
                 <a href="https://x.com/perl/site2/individual?id=3"><img src="a.jpg"></a>
               </center></td></tr></tbody></table>
               <table><tbody><tr><td><center>
                 <a href="https://x.com/promo"><img src="b.jpg"></a>
               </center></td></tr></tbody></table>"#,
        );
        let sel = selector(Provider2Adapter.listing_selector()).unwrap();
        let links: Vec<_> = page
            .select(&sel)
            .map(|el| Provider2Adapter.extract_link(el))
            .collect();

        assert_eq!(
            links,
            vec![Some("https://x.com/perl/site2/individual?id=3".to_string()), None]
        );
    }
}
