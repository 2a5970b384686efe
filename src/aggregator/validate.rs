use std::collections::HashSet;
use std::fmt;

use crate::schema::Record;
use crate::util::{is_placeholder_phone, normalize_phone};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectReason {
    /// Phone does not normalize to exactly 10 digits
    PhoneLength,
    PlaceholderPhone,
    EmptyName,
    EmptyZone,
    NoPictures,
    MissingSource,
    /// Record names another source than the rest of its batch
    ForeignSource,
    /// An earlier record of the batch already carries this phone
    DuplicatePhone,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Self::PhoneLength => "phone is not 10 digits",
            Self::PlaceholderPhone => "placeholder phone",
            Self::EmptyName => "empty name",
            Self::EmptyZone => "empty zone",
            Self::NoPictures => "no pictures",
            Self::MissingSource => "missing source",
            Self::ForeignSource => "foreign source",
            Self::DuplicatePhone => "duplicate phone",
        };
        f.write_str(reason)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Rejected {
    pub record: Record,
    pub reasons: Vec<RejectReason>,
}

/// A batch split into storable and discarded records.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Validated {
    /// Source every accepted record belongs to
    pub source: Option<String>,
    /// Accepted records, phone normalized, in batch order
    pub accepted: Vec<Record>,
    pub rejected: Vec<Rejected>,
}

/// Record-level checks. Returns the normalized phone when the record
/// is storable on its own.
pub fn check_record(record: &Record) -> Result<String, Vec<RejectReason>> {
    let mut reasons = Vec::new();

    let phone = normalize_phone(&record.phone);
    if is_placeholder_phone(&record.phone) {
        reasons.push(RejectReason::PlaceholderPhone);
    } else if phone.is_none() {
        reasons.push(RejectReason::PhoneLength);
    }
    if record.name.is_empty() {
        reasons.push(RejectReason::EmptyName);
    }
    if record.place.is_empty() {
        reasons.push(RejectReason::EmptyZone);
    }
    if record.pics.is_empty() {
        reasons.push(RejectReason::NoPictures);
    }
    if record.source.is_empty() {
        reasons.push(RejectReason::MissingSource);
    }

    match phone {
        Some(phone) if reasons.is_empty() => Ok(phone),
        _ => Err(reasons),
    }
}

/// Partitions a batch.
///
/// On top of the record checks, a batch belongs to exactly one source:
/// the first non-empty source seen. Records naming any other source are
/// rejected, as are repeats of a phone already accepted.
pub fn validate_batch(batch: Vec<Record>) -> Validated {
    let source = batch
        .iter()
        .map(|r| r.source.as_str())
        .find(|s| !s.is_empty())
        .map(str::to_string);

    let mut seen = HashSet::new();
    let mut out = Validated {
        source,
        ..Validated::default()
    };

    for mut record in batch {
        let verdict = check_record(&record).and_then(|phone| {
            if out.source.as_deref() != Some(record.source.as_str()) {
                Err(vec![RejectReason::ForeignSource])
            } else if !seen.insert(phone.clone()) {
                Err(vec![RejectReason::DuplicatePhone])
            } else {
                Ok(phone)
            }
        });

        match verdict {
            Ok(phone) => {
                record.phone = phone;
                out.accepted.push(record);
            }
            Err(reasons) => out.rejected.push(Rejected { record, reasons }),
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, phone: &str, place: &str, pics: usize) -> Record {
        Record {
            name: name.into(),
            phone: phone.into(),
            place: place.into(),
            source: "https://site-a.com/list".into(),
            pics: (0..pics).map(|i| format!("https://cdn/{i}.jpg")).collect(),
            ..Record::default()
        }
    }

    #[test]
    fn valid_record_yields_normalized_phone() {
        assert_eq!(
            check_record(&record("Ana", "11-2233-4455", "Palermo", 1)),
            Ok("1122334455".to_string())
        );
    }

    #[test]
    fn every_failed_rule_is_reported() {
        let reasons = check_record(&record("", "123", "", 0)).unwrap_err();
        assert_eq!(
            reasons,
            vec![
                RejectReason::PhoneLength,
                RejectReason::EmptyName,
                RejectReason::EmptyZone,
                RejectReason::NoPictures,
            ]
        );
    }

    #[test]
    fn placeholder_phone_is_rejected_in_any_case() {
        let reasons = check_record(&record("Ana", "VACACIONES", "Palermo", 1)).unwrap_err();
        assert_eq!(reasons, vec![RejectReason::PlaceholderPhone]);
    }

    #[test]
    fn validity_matches_the_record_rules() {
        let phones = ["1122334455", "11 2233 4455", "112233445", "11223344556", "vacaciones", ""];
        let names = ["Ana", ""];
        let places = ["Palermo", ""];

        for phone in phones {
            for name in names {
                for place in places {
                    for pics in [0, 2] {
                        let r = record(name, phone, place, pics);
                        let expected = normalize_phone(phone).is_some()
                            && !is_placeholder_phone(phone)
                            && !name.is_empty()
                            && !place.is_empty()
                            && pics > 0;
                        assert_eq!(check_record(&r).is_ok(), expected, "{r:?}");
                    }
                }
            }
        }
    }

    #[test]
    fn batch_keeps_order_and_drops_duplicates() {
        let batch = vec![
            record("Ana", "1122334455", "Palermo", 1),
            record("Bad", "vacaciones", "Palermo", 1),
            record("Eva", "1199887766", "Belgrano", 2),
            record("Ana again", "11-2233-4455", "Palermo", 1),
        ];

        let out = validate_batch(batch);

        let names: Vec<_> = out.accepted.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["Ana", "Eva"]);
        assert_eq!(out.rejected.len(), 2);
        assert_eq!(out.rejected[1].reasons, vec![RejectReason::DuplicatePhone]);
        assert_eq!(out.source.as_deref(), Some("https://site-a.com/list"));
    }

    #[test]
    fn foreign_source_is_rejected() {
        let mut other = record("Eva", "1199887766", "Belgrano", 1);
        other.source = "https://site-b.com".into();

        let out = validate_batch(vec![record("Ana", "1122334455", "Palermo", 1), other]);

        assert_eq!(out.accepted.len(), 1);
        assert_eq!(out.rejected[0].reasons, vec![RejectReason::ForeignSource]);
    }

    #[test]
    fn empty_batch_has_no_source() {
        let out = validate_batch(Vec::new());
        assert!(out.source.is_none());
        assert!(out.accepted.is_empty());
    }
}
