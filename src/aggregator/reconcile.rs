use thiserror::Error;

use crate::schema::Record;
use crate::store::{
    Dictionaries, NewPicture, NewProvider, ProviderStore, StoreError, StoreTransaction, TxOp,
};

#[derive(Debug, Error)]
#[error("reconciliation of `{source_name}` failed at {op}: {error}")]
pub struct ReconcileError {
    pub source_name: String,
    pub op: TxOp,
    #[source]
    pub error: StoreError,
}

fn at<'a>(source: &'a str, op: TxOp) -> impl FnOnce(StoreError) -> ReconcileError + 'a {
    move |error| ReconcileError {
        source_name: source.to_string(),
        op,
        error,
    }
}

/// What a committed reconciliation changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub deleted: u64,
    pub new_zones: usize,
    pub new_sources: usize,
    pub providers: u64,
    pub pictures: u64,
}

/// Replaces the stored providers of `source` with `accepted`.
///
/// Runs as one transaction:
///
/// 1. delete the source's providers (and their pictures)
/// 2. insert zones and sources not in `known`
/// 3. re-read both dictionaries inside the transaction
/// 4. insert providers, resolving zone and source ids
/// 5. read back phone → id for the source
/// 6. insert every picture against its provider id
///
/// Any failure rolls everything back; readers keep seeing the previous
/// state of the source. `accepted` must be non-empty and validated.
pub async fn reconcile(
    store: &dyn ProviderStore,
    known: &Dictionaries,
    source: &str,
    accepted: &[Record],
) -> Result<ReconcileReport, ReconcileError> {
    let mut tx = store.begin().await.map_err(at(source, TxOp::Begin))?;

    match apply(tx.as_mut(), known, source, accepted).await {
        Ok(report) => {
            tx.commit().await.map_err(at(source, TxOp::Commit))?;
            Ok(report)
        }
        Err(err) => {
            if let Err(e) = tx.rollback().await {
                log::warn!("Rollback for {source} failed: {e}");
            }
            Err(err)
        }
    }
}

async fn apply(
    tx: &mut dyn StoreTransaction,
    known: &Dictionaries,
    source: &str,
    accepted: &[Record],
) -> Result<ReconcileReport, ReconcileError> {
    let mut report = ReconcileReport::default();

    // A source missing from the cache may still exist if the last
    // dictionary refresh failed, so look it up before deleting.
    let existing = match known.sources.get(source) {
        Some(id) => Some(*id),
        None => tx
            .sources()
            .await
            .map_err(at(source, TxOp::ReadSources))?
            .get(source)
            .copied(),
    };
    if let Some(source_id) = existing {
        report.deleted = tx
            .delete_source_providers(source_id)
            .await
            .map_err(at(source, TxOp::DeleteProviders))?;
    }

    let new_zones = unknown_names(accepted.iter().map(|r| r.place.as_str()), |z| {
        known.zones.contains_key(z)
    });
    if !new_zones.is_empty() {
        tx.insert_zones(&new_zones)
            .await
            .map_err(at(source, TxOp::InsertZones))?;
    }
    report.new_zones = new_zones.len();

    let new_sources = unknown_names(accepted.iter().map(|r| r.source.as_str()), |s| {
        existing.is_some() || known.sources.contains_key(s)
    });
    if !new_sources.is_empty() {
        tx.insert_sources(&new_sources)
            .await
            .map_err(at(source, TxOp::InsertSources))?;
    }
    report.new_sources = new_sources.len();

    let zones = tx.zones().await.map_err(at(source, TxOp::ReadZones))?;
    let sources = tx.sources().await.map_err(at(source, TxOp::ReadSources))?;

    let source_id = *sources.get(source).ok_or_else(|| {
        at(source, TxOp::ReadSources)(StoreError::Unresolved {
            kind: "source",
            name: source.to_string(),
        })
    })?;

    let rows = accepted
        .iter()
        .map(|r| {
            let zone_id = *zones.get(&r.place).ok_or_else(|| StoreError::Unresolved {
                kind: "zone",
                name: r.place.clone(),
            })?;
            Ok(NewProvider {
                name: r.name.clone(),
                phone: r.phone.clone(),
                link: r.link.clone(),
                zone_id,
                source_id,
            })
        })
        .collect::<Result<Vec<_>, StoreError>>()
        .map_err(at(source, TxOp::ReadZones))?;

    report.providers = tx
        .insert_providers(&rows)
        .await
        .map_err(at(source, TxOp::InsertProviders))?;

    let ids = tx
        .provider_ids_by_phone(source_id)
        .await
        .map_err(at(source, TxOp::ReadProviderIds))?;

    let mut pictures = Vec::new();
    for record in accepted {
        let provider_id = *ids.get(&record.phone).ok_or_else(|| {
            at(source, TxOp::ReadProviderIds)(StoreError::Unresolved {
                kind: "provider",
                name: record.phone.clone(),
            })
        })?;

        pictures.extend(record.pics.iter().enumerate().map(|(position, url)| NewPicture {
            provider_id,
            url: url.clone(),
            position: i32::try_from(position).unwrap_or(i32::MAX),
        }));
    }

    report.pictures = tx
        .insert_pictures(&pictures)
        .await
        .map_err(at(source, TxOp::InsertPictures))?;

    Ok(report)
}

/// Distinct names, in first-seen order, that `known` does not cover.
fn unknown_names<'a>(
    names: impl Iterator<Item = &'a str>,
    known: impl Fn(&str) -> bool,
) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for name in names {
        if !known(name) && !out.iter().any(|n| n == name) {
            out.push(name.to_string());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn record(phone: &str, place: &str, pics: &[&str]) -> Record {
        Record {
            name: format!("n{phone}"),
            phone: phone.into(),
            place: place.into(),
            source: "s1".into(),
            pics: pics.iter().map(|p| p.to_string()).collect(),
            ..Record::default()
        }
    }

    #[tokio::test]
    async fn first_run_creates_dictionaries_and_rows() {
        let store = MemoryStore::new();
        let batch = [
            record("1111111111", "Palermo", &["a", "b"]),
            record("2222222222", "Belgrano", &["c"]),
        ];

        let report = reconcile(&store, &Dictionaries::default(), "s1", &batch)
            .await
            .unwrap();

        assert_eq!(
            report,
            ReconcileReport {
                deleted: 0,
                new_zones: 2,
                new_sources: 1,
                providers: 2,
                pictures: 3,
            }
        );
        let listed = store.list_providers().await.unwrap();
        assert_eq!(listed[0].pics, vec!["a", "b"]);
        assert_eq!(listed[1].place, "Belgrano");
    }

    #[tokio::test]
    async fn second_run_replaces_the_source() {
        let store = MemoryStore::new();
        let first = [record("1111111111", "Palermo", &["a"])];
        reconcile(&store, &Dictionaries::default(), "s1", &first)
            .await
            .unwrap();

        let known = Dictionaries::load(&store).await.unwrap();
        let second = [record("3333333333", "Palermo", &["z"])];
        let report = reconcile(&store, &known, "s1", &second).await.unwrap();

        assert_eq!(report.deleted, 1);
        assert_eq!(report.new_zones, 0);
        assert_eq!(report.new_sources, 0);
        let listed = store.list_providers().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].phone, "3333333333");
    }

    #[tokio::test]
    async fn stale_cache_still_deletes_existing_rows() {
        let store = MemoryStore::new();
        let batch = [record("1111111111", "Palermo", &["a"])];
        reconcile(&store, &Dictionaries::default(), "s1", &batch)
            .await
            .unwrap();

        let report = reconcile(&store, &Dictionaries::default(), "s1", &batch)
            .await
            .unwrap();

        assert_eq!(report.deleted, 1);
        assert_eq!(store.provider_counts().await["s1"], 1);
    }

    #[tokio::test]
    async fn failure_names_the_operation() {
        let store = MemoryStore::new();
        store.fail_next(TxOp::InsertPictures);

        let err = reconcile(
            &store,
            &Dictionaries::default(),
            "s1",
            &[record("1111111111", "Palermo", &["a"])],
        )
        .await
        .unwrap_err();

        assert_eq!(err.op, TxOp::InsertPictures);
        assert_eq!(err.source_name, "s1");
        assert!(store.zones().await.unwrap().is_empty());
    }

    #[test]
    fn unknown_names_are_distinct_and_ordered() {
        let names = unknown_names(["b", "a", "b", "c"].into_iter(), |n| n == "c");
        assert_eq!(names, vec!["b", "a"]);
    }
}
