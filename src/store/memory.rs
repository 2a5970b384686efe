use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::schema::ShowcaseProvider;

use super::{
    NameIndex, NewPicture, NewProvider, ProviderStore, ShowcaseRow, StoreError, StoreTransaction,
    TxOp, group_showcase_rows,
};

#[derive(Debug, Clone)]
struct ProviderRow {
    name: String,
    phone: String,
    link: String,
    zone_id: i32,
    source_id: i32,
}

#[derive(Debug, Clone, Default)]
struct Tables {
    zones: BTreeMap<i32, String>,
    sources: BTreeMap<i32, String>,
    providers: BTreeMap<i32, ProviderRow>,
    pics: Vec<NewPicture>,
    next_id: i32,
}

impl Tables {
    fn next_id(&mut self) -> i32 {
        self.next_id += 1;
        self.next_id
    }

    fn index(names: &BTreeMap<i32, String>) -> NameIndex {
        names.iter().map(|(id, name)| (name.clone(), *id)).collect()
    }

    fn insert_names(&mut self, op: TxOp, names: &[String]) {
        for name in names {
            let table = if op == TxOp::InsertZones { &self.zones } else { &self.sources };
            if table.values().any(|existing| existing == name) {
                continue;
            }
            let id = self.next_id();
            let table = if op == TxOp::InsertZones { &mut self.zones } else { &mut self.sources };
            table.insert(id, name.clone());
        }
    }
}

/// In-process store with the same transactional behaviour as Postgres.
///
/// A transaction holds the table lock and works on a private copy; only
/// `commit` writes the copy back, so a failed or dropped transaction
/// leaves no trace.
///
/// `fail_next` arms a one-shot failure for the next transaction at a
/// given operation.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
    fail_next: Arc<std::sync::Mutex<Option<TxOp>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next transaction fail at `op`.
    pub fn fail_next(&self, op: TxOp) {
        if let Ok(mut armed) = self.fail_next.lock() {
            *armed = Some(op);
        }
    }

    fn take_failure(&self) -> Option<TxOp> {
        self.fail_next.lock().ok().and_then(|mut armed| armed.take())
    }

    /// Number of stored providers per source name.
    pub async fn provider_counts(&self) -> BTreeMap<String, usize> {
        let tables = self.tables.lock().await;
        let mut counts = BTreeMap::new();
        for row in tables.providers.values() {
            if let Some(source) = tables.sources.get(&row.source_id) {
                *counts.entry(source.clone()).or_insert(0) += 1;
            }
        }
        counts
    }

    /// Number of stored pictures.
    pub async fn picture_count(&self) -> usize {
        self.tables.lock().await.pics.len()
    }
}

#[async_trait]
impl ProviderStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        let fail_at = self.take_failure();
        if fail_at == Some(TxOp::Begin) {
            return Err(injected(TxOp::Begin));
        }

        let guard = self.tables.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryTransaction {
            guard,
            working,
            fail_at,
        }))
    }

    async fn zones(&self) -> Result<NameIndex, StoreError> {
        Ok(Tables::index(&self.tables.lock().await.zones))
    }

    async fn sources(&self) -> Result<NameIndex, StoreError> {
        Ok(Tables::index(&self.tables.lock().await.sources))
    }

    async fn list_providers(&self) -> Result<Vec<ShowcaseProvider>, StoreError> {
        let tables = self.tables.lock().await;
        let mut rows = Vec::new();

        for (id, p) in &tables.providers {
            let base = ShowcaseRow {
                id: *id,
                name: p.name.clone(),
                phone: p.phone.clone(),
                link: p.link.clone(),
                place: tables.zones.get(&p.zone_id).cloned().unwrap_or_default(),
                source: tables.sources.get(&p.source_id).cloned().unwrap_or_default(),
                pic: None,
            };

            let mut pics: Vec<&NewPicture> =
                tables.pics.iter().filter(|pic| pic.provider_id == *id).collect();
            pics.sort_by_key(|pic| pic.position);

            if pics.is_empty() {
                rows.push(base);
            } else {
                rows.extend(pics.into_iter().map(|pic| ShowcaseRow {
                    pic: Some(pic.url.clone()),
                    ..base.clone()
                }));
            }
        }

        Ok(group_showcase_rows(rows))
    }

    async fn close(&self) {}
}

fn injected(op: TxOp) -> StoreError {
    StoreError::Rejected {
        op,
        reason: "injected failure".into(),
    }
}

pub struct MemoryTransaction {
    guard: OwnedMutexGuard<Tables>,
    working: Tables,
    fail_at: Option<TxOp>,
}

impl MemoryTransaction {
    fn check(&self, op: TxOp) -> Result<(), StoreError> {
        if self.fail_at == Some(op) {
            return Err(injected(op));
        }
        Ok(())
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn delete_source_providers(&mut self, source_id: i32) -> Result<u64, StoreError> {
        self.check(TxOp::DeleteProviders)?;

        let before = self.working.providers.len();
        self.working.providers.retain(|_, p| p.source_id != source_id);
        let providers = &self.working.providers;
        self.working
            .pics
            .retain(|pic| providers.contains_key(&pic.provider_id));

        Ok((before - self.working.providers.len()) as u64)
    }

    async fn insert_zones(&mut self, names: &[String]) -> Result<(), StoreError> {
        self.check(TxOp::InsertZones)?;
        self.working.insert_names(TxOp::InsertZones, names);
        Ok(())
    }

    async fn insert_sources(&mut self, names: &[String]) -> Result<(), StoreError> {
        self.check(TxOp::InsertSources)?;
        self.working.insert_names(TxOp::InsertSources, names);
        Ok(())
    }

    async fn zones(&mut self) -> Result<NameIndex, StoreError> {
        self.check(TxOp::ReadZones)?;
        Ok(Tables::index(&self.working.zones))
    }

    async fn sources(&mut self) -> Result<NameIndex, StoreError> {
        self.check(TxOp::ReadSources)?;
        Ok(Tables::index(&self.working.sources))
    }

    async fn insert_providers(&mut self, rows: &[NewProvider]) -> Result<u64, StoreError> {
        self.check(TxOp::InsertProviders)?;

        for row in rows {
            if !self.working.zones.contains_key(&row.zone_id)
                || !self.working.sources.contains_key(&row.source_id)
            {
                return Err(StoreError::Rejected {
                    op: TxOp::InsertProviders,
                    reason: format!("dangling zone/source for {}", row.phone),
                });
            }

            let id = self.working.next_id();
            self.working.providers.insert(
                id,
                ProviderRow {
                    name: row.name.clone(),
                    phone: row.phone.clone(),
                    link: row.link.clone(),
                    zone_id: row.zone_id,
                    source_id: row.source_id,
                },
            );
        }

        Ok(rows.len() as u64)
    }

    async fn provider_ids_by_phone(&mut self, source_id: i32) -> Result<NameIndex, StoreError> {
        self.check(TxOp::ReadProviderIds)?;

        Ok(self
            .working
            .providers
            .iter()
            .filter(|(_, p)| p.source_id == source_id)
            .map(|(id, p)| (p.phone.clone(), *id))
            .collect())
    }

    async fn insert_pictures(&mut self, rows: &[NewPicture]) -> Result<u64, StoreError> {
        self.check(TxOp::InsertPictures)?;

        if let Some(orphan) = rows
            .iter()
            .find(|pic| !self.working.providers.contains_key(&pic.provider_id))
        {
            return Err(StoreError::Rejected {
                op: TxOp::InsertPictures,
                reason: format!("no provider {}", orphan.provider_id),
            });
        }

        self.working.pics.extend_from_slice(rows);
        Ok(rows.len() as u64)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.check(TxOp::Commit)?;

        let MemoryTransaction {
            mut guard, working, ..
        } = *self;
        *guard = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn committed_writes_become_visible() {
        let store = MemoryStore::new();

        let mut tx = store.begin().await.unwrap();
        tx.insert_zones(&names(&["Palermo", "Belgrano"])).await.unwrap();
        tx.insert_zones(&names(&["Palermo"])).await.unwrap();
        tx.commit().await.unwrap();

        let zones = store.zones().await.unwrap();
        assert_eq!(zones.len(), 2);
        assert!(zones.contains_key("Belgrano"));
    }

    #[tokio::test]
    async fn rollback_discards_writes() {
        let store = MemoryStore::new();

        let mut tx = store.begin().await.unwrap();
        tx.insert_sources(&names(&["s1"])).await.unwrap();
        tx.rollback().await.unwrap();

        assert!(store.sources().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn injected_failure_is_one_shot() {
        let store = MemoryStore::new();
        store.fail_next(TxOp::InsertZones);

        let mut tx = store.begin().await.unwrap();
        let err = tx.insert_zones(&names(&["Palermo"])).await.unwrap_err();
        assert!(matches!(err, StoreError::Rejected { op: TxOp::InsertZones, .. }));
        tx.rollback().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        tx.insert_zones(&names(&["Palermo"])).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.zones().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn deleting_a_source_drops_its_pictures() {
        let store = MemoryStore::new();

        let mut tx = store.begin().await.unwrap();
        tx.insert_zones(&names(&["Palermo"])).await.unwrap();
        tx.insert_sources(&names(&["a", "b"])).await.unwrap();
        let zone = tx.zones().await.unwrap()["Palermo"];
        let sources = tx.sources().await.unwrap();
        let rows = [
            NewProvider {
                name: "x".into(),
                phone: "1111111111".into(),
                link: String::new(),
                zone_id: zone,
                source_id: sources["a"],
            },
            NewProvider {
                name: "y".into(),
                phone: "2222222222".into(),
                link: String::new(),
                zone_id: zone,
                source_id: sources["b"],
            },
        ];
        tx.insert_providers(&rows).await.unwrap();
        let ids_a = tx.provider_ids_by_phone(sources["a"]).await.unwrap();
        let ids_b = tx.provider_ids_by_phone(sources["b"]).await.unwrap();
        assert_eq!(ids_a.len(), 1);
        tx.insert_pictures(&[
            NewPicture { provider_id: ids_a["1111111111"], url: "a.jpg".into(), position: 0 },
            NewPicture { provider_id: ids_b["2222222222"], url: "b.jpg".into(), position: 0 },
        ])
        .await
        .unwrap();

        assert_eq!(tx.delete_source_providers(sources["a"]).await.unwrap(), 1);
        tx.commit().await.unwrap();

        assert_eq!(store.picture_count().await, 1);
        let listed = store.list_providers().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].source, "b");
        assert_eq!(listed[0].pics, vec!["b.jpg"]);
    }

    #[tokio::test]
    async fn providers_need_known_zone_and_source() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();

        let err = tx
            .insert_providers(&[NewProvider {
                name: "x".into(),
                phone: "1111111111".into(),
                link: String::new(),
                zone_id: 7,
                source_id: 8,
            }])
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::Rejected { op: TxOp::InsertProviders, .. }));
    }
}
