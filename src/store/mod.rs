//! Persistence for zones, sources, providers and their pictures.
//!
//! The aggregator only ever talks to the traits below. Every
//! reconciliation runs inside one `StoreTransaction`; nothing it writes
//! is visible until `commit`.
//!
//! Implementations:
//! - `PgStore`     (Postgres via sqlx, production)
//! - `MemoryStore` (in-process, used by tests and dry runs)

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

use crate::schema::ShowcaseProvider;

/// Name → id lookup for zones or sources.
pub type NameIndex = HashMap<String, i32>;

/// Cached zone and source dictionaries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dictionaries {
    pub zones: NameIndex,
    pub sources: NameIndex,
}

impl Dictionaries {
    pub async fn load(store: &dyn ProviderStore) -> Result<Self, StoreError> {
        Ok(Self {
            zones: store.zones().await?,
            sources: store.sources().await?,
        })
    }
}

/// A provider row ready to insert; names already resolved to ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewProvider {
    pub name: String,
    pub phone: String,
    pub link: String,
    pub zone_id: i32,
    pub source_id: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPicture {
    pub provider_id: i32,
    pub url: String,
    /// Order of the picture within its provider
    pub position: i32,
}

/// Individual operations of a transaction. Used to tag failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxOp {
    Begin,
    DeleteProviders,
    InsertZones,
    InsertSources,
    ReadZones,
    ReadSources,
    InsertProviders,
    ReadProviderIds,
    InsertPictures,
    Commit,
}

impl fmt::Display for TxOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Begin => "begin",
            Self::DeleteProviders => "delete providers",
            Self::InsertZones => "insert zones",
            Self::InsertSources => "insert sources",
            Self::ReadZones => "read zones",
            Self::ReadSources => "read sources",
            Self::InsertProviders => "insert providers",
            Self::ReadProviderIds => "read provider ids",
            Self::InsertPictures => "insert pictures",
            Self::Commit => "commit",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("unresolved {kind} `{name}`")]
    Unresolved { kind: &'static str, name: String },

    #[error("store rejected {op}: {reason}")]
    Rejected { op: TxOp, reason: String },
}

/// One open unit of work.
///
/// Dropping a transaction without `commit` discards its writes.
#[async_trait]
pub trait StoreTransaction: Send {
    /// Removes every provider of the source, and their pictures.
    /// Returns the number of providers removed.
    async fn delete_source_providers(&mut self, source_id: i32) -> Result<u64, StoreError>;

    /// Adds zones by name; names that already exist are left alone.
    async fn insert_zones(&mut self, names: &[String]) -> Result<(), StoreError>;

    /// Adds sources by name; names that already exist are left alone.
    async fn insert_sources(&mut self, names: &[String]) -> Result<(), StoreError>;

    async fn zones(&mut self) -> Result<NameIndex, StoreError>;

    async fn sources(&mut self) -> Result<NameIndex, StoreError>;

    async fn insert_providers(&mut self, rows: &[NewProvider]) -> Result<u64, StoreError>;

    /// Phone → provider id, for the providers of one source.
    async fn provider_ids_by_phone(&mut self, source_id: i32) -> Result<NameIndex, StoreError>;

    async fn insert_pictures(&mut self, rows: &[NewPicture]) -> Result<u64, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

#[async_trait]
pub trait ProviderStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError>;

    async fn zones(&self) -> Result<NameIndex, StoreError>;

    async fn sources(&self) -> Result<NameIndex, StoreError>;

    /// Every provider with its zone, source and pictures, by id.
    async fn list_providers(&self) -> Result<Vec<ShowcaseProvider>, StoreError>;

    async fn close(&self);
}

/// Flat provider ⨝ picture row, one per picture (or one with `pic =
/// None` for a provider without pictures).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShowcaseRow {
    pub id: i32,
    pub name: String,
    pub phone: String,
    pub link: String,
    pub place: String,
    pub source: String,
    pub pic: Option<String>,
}

/// Folds join rows into one entry per provider.
///
/// Rows must be ordered by provider id; picture order is preserved.
pub fn group_showcase_rows(rows: impl IntoIterator<Item = ShowcaseRow>) -> Vec<ShowcaseProvider> {
    let mut providers: Vec<ShowcaseProvider> = Vec::new();

    for row in rows {
        match providers.last_mut() {
            Some(last) if last.id == row.id => last.pics.extend(row.pic),
            _ => providers.push(ShowcaseProvider {
                id: row.id,
                name: row.name,
                phone: row.phone,
                link: row.link,
                place: row.place,
                source: row.source,
                pics: row.pic.into_iter().collect(),
            }),
        }
    }

    providers
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: i32, pic: Option<&str>) -> ShowcaseRow {
        ShowcaseRow {
            id,
            name: format!("p{id}"),
            phone: "1122334455".into(),
            link: String::new(),
            place: "Palermo".into(),
            source: "s".into(),
            pic: pic.map(str::to_string),
        }
    }

    #[test]
    fn groups_pictures_under_their_provider() {
        let grouped = group_showcase_rows(vec![
            row(1, Some("a")),
            row(1, Some("b")),
            row(2, None),
            row(3, Some("c")),
        ]);

        assert_eq!(grouped.len(), 3);
        assert_eq!(grouped[0].pics, vec!["a", "b"]);
        assert!(grouped[1].pics.is_empty());
        assert_eq!(grouped[2].pics, vec!["c"]);
    }

    #[test]
    fn no_rows_no_providers() {
        assert!(group_showcase_rows(Vec::new()).is_empty());
    }
}
