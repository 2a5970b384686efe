use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};

use crate::config::PostgresConfig;
use crate::schema::ShowcaseProvider;

use super::{
    NameIndex, NewPicture, NewProvider, ProviderStore, ShowcaseRow, StoreError, StoreTransaction,
    group_showcase_rows,
};

const SCHEMA: [&str; 4] = [
    "CREATE TABLE IF NOT EXISTS zones (
        id SERIAL PRIMARY KEY,
        name TEXT NOT NULL UNIQUE
    )",
    "CREATE TABLE IF NOT EXISTS sources (
        id SERIAL PRIMARY KEY,
        name TEXT NOT NULL UNIQUE
    )",
    "CREATE TABLE IF NOT EXISTS providers (
        id SERIAL PRIMARY KEY,
        name TEXT NOT NULL,
        phone TEXT NOT NULL,
        link TEXT NOT NULL DEFAULT '',
        zone_id INTEGER NOT NULL REFERENCES zones(id),
        source_id INTEGER NOT NULL REFERENCES sources(id)
    )",
    "CREATE TABLE IF NOT EXISTS provider_pics (
        provider_id INTEGER NOT NULL REFERENCES providers(id) ON DELETE CASCADE,
        pic_url TEXT NOT NULL,
        position INTEGER NOT NULL DEFAULT 0
    )",
];

/// Postgres-backed store.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(cfg: &PostgresConfig) -> Result<Self, StoreError> {
        log::info!("Connecting to Postgres at {}:{}/{}", cfg.host, cfg.port, cfg.database);

        let pool = PgPoolOptions::new()
            .max_connections(cfg.max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(cfg.connect_options())
            .await?;

        Ok(Self { pool })
    }

    /// Creates the tables if they do not exist yet.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn index(&self, table: &str) -> Result<NameIndex, StoreError> {
        let rows: Vec<(i32, String)> = sqlx::query_as(&format!("SELECT id, name FROM {table}"))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(id, name)| (name, id)).collect())
    }
}

#[async_trait]
impl ProviderStore for PgStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTransaction { tx }))
    }

    async fn zones(&self) -> Result<NameIndex, StoreError> {
        self.index("zones").await
    }

    async fn sources(&self) -> Result<NameIndex, StoreError> {
        self.index("sources").await
    }

    async fn list_providers(&self) -> Result<Vec<ShowcaseProvider>, StoreError> {
        let rows: Vec<(i32, String, String, String, String, String, Option<String>)> =
            sqlx::query_as(
                "SELECT p.id, p.name, p.phone, p.link, z.name, s.name, pp.pic_url
                 FROM providers p
                 JOIN zones z ON z.id = p.zone_id
                 JOIN sources s ON s.id = p.source_id
                 LEFT JOIN provider_pics pp ON pp.provider_id = p.id
                 ORDER BY p.id, pp.position",
            )
            .fetch_all(&self.pool)
            .await?;

        Ok(group_showcase_rows(rows.into_iter().map(
            |(id, name, phone, link, place, source, pic)| ShowcaseRow {
                id,
                name,
                phone,
                link,
                place,
                source,
                pic,
            },
        )))
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

pub struct PgTransaction {
    tx: Transaction<'static, Postgres>,
}

impl PgTransaction {
    async fn index(&mut self, table: &str) -> Result<NameIndex, StoreError> {
        let rows: Vec<(i32, String)> = sqlx::query_as(&format!("SELECT id, name FROM {table}"))
            .fetch_all(&mut *self.tx)
            .await?;
        Ok(rows.into_iter().map(|(id, name)| (name, id)).collect())
    }

    async fn insert_names(&mut self, table: &str, names: &[String]) -> Result<(), StoreError> {
        if names.is_empty() {
            return Ok(());
        }

        sqlx::query(&format!(
            "INSERT INTO {table} (name) SELECT * FROM UNNEST($1::text[]) ON CONFLICT (name) DO NOTHING"
        ))
        .bind(names)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl StoreTransaction for PgTransaction {
    async fn delete_source_providers(&mut self, source_id: i32) -> Result<u64, StoreError> {
        sqlx::query(
            "DELETE FROM provider_pics
             WHERE provider_id IN (SELECT id FROM providers WHERE source_id = $1)",
        )
        .bind(source_id)
        .execute(&mut *self.tx)
        .await?;

        let deleted = sqlx::query("DELETE FROM providers WHERE source_id = $1")
            .bind(source_id)
            .execute(&mut *self.tx)
            .await?;

        Ok(deleted.rows_affected())
    }

    async fn insert_zones(&mut self, names: &[String]) -> Result<(), StoreError> {
        self.insert_names("zones", names).await
    }

    async fn insert_sources(&mut self, names: &[String]) -> Result<(), StoreError> {
        self.insert_names("sources", names).await
    }

    async fn zones(&mut self) -> Result<NameIndex, StoreError> {
        self.index("zones").await
    }

    async fn sources(&mut self) -> Result<NameIndex, StoreError> {
        self.index("sources").await
    }

    async fn insert_providers(&mut self, rows: &[NewProvider]) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let names: Vec<&str> = rows.iter().map(|r| r.name.as_str()).collect();
        let phones: Vec<&str> = rows.iter().map(|r| r.phone.as_str()).collect();
        let links: Vec<&str> = rows.iter().map(|r| r.link.as_str()).collect();
        let zone_ids: Vec<i32> = rows.iter().map(|r| r.zone_id).collect();
        let source_ids: Vec<i32> = rows.iter().map(|r| r.source_id).collect();

        let inserted = sqlx::query(
            "INSERT INTO providers (name, phone, link, zone_id, source_id)
             SELECT * FROM UNNEST($1::text[], $2::text[], $3::text[], $4::int4[], $5::int4[])",
        )
        .bind(&names)
        .bind(&phones)
        .bind(&links)
        .bind(&zone_ids)
        .bind(&source_ids)
        .execute(&mut *self.tx)
        .await?;

        Ok(inserted.rows_affected())
    }

    async fn provider_ids_by_phone(&mut self, source_id: i32) -> Result<NameIndex, StoreError> {
        let rows: Vec<(i32, String)> =
            sqlx::query_as("SELECT id, phone FROM providers WHERE source_id = $1")
                .bind(source_id)
                .fetch_all(&mut *self.tx)
                .await?;
        Ok(rows.into_iter().map(|(id, phone)| (phone, id)).collect())
    }

    async fn insert_pictures(&mut self, rows: &[NewPicture]) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let provider_ids: Vec<i32> = rows.iter().map(|r| r.provider_id).collect();
        let urls: Vec<&str> = rows.iter().map(|r| r.url.as_str()).collect();
        let positions: Vec<i32> = rows.iter().map(|r| r.position).collect();

        let inserted = sqlx::query(
            "INSERT INTO provider_pics (provider_id, pic_url, position)
             SELECT * FROM UNNEST($1::int4[], $2::text[], $3::int4[])",
        )
        .bind(&provider_ids)
        .bind(&urls)
        .bind(&positions)
        .execute(&mut *self.tx)
        .await?;

        Ok(inserted.rows_affected())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}
