pub mod memory;
pub mod patch;
pub mod records;
pub mod store;

use anyhow::{Context, Result};
use async_trait::async_trait;
use diffcast_core::config::DbConfig;
pub use memory::MemoryStore;
pub use patch::{CommitPatch, DeliveryPatch, RepoPatch, VideoPatch};
pub use records::Records;
use serde_json::Value;
use sqlx::{Pool, Row, Sqlite, SqlitePool, migrate::MigrateDatabase, sqlite::SqlitePoolOptions};
pub use store::{DocumentStore, Query};
use time::OffsetDateTime;

/// SQLite-backed document store. Each document is a JSON text column, updated
/// in place with `json_patch`.
#[derive(Clone)]
pub struct Database {
    pub pool: Pool<Sqlite>,
}

impl Database {
    pub async fn new(config: &DbConfig) -> Result<Self> {
        if config.url.contains(":memory:") {
            return Self::in_memory().await;
        }
        if !Sqlite::database_exists(&config.url).await.unwrap_or(false) {
            tracing::info!(url = %config.url, "Creating database");
            Sqlite::create_database(&config.url).await.context("Failed to create database")?;
            tracing::info!("Database created");
        }
        let pool =
            SqlitePool::connect(&config.url).await.context("Failed to connect to database")?;
        Self::with_pool(pool).await
    }

    /// Private in-memory database. A single connection keeps every query on
    /// the same database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory database")?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("../../migrations")
            .run(&pool)
            .await
            .context("Failed to run database migrations")?;
        Ok(Self { pool })
    }

    pub async fn close(&self) { self.pool.close().await }
}

#[async_trait]
impl DocumentStore for Database {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        let mut conn = self.pool.acquire().await?;
        let row = sqlx::query(
            r#"
            SELECT data
            FROM documents
            WHERE collection = ? AND id = ?
            "#,
        )
        .bind(collection)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .with_context(|| format!("Failed to load {collection}/{id}"))?;
        row.map(|row| decode(row.try_get("data")?)).transpose()
    }

    async fn create_if_absent(
        &self,
        collection: &str,
        id: &str,
        doc: Value,
    ) -> Result<(Value, bool)> {
        let mut conn = self.pool.acquire().await?;
        let now = now_millis();
        let result = sqlx::query(
            r#"
            INSERT INTO documents (collection, id, data, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (collection, id) DO NOTHING
            "#,
        )
        .bind(collection)
        .bind(id)
        .bind(serde_json::to_string(&doc)?)
        .bind(now)
        .bind(now)
        .execute(&mut *conn)
        .await
        .with_context(|| format!("Failed to create {collection}/{id}"))?;
        if result.rows_affected() > 0 {
            return Ok((doc, true));
        }
        drop(conn);
        let existing = self
            .get(collection, id)
            .await?
            .with_context(|| format!("{collection}/{id} vanished after insert conflict"))?;
        Ok((existing, false))
    }

    async fn merge(&self, collection: &str, id: &str, patch: &Value) -> Result<Option<Value>> {
        let mut conn = self.pool.acquire().await?;
        let row = sqlx::query(
            r#"
            UPDATE documents
            SET data = json_patch(data, ?), updated_at = ?
            WHERE collection = ? AND id = ?
            RETURNING data
            "#,
        )
        .bind(serde_json::to_string(patch)?)
        .bind(now_millis())
        .bind(collection)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .with_context(|| format!("Failed to update {collection}/{id}"))?;
        row.map(|row| decode(row.try_get("data")?)).transpose()
    }

    async fn list(&self, collection: &str, query: &Query) -> Result<Vec<Value>> {
        if query.filters.iter().any(|f| f.values.is_empty()) {
            return Ok(vec![]);
        }
        let mut sql = String::from("SELECT data FROM documents WHERE collection = ?");
        for filter in &query.filters {
            let placeholders = vec!["?"; filter.values.len()].join(", ");
            sql.push_str(&format!(" AND json_extract(data, ?) IN ({placeholders})"));
        }
        sql.push_str(" ORDER BY created_at DESC, rowid DESC");
        if query.limit.is_some() {
            sql.push_str(" LIMIT ?");
        }
        let mut q = sqlx::query(&sql).bind(collection);
        for filter in &query.filters {
            q = q.bind(format!("$.{}", filter.field));
            for value in &filter.values {
                q = q.bind(value.as_str());
            }
        }
        if let Some(limit) = query.limit {
            q = q.bind(limit as i64);
        }
        let mut conn = self.pool.acquire().await?;
        let rows = q
            .fetch_all(&mut *conn)
            .await
            .with_context(|| format!("Failed to list {collection}"))?;
        rows.into_iter().map(|row| decode(row.try_get("data")?)).collect()
    }
}

fn decode(data: String) -> Result<Value> {
    serde_json::from_str(&data).context("Failed to decode stored document")
}

fn now_millis() -> i64 { (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64 }
