//! Record store: generic keyed persistence the engine runs against.
//!
//! Records are JSON bodies addressed by `(kind, index)`. There are no
//! transactions; read-modify-write sequences are serialised by
//! [`crate::locks::KeyedLocks`] in the engine, not here.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use tokio::sync::RwLock;
use tracing::info;

use crate::errors::{EngineError, Result};
use crate::types::{Entity, Investor, Project, Recipient};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordKind {
    Project,
    Investor,
    Recipient,
    Entity,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Project => "project",
            Self::Investor => "investor",
            Self::Recipient => "recipient",
            Self::Entity => "entity",
        }
    }
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get(&self, kind: RecordKind, index: u64) -> Result<Option<String>>;
    async fn put(&self, kind: RecordKind, index: u64, body: String) -> Result<()>;
    /// All records of `kind`, ordered by index.
    async fn list_all(&self, kind: RecordKind) -> Result<Vec<String>>;
}

/// A record type with a fixed kind and its own index.
pub trait Record: Serialize + DeserializeOwned {
    const KIND: RecordKind;
    fn record_index(&self) -> u64;
}

impl Record for Project {
    const KIND: RecordKind = RecordKind::Project;
    fn record_index(&self) -> u64 {
        self.index
    }
}

impl Record for Investor {
    const KIND: RecordKind = RecordKind::Investor;
    fn record_index(&self) -> u64 {
        self.index
    }
}

impl Record for Recipient {
    const KIND: RecordKind = RecordKind::Recipient;
    fn record_index(&self) -> u64 {
        self.index
    }
}

impl Record for Entity {
    const KIND: RecordKind = RecordKind::Entity;
    fn record_index(&self) -> u64 {
        self.index
    }
}

// ─────────────────────────────────────────────────────────
// Typed helpers
// ─────────────────────────────────────────────────────────

pub async fn load<T: Record>(store: &dyn RecordStore, index: u64) -> Result<T> {
    match store.get(T::KIND, index).await? {
        Some(body) => Ok(serde_json::from_str(&body)?),
        None => Err(EngineError::not_found(T::KIND.as_str(), index)),
    }
}

pub async fn save<T: Record>(store: &dyn RecordStore, record: &T) -> Result<()> {
    let body = serde_json::to_string(record)?;
    store.put(T::KIND, record.record_index(), body).await
}

pub async fn load_all<T: Record>(store: &dyn RecordStore) -> Result<Vec<T>> {
    store
        .list_all(T::KIND)
        .await?
        .iter()
        .map(|body| serde_json::from_str(body).map_err(EngineError::from))
        .collect()
}

/// Next free index for `T`, counting from 1.
pub async fn next_index<T: Record>(store: &dyn RecordStore) -> Result<u64> {
    let all: Vec<T> = load_all(store).await?;
    Ok(all.iter().map(Record::record_index).max().unwrap_or(0) + 1)
}

// ─────────────────────────────────────────────────────────
// SQLite
// ─────────────────────────────────────────────────────────

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

/// Establish a SQLite connection pool and run pending migrations.
pub async fn init_pool(database_url: &str, max_connections: u32) -> Result<SqlitePool> {
    let url = if database_url.starts_with("sqlite:") {
        database_url.to_string()
    } else {
        format!("sqlite:{database_url}")
    };
    let url = if url.contains("memory") || url.contains("mode=") {
        url
    } else {
        // Make sure the file is created if it doesn't exist yet.
        format!("{url}?mode=rwc")
    };

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect(&url)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database migrations applied successfully");
    Ok(pool)
}

#[async_trait]
impl RecordStore for SqliteStore {
    async fn get(&self, kind: RecordKind, index: u64) -> Result<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT body FROM records WHERE kind = ?1 AND idx = ?2")
                .bind(kind.as_str())
                .bind(index as i64)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(body,)| body))
    }

    async fn put(&self, kind: RecordKind, index: u64, body: String) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO records (kind, idx, body, updated_at)
            VALUES (?1, ?2, ?3, strftime('%s', 'now'))
            ON CONFLICT (kind, idx) DO UPDATE
                SET body = excluded.body, updated_at = excluded.updated_at
            "#,
        )
        .bind(kind.as_str())
        .bind(index as i64)
        .bind(body)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_all(&self, kind: RecordKind) -> Result<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT body FROM records WHERE kind = ?1 ORDER BY idx ASC")
                .bind(kind.as_str())
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(body,)| body).collect())
    }
}

// ─────────────────────────────────────────────────────────
// In-memory
// ─────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<(RecordKind, u64), String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn get(&self, kind: RecordKind, index: u64) -> Result<Option<String>> {
        Ok(self.records.read().await.get(&(kind, index)).cloned())
    }

    async fn put(&self, kind: RecordKind, index: u64, body: String) -> Result<()> {
        self.records.write().await.insert((kind, index), body);
        Ok(())
    }

    async fn list_all(&self, kind: RecordKind) -> Result<Vec<String>> {
        let records = self.records.read().await;
        let mut matching: Vec<_> = records
            .iter()
            .filter(|((k, _), _)| *k == kind)
            .map(|((_, idx), body)| (*idx, body.clone()))
            .collect();
        matching.sort_by_key(|(idx, _)| *idx);
        Ok(matching.into_iter().map(|(_, body)| body).collect())
    }
}
