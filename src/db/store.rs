use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tokio::sync::RwLock;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Durable text storage for documents.
///
/// The store is a best-effort durable cache of each document's plain-text
/// projection; the resident CRDT replica stays authoritative while sessions
/// are connected. Project/file metadata CRUD lives in a separate service.
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn get(&self, doc_id: &str) -> Result<Option<String>, StoreError>;
    async fn put(&self, doc_id: &str, text: &str) -> Result<(), StoreError>;
}

/// Postgres-backed store
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Create the connection pool and ensure the documents table exists.
    /// Unreachable storage at startup is fatal; the caller exits rather than
    /// serving a workspace with no persistence guarantee.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        info!("Connecting to database...");

        let pool = PgPoolOptions::new()
            .max_connections(20)
            .min_connections(2)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect(database_url)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                id TEXT PRIMARY KEY,
                content TEXT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&pool)
        .await?;

        info!("Database connection pool created successfully");
        Ok(Self { pool })
    }
}

#[async_trait]
impl DurableStore for PgStore {
    async fn get(&self, doc_id: &str) -> Result<Option<String>, StoreError> {
        let row = sqlx::query("SELECT content FROM documents WHERE id = $1")
            .bind(doc_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(row.try_get("content")?)),
            None => Ok(None),
        }
    }

    async fn put(&self, doc_id: &str, text: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO documents (id, content, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (id) DO UPDATE
                SET content = EXCLUDED.content,
                    updated_at = NOW()
            "#,
        )
        .bind(doc_id)
        .bind(text)
        .execute(&self.pool)
        .await?;
        info!("Persisted document {} ({} bytes)", doc_id, text.len());
        Ok(())
    }
}

/// In-memory store for tests and storage-less development runs
#[derive(Default)]
pub struct MemStore {
    docs: RwLock<HashMap<String, String>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DurableStore for MemStore {
    async fn get(&self, doc_id: &str) -> Result<Option<String>, StoreError> {
        Ok(self.docs.read().await.get(doc_id).cloned())
    }

    async fn put(&self, doc_id: &str, text: &str) -> Result<(), StoreError> {
        self.docs
            .write()
            .await
            .insert(doc_id.to_string(), text.to_string());
        Ok(())
    }
}
