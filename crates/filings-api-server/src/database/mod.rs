pub mod models;
pub mod repository;
pub mod vector_store;

pub use models::*;
pub use repository::Repository;
pub use vector_store::VectorStore;

use crate::config::DatabaseConfig;
use anyhow::Result;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::info;

#[derive(Clone)]
pub struct DbPool {
    pool: PgPool,
}

impl DbPool {
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.pool_max_size)
            .acquire_timeout(Duration::from_secs(config.pool_timeout_seconds))
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    pub fn get_pool(&self) -> &PgPool {
        &self.pool
    }

    /// Idempotent schema bootstrap. Migration tooling is deliberately not
    /// part of this service; every statement is IF NOT EXISTS.
    pub async fn ensure_schema(&self, embedding_dimension: usize) -> Result<()> {
        sqlx::query("CREATE EXTENSION IF NOT EXISTS vector")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS conversations (
                conversation_id UUID PRIMARY KEY,
                user_id BIGINT NOT NULL,
                title TEXT NOT NULL,
                ingestion_status TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS conversation_companies (
                company_id BIGSERIAL PRIMARY KEY,
                conversation_id UUID NOT NULL
                    REFERENCES conversations (conversation_id) ON DELETE CASCADE,
                company_name TEXT NOT NULL,
                position INT NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS messages (
                message_id UUID PRIMARY KEY,
                conversation_id UUID NOT NULL
                    REFERENCES conversations (conversation_id) ON DELETE CASCADE,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                metadata JSONB,
                created_at TIMESTAMPTZ NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS message_sources (
                message_id UUID NOT NULL
                    REFERENCES messages (message_id) ON DELETE CASCADE,
                document_id TEXT NOT NULL,
                document_title TEXT NOT NULL,
                relevance_score REAL NOT NULL,
                chunks_used INT NOT NULL,
                sort_order INT NOT NULL,
                PRIMARY KEY (message_id, document_id)
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS documents (
                id BIGSERIAL PRIMARY KEY,
                document_id TEXT NOT NULL,
                conversation_id UUID
                    REFERENCES conversations (conversation_id) ON DELETE CASCADE,
                user_id BIGINT,
                title TEXT NOT NULL,
                content_type TEXT NOT NULL,
                file_path TEXT,
                full_text TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE UNIQUE INDEX IF NOT EXISTS ux_documents_scope
               ON documents (document_id, conversation_id) NULLS NOT DISTINCT"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            r#"CREATE TABLE IF NOT EXISTS filing_embeddings (
                embedding_id BIGSERIAL PRIMARY KEY,
                owner_kind TEXT NOT NULL,
                user_id BIGINT,
                conversation_id UUID,
                document_id TEXT NOT NULL,
                document_title TEXT NOT NULL,
                chunk_index INT NOT NULL,
                content TEXT NOT NULL,
                chunk_hash TEXT NOT NULL,
                embedding vector({}) NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )"#,
            embedding_dimension
        ))
        .execute(&self.pool)
        .await?;

        // The uniqueness tuple from the data model. NULLS NOT DISTINCT makes
        // the corpus-wide scope (null user/conversation) participate too.
        sqlx::query(
            r#"CREATE UNIQUE INDEX IF NOT EXISTS ux_filing_embeddings_scope_chunk
               ON filing_embeddings
                   (owner_kind, user_id, conversation_id, document_id, chunk_index)
               NULLS NOT DISTINCT"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE INDEX IF NOT EXISTS ix_filing_embeddings_cosine
               ON filing_embeddings USING hnsw (embedding vector_cosine_ops)"#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database schema ensured (embedding dimension {})", embedding_dimension);

        Ok(())
    }
}
