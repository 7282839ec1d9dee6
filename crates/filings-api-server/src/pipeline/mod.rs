pub mod orchestrator;
pub mod state;
pub mod worker;

pub use orchestrator::PipelineOrchestrator;
pub use worker::{PipelineQueue, PipelineWorkers};

use crate::database::{DocumentRecord, EmbeddingUpsert, Repository, UpsertStats, VectorStore};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

/// One ingestion batch, persisted as durable state before it is enqueued.
#[derive(Debug, Clone)]
pub struct PipelineJob {
    pub job_id: Uuid,
    pub conversation_id: Uuid,
    pub user_id: i64,
    pub company_identifier: String,
    pub filing_types: Vec<String>,
}

/// Persistence contract for the final stage: register the documents and
/// upsert their chunk embeddings.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EmbeddingSink: Send + Sync {
    async fn upsert_embeddings(&self, items: Vec<EmbeddingUpsert>) -> Result<UpsertStats>;

    async fn register_documents(&self, documents: &[DocumentRecord]) -> Result<()>;
}

/// Production sink backed by the vector store and the domain repository.
pub struct PgEmbeddingSink {
    vector_store: Arc<VectorStore>,
    repository: Arc<Repository>,
}

impl PgEmbeddingSink {
    pub fn new(vector_store: Arc<VectorStore>, repository: Arc<Repository>) -> Self {
        Self {
            vector_store,
            repository,
        }
    }
}

#[async_trait]
impl EmbeddingSink for PgEmbeddingSink {
    async fn upsert_embeddings(&self, items: Vec<EmbeddingUpsert>) -> Result<UpsertStats> {
        self.vector_store.upsert_embeddings(items).await
    }

    async fn register_documents(&self, documents: &[DocumentRecord]) -> Result<()> {
        for document in documents {
            self.repository.register_document(document).await?;
        }
        Ok(())
    }
}
