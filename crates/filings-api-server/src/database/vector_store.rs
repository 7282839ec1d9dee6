use super::{DbPool, EmbeddingRow, EmbeddingScope, EmbeddingUpsert, OwnerKind, SimilarChunk, UpsertStats};
use anyhow::Result;
use pgvector::Vector;
use sqlx::FromRow;
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

/// KNN queries and the hash-gated upsert over `filing_embeddings`.
/// Ranking is by cosine distance ascending; callers see the complement,
/// `similarity = 1 - distance`, as f32.
pub struct VectorStore {
    pool: DbPool,
}

impl VectorStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Top-K across every user document, no scope filter.
    pub async fn find_similar_all_system(
        &self,
        query: &[f32],
        top_k: u32,
    ) -> Result<Vec<SimilarChunk>> {
        let chunks = sqlx::query_as::<_, SimilarChunk>(
            r#"SELECT content, document_id, document_title,
                      (1 - (embedding <=> $1))::float4 AS similarity
               FROM filing_embeddings
               WHERE owner_kind = $2
               ORDER BY embedding <=> $1
               LIMIT $3"#,
        )
        .bind(Vector::from(query.to_vec()))
        .bind(OwnerKind::UserDocument.as_str())
        .bind(top_k as i64)
        .fetch_all(self.pool.get_pool())
        .await?;

        Ok(chunks)
    }

    /// Top-K restricted to a user, optionally to one conversation. A null
    /// conversation in the scope matches every conversation of that user.
    pub async fn find_similar_in_conversation(
        &self,
        query: &[f32],
        scope: EmbeddingScope,
        top_k: u32,
    ) -> Result<Vec<SimilarChunk>> {
        let chunks = sqlx::query_as::<_, SimilarChunk>(
            r#"SELECT content, document_id, document_title,
                      (1 - (embedding <=> $1))::float4 AS similarity
               FROM filing_embeddings
               WHERE owner_kind = $2
                 AND user_id = $3
                 AND ($4::uuid IS NULL OR conversation_id = $4)
               ORDER BY embedding <=> $1
               LIMIT $5"#,
        )
        .bind(Vector::from(query.to_vec()))
        .bind(OwnerKind::UserDocument.as_str())
        .bind(scope.user_id)
        .bind(scope.conversation_id)
        .bind(top_k as i64)
        .fetch_all(self.pool.get_pool())
        .await?;

        Ok(chunks)
    }

    /// Threshold-filtered KNN. `max_k = None` means no cap (LIMIT NULL is
    /// unbounded in Postgres). The owner filter is an explicit parameter;
    /// call sites choose the scope they mean.
    pub async fn find_similar_adaptive(
        &self,
        query: &[f32],
        owner: OwnerKind,
        max_k: Option<u32>,
        min_similarity: f32,
        scope: Option<EmbeddingScope>,
    ) -> Result<Vec<SimilarChunk>> {
        let (user_id, conversation_id) = match scope {
            Some(s) => (Some(s.user_id), s.conversation_id),
            None => (None, None),
        };

        let chunks = sqlx::query_as::<_, SimilarChunk>(
            r#"SELECT content, document_id, document_title,
                      (1 - (embedding <=> $1))::float4 AS similarity
               FROM filing_embeddings
               WHERE owner_kind = $2
                 AND (embedding <=> $1) <= 1 - $3
                 AND ($4::bigint IS NULL OR user_id = $4)
                 AND ($5::uuid IS NULL OR conversation_id = $5)
               ORDER BY embedding <=> $1
               LIMIT $6"#,
        )
        .bind(Vector::from(query.to_vec()))
        .bind(owner.as_str())
        .bind(min_similarity as f64)
        .bind(user_id)
        .bind(conversation_id)
        .bind(max_k.map(|k| k as i64))
        .fetch_all(self.pool.get_pool())
        .await?;

        debug!(
            "Adaptive search returned {} chunks (max_k={:?}, min_similarity={})",
            chunks.len(),
            max_k,
            min_similarity
        );

        Ok(chunks)
    }

    /// Every embedding row of one document in a user/conversation scope,
    /// vectors included. Used for explicitly referenced documents whose
    /// similarity is computed in-process and bypasses the threshold.
    pub async fn embeddings_for_document(
        &self,
        scope: EmbeddingScope,
        document_id: &str,
    ) -> Result<Vec<EmbeddingRow>> {
        let rows = sqlx::query_as::<_, EmbeddingRow>(
            r#"SELECT embedding_id, document_id, document_title, chunk_index,
                      content, chunk_hash, embedding
               FROM filing_embeddings
               WHERE owner_kind = $1
                 AND user_id = $2
                 AND ($3::uuid IS NULL OR conversation_id = $3)
                 AND document_id = $4
               ORDER BY chunk_index"#,
        )
        .bind(OwnerKind::UserDocument.as_str())
        .bind(scope.user_id)
        .bind(scope.conversation_id)
        .bind(document_id)
        .fetch_all(self.pool.get_pool())
        .await?;

        Ok(rows)
    }

    /// Insert-or-update keyed on the uniqueness tuple, gated by the content
    /// hash: a matching hash leaves the row untouched (updated_at included).
    /// Items are grouped by (user, conversation, document); existing rows
    /// are preloaded once per group; everything commits at the end.
    pub async fn upsert_embeddings(&self, items: Vec<EmbeddingUpsert>) -> Result<UpsertStats> {
        self.upsert_grouped(items, |item| {
            (item.user_id, item.conversation_id, item.document_id.clone())
        })
        .await
    }

    /// Bulk-corpus variant: groups by document only, ignoring user and
    /// conversation scope differences inside a document.
    pub async fn upsert_document_embeddings(
        &self,
        items: Vec<EmbeddingUpsert>,
    ) -> Result<UpsertStats> {
        self.upsert_grouped(items, |item| (None, None, item.document_id.clone()))
            .await
    }

    async fn upsert_grouped<K>(
        &self,
        items: Vec<EmbeddingUpsert>,
        key_fn: K,
    ) -> Result<UpsertStats>
    where
        K: Fn(&EmbeddingUpsert) -> (Option<i64>, Option<Uuid>, String),
    {
        #[derive(FromRow)]
        struct ExistingRow {
            embedding_id: i64,
            chunk_index: i32,
            chunk_hash: String,
        }

        let mut groups: HashMap<(Option<i64>, Option<Uuid>, String), Vec<EmbeddingUpsert>> =
            HashMap::new();
        for item in items {
            groups.entry(key_fn(&item)).or_default().push(item);
        }

        let mut stats = UpsertStats::default();
        let mut transaction = self.pool.get_pool().begin().await?;

        for (group_key, group_items) in groups {
            let first = &group_items[0];
            let owner = first.owner;

            let existing = sqlx::query_as::<_, ExistingRow>(
                r#"SELECT embedding_id, chunk_index, chunk_hash
                   FROM filing_embeddings
                   WHERE owner_kind = $1
                     AND user_id IS NOT DISTINCT FROM $2
                     AND conversation_id IS NOT DISTINCT FROM $3
                     AND document_id = $4"#,
            )
            .bind(owner.as_str())
            .bind(first.user_id)
            .bind(first.conversation_id)
            .bind(&first.document_id)
            .fetch_all(&mut *transaction)
            .await?;

            let by_index: HashMap<i32, (i64, String)> = existing
                .into_iter()
                .map(|row| (row.chunk_index, (row.embedding_id, row.chunk_hash)))
                .collect();

            for item in &group_items {
                match by_index.get(&item.chunk_index) {
                    None => {
                        sqlx::query(
                            r#"INSERT INTO filing_embeddings
                                   (owner_kind, user_id, conversation_id, document_id,
                                    document_title, chunk_index, content, chunk_hash, embedding)
                               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"#,
                        )
                        .bind(item.owner.as_str())
                        .bind(item.user_id)
                        .bind(item.conversation_id)
                        .bind(&item.document_id)
                        .bind(&item.document_title)
                        .bind(item.chunk_index)
                        .bind(&item.content)
                        .bind(&item.chunk_hash)
                        .bind(Vector::from(item.embedding.clone()))
                        .execute(&mut *transaction)
                        .await?;
                        stats.inserted += 1;
                    }
                    Some((embedding_id, stored_hash)) if stored_hash != &item.chunk_hash => {
                        sqlx::query(
                            r#"UPDATE filing_embeddings
                               SET content = $2, chunk_hash = $3, embedding = $4,
                                   document_title = $5, updated_at = now()
                               WHERE embedding_id = $1"#,
                        )
                        .bind(embedding_id)
                        .bind(&item.content)
                        .bind(&item.chunk_hash)
                        .bind(Vector::from(item.embedding.clone()))
                        .bind(&item.document_title)
                        .execute(&mut *transaction)
                        .await?;
                        stats.updated += 1;
                    }
                    Some(_) => {
                        // Content-addressed short-circuit: no write at all.
                        stats.unchanged += 1;
                    }
                }
            }

            debug!(
                "Upsert group {:?}: {} items",
                group_key,
                group_items.len()
            );
        }

        transaction.commit().await?;

        debug!(
            "Upsert committed: {} inserted, {} updated, {} unchanged",
            stats.inserted, stats.updated, stats.unchanged
        );

        Ok(stats)
    }
}
