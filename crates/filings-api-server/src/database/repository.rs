use super::{
    Conversation, ConversationCompany, DbPool, DocumentRecord, Message, MessageSource,
};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

/// Domain persistence for conversations, messages, sources and document
/// records. Relations are navigated by query, never by pointer chase:
/// parents hold ids, children are looked up on demand.
pub struct Repository {
    pool: DbPool,
}

impl Repository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn create_conversation(&self, user_id: i64, title: &str) -> Result<Conversation> {
        let conversation = sqlx::query_as::<_, Conversation>(
            r#"INSERT INTO conversations (conversation_id, user_id, title)
               VALUES ($1, $2, $3)
               RETURNING conversation_id, user_id, title, ingestion_status,
                         created_at, updated_at"#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(title)
        .fetch_one(self.pool.get_pool())
        .await?;

        Ok(conversation)
    }

    /// Fetch a conversation only if it is owned by the given user.
    pub async fn get_conversation(
        &self,
        user_id: i64,
        conversation_id: Uuid,
    ) -> Result<Option<Conversation>> {
        let conversation = sqlx::query_as::<_, Conversation>(
            r#"SELECT conversation_id, user_id, title, ingestion_status,
                      created_at, updated_at
               FROM conversations
               WHERE conversation_id = $1 AND user_id = $2"#,
        )
        .bind(conversation_id)
        .bind(user_id)
        .fetch_optional(self.pool.get_pool())
        .await?;

        Ok(conversation)
    }

    pub async fn touch_conversation(&self, conversation_id: Uuid) -> Result<()> {
        sqlx::query("UPDATE conversations SET updated_at = now() WHERE conversation_id = $1")
            .bind(conversation_id)
            .execute(self.pool.get_pool())
            .await?;

        Ok(())
    }

    /// Mirror of the pipeline state onto the conversation. Written only on
    /// terminal transitions to keep domain and pipeline state loosely
    /// coupled.
    pub async fn set_ingestion_status(
        &self,
        conversation_id: Uuid,
        status: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"UPDATE conversations
               SET ingestion_status = $2, updated_at = now()
               WHERE conversation_id = $1"#,
        )
        .bind(conversation_id)
        .bind(status)
        .execute(self.pool.get_pool())
        .await?;

        Ok(())
    }

    pub async fn add_company(
        &self,
        conversation_id: Uuid,
        company_name: &str,
    ) -> Result<ConversationCompany> {
        let company = sqlx::query_as::<_, ConversationCompany>(
            r#"INSERT INTO conversation_companies (conversation_id, company_name, position)
               VALUES ($1, $2,
                       (SELECT COALESCE(MAX(position) + 1, 0)
                        FROM conversation_companies
                        WHERE conversation_id = $1))
               RETURNING company_id, conversation_id, company_name, position"#,
        )
        .bind(conversation_id)
        .bind(company_name)
        .fetch_one(self.pool.get_pool())
        .await?;

        Ok(company)
    }

    pub async fn list_companies(&self, conversation_id: Uuid) -> Result<Vec<ConversationCompany>> {
        let companies = sqlx::query_as::<_, ConversationCompany>(
            r#"SELECT company_id, conversation_id, company_name, position
               FROM conversation_companies
               WHERE conversation_id = $1
               ORDER BY position"#,
        )
        .bind(conversation_id)
        .fetch_all(self.pool.get_pool())
        .await?;

        Ok(companies)
    }

    pub async fn insert_message(
        &self,
        conversation_id: Uuid,
        role: &str,
        content: &str,
        metadata: Option<Value>,
        created_at: DateTime<Utc>,
    ) -> Result<Message> {
        let message = sqlx::query_as::<_, Message>(
            r#"INSERT INTO messages (message_id, conversation_id, role, content, metadata, created_at)
               VALUES ($1, $2, $3, $4, $5, $6)
               RETURNING message_id, conversation_id, role, content, metadata, created_at"#,
        )
        .bind(Uuid::new_v4())
        .bind(conversation_id)
        .bind(role)
        .bind(content)
        .bind(metadata)
        .bind(created_at)
        .fetch_one(self.pool.get_pool())
        .await?;

        Ok(message)
    }

    pub async fn list_messages(&self, conversation_id: Uuid) -> Result<Vec<Message>> {
        let messages = sqlx::query_as::<_, Message>(
            r#"SELECT message_id, conversation_id, role, content, metadata, created_at
               FROM messages
               WHERE conversation_id = $1
               ORDER BY created_at, message_id"#,
        )
        .bind(conversation_id)
        .fetch_all(self.pool.get_pool())
        .await?;

        Ok(messages)
    }

    pub async fn insert_message_sources(
        &self,
        message_id: Uuid,
        sources: &[MessageSource],
    ) -> Result<()> {
        if sources.is_empty() {
            return Ok(());
        }

        let mut transaction = self.pool.get_pool().begin().await?;

        for source in sources {
            sqlx::query(
                r#"INSERT INTO message_sources
                       (message_id, document_id, document_title,
                        relevance_score, chunks_used, sort_order)
                   VALUES ($1, $2, $3, $4, $5, $6)"#,
            )
            .bind(message_id)
            .bind(&source.document_id)
            .bind(&source.document_title)
            .bind(source.relevance_score)
            .bind(source.chunks_used)
            .bind(source.sort_order)
            .execute(&mut *transaction)
            .await?;
        }

        transaction.commit().await?;
        debug!("Persisted {} sources for message {}", sources.len(), message_id);

        Ok(())
    }

    pub async fn list_message_sources(&self, message_id: Uuid) -> Result<Vec<MessageSource>> {
        let sources = sqlx::query_as::<_, MessageSource>(
            r#"SELECT document_id, document_title, relevance_score, chunks_used, sort_order
               FROM message_sources
               WHERE message_id = $1
               ORDER BY sort_order"#,
        )
        .bind(message_id)
        .fetch_all(self.pool.get_pool())
        .await?;

        Ok(sources)
    }

    /// Register (or refresh) a document record. Re-running a pipeline must
    /// not duplicate records, so this is an upsert on the scope tuple.
    pub async fn register_document(&self, doc: &DocumentRecord) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO documents
                   (document_id, conversation_id, user_id, title, content_type, file_path, full_text)
               VALUES ($1, $2, $3, $4, $5, $6, $7)
               ON CONFLICT (document_id, conversation_id)
               DO UPDATE SET title = EXCLUDED.title,
                             content_type = EXCLUDED.content_type,
                             file_path = EXCLUDED.file_path,
                             full_text = EXCLUDED.full_text"#,
        )
        .bind(&doc.document_id)
        .bind(doc.conversation_id)
        .bind(doc.user_id)
        .bind(&doc.title)
        .bind(&doc.content_type)
        .bind(&doc.file_path)
        .bind(&doc.full_text)
        .execute(self.pool.get_pool())
        .await?;

        Ok(())
    }

    pub async fn get_document(
        &self,
        conversation_id: Uuid,
        document_id: &str,
    ) -> Result<Option<DocumentRecord>> {
        let document = sqlx::query_as::<_, DocumentRecord>(
            r#"SELECT document_id, conversation_id, user_id, title, content_type, file_path, full_text
               FROM documents
               WHERE conversation_id = $1 AND document_id = $2"#,
        )
        .bind(conversation_id)
        .bind(document_id)
        .fetch_optional(self.pool.get_pool())
        .await?;

        Ok(document)
    }

    pub async fn list_documents(&self, conversation_id: Uuid) -> Result<Vec<DocumentRecord>> {
        let documents = sqlx::query_as::<_, DocumentRecord>(
            r#"SELECT document_id, conversation_id, user_id, title, content_type, file_path, full_text
               FROM documents
               WHERE conversation_id = $1
               ORDER BY document_id"#,
        )
        .bind(conversation_id)
        .fetch_all(self.pool.get_pool())
        .await?;

        Ok(documents)
    }
}
