use chrono::{DateTime, Utc};
use pgvector::Vector;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Conversation {
    pub conversation_id: Uuid,
    pub user_id: i64,
    pub title: String,
    pub ingestion_status: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ConversationCompany {
    pub company_id: i64,
    pub conversation_id: Uuid,
    pub company_name: String,
    pub position: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(MessageRole::User),
            "assistant" => Some(MessageRole::Assistant),
            "system" => Some(MessageRole::System),
            _ => None,
        }
    }

    /// Transcript label (USER / ASSISTANT / SYSTEM).
    pub fn label(&self) -> &'static str {
        match self {
            MessageRole::User => "USER",
            MessageRole::Assistant => "ASSISTANT",
            MessageRole::System => "SYSTEM",
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Message {
    pub message_id: Uuid,
    pub conversation_id: Uuid,
    pub role: String,
    pub content: String,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Reference from an assistant message to a document, ranked by relevance.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct MessageSource {
    pub document_id: String,
    pub document_title: String,
    pub relevance_score: f32,
    pub chunks_used: i32,
    pub sort_order: i32,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DocumentRecord {
    pub document_id: String,
    pub conversation_id: Option<Uuid>,
    pub user_id: Option<i64>,
    pub title: String,
    pub content_type: String,
    pub file_path: Option<String>,
    pub full_text: Option<String>,
}

/// Who an embedding row belongs to. User documents are scoped to a user
/// and usually a conversation; the system knowledge base is corpus-wide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OwnerKind {
    UserDocument,
    SystemKnowledgeBase,
}

impl OwnerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OwnerKind::UserDocument => "user_document",
            OwnerKind::SystemKnowledgeBase => "system_knowledge_base",
        }
    }
}

/// Scope filter for vector queries: a user, optionally narrowed to one
/// conversation.
#[derive(Debug, Clone, Copy)]
pub struct EmbeddingScope {
    pub user_id: i64,
    pub conversation_id: Option<Uuid>,
}

/// Full embedding row, vector included. Loaded for explicitly referenced
/// documents where similarity is computed in-process.
#[derive(Debug, Clone, FromRow)]
pub struct EmbeddingRow {
    pub embedding_id: i64,
    pub document_id: String,
    pub document_title: String,
    pub chunk_index: i32,
    pub content: String,
    pub chunk_hash: String,
    pub embedding: Vector,
}

/// KNN result: similarity is 1 - cosine distance.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct SimilarChunk {
    pub content: String,
    pub document_id: String,
    pub document_title: String,
    pub similarity: f32,
}

/// One row offered to the upsert. The hash gates mutation: a matching hash
/// leaves the stored row untouched.
#[derive(Debug, Clone)]
pub struct EmbeddingUpsert {
    pub owner: OwnerKind,
    pub user_id: Option<i64>,
    pub conversation_id: Option<Uuid>,
    pub document_id: String,
    pub document_title: String,
    pub chunk_index: i32,
    pub content: String,
    pub chunk_hash: String,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UpsertStats {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
}
