use super::conversations::owned_conversation;
use crate::auth::CurrentUser;
use crate::database::{Message, MessageRole};
use crate::services::answer_service::AnswerRequest;
use crate::state::AppState;
use crate::utils::error::ApiError;
use axum::extract::{Path, State};
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct PostMessageRequest {
    pub content: String,
    #[serde(default)]
    pub referenced_document_ids: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct SourceView {
    pub document_id: String,
    pub document_title: String,
    pub relevance_score: f32,
    pub chunks_used: i32,
    pub order: i32,
}

#[derive(Debug, Serialize)]
pub struct PostMessageResponse {
    pub user_message: Message,
    pub assistant_message: Message,
    pub sources: Vec<SourceView>,
    pub intent: String,
}

/// Post a user question and produce the grounded assistant reply. The
/// user message is persisted before the RAG block runs, so a failed
/// answer leaves it in place for a retry.
pub async fn post_message(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(conversation_id): Path<Uuid>,
    Json(request): Json<PostMessageRequest>,
) -> Result<Json<PostMessageResponse>, ApiError> {
    if request.content.trim().is_empty() {
        return Err(ApiError::Validation("content must not be empty".to_string()));
    }

    owned_conversation(&state, user_id, conversation_id).await?;

    let user_message = state
        .repository
        .insert_message(
            conversation_id,
            MessageRole::User.as_str(),
            request.content.trim(),
            None,
            Utc::now(),
        )
        .await
        .map_err(|e| ApiError::DatabaseError(e.to_string()))?;

    let outcome = state
        .answer_service
        .answer(
            AnswerRequest {
                conversation_id,
                user_id,
                user_content: request.content.trim().to_string(),
                referenced_document_ids: request.referenced_document_ids,
            },
            CancellationToken::new(),
        )
        .await?;

    let sources = outcome
        .sources
        .into_iter()
        .map(|source| SourceView {
            document_id: source.document_id,
            document_title: source.document_title,
            // Presentation clips to [0, 1]; storage keeps the raw score.
            relevance_score: source.relevance_score.clamp(0.0, 1.0),
            chunks_used: source.chunks_used,
            order: source.sort_order,
        })
        .collect();

    Ok(Json(PostMessageResponse {
        user_message,
        assistant_message: outcome.message,
        sources,
        intent: outcome.intent.as_str().to_string(),
    }))
}
