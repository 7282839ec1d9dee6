use crate::auth::CurrentUser;
use crate::database::EmbeddingScope;
use crate::services::EmbeddingProvider;
use crate::state::AppState;
use crate::utils::error::ApiError;
use crate::utils::limiters::Limiters;
use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    /// Restrict to one conversation; omitted means all of the user's
    /// conversations, `corpus_wide = true` drops the user filter entirely.
    pub conversation_id: Option<Uuid>,
    #[serde(default)]
    pub corpus_wide: bool,
    pub limit: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub results: Vec<SearchResult>,
    pub total: usize,
}

#[derive(Debug, Serialize)]
pub struct SearchResult {
    pub document_id: String,
    pub document_title: String,
    pub content: String,
    pub similarity: f32,
}

/// Direct top-K similarity search, outside the answer flow.
pub async fn search_handler(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Json(request): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, ApiError> {
    if request.query.trim().is_empty() {
        return Err(ApiError::Validation("query must not be empty".to_string()));
    }

    info!("Search request from user {}: {}", user_id, request.query);

    let query_embedding = state
        .embedding_service
        .embed(&request.query)
        .await
        .map_err(|e| ApiError::ProviderFailure(e.to_string()))?;

    let top_k = request.limit.unwrap_or(10).min(50);

    let (_permit, _) = Limiters::acquire_timed(
        state.limiters.vector_search.clone(),
        state.limiters.acquire_timeout,
        "vector_search",
    )
    .await
    .map_err(|e| ApiError::DatabaseError(e.to_string()))?;

    let chunks = if request.corpus_wide {
        state
            .vector_store
            .find_similar_all_system(&query_embedding, top_k)
            .await
    } else {
        state
            .vector_store
            .find_similar_in_conversation(
                &query_embedding,
                EmbeddingScope {
                    user_id,
                    conversation_id: request.conversation_id,
                },
                top_k,
            )
            .await
    }
    .map_err(|e| ApiError::DatabaseError(e.to_string()))?;

    let results: Vec<SearchResult> = chunks
        .into_iter()
        .map(|chunk| SearchResult {
            document_id: chunk.document_id,
            document_title: chunk.document_title,
            content: chunk.content,
            similarity: chunk.similarity,
        })
        .collect();

    let total = results.len();

    Ok(Json(SearchResponse { results, total }))
}
