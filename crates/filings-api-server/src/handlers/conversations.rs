use crate::auth::CurrentUser;
use crate::database::{Conversation, ConversationCompany, DocumentRecord, Message};
use crate::pipeline::PipelineJob;
use crate::state::AppState;
use crate::utils::error::ApiError;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct CreateConversationRequest {
    pub title: String,
}

pub async fn create_conversation(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Json(request): Json<CreateConversationRequest>,
) -> Result<(StatusCode, Json<Conversation>), ApiError> {
    if request.title.trim().is_empty() {
        return Err(ApiError::Validation("title must not be empty".to_string()));
    }

    let conversation = state
        .repository
        .create_conversation(user_id, request.title.trim())
        .await
        .map_err(|e| ApiError::DatabaseError(e.to_string()))?;

    Ok((StatusCode::CREATED, Json(conversation)))
}

#[derive(Debug, Serialize)]
pub struct ConversationDetail {
    #[serde(flatten)]
    pub conversation: Conversation,
    pub companies: Vec<ConversationCompany>,
    pub messages: Vec<Message>,
}

pub async fn get_conversation(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(conversation_id): Path<Uuid>,
) -> Result<Json<ConversationDetail>, ApiError> {
    let conversation = owned_conversation(&state, user_id, conversation_id).await?;

    let companies = state
        .repository
        .list_companies(conversation_id)
        .await
        .map_err(|e| ApiError::DatabaseError(e.to_string()))?;
    let messages = state
        .repository
        .list_messages(conversation_id)
        .await
        .map_err(|e| ApiError::DatabaseError(e.to_string()))?;

    Ok(Json(ConversationDetail {
        conversation,
        companies,
        messages,
    }))
}

#[derive(Debug, Deserialize)]
pub struct AttachCompanyRequest {
    pub company: String,
    pub filing_types: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct AttachCompanyResponse {
    pub company: ConversationCompany,
    pub job_id: Uuid,
}

/// Attach a company to the conversation and enqueue its ingestion batch.
pub async fn attach_company(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(conversation_id): Path<Uuid>,
    Json(request): Json<AttachCompanyRequest>,
) -> Result<(StatusCode, Json<AttachCompanyResponse>), ApiError> {
    if request.company.trim().is_empty() {
        return Err(ApiError::Validation("company must not be empty".to_string()));
    }
    if request.filing_types.is_empty() {
        return Err(ApiError::Validation(
            "filing_types must not be empty".to_string(),
        ));
    }

    owned_conversation(&state, user_id, conversation_id).await?;

    let company = state
        .repository
        .add_company(conversation_id, request.company.trim())
        .await
        .map_err(|e| ApiError::DatabaseError(e.to_string()))?;

    let job = PipelineJob {
        job_id: Uuid::new_v4(),
        conversation_id,
        user_id,
        company_identifier: request.company.trim().to_string(),
        filing_types: request.filing_types.clone(),
    };
    let job_id = job.job_id;
    state.pipeline_queue.enqueue(job)?;

    info!(
        "Enqueued ingestion job {} for conversation {} ({})",
        job_id, conversation_id, request.company
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(AttachCompanyResponse { company, job_id }),
    ))
}

pub async fn list_documents(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(conversation_id): Path<Uuid>,
) -> Result<Json<Vec<DocumentRecord>>, ApiError> {
    owned_conversation(&state, user_id, conversation_id).await?;

    let documents = state
        .repository
        .list_documents(conversation_id)
        .await
        .map_err(|e| ApiError::DatabaseError(e.to_string()))?;

    Ok(Json(documents))
}

pub(crate) async fn owned_conversation(
    state: &AppState,
    user_id: i64,
    conversation_id: Uuid,
) -> Result<Conversation, ApiError> {
    state
        .repository
        .get_conversation(user_id, conversation_id)
        .await
        .map_err(|e| ApiError::DatabaseError(e.to_string()))?
        .ok_or_else(|| ApiError::NotFound(format!("conversation {}", conversation_id)))
}
