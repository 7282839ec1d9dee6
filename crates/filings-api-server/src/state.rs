use std::sync::Arc;

use crate::config::Settings;
use crate::database::{DbPool, Repository, VectorStore};
use crate::pipeline::PipelineQueue;
use crate::services::{AnswerService, EmbeddingService, ProgressBus};
use crate::utils::limiters::Limiters;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub settings: Settings,
    pub db_pool: DbPool,
    pub repository: Arc<Repository>,
    pub vector_store: Arc<VectorStore>,
    pub embedding_service: Arc<EmbeddingService>,
    pub answer_service: Arc<AnswerService>,
    pub progress_bus: Arc<ProgressBus>,
    pub pipeline_queue: PipelineQueue,
    pub limiters: Arc<Limiters>,
}
