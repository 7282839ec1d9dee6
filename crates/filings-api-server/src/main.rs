use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, TraceLayer},
};
use tracing::info;

use filings_api_server::config::Settings;
use filings_api_server::database::{DbPool, Repository, VectorStore};
use filings_api_server::edgar::EdgarClient;
use filings_api_server::handlers;
use filings_api_server::pipeline::{
    PgEmbeddingSink, PipelineOrchestrator, PipelineQueue, PipelineWorkers,
};
use filings_api_server::services::{
    AnswerService, EmbeddingService, IntentClassifier, LlmService, ProgressBus,
    QueryPreprocessor, RetrievalStrategy,
};
use filings_api_server::state::AppState;
use filings_api_server::utils::limiters::Limiters;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "info,filings_api_server=debug".to_string()),
        )
        .with_target(true)
        .json()
        .init();

    info!("🚀 Starting Filings API Server...");

    let settings = Settings::load()?;
    info!("✅ Configuration loaded");

    let db_pool = DbPool::new(&settings.database).await?;
    db_pool.ensure_schema(settings.embedding.dimension).await?;
    info!("✅ Database connection established");

    let limiters = Arc::new(Limiters::new(&settings.limits));
    let repository = Arc::new(Repository::new(db_pool.clone()));
    let vector_store = Arc::new(VectorStore::new(db_pool.clone()));

    let embedding_service = Arc::new(EmbeddingService::new(
        settings.embedding.clone(),
        limiters.clone(),
    )?);
    let llm_service = Arc::new(LlmService::new(settings.llm.clone(), limiters.clone())?);
    let edgar_client = Arc::new(EdgarClient::new(settings.edgar.clone())?);

    let blob_store = Arc::new(filings_api_server::storage::BlobStore::new(
        settings.storage.base_dir.clone(),
    ));
    let progress_bus = Arc::new(ProgressBus::new(256));

    // Background worker runtime for the ingestion pipeline.
    let sink = Arc::new(PgEmbeddingSink::new(vector_store.clone(), repository.clone()));
    let orchestrator = Arc::new(PipelineOrchestrator::new(
        edgar_client,
        embedding_service.clone(),
        sink,
        blob_store,
        progress_bus.clone(),
        settings.pipeline.clone(),
    ));
    let (pipeline_queue, job_receiver) = PipelineQueue::new(settings.pipeline.queue_capacity);
    let shutdown = CancellationToken::new();
    PipelineWorkers::spawn(
        settings.pipeline.worker_count,
        job_receiver,
        orchestrator,
        repository.clone(),
        shutdown.clone(),
    );
    info!("✅ Pipeline workers started");

    let answer_service = Arc::new(AnswerService::new(
        repository.clone(),
        vector_store.clone(),
        embedding_service.clone(),
        llm_service.clone(),
        IntentClassifier::new(llm_service.clone()),
        RetrievalStrategy::new(settings.retrieval.clone()),
        QueryPreprocessor::new(llm_service.clone()),
        limiters.clone(),
    ));

    let state = AppState {
        settings: settings.clone(),
        db_pool,
        repository,
        vector_store,
        embedding_service,
        answer_service,
        progress_bus,
        pipeline_queue,
        limiters,
    };

    let app = build_router(state);

    let addr = SocketAddr::from((
        settings.server.host.parse::<std::net::IpAddr>()?,
        settings.server.port,
    ));
    info!("🎯 Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    shutdown.cancel();

    Ok(())
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/health/ready", get(handlers::health::readiness_check))
        .route(
            "/api/conversations",
            post(handlers::conversations::create_conversation),
        )
        .route(
            "/api/conversations/{conversation_id}",
            get(handlers::conversations::get_conversation),
        )
        .route(
            "/api/conversations/{conversation_id}/companies",
            post(handlers::conversations::attach_company),
        )
        .route(
            "/api/conversations/{conversation_id}/documents",
            get(handlers::conversations::list_documents),
        )
        .route(
            "/api/conversations/{conversation_id}/messages",
            post(handlers::chat::post_message),
        )
        .route(
            "/api/conversations/{conversation_id}/progress",
            get(handlers::progress::subscribe_progress),
        )
        .route("/api/search", post(handlers::search::search_handler))
        .layer(
            CorsLayer::permissive()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::default().include_headers(false)),
        )
        .with_state(state)
}
