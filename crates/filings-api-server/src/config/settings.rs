use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub edgar: EdgarConfig,
    pub storage: StorageConfig,
    pub embedding: EmbeddingConfig,
    pub llm: LlmConfig,
    pub retrieval: RetrievalConfig,
    pub pipeline: PipelineConfig,
    pub limits: LimitsConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub pool_max_size: u32,
    pub pool_timeout_seconds: u64,
}

/// EDGAR archive access. The user agent MUST carry a contact address; the
/// archive's fair-access policy rejects anonymous clients.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EdgarConfig {
    pub base_url: String,
    pub data_base_url: String,
    pub user_agent: String,
    pub min_request_interval_ms: u64,
    /// <= 0 means no cap.
    pub max_filings_to_download: i64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StorageConfig {
    /// Base directory for the per-conversation staging area.
    pub base_dir: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EmbeddingConfig {
    pub base_url: String,
    pub model: String,
    pub dimension: usize,
    pub batch_size: usize,
    pub api_key: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LlmConfig {
    pub base_url: String,
    pub model: String,
    /// Low-cost tier for auxiliary calls (query rewriting).
    pub fast_model: String,
    pub timeout_seconds: u64,
    pub max_tokens: usize,
    pub api_key: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RetrievalConfig {
    pub regular_max_k: u32,
    pub regular_min_similarity: f32,
    /// 0 means unlimited.
    pub exhaustive_max_k: u32,
    pub exhaustive_min_similarity: f32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PipelineConfig {
    pub worker_count: usize,
    pub queue_capacity: usize,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub persist_lock_timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LimitsConfig {
    pub embedding_concurrency: usize,
    pub vector_search_concurrency: usize,
    pub chat_concurrency: usize,
    pub acquire_timeout_ms: u64,
}

impl Settings {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Config::builder()
            .add_source(File::with_name("config/settings").required(true))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Settings = config.try_deserialize()?;
        Ok(settings)
    }
}
