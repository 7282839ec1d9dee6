pub mod settings;

pub use settings::{
    DatabaseConfig, EdgarConfig, EmbeddingConfig, LimitsConfig, LlmConfig, PipelineConfig,
    RetrievalConfig, ServerConfig, Settings, StorageConfig,
};
