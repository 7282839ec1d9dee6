pub mod answer_service;
pub mod embedding_service;
pub mod intent_classifier;
pub mod llm_service;
pub mod progress_bus;
pub mod query_preprocessor;
pub mod retrieval_strategy;

pub use answer_service::AnswerService;
pub use embedding_service::{EmbeddingProvider, EmbeddingService};
pub use intent_classifier::{IntentClassifier, QueryIntent};
pub use llm_service::{ChatProvider, ChatTier, LlmService};
pub use progress_bus::ProgressBus;
pub use query_preprocessor::QueryPreprocessor;
pub use retrieval_strategy::RetrievalStrategy;
