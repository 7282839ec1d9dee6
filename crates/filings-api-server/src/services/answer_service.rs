use crate::database::{
    EmbeddingScope, Message, MessageRole, MessageSource, OwnerKind, Repository, SimilarChunk,
    VectorStore,
};
use crate::services::embedding_service::EmbeddingProvider;
use crate::services::intent_classifier::{IntentClassifier, QueryIntent};
use crate::services::llm_service::{ChatProvider, ChatTier};
use crate::services::query_preprocessor::QueryPreprocessor;
use crate::services::retrieval_strategy::RetrievalStrategy;
use crate::utils::error::ApiError;
use crate::utils::limiters::Limiters;
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

/// One chunk scored against the current query, before or after merging.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredChunk {
    pub text: String,
    pub document_id: String,
    pub document_title: String,
    pub similarity: f32,
}

impl From<SimilarChunk> for ScoredChunk {
    fn from(chunk: SimilarChunk) -> Self {
        Self {
            text: chunk.content,
            document_id: chunk.document_id,
            document_title: chunk.document_title,
            similarity: chunk.similarity,
        }
    }
}

pub struct AnswerRequest {
    pub conversation_id: Uuid,
    pub user_id: i64,
    pub user_content: String,
    pub referenced_document_ids: Vec<String>,
}

pub struct AnswerOutcome {
    pub message: Message,
    pub sources: Vec<MessageSource>,
    pub intent: QueryIntent,
}

/// The answer orchestrator: intent-adaptive retrieval, merge with
/// explicitly referenced documents, grounding, generation and persistence.
/// The caller persists the user message before entry; everything inside
/// the RAG block surfaces as one `QueryFailed`.
pub struct AnswerService {
    repository: Arc<Repository>,
    vector_store: Arc<VectorStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    chat: Arc<dyn ChatProvider>,
    classifier: IntentClassifier,
    strategy: RetrievalStrategy,
    preprocessor: QueryPreprocessor,
    limiters: Arc<Limiters>,
}

impl AnswerService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repository: Arc<Repository>,
        vector_store: Arc<VectorStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        chat: Arc<dyn ChatProvider>,
        classifier: IntentClassifier,
        strategy: RetrievalStrategy,
        preprocessor: QueryPreprocessor,
        limiters: Arc<Limiters>,
    ) -> Self {
        Self {
            repository,
            vector_store,
            embedder,
            chat,
            classifier,
            strategy,
            preprocessor,
            limiters,
        }
    }

    pub async fn answer(
        &self,
        request: AnswerRequest,
        ct: CancellationToken,
    ) -> Result<AnswerOutcome, ApiError> {
        match self.run_rag(&request, &ct).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                if matches!(e.downcast_ref::<ApiError>(), Some(ApiError::Cancelled)) {
                    return Err(ApiError::Cancelled);
                }
                Err(ApiError::QueryFailed(e.to_string()))
            }
        }
    }

    async fn run_rag(
        &self,
        request: &AnswerRequest,
        ct: &CancellationToken,
    ) -> Result<AnswerOutcome> {
        // 1. History as a labeled transcript.
        let messages = self.repository.list_messages(request.conversation_id).await?;
        let transcript = render_transcript(&messages);

        // 2-3. Intent and retrieval parameters.
        let classification = self.classifier.classify(&request.user_content).await;
        let params = self.strategy.for_intent(classification.intent);
        info!(
            "Answering in conversation {}: intent={} max_k={:?} min_similarity={}",
            request.conversation_id,
            classification.intent.as_str(),
            params.max_k,
            params.min_similarity
        );

        // 4-5. Search-oriented rewrite, then its embedding.
        let history = (!messages.is_empty()).then_some(transcript.as_str());
        let rewritten = self
            .preprocessor
            .rewrite(&request.user_content, history)
            .await;
        let query_vec = self.embedder.embed(&rewritten).await?;

        let scope = EmbeddingScope {
            user_id: request.user_id,
            conversation_id: Some(request.conversation_id),
        };

        // 6. Referenced documents: all their chunks, scored in-process,
        //    bypassing the similarity threshold.
        let mut referenced_chunks: Vec<ScoredChunk> = Vec::new();
        let mut referenced_titles: HashMap<String, String> = HashMap::new();
        for document_id in &request.referenced_document_ids {
            let rows = self
                .vector_store
                .embeddings_for_document(scope, document_id)
                .await?;
            for row in rows {
                let similarity = query_similarity(&query_vec, row.embedding.as_slice());
                referenced_titles
                    .entry(row.document_id.clone())
                    .or_insert_with(|| row.document_title.clone());
                referenced_chunks.push(ScoredChunk {
                    text: row.content,
                    document_id: row.document_id,
                    document_title: row.document_title,
                    similarity,
                });
            }
        }

        // 7. Adaptive KNN under the search limiter.
        let adaptive: Vec<ScoredChunk> = {
            let (_permit, _) = Limiters::acquire_timed(
                self.limiters.vector_search.clone(),
                self.limiters.acquire_timeout,
                "vector_search",
            )
            .await?;

            self.vector_store
                .find_similar_adaptive(
                    &query_vec,
                    OwnerKind::UserDocument,
                    params.max_k,
                    params.min_similarity,
                    Some(scope),
                )
                .await?
                .into_iter()
                .map(ScoredChunk::from)
                .collect()
        };
        debug!(
            "Retrieved {} adaptive and {} referenced chunks",
            adaptive.len(),
            referenced_chunks.len()
        );

        // 8. Merge; referenced wins on key collision.
        let merged = merge_chunks(adaptive, referenced_chunks);

        // 9. Per-document source aggregation. Referenced documents that
        //    yielded no chunks still appear, titled from the registry.
        for document_id in &request.referenced_document_ids {
            if !referenced_titles.contains_key(document_id) {
                let title = self
                    .repository
                    .get_document(request.conversation_id, document_id)
                    .await?
                    .map(|d| d.title)
                    .unwrap_or_else(|| document_id.clone());
                referenced_titles.insert(document_id.clone(), title);
            }
        }
        let sources = aggregate_sources(&merged, &request.referenced_document_ids, &referenced_titles);

        // 10. Grounding and generation. Cancellation stops before the chat
        //     provider is called; nothing is persisted then.
        if ct.is_cancelled() {
            return Err(ApiError::Cancelled.into());
        }

        let answer_text = match classification.intent {
            QueryIntent::Regular => {
                let context = build_regular_context(&transcript, &merged);
                self.chat
                    .generate(&request.user_content, Some(&context), ChatTier::Default)
                    .await?
            }
            QueryIntent::Exhaustive => {
                let distinct_documents = count_distinct_documents(&merged);
                let prompt =
                    build_exhaustive_prompt(&request.user_content, distinct_documents, &transcript);
                self.chat.generate(&prompt, None, ChatTier::Default).await?
            }
        };

        // 11. Persist the assistant message strictly after the user message.
        let last_user_at = messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::User.as_str())
            .map(|m| m.created_at);
        let created_at = assistant_timestamp(Utc::now(), last_user_at);

        let metadata = serde_json::json!({
            "intent": classification.intent.as_str(),
            "intentReasoning": classification.reasoning,
            "rewrittenQuery": rewritten,
        });

        let message = self
            .repository
            .insert_message(
                request.conversation_id,
                MessageRole::Assistant.as_str(),
                &answer_text,
                Some(metadata),
                created_at,
            )
            .await?;
        self.repository
            .insert_message_sources(message.message_id, &sources)
            .await?;
        self.repository
            .touch_conversation(request.conversation_id)
            .await?;

        Ok(AnswerOutcome {
            message,
            sources,
            intent: classification.intent,
        })
    }
}

/// Labeled transcript bracketed by explicit delimiters.
pub fn render_transcript(messages: &[Message]) -> String {
    if messages.is_empty() {
        return String::new();
    }

    let mut transcript = String::from("=== CONVERSATION HISTORY ===\n");
    for message in messages {
        let label = MessageRole::parse(&message.role)
            .map(|r| r.label())
            .unwrap_or("SYSTEM");
        transcript.push_str(label);
        transcript.push_str(": ");
        transcript.push_str(&message.content);
        transcript.push('\n');
    }
    transcript.push_str("=== END CONVERSATION HISTORY ===");

    transcript
}

/// Merge adaptive and referenced results into one list keyed by
/// `(documentId, text)`. Adaptive collisions keep the maximum similarity;
/// a referenced entry always replaces whatever is there. The result is
/// sorted by similarity descending with the lexicographically smaller
/// `(documentId, text)` first on ties.
pub fn merge_chunks(adaptive: Vec<ScoredChunk>, referenced: Vec<ScoredChunk>) -> Vec<ScoredChunk> {
    use std::collections::hash_map::Entry;

    let mut by_key: HashMap<(String, String), ScoredChunk> = HashMap::new();

    for chunk in adaptive {
        let key = (chunk.document_id.clone(), chunk.text.clone());
        match by_key.entry(key) {
            Entry::Occupied(mut occupied) => {
                if chunk.similarity > occupied.get().similarity {
                    occupied.insert(chunk);
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(chunk);
            }
        }
    }

    for chunk in referenced {
        let key = (chunk.document_id.clone(), chunk.text.clone());
        by_key.insert(key, chunk);
    }

    let mut merged: Vec<ScoredChunk> = by_key.into_values().collect();
    merged.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.document_id.cmp(&b.document_id))
            .then_with(|| a.text.cmp(&b.text))
    });

    merged
}

pub fn count_distinct_documents(merged: &[ScoredChunk]) -> usize {
    let mut seen: Vec<&str> = merged.iter().map(|c| c.document_id.as_str()).collect();
    seen.sort_unstable();
    seen.dedup();
    seen.len()
}

/// Group merged chunks by document and rank the groups. Every explicitly
/// referenced document appears even with zero chunks. Ordering is
/// `maxSimilarity` descending, smaller `documentId` first on ties;
/// `sort_order` is the resulting 0-based rank.
pub fn aggregate_sources(
    merged: &[ScoredChunk],
    referenced_document_ids: &[String],
    referenced_titles: &HashMap<String, String>,
) -> Vec<MessageSource> {
    struct Group {
        title: String,
        chunks_used: i32,
        max_similarity: f32,
    }

    let mut groups: HashMap<String, Group> = HashMap::new();
    for chunk in merged {
        let group = groups
            .entry(chunk.document_id.clone())
            .or_insert_with(|| Group {
                title: chunk.document_title.clone(),
                chunks_used: 0,
                max_similarity: f32::MIN,
            });
        group.chunks_used += 1;
        group.max_similarity = group.max_similarity.max(chunk.similarity);
    }

    for document_id in referenced_document_ids {
        groups.entry(document_id.clone()).or_insert_with(|| Group {
            title: referenced_titles
                .get(document_id)
                .cloned()
                .unwrap_or_else(|| document_id.clone()),
            chunks_used: 0,
            max_similarity: 0.0,
        });
    }

    let mut ranked: Vec<(String, Group)> = groups.into_iter().collect();
    ranked.sort_by(|(id_a, a), (id_b, b)| {
        b.max_similarity
            .partial_cmp(&a.max_similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| id_a.cmp(id_b))
    });

    ranked
        .into_iter()
        .enumerate()
        .map(|(rank, (document_id, group))| MessageSource {
            document_id,
            document_title: group.title,
            relevance_score: if group.chunks_used > 0 {
                group.max_similarity
            } else {
                0.0
            },
            chunks_used: group.chunks_used,
            sort_order: rank as i32,
        })
        .collect()
}

/// Transcript block followed by the merged chunks, best first.
pub fn build_regular_context(transcript: &str, merged: &[ScoredChunk]) -> String {
    use std::fmt::Write;

    let mut context = String::new();
    if !transcript.is_empty() {
        context.push_str(transcript);
        context.push_str("\n\n");
    }

    context.push_str("KNOWLEDGE BASE DOCUMENTS:\n");
    if merged.is_empty() {
        context.push_str("(no relevant passages found)\n");
        return context;
    }

    for (i, chunk) in merged.iter().enumerate() {
        let _ = write!(
            context,
            "\n[{}] {} ({}, similarity {:.3})\n{}\n",
            i + 1,
            chunk.document_title,
            chunk.document_id,
            chunk.similarity,
            chunk.text.trim()
        );
    }

    context
}

/// Exhaustive mode never leaks chunk text into the prompt; the model sees
/// only how many distinct documents matched, plus the transcript.
pub fn build_exhaustive_prompt(
    user_content: &str,
    distinct_documents: usize,
    transcript: &str,
) -> String {
    let mut prompt = format!(
        "The user asked: {}\n\nAn exhaustive search of the knowledge base found matching \
         content in {} distinct document(s). Summarize the scope of what was found for the \
         user, citing the document count; the per-document list accompanies your answer \
         separately.",
        user_content, distinct_documents
    );

    if !transcript.is_empty() {
        prompt.push_str("\n\n");
        prompt.push_str(transcript);
    }

    prompt
}

/// Score a stored chunk vector against the query, in the same
/// `similarity = 1 - cosineDistance` f32 shape the vector store returns.
/// Degenerate rows (dimension drift, zero magnitude) score 0.0 rather than
/// failing the whole answer.
fn query_similarity(query: &[f32], chunk: &[f32]) -> f32 {
    if query.len() != chunk.len() || query.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut query_norm = 0.0f32;
    let mut chunk_norm = 0.0f32;
    for (q, c) in query.iter().zip(chunk) {
        dot += q * c;
        query_norm += q * q;
        chunk_norm += c * c;
    }

    if query_norm == 0.0 || chunk_norm == 0.0 {
        return 0.0;
    }

    (dot / (query_norm.sqrt() * chunk_norm.sqrt())).clamp(-1.0, 1.0)
}

/// Monotonic within wall-clock precision, and strictly after the user
/// message being answered.
pub fn assistant_timestamp(
    now: DateTime<Utc>,
    last_user_at: Option<DateTime<Utc>>,
) -> DateTime<Utc> {
    match last_user_at {
        Some(user_at) if now <= user_at => user_at + Duration::microseconds(1),
        _ => now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(document_id: &str, text: &str, similarity: f32) -> ScoredChunk {
        ScoredChunk {
            text: text.to_string(),
            document_id: document_id.to_string(),
            document_title: format!("Title of {}", document_id),
            similarity,
        }
    }

    fn message(role: MessageRole, content: &str) -> Message {
        Message {
            message_id: Uuid::new_v4(),
            conversation_id: Uuid::new_v4(),
            role: role.as_str().to_string(),
            content: content.to_string(),
            metadata: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_referenced_wins_over_adaptive_with_same_key() {
        let adaptive = vec![chunk("D1", "t", 0.8)];
        let referenced = vec![chunk("D1", "t", 0.5)];

        let merged = merge_chunks(adaptive, referenced);
        assert_eq!(merged.len(), 1);
        assert!((merged[0].similarity - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn test_adaptive_collision_keeps_max_similarity() {
        let adaptive = vec![chunk("D1", "t", 0.6), chunk("D1", "t", 0.9)];
        let merged = merge_chunks(adaptive, Vec::new());
        assert_eq!(merged.len(), 1);
        assert!((merged[0].similarity - 0.9).abs() < f32::EPSILON);
    }

    #[test]
    fn test_merge_sorts_descending_with_lexicographic_tie_break() {
        let adaptive = vec![
            chunk("D2", "b", 0.7),
            chunk("D1", "z", 0.7),
            chunk("D1", "a", 0.7),
            chunk("D3", "c", 0.9),
        ];
        let merged = merge_chunks(adaptive, Vec::new());

        let keys: Vec<(&str, &str)> = merged
            .iter()
            .map(|c| (c.document_id.as_str(), c.text.as_str()))
            .collect();
        assert_eq!(
            keys,
            vec![("D3", "c"), ("D1", "a"), ("D1", "z"), ("D2", "b")]
        );
    }

    #[test]
    fn test_aggregate_groups_and_ranks_by_max_similarity() {
        let merged = vec![
            chunk("D1", "a", 0.9),
            chunk("D1", "b", 0.5),
            chunk("D2", "c", 0.8),
        ];

        let sources = aggregate_sources(&merged, &[], &HashMap::new());
        assert_eq!(sources.len(), 2);

        assert_eq!(sources[0].document_id, "D1");
        assert_eq!(sources[0].chunks_used, 2);
        assert!((sources[0].relevance_score - 0.9).abs() < f32::EPSILON);
        assert_eq!(sources[0].sort_order, 0);

        assert_eq!(sources[1].document_id, "D2");
        assert_eq!(sources[1].sort_order, 1);

        // Ordering invariant: scores never increase down the list.
        assert!(sources[0].relevance_score >= sources[1].relevance_score);
    }

    #[test]
    fn test_aggregate_tie_breaks_on_document_id() {
        let merged = vec![chunk("D2", "a", 0.8), chunk("D1", "b", 0.8)];
        let sources = aggregate_sources(&merged, &[], &HashMap::new());
        assert_eq!(sources[0].document_id, "D1");
        assert_eq!(sources[1].document_id, "D2");
    }

    #[test]
    fn test_referenced_document_without_chunks_appears_last() {
        let merged = vec![chunk("D1", "a", 0.9), chunk("D2", "b", 0.4)];
        let referenced = vec!["D9".to_string()];
        let titles: HashMap<String, String> =
            [("D9".to_string(), "Annual report".to_string())].into();

        let sources = aggregate_sources(&merged, &referenced, &titles);
        assert_eq!(sources.len(), 3);

        let last = &sources[2];
        assert_eq!(last.document_id, "D9");
        assert_eq!(last.document_title, "Annual report");
        assert_eq!(last.chunks_used, 0);
        assert_eq!(last.relevance_score, 0.0);
        assert_eq!(last.sort_order, 2);
    }

    #[test]
    fn test_referenced_only_source_is_rank_zero() {
        let sources = aggregate_sources(&[], &["D9".to_string()], &HashMap::new());
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].sort_order, 0);
        assert_eq!(sources[0].chunks_used, 0);
    }

    #[test]
    fn test_exhaustive_prompt_has_count_but_no_chunk_text() {
        let merged = vec![
            chunk("D1", "secret passage one", 0.9),
            chunk("D2", "secret passage two", 0.8),
            chunk("D3", "secret passage three", 0.7),
        ];
        let distinct = count_distinct_documents(&merged);
        let prompt = build_exhaustive_prompt("list all supply chain risks", distinct, "");

        assert!(prompt.contains("3 distinct document(s)"));
        assert!(!prompt.contains("secret passage"));
    }

    #[test]
    fn test_regular_context_orders_chunks_and_includes_transcript() {
        let transcript = render_transcript(&[
            message(MessageRole::User, "what about supply chains?"),
            message(MessageRole::Assistant, "they are discussed in the 10-K"),
        ]);
        let merged = vec![chunk("D1", "best passage", 0.9), chunk("D2", "second", 0.7)];

        let context = build_regular_context(&transcript, &merged);
        assert!(context.starts_with("=== CONVERSATION HISTORY ==="));
        assert!(context.contains("USER: what about supply chains?"));
        assert!(context.contains("KNOWLEDGE BASE DOCUMENTS:"));

        let best = context.find("best passage").unwrap();
        let second = context.find("second").unwrap();
        assert!(best < second);
    }

    #[test]
    fn test_transcript_labels_and_delimiters() {
        let transcript = render_transcript(&[
            message(MessageRole::System, "be terse"),
            message(MessageRole::User, "hi"),
        ]);
        assert!(transcript.starts_with("=== CONVERSATION HISTORY ===\n"));
        assert!(transcript.contains("SYSTEM: be terse\n"));
        assert!(transcript.contains("USER: hi\n"));
        assert!(transcript.ends_with("=== END CONVERSATION HISTORY ==="));

        assert_eq!(render_transcript(&[]), "");
    }

    #[test]
    fn test_query_similarity_matches_store_shape() {
        // Parallel vectors score 1 regardless of magnitude, like the
        // store's 1 - cosineDistance projection.
        let query = vec![0.2, 0.4, 0.6];
        let scaled = vec![1.0, 2.0, 3.0];
        assert!((query_similarity(&query, &scaled) - 1.0).abs() < 1e-6);

        let opposed: Vec<f32> = scaled.iter().map(|v| -v).collect();
        assert!((query_similarity(&query, &opposed) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_query_similarity_degenerate_rows_score_zero() {
        // Dimension drift or an all-zero stored vector must not sink the
        // whole answer; the chunk just scores nothing.
        assert_eq!(query_similarity(&[0.2, 0.4], &[0.2, 0.4, 0.6]), 0.0);
        assert_eq!(query_similarity(&[0.2, 0.4, 0.6], &[0.0, 0.0, 0.0]), 0.0);
        assert_eq!(query_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn test_assistant_timestamp_is_strictly_after_user() {
        let user_at = Utc::now();

        // Wall clock behind or equal to the user message: bump past it.
        let bumped = assistant_timestamp(user_at, Some(user_at));
        assert!(bumped > user_at);

        let later = user_at + Duration::seconds(5);
        assert_eq!(assistant_timestamp(later, Some(user_at)), later);
        assert_eq!(assistant_timestamp(later, None), later);
    }
}
