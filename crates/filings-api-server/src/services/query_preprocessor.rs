use crate::services::llm_service::{ChatProvider, ChatTier};
use std::sync::Arc;
use tracing::warn;

const REWRITE_SYSTEM_PROMPT: &str = "Rewrite the user's question about company filings into a \
concise, keyword-rich search query for semantic retrieval. Preserve company names, form types, \
fiscal periods and financial terms. Reply with the rewritten query only.";

const REWRITE_WITH_HISTORY_SYSTEM_PROMPT: &str = "Rewrite the user's latest question about \
company filings into a concise, keyword-rich search query for semantic retrieval, resolving \
pronouns and references against the conversation transcript that follows. Reply with the \
rewritten query only.";

/// Turns a conversational question into a search-oriented query. The raw
/// question is always an acceptable fallback, so this never fails.
pub struct QueryPreprocessor {
    chat: Arc<dyn ChatProvider>,
}

impl QueryPreprocessor {
    pub fn new(chat: Arc<dyn ChatProvider>) -> Self {
        Self { chat }
    }

    pub async fn rewrite(&self, user_content: &str, history: Option<&str>) -> String {
        let (prompt, system) = match history.filter(|h| !h.trim().is_empty()) {
            Some(transcript) => (
                format!("{}\n\n{}", user_content, transcript),
                REWRITE_WITH_HISTORY_SYSTEM_PROMPT,
            ),
            None => (user_content.to_string(), REWRITE_SYSTEM_PROMPT),
        };

        match self
            .chat
            .generate(&prompt, Some(system), ChatTier::Fast)
            .await
        {
            Ok(rewritten) if !rewritten.trim().is_empty() => rewritten.trim().to_string(),
            Ok(_) => user_content.to_string(),
            Err(e) => {
                warn!("Query rewrite failed ({}), using raw question", e);
                user_content.to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::llm_service::MockChatProvider;

    #[tokio::test]
    async fn test_rewrite_uses_model_output() {
        let mut chat = MockChatProvider::new();
        chat.expect_generate()
            .returning(|_, _, _| Ok("  AAPL 10-K supply chain risk  ".to_string()));
        let preprocessor = QueryPreprocessor::new(Arc::new(chat));

        let rewritten = preprocessor
            .rewrite("what did they say about supply chains?", None)
            .await;
        assert_eq!(rewritten, "AAPL 10-K supply chain risk");
    }

    #[tokio::test]
    async fn test_history_selects_the_history_form() {
        let mut chat = MockChatProvider::new();
        chat.expect_generate()
            .withf(|prompt, system, _| {
                prompt.contains("USER: earlier question")
                    && system.unwrap_or("").contains("conversation transcript")
            })
            .returning(|_, _, _| Ok("rewritten".to_string()));
        let preprocessor = QueryPreprocessor::new(Arc::new(chat));

        let rewritten = preprocessor
            .rewrite("and the year before?", Some("USER: earlier question"))
            .await;
        assert_eq!(rewritten, "rewritten");
    }

    #[tokio::test]
    async fn test_failure_falls_back_to_raw_question() {
        let mut chat = MockChatProvider::new();
        chat.expect_generate()
            .returning(|_, _, _| Err(anyhow::anyhow!("provider down")));
        let preprocessor = QueryPreprocessor::new(Arc::new(chat));

        let rewritten = preprocessor.rewrite("what was revenue?", None).await;
        assert_eq!(rewritten, "what was revenue?");
    }

    #[tokio::test]
    async fn test_empty_rewrite_falls_back() {
        let mut chat = MockChatProvider::new();
        chat.expect_generate().returning(|_, _, _| Ok("   ".to_string()));
        let preprocessor = QueryPreprocessor::new(Arc::new(chat));

        let rewritten = preprocessor.rewrite("what was revenue?", None).await;
        assert_eq!(rewritten, "what was revenue?");
    }
}
