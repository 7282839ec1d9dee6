use crate::services::llm_service::{ChatProvider, ChatTier};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

/// Query intent drives the retrieval parameters: `Regular` wants balanced
/// precision, `Exhaustive` wants maximum recall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryIntent {
    Regular,
    Exhaustive,
}

impl QueryIntent {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryIntent::Regular => "Regular",
            QueryIntent::Exhaustive => "Exhaustive",
        }
    }
}

#[derive(Debug, Clone)]
pub struct IntentClassification {
    pub intent: QueryIntent,
    pub reasoning: String,
    pub confidence: Option<f32>,
}

const CLASSIFY_SYSTEM_PROMPT: &str = "You classify a user's question about company filings. \
Reply with JSON only, no prose: {\"intent\": \"REGULAR\" or \"EXHAUSTIVE\", \"reasoning\": \"...\"}. \
EXHAUSTIVE means the user wants every matching occurrence across all documents \
(e.g. \"list all cases of X\"); REGULAR means a focused answer is enough.";

/// Phrases that signal an exhaustive query when the model is unavailable
/// or returns something unusable.
const EXHAUSTIVE_KEYWORDS: &[&str] = &[
    "list all",
    "find all",
    "show all",
    "every",
    "all cases",
    "all instances",
    "all documents",
    "all mentions",
    "complete list",
    "exhaustive",
    "entire",
    "give me every",
    "what are all",
    "all of",
    "each",
];

#[derive(Debug, Deserialize)]
struct ClassifierReply {
    intent: String,
    #[serde(default)]
    reasoning: String,
    #[serde(default)]
    confidence: Option<f32>,
}

pub struct IntentClassifier {
    chat: Arc<dyn ChatProvider>,
}

impl IntentClassifier {
    pub fn new(chat: Arc<dyn ChatProvider>) -> Self {
        Self { chat }
    }

    /// Classify a query. Never fails: the keyword rule backs up every
    /// provider error and every unusable reply.
    pub async fn classify(&self, query: &str) -> IntentClassification {
        if query.trim().is_empty() {
            return IntentClassification {
                intent: QueryIntent::Regular,
                reasoning: "empty query".to_string(),
                confidence: None,
            };
        }

        match self
            .chat
            .generate(query, Some(CLASSIFY_SYSTEM_PROMPT), ChatTier::Default)
            .await
        {
            Ok(reply) => match parse_reply(&reply) {
                Some(classification) => {
                    debug!(
                        "Classified intent {} ({})",
                        classification.intent.as_str(),
                        classification.reasoning
                    );
                    classification
                }
                None => {
                    warn!("Unusable classifier reply, falling back to keyword rule");
                    keyword_fallback(query)
                }
            },
            Err(e) => {
                warn!("Intent classification failed ({}), falling back to keyword rule", e);
                keyword_fallback(query)
            }
        }
    }
}

fn parse_reply(reply: &str) -> Option<IntentClassification> {
    let trimmed = reply
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    if trimmed.is_empty() {
        return None;
    }

    let parsed: ClassifierReply = serde_json::from_str(trimmed).ok()?;
    let intent = match parsed.intent.to_uppercase().as_str() {
        "REGULAR" => QueryIntent::Regular,
        "EXHAUSTIVE" => QueryIntent::Exhaustive,
        _ => return None,
    };

    Some(IntentClassification {
        intent,
        reasoning: parsed.reasoning,
        confidence: parsed.confidence,
    })
}

fn keyword_fallback(query: &str) -> IntentClassification {
    let lowered = query.to_lowercase();
    let matched = EXHAUSTIVE_KEYWORDS
        .iter()
        .find(|keyword| lowered.contains(*keyword));

    match matched {
        Some(keyword) => IntentClassification {
            intent: QueryIntent::Exhaustive,
            reasoning: format!("keyword rule: matched '{}'", keyword),
            confidence: None,
        },
        None => IntentClassification {
            intent: QueryIntent::Regular,
            reasoning: "keyword rule: no exhaustive marker".to_string(),
            confidence: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::llm_service::MockChatProvider;

    fn classifier_with_reply(reply: Result<String, String>) -> IntentClassifier {
        let mut chat = MockChatProvider::new();
        chat.expect_generate().returning(move |_, _, _| match &reply {
            Ok(text) => Ok(text.clone()),
            Err(msg) => Err(anyhow::anyhow!(msg.clone())),
        });
        IntentClassifier::new(Arc::new(chat))
    }

    #[tokio::test]
    async fn test_model_reply_is_used() {
        let classifier = classifier_with_reply(Ok(
            r#"{"intent": "EXHAUSTIVE", "reasoning": "wants every case"}"#.to_string(),
        ));
        let result = classifier.classify("list everything please").await;
        assert_eq!(result.intent, QueryIntent::Exhaustive);
        assert_eq!(result.reasoning, "wants every case");
    }

    #[tokio::test]
    async fn test_fenced_json_is_accepted() {
        let classifier = classifier_with_reply(Ok(
            "```json\n{\"intent\": \"regular\", \"reasoning\": \"focused\"}\n```".to_string(),
        ));
        let result = classifier.classify("what was revenue in 2024?").await;
        assert_eq!(result.intent, QueryIntent::Regular);
    }

    #[tokio::test]
    async fn test_garbage_reply_falls_back_to_keywords() {
        let classifier = classifier_with_reply(Ok("I think... maybe regular?".to_string()));
        let result = classifier
            .classify("list all cases where management discussed supply chain risk")
            .await;
        assert_eq!(result.intent, QueryIntent::Exhaustive);
    }

    #[tokio::test]
    async fn test_unknown_intent_falls_back() {
        let classifier = classifier_with_reply(Ok(
            r#"{"intent": "THOROUGH", "reasoning": "?"}"#.to_string(),
        ));
        let result = classifier.classify("what is the deadline?").await;
        assert_eq!(result.intent, QueryIntent::Regular);
    }

    #[tokio::test]
    async fn test_provider_error_falls_back() {
        let classifier = classifier_with_reply(Err("provider down".to_string()));
        let result = classifier.classify("show all mentions of litigation").await;
        assert_eq!(result.intent, QueryIntent::Exhaustive);
    }

    #[tokio::test]
    async fn test_empty_query_is_regular_without_model_call() {
        let mut chat = MockChatProvider::new();
        chat.expect_generate().times(0);
        let classifier = IntentClassifier::new(Arc::new(chat));

        let result = classifier.classify("   ").await;
        assert_eq!(result.intent, QueryIntent::Regular);
    }

    #[test]
    fn test_keyword_rule_phrases() {
        for query in [
            "give me every filing that mentions china",
            "what are all the risk factors",
            "I want the complete list of directors",
            "each quarter's revenue",
        ] {
            assert_eq!(keyword_fallback(query).intent, QueryIntent::Exhaustive, "{}", query);
        }

        assert_eq!(
            keyword_fallback("what was the revenue last year?").intent,
            QueryIntent::Regular
        );
    }
}
