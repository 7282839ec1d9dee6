use crate::config::LlmConfig;
use crate::utils::limiters::Limiters;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Model tier for a chat call. `Fast` is the low-cost model used for
/// auxiliary work like query rewriting; `Default` answers users and
/// classifies intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatTier {
    Default,
    Fast,
}

/// Text-in, text-out chat contract. `context` becomes the system message
/// when present.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn generate<'a>(
        &'a self,
        prompt: &'a str,
        context: Option<&'a str>,
        tier: ChatTier,
    ) -> Result<String>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: usize,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

pub struct LlmService {
    client: Client,
    config: LlmConfig,
    limiters: Arc<Limiters>,
}

impl LlmService {
    pub fn new(config: LlmConfig, limiters: Arc<Limiters>) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_seconds))
            .build()
            .context("Failed to build LLM HTTP client")?;

        Ok(Self {
            client,
            config,
            limiters,
        })
    }

    fn model_for(&self, tier: ChatTier) -> &str {
        match tier {
            ChatTier::Default => &self.config.model,
            ChatTier::Fast => &self.config.fast_model,
        }
    }
}

#[async_trait]
impl ChatProvider for LlmService {
    async fn generate<'a>(
        &'a self,
        prompt: &'a str,
        context: Option<&'a str>,
        tier: ChatTier,
    ) -> Result<String> {
        let (_permit, wait) = Limiters::acquire_timed(
            self.limiters.chat.clone(),
            self.limiters.acquire_timeout,
            "chat",
        )
        .await?;

        debug!(wait_ms = wait.as_millis() as u64, op = "chat", "wait_queue");

        let mut messages = Vec::with_capacity(2);
        if let Some(system) = context {
            messages.push(ChatMessage {
                role: "system".to_string(),
                content: system.to_string(),
            });
        }
        messages.push(ChatMessage {
            role: "user".to_string(),
            content: prompt.to_string(),
        });

        let request = ChatCompletionRequest {
            model: self.model_for(tier).to_string(),
            messages,
            max_tokens: self.config.max_tokens,
            temperature: 0.2,
            stream: false,
        };

        let url = format!("{}/v1/chat/completions", self.config.base_url);
        let mut request_builder = self.client.post(&url).json(&request);

        if let Some(key) = &self.config.api_key {
            request_builder = request_builder.header("Authorization", format!("Bearer {}", key));
        }

        let response = request_builder
            .send()
            .await
            .context("Failed to call chat API")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Chat API error ({}): {}", status, body);
        }

        let body: ChatCompletionResponse = response
            .json()
            .await
            .context("Failed to parse chat response")?;

        let content = body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();

        Ok(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::settings::LimitsConfig;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn service(base: &str) -> LlmService {
        let limiters = Arc::new(Limiters::new(&LimitsConfig {
            embedding_concurrency: 1,
            vector_search_concurrency: 1,
            chat_concurrency: 2,
            acquire_timeout_ms: 1000,
        }));
        LlmService::new(
            LlmConfig {
                base_url: base.to_string(),
                model: "main-model".to_string(),
                fast_model: "fast-model".to_string(),
                timeout_seconds: 5,
                max_tokens: 256,
                api_key: None,
            },
            limiters,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_generate_sends_context_as_system_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_partial_json(serde_json::json!({
                "model": "main-model",
                "messages": [
                    {"role": "system", "content": "the context"},
                    {"role": "user", "content": "the question"}
                ]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "the answer"}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let answer = service(&server.uri())
            .generate("the question", Some("the context"), ChatTier::Default)
            .await
            .unwrap();
        assert_eq!(answer, "the answer");
    }

    #[tokio::test]
    async fn test_fast_tier_uses_fast_model() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_partial_json(serde_json::json!({"model": "fast-model"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "ok"}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        service(&server.uri())
            .generate("q", None, ChatTier::Fast)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_non_success_status_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        assert!(service(&server.uri())
            .generate("q", None, ChatTier::Default)
            .await
            .is_err());
    }
}
