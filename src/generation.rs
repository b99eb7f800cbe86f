//! Generative model access.
//!
//! [`Generator`] takes the grounding payload as system context and the decorated query as the
//! user turn, and returns answer text. [`ChatCompletionGenerator`] speaks the OpenAI-compatible
//! `/chat/completions` protocol through the same credential rotation and retry machinery as
//! the embedding client.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::config::GenerationSettings;
use crate::error::{RagError, RagResult};
use crate::remote::{CredentialPool, RemoteClient, RetryPolicy};

#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, system_context: &str, user_query: &str) -> RagResult<String>;
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    max_tokens: u32,
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

/// Client for an OpenAI-compatible `POST /chat/completions` endpoint.
#[derive(Debug, Clone)]
pub struct ChatCompletionGenerator {
    client: RemoteClient,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

impl ChatCompletionGenerator {
    pub fn new(client: RemoteClient, model: &str, max_tokens: u32, temperature: f32) -> Self {
        Self {
            client,
            model: model.to_string(),
            max_tokens,
            temperature,
        }
    }

    pub fn from_settings(settings: &GenerationSettings) -> Self {
        let client = RemoteClient::new(
            &settings.api_base,
            CredentialPool::new(
                settings.credentials(),
                Duration::from_secs(settings.rotation_window_secs),
            ),
            RetryPolicy::new(
                settings.max_retries,
                Duration::from_millis(settings.backoff_base_ms),
                Duration::from_millis(settings.backoff_max_ms),
            ),
            Duration::from_secs(settings.timeout_secs),
        );
        Self::new(
            client,
            &settings.model,
            settings.max_tokens,
            settings.temperature,
        )
    }
}

#[async_trait]
impl Generator for ChatCompletionGenerator {
    async fn generate(&self, system_context: &str, user_query: &str) -> RagResult<String> {
        let request = ChatRequest {
            model: &self.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: system_context,
                },
                ChatMessage {
                    role: "user",
                    content: user_query,
                },
            ],
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };
        debug!("Generating with {} ({} context bytes)", self.model, system_context.len());

        let response: ChatResponse = self
            .client
            .post_json("chat/completions", &request)
            .await
            .map_err(|failure| {
                RagError::Generation(format!(
                    "{} (after {} attempt(s))",
                    failure.reason, failure.attempts
                ))
            })?;

        response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|content| content.trim().to_string())
            .filter(|content| !content.is_empty())
            .ok_or_else(|| RagError::Generation("model returned an empty answer".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    fn generator(base_url: &str) -> ChatCompletionGenerator {
        let client = RemoteClient::new(
            base_url,
            CredentialPool::new(vec!["key".into()], Duration::from_secs(60)),
            RetryPolicy::new(1, Duration::from_millis(1), Duration::from_millis(2)),
            Duration::from_secs(5),
        );
        ChatCompletionGenerator::new(client, "chat-model", 64, 0.0)
    }

    #[tokio::test]
    async fn test_generate_returns_trimmed_answer() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/chat/completions")
                    .header("authorization", "Bearer key");
                then.status(200).json_body(json!({
                    "choices": [{"message": {"role": "assistant", "content": " My name is Gopala Swamy. "}}]
                }));
            })
            .await;

        let answer = generator(&server.base_url())
            .generate("CONTEXT", "QUERY")
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(answer, "My name is Gopala Swamy.");
    }

    #[tokio::test]
    async fn test_generate_failure_is_generation_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/chat/completions");
                then.status(503);
            })
            .await;

        let err = generator(&server.base_url())
            .generate("c", "q")
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::Generation(_)));
    }

    #[tokio::test]
    async fn test_empty_choices_is_generation_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/chat/completions");
                then.status(200).json_body(json!({"choices": []}));
            })
            .await;

        let err = generator(&server.base_url())
            .generate("c", "q")
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::Generation(_)));
    }
}
