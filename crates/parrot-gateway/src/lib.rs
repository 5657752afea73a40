//! Parrot Gateway
//!
//! Synchronous completion call against an OpenAI-style endpoint. One request
//! per turn, bounded timeout, uniform error wrapping: every failure becomes a
//! `ModelError` value instead of crossing the turn as a fault.

use parrot_config::GatewayConfig;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("model transport: {0}")]
    Transport(String),
    #[error("model HTTP {status}: {detail}")]
    Http { status: u16, detail: String },
    #[error("model response decode: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Seam between the turn pipeline and the remote model. The pipeline and the
/// media describer only ever see this trait, so tests can swap in a stub.
#[async_trait::async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        max_tokens: u32,
    ) -> Result<String, ModelError>;

    async fn health_check(&self) -> bool;
}

pub struct HttpCompletionClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl HttpCompletionClient {
    pub fn new(config: &GatewayConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config
                .api_key
                .as_deref()
                .map(str::trim)
                .filter(|key| !key.is_empty())
                .map(|key| key.to_string()),
            model: config.model.clone(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn truncate_for_error(text: &str, max_chars: usize) -> String {
        if text.chars().count() <= max_chars {
            text.to_string()
        } else {
            let truncated: String = text.chars().take(max_chars).collect();
            format!("{}...", truncated)
        }
    }

    /// Pull the reply out of either a chat-style or a completion-style body.
    /// Neither shape present falls back to a raw dump of the body, so a
    /// misbehaving endpoint still produces a turn instead of an error.
    fn extract_reply(body: &str) -> Result<String, ModelError> {
        let parsed: serde_json::Value = serde_json::from_str(body)
            .map_err(|e| ModelError::Decode(format!("{}: {}", e, Self::truncate_for_error(body, 300))))?;

        if let Some(error) = parsed.get("error") {
            return Err(ModelError::Decode(format!("API error: {}", error)));
        }

        let choice = parsed
            .get("choices")
            .and_then(|v| v.as_array())
            .and_then(|choices| choices.first());

        let text = choice.and_then(|choice| {
            choice
                .get("message")
                .and_then(|m| m.get("content"))
                .and_then(|v| v.as_str())
                .or_else(|| choice.get("text").and_then(|v| v.as_str()))
        });

        match text {
            Some(text) => Ok(text.trim().to_string()),
            None => Ok(parsed.to_string()),
        }
    }
}

#[async_trait::async_trait]
impl CompletionBackend for HttpCompletionClient {
    async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        max_tokens: u32,
    ) -> Result<String, ModelError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": max_tokens,
        });

        let mut request = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        let response = request
            .send()
            .await
            .map_err(|e| ModelError::Transport(e.to_string()))?;

        let status = response.status();
        let raw_body = response
            .text()
            .await
            .map_err(|e| ModelError::Transport(e.to_string()))?;

        if !status.is_success() {
            return Err(ModelError::Http {
                status: status.as_u16(),
                detail: Self::truncate_for_error(&raw_body, 300),
            });
        }

        let reply = Self::extract_reply(&raw_body)?;
        tracing::debug!(model = %self.model, chars = reply.chars().count(), "Model reply received");
        Ok(reply)
    }

    async fn health_check(&self) -> bool {
        let url = format!("{}/models", self.base_url);
        let mut request = self.client.get(&url);
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }
        match request.send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::HttpCompletionClient;

    #[test]
    fn extract_reply_reads_chat_shape() {
        let body = r#"{"choices":[{"message":{"content":"  hello  "}}]}"#;
        let reply = HttpCompletionClient::extract_reply(body).expect("extract");
        assert_eq!(reply, "hello");
    }

    #[test]
    fn extract_reply_reads_completion_shape() {
        let body = r#"{"choices":[{"text":"plain completion"}]}"#;
        let reply = HttpCompletionClient::extract_reply(body).expect("extract");
        assert_eq!(reply, "plain completion");
    }

    #[test]
    fn extract_reply_falls_back_to_raw_dump() {
        let body = r#"{"output":"unexpected shape"}"#;
        let reply = HttpCompletionClient::extract_reply(body).expect("extract");
        assert!(reply.contains("unexpected shape"));
    }

    #[test]
    fn extract_reply_rejects_invalid_json() {
        assert!(HttpCompletionClient::extract_reply("not json").is_err());
    }

    #[test]
    fn extract_reply_surfaces_api_error_object() {
        let body = r#"{"error":{"message":"quota exceeded"}}"#;
        let err = HttpCompletionClient::extract_reply(body).expect_err("error");
        assert!(err.to_string().contains("quota exceeded"));
    }

    #[test]
    fn truncate_keeps_short_text_intact() {
        assert_eq!(HttpCompletionClient::truncate_for_error("short", 300), "short");
        let long = "x".repeat(400);
        let truncated = HttpCompletionClient::truncate_for_error(&long, 300);
        assert!(truncated.ends_with("..."));
        assert_eq!(truncated.chars().count(), 303);
    }
}
