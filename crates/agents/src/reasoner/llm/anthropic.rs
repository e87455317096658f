//! Anthropic-style messages client.

use super::{ChatProvider, ChatResponse, LlmError};
use async_trait::async_trait;
use neverdown_common::Secret;
use neverdown_config::Settings;
use neverdown_models::TokenUsage;
use serde_json::json;
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const API_VERSION: &str = "2023-06-01";

pub struct AnthropicClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Secret,
    model: String,
    max_tokens: u32,
    temperature: f64,
}

impl AnthropicClient {
    #[must_use]
    pub fn new(
        api_key: Secret,
        model: String,
        max_tokens: u32,
        temperature: f64,
        timeout_secs: u64,
        base_url: Option<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(timeout_secs))
                .build()
                .unwrap_or_default(),
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            api_key,
            model,
            max_tokens,
            temperature,
        }
    }

    #[must_use]
    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            settings.llm_api_key.clone(),
            settings.llm_model.clone(),
            settings.llm_max_tokens,
            settings.llm_temperature,
            settings.llm_timeout_secs,
            None,
        )
    }
}

#[async_trait]
impl ChatProvider for AnthropicClient {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    async fn chat(&self, system: &str, user: &str) -> Result<ChatResponse, LlmError> {
        let payload = json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
            "system": system,
            "messages": [
                {"role": "user", "content": user},
            ],
        });

        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", self.api_key.expose())
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(&payload)
            .send()
            .await
            .map_err(|e| LlmError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let data: serde_json::Value = response
            .json()
            .await
            .map_err(|e| LlmError::Malformed(e.to_string()))?;

        let content = data
            .get("content")
            .and_then(|c| c.as_array())
            .map(|blocks| {
                blocks
                    .iter()
                    .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("text"))
                    .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        let usage = TokenUsage {
            input_tokens: data["usage"]["input_tokens"].as_u64().unwrap_or(0),
            output_tokens: data["usage"]["output_tokens"].as_u64().unwrap_or(0),
        };

        Ok(ChatResponse { content, usage })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> AnthropicClient {
        AnthropicClient::new(
            Secret::new("sk-ant-test"),
            "claude-sonnet-4-20250514".to_string(),
            1024,
            0.1,
            5,
            Some(server.uri()),
        )
    }

    #[tokio::test]
    async fn test_chat_parses_content_and_usage() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/messages"))
            .and(header("x-api-key", "sk-ant-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "content": [
                    {"type": "text", "text": "## Root Cause\n"},
                    {"type": "text", "text": "missing null check"}
                ],
                "usage": {"input_tokens": 150, "output_tokens": 42}
            })))
            .mount(&server)
            .await;

        let response = client_for(&server).chat("sys", "user").await.unwrap();
        assert_eq!(response.content, "## Root Cause\nmissing null check");
        assert_eq!(response.usage.input_tokens, 150);
        assert_eq!(response.usage.output_tokens, 42);
    }

    #[tokio::test]
    async fn test_http_error_is_typed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/messages"))
            .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
            .mount(&server)
            .await;

        let err = client_for(&server).chat("sys", "user").await.unwrap_err();
        match err {
            LlmError::Http { status, body } => {
                assert_eq!(status, 429);
                assert_eq!(body, "rate limited");
            }
            other => panic!("expected Http error, got {other:?}"),
        }
    }
}
