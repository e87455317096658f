//! OpenAI-style chat-completions client.

use super::{ChatProvider, ChatResponse, LlmError};
use async_trait::async_trait;
use neverdown_common::Secret;
use neverdown_config::Settings;
use neverdown_models::TokenUsage;
use serde_json::json;
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Secret,
    model: String,
    max_tokens: u32,
    temperature: f64,
}

impl OpenAiClient {
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
impl ChatProvider for OpenAiClient {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn chat(&self, system: &str, user: &str) -> Result<ChatResponse, LlmError> {
        let payload = json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(self.api_key.expose())
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

        let content = data["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string();

        let usage = TokenUsage {
            input_tokens: data["usage"]["prompt_tokens"].as_u64().unwrap_or(0),
            output_tokens: data["usage"]["completion_tokens"].as_u64().unwrap_or(0),
        };

        Ok(ChatResponse { content, usage })
    }
}
