//! Provider-agnostic chat interface.
//!
//! The Reasoner is the only component allowed to call a language-model
//! endpoint, and it does so exclusively through [`ChatProvider`]. Two
//! providers are recognised: Anthropic-style messages and OpenAI-style
//! chat completions.

pub mod anthropic;
pub mod openai;

use async_trait::async_trait;
use neverdown_config::Settings;
use neverdown_models::TokenUsage;

/// Errors surfaced by a provider call.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("HTTP error: {status} - {body}")]
    Http { status: u16, body: String },

    #[error("request failed: {0}")]
    Request(String),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("API key not configured for provider {0}")]
    MissingApiKey(String),

    #[error("unsupported provider: {0}")]
    UnsupportedProvider(String),
}

/// A completed chat exchange.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub usage: TokenUsage,
}

/// One-shot chat call: a system instruction plus a single user message.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Provider name for logging.
    fn name(&self) -> &'static str;

    /// Send the exchange and return the assistant's text with usage
    /// counters.
    async fn chat(&self, system: &str, user: &str) -> Result<ChatResponse, LlmError>;
}

/// Build the configured provider.
pub fn provider_from_settings(settings: &Settings) -> Result<Box<dyn ChatProvider>, LlmError> {
    if settings.llm_api_key.is_empty() {
        return Err(LlmError::MissingApiKey(settings.llm_provider.clone()));
    }
    match settings.llm_provider.as_str() {
        "anthropic" => Ok(Box::new(anthropic::AnthropicClient::from_settings(settings))),
        "openai" => Ok(Box::new(openai::OpenAiClient::from_settings(settings))),
        other => Err(LlmError::UnsupportedProvider(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_key_rejected() {
        let settings = Settings::default();
        assert!(matches!(
            provider_from_settings(&settings),
            Err(LlmError::MissingApiKey(_))
        ));
    }

    #[test]
    fn test_known_providers_constructed() {
        let settings = Settings {
            llm_api_key: neverdown_common::Secret::new("sk-test"),
            ..Settings::default()
        };
        assert_eq!(provider_from_settings(&settings).unwrap().name(), "anthropic");

        let settings = Settings {
            llm_api_key: neverdown_common::Secret::new("sk-test"),
            llm_provider: "openai".to_string(),
            ..Settings::default()
        };
        assert_eq!(provider_from_settings(&settings).unwrap().name(), "openai");
    }
}
