//! Anthropic API client implementation
//!
//! Thin transport for the Messages API. Retries, deadlines, and window
//! accounting all live in the dispatcher; this client classifies HTTP
//! failures into the dispatch taxonomy and nothing more.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, warn};

use super::error::{DispatchError, classify_status};
use super::provider::ProviderClient;
use super::types::{CompletionRequest, CompletionResponse};
use crate::config::LlmConfig;

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Anthropic Messages API client
pub struct AnthropicClient {
    api_key: String,
    base_url: String,
    http: Client,
}

impl AnthropicClient {
    /// Create a client from the LLM configuration
    pub fn from_config(config: &LlmConfig) -> Result<Self, DispatchError> {
        debug!(base_url = %config.base_url, "AnthropicClient::from_config: called");
        let api_key = config
            .api_key()
            .map_err(|e| DispatchError::ResponseInvalid(e.to_string()))?;

        // No client-level timeout: the dispatcher enforces per-request
        // deadlines derived from the stage's budget
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(DispatchError::Network)?;

        Ok(Self {
            api_key,
            base_url: config.base_url.clone(),
            http,
        })
    }

    fn build_request_body(&self, request: &CompletionRequest) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": request.model,
            "max_tokens": request.max_output_tokens,
            "messages": [{"role": "user", "content": request.prompt_body}],
        });
        if !request.system_prompt.is_empty() {
            body["system"] = serde_json::json!(request.system_prompt);
        }
        body
    }
}

#[async_trait]
impl ProviderClient for AnthropicClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, DispatchError> {
        debug!(model = %request.model, stage = %request.stage_name, "complete: called");
        let url = format!("{}/v1/messages", self.base_url);
        let body = self.build_request_body(request);

        let response = self
            .http
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_secs);
            let text = response.text().await.unwrap_or_default();
            warn!(status, "complete: provider returned error");
            return Err(classify_status(status, text, retry_after));
        }

        let api_response: MessagesResponse = response
            .json()
            .await
            .map_err(|e| DispatchError::ResponseInvalid(e.to_string()))?;

        let content = api_response
            .content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
            })
            .collect::<Vec<_>>()
            .join("");

        debug!(
            prompt_tokens = api_response.usage.input_tokens,
            output_tokens = api_response.usage.output_tokens,
            "complete: success"
        );
        Ok(CompletionResponse {
            content,
            prompt_tokens: api_response.usage.input_tokens,
            output_tokens: api_response.usage.output_tokens,
            model: api_response.model,
        })
    }
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    model: String,
    content: Vec<ContentBlock>,
    usage: Usage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text { text: String },
}

#[derive(Debug, Deserialize)]
struct Usage {
    input_tokens: u64,
    output_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_request_body() {
        let client = AnthropicClient {
            api_key: "key".to_string(),
            base_url: "https://api.anthropic.com".to_string(),
            http: Client::new(),
        };

        let request = CompletionRequest {
            model: "claude-sonnet".to_string(),
            system_prompt: "You are a reviewer".to_string(),
            prompt_body: "Review this".to_string(),
            max_output_tokens: 2048,
            session_id: "s".to_string(),
            stage_name: "review".to_string(),
        };

        let body = client.build_request_body(&request);
        assert_eq!(body["model"], "claude-sonnet");
        assert_eq!(body["max_tokens"], 2048);
        assert_eq!(body["system"], "You are a reviewer");
        assert_eq!(body["messages"][0]["role"], "user");
    }

    #[test]
    fn test_system_omitted_when_empty() {
        let client = AnthropicClient {
            api_key: "key".to_string(),
            base_url: "x".to_string(),
            http: Client::new(),
        };
        let request = CompletionRequest {
            model: "m".to_string(),
            system_prompt: String::new(),
            prompt_body: "hi".to_string(),
            max_output_tokens: 10,
            session_id: "s".to_string(),
            stage_name: "t".to_string(),
        };
        assert!(client.build_request_body(&request).get("system").is_none());
    }

    #[test]
    fn test_response_parsing() {
        let json = r#"{
            "model": "claude-sonnet",
            "content": [{"type": "text", "text": "hello "}, {"type": "text", "text": "world"}],
            "usage": {"input_tokens": 12, "output_tokens": 3}
        }"#;
        let parsed: MessagesResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.usage.input_tokens, 12);
        assert_eq!(parsed.content.len(), 2);
    }
}
