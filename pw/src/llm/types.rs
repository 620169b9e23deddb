//! LLM request/response types

use serde::{Deserialize, Serialize};

/// A fully-formed prompt request, ready for a provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// Model id the request targets
    pub model: String,
    /// System prompt (may be empty)
    #[serde(default)]
    pub system_prompt: String,
    /// Rendered prompt body, inputs already substituted
    pub prompt_body: String,
    /// Output token ceiling, reserved against the context window
    pub max_output_tokens: u64,
    /// Session this request belongs to
    pub session_id: String,
    /// Stage that issued the request
    pub stage_name: String,
}

impl CompletionRequest {
    /// Rough prompt-token estimate used for the pre-dispatch window check
    ///
    /// Four characters per token is the usual planning heuristic; actual
    /// usage is reconciled from the provider's response.
    pub fn estimated_prompt_tokens(&self) -> u64 {
        ((self.system_prompt.len() + self.prompt_body.len()) / 4) as u64
    }
}

/// A provider's answer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    /// Raw text content
    pub content: String,
    /// Tokens the provider counted in the prompt
    pub prompt_tokens: u64,
    /// Tokens generated
    pub output_tokens: u64,
    /// Model that actually served the request
    pub model: String,
}
