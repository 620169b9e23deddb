//! LLM dispatch subsystem
//!
//! Provider transports behind [`ProviderClient`], the per-session
//! [`LlmDispatcher`] that enforces context windows and retry policies, and
//! the token-accounting state it maintains.

use std::sync::Arc;

use tracing::debug;

mod anthropic;
mod context;
mod dispatcher;
mod error;
pub mod provider;
mod types;

pub use anthropic::AnthropicClient;
pub use context::ContextWindowState;
pub use dispatcher::{ContextThresholds, LlmDispatcher, ModelCatalog};
pub use error::{DispatchError, classify_status};
pub use provider::ProviderClient;
pub use types::{CompletionRequest, CompletionResponse};

use crate::config::LlmConfig;

/// Create a provider client for the configured provider
///
/// Reference implementation ships the Anthropic transport; anything else is
/// a configuration error.
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn ProviderClient>, DispatchError> {
    debug!(provider = %config.provider, "create_provider: called");
    match config.provider.as_str() {
        "anthropic" => Ok(Arc::new(AnthropicClient::from_config(config)?)),
        other => Err(DispatchError::ResponseInvalid(format!(
            "Unknown LLM provider: '{}'. Supported: anthropic",
            other
        ))),
    }
}
