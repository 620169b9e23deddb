//! ProviderClient trait definition

use async_trait::async_trait;

use super::error::DispatchError;
use super::types::{CompletionRequest, CompletionResponse};

/// Stateless provider transport - one request, one response
///
/// Implementations do no retrying and no window accounting; both belong to
/// the dispatcher so that stage retry policies stay in charge.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Send a single completion request
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, DispatchError>;
}
