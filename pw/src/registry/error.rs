//! Registry error types

use thiserror::Error;

/// Errors raised while loading or querying the prompt/agent registries
///
/// All of these are fatal at startup; a run never begins against a registry
/// that failed to load.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Prompt not found: {0}")]
    PromptNotFound(String),

    #[error("Malformed prompt {path}: {reason}")]
    PromptMalformed { path: String, reason: String },

    #[error("Cyclic prompt dependency involving '{0}'")]
    PromptCyclicDependency(String),

    #[error("Command not found: {0}")]
    CommandNotFound(String),

    #[error("Malformed command {path}: {reason}")]
    CommandMalformed { path: String, reason: String },

    #[error("Malformed agent registry {path}: {reason}")]
    AgentsMalformed { path: String, reason: String },

    #[error("Registry queried before initialisation")]
    RegistryNotInitialised,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
