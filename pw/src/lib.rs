//! Pipewright - pipeline execution engine for AI-assisted development
//! workflows
//!
//! A command is a declarative DAG of prompt stages. The engine schedules
//! stages layer by layer, dispatches each to an LLM provider under retry
//! and context-window policies, emits a live event stream for observers,
//! and persists every event into a resumable session log.
//!
//! # Core concepts
//!
//! - **Durable events first**: every event hits the session store before
//!   observers see it; the log alone can reconstruct a run
//! - **Resume, don't redo**: completed stages are never re-dispatched; an
//!   interrupted response replays through output parsing only
//! - **Failures stay local**: stage failures skip their dependents while
//!   independent branches keep running
//!
//! # Modules
//!
//! - [`registry`] - one-shot prompt/command/agent loading
//! - [`scheduler`] - the DAG executor
//! - [`llm`] - provider transports and the dispatching gate
//! - [`events`] - typed event stream and bus
//! - [`session`] - persistence and resume machinery
//! - [`mcp`] - external tool-server approvals and probing

pub mod cancel;
pub mod cleanup;
pub mod cli;
pub mod config;
pub mod domain;
pub mod events;
pub mod llm;
pub mod mcp;
pub mod orchestrator;
pub mod registry;
pub mod scheduler;
pub mod session;

// Re-export commonly used types
pub use cancel::{CancelHandle, CancelToken, cancel_pair};
pub use cleanup::{CleanupScheduler, spawn_cleanup_timer};
pub use config::{Config, LlmConfig};
pub use domain::{
    AgentCapability, CommandDescriptor, EscalationAction, EscalationPolicy, EscalationTrigger, FailureKind,
    PromptDescriptor, RetryPolicy, RunOutcome, RunResult, Stage, StageFailure, StageRecord, StageState,
};
pub use events::{EventBus, EventKind, EventPayload, PipelineEvent, SessionEmitter, create_event_bus};
pub use llm::{
    AnthropicClient, CompletionRequest, CompletionResponse, ContextThresholds, ContextWindowState, DispatchError,
    LlmDispatcher, ModelCatalog, ProviderClient, create_provider,
};
pub use mcp::{ApprovalMemory, Availability, McpApprovalCache, McpClientManager, McpError, McpServerConfig};
pub use orchestrator::{Orchestrator, RunOptions};
pub use registry::{AgentRegistry, PromptRegistry, RegistryError};
pub use scheduler::{SchedulerConfig, StageScheduler};
pub use session::{SessionManager, SessionReplay};
