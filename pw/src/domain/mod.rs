//! Core domain types
//!
//! Frozen descriptor records built once at startup (prompts, agents,
//! commands) plus the runtime session/stage bookkeeping the scheduler
//! maintains while a pipeline runs.

mod agent;
mod command;
mod prompt;
mod session;

pub use agent::AgentCapability;
pub use command::{
    CommandDescriptor, EscalationAction, EscalationPolicy, EscalationTrigger, InputSource, OutputRef, RetryPolicy,
    Stage,
};
pub use prompt::{InputKind, ModelRequirements, PromptDependencies, PromptDescriptor, PromptInput, TokenBudget};
pub use session::{FailureKind, RunOutcome, RunResult, StageFailure, StageRecord, StageState};
