//! Runtime stage and run bookkeeping
//!
//! A `StageRecord` is the scheduler's view of one stage across attempts;
//! the set of records plus token totals aggregates into a `RunResult`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Machine-readable failure classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ContextOverflow,
    ProviderTimeout,
    ProviderRateLimited,
    ProviderTransient,
    ProviderPermanent,
    ResponseInvalid,
    StageInputInvalid,
    ToolBlocked,
    Cancelled,
    /// Upstream dependency failed; this stage never ran
    DependencyFailed,
}

impl FailureKind {
    /// Transient failures are retried per policy; permanent ones go
    /// straight to escalation
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FailureKind::ProviderTimeout | FailureKind::ProviderRateLimited | FailureKind::ProviderTransient
        )
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ContextOverflow => "context_overflow",
            Self::ProviderTimeout => "provider_timeout",
            Self::ProviderRateLimited => "provider_rate_limited",
            Self::ProviderTransient => "provider_transient",
            Self::ProviderPermanent => "provider_permanent",
            Self::ResponseInvalid => "response_invalid",
            Self::StageInputInvalid => "stage_input_invalid",
            Self::ToolBlocked => "tool_blocked",
            Self::Cancelled => "cancelled",
            Self::DependencyFailed => "dependency_failed",
        };
        write!(f, "{}", s)
    }
}

/// A failure with both machine kind and human message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl StageFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Final state of one stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    /// Never started because an upstream dependency failed
    Skipped,
}

/// Per-stage record captured in the session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: String,
    pub state: StageState,
    /// Dispatch attempts made (escalation re-dispatch included)
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Parsed outputs, keyed by the prompt's declared output names
    #[serde(default)]
    pub outputs: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<StageFailure>,
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

impl StageRecord {
    pub fn new(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            state: StageState::Pending,
            attempts: 0,
            started_at: None,
            ended_at: None,
            outputs: Map::new(),
            failure: None,
            prompt_tokens: 0,
            output_tokens: 0,
        }
    }

    /// Confidence reported by the stage's parsed outputs, if any
    pub fn confidence(&self) -> Option<f64> {
        self.outputs.get("confidence").and_then(Value::as_f64)
    }

    /// Whether downstream stages should be skipped on this stage's say-so
    pub fn skip_downstream(&self) -> bool {
        self.outputs
            .get("skip_downstream")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// Overall command outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    /// Some stage failed but every required output is present
    Partial,
    Failure,
    Cancelled,
}

impl RunOutcome {
    /// Contracted CLI exit codes
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Success => 0,
            RunOutcome::Partial => 1,
            RunOutcome::Failure => 2,
            RunOutcome::Cancelled => 130,
        }
    }
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Partial => write!(f, "partial"),
            Self::Failure => write!(f, "failure"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Aggregated result of one command run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub session_id: String,
    pub outcome: RunOutcome,
    pub stages: HashMap<String, StageRecord>,
    pub total_prompt_tokens: u64,
    pub total_output_tokens: u64,
}
