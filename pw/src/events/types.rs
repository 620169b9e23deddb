//! Pipeline event vocabulary
//!
//! Every observable step of a run is one `PipelineEvent`: an envelope
//! (timestamp, session, optional stage) around a tagged payload. Observers
//! receive events over the bus; the session store persists the same
//! envelopes as JSON lines.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::{FailureKind, RunOutcome};

/// Envelope common to all events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineEvent {
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl PipelineEvent {
    /// Stamp a payload with the current time
    pub fn now(session_id: impl Into<String>, stage: Option<String>, payload: EventPayload) -> Self {
        Self {
            timestamp: Utc::now(),
            session_id: session_id.into(),
            stage,
            payload,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }
}

/// Variant-specific payloads
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventPayload {
    // === Pipeline lifecycle ===
    PipelineStart {
        command: String,
        is_resumed: bool,
    },
    PipelineComplete {
        outcome: RunOutcome,
        total_prompt_tokens: u64,
        total_output_tokens: u64,
    },
    PipelineError {
        /// Machine-readable reason, e.g. `cancelled`
        reason: String,
        message: String,
    },

    // === Stage lifecycle ===
    StageStart {
        agent: String,
        prompt_id: String,
        is_parallel: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        worktree: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        branch: Option<String>,
    },
    StageProgress {
        message: String,
        warning: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        utilisation_percent: Option<f64>,
    },
    StageComplete {
        outputs: Map<String, Value>,
        attempts: u32,
        duration_ms: u64,
    },
    StageError {
        kind: FailureKind,
        message: String,
        attempts: u32,
    },

    // === LLM dispatch ===
    LlmRequest {
        model: String,
        attempt: u32,
        estimated_prompt_tokens: u64,
        max_output_tokens: u64,
    },
    LlmResponse {
        model: String,
        prompt_tokens: u64,
        output_tokens: u64,
        duration_ms: u64,
        /// Raw response body; kept in the log so an interrupted session can
        /// replay output parsing without re-dispatching
        content: String,
    },
    AgentThinking {
        agent: String,
        text: String,
    },

    // === Escalation ===
    EscalationTriggered {
        from_agent: String,
        reason: String,
        action: String,
    },
    EscalationResolved {
        to_agent: String,
        model: String,
    },
    EscalationAborted {
        reason: String,
    },

    // === External tool hooks ===
    ToolHookTriggered {
        server_id: String,
        needs_approval: bool,
    },
    ToolHookBlocked {
        server_id: String,
        reason: String,
    },
    ToolHookPost {
        server_id: String,
    },
}

/// Discriminant for filtered subscriptions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    PipelineStart,
    PipelineComplete,
    PipelineError,
    StageStart,
    StageProgress,
    StageComplete,
    StageError,
    LlmRequest,
    LlmResponse,
    AgentThinking,
    EscalationTriggered,
    EscalationResolved,
    EscalationAborted,
    ToolHookTriggered,
    ToolHookBlocked,
    ToolHookPost,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PipelineStart => "PipelineStart",
            Self::PipelineComplete => "PipelineComplete",
            Self::PipelineError => "PipelineError",
            Self::StageStart => "StageStart",
            Self::StageProgress => "StageProgress",
            Self::StageComplete => "StageComplete",
            Self::StageError => "StageError",
            Self::LlmRequest => "LlmRequest",
            Self::LlmResponse => "LlmResponse",
            Self::AgentThinking => "AgentThinking",
            Self::EscalationTriggered => "EscalationTriggered",
            Self::EscalationResolved => "EscalationResolved",
            Self::EscalationAborted => "EscalationAborted",
            Self::ToolHookTriggered => "ToolHookTriggered",
            Self::ToolHookBlocked => "ToolHookBlocked",
            Self::ToolHookPost => "ToolHookPost",
        }
    }
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::PipelineStart { .. } => EventKind::PipelineStart,
            Self::PipelineComplete { .. } => EventKind::PipelineComplete,
            Self::PipelineError { .. } => EventKind::PipelineError,
            Self::StageStart { .. } => EventKind::StageStart,
            Self::StageProgress { .. } => EventKind::StageProgress,
            Self::StageComplete { .. } => EventKind::StageComplete,
            Self::StageError { .. } => EventKind::StageError,
            Self::LlmRequest { .. } => EventKind::LlmRequest,
            Self::LlmResponse { .. } => EventKind::LlmResponse,
            Self::AgentThinking { .. } => EventKind::AgentThinking,
            Self::EscalationTriggered { .. } => EventKind::EscalationTriggered,
            Self::EscalationResolved { .. } => EventKind::EscalationResolved,
            Self::EscalationAborted { .. } => EventKind::EscalationAborted,
            Self::ToolHookTriggered { .. } => EventKind::ToolHookTriggered,
            Self::ToolHookBlocked { .. } => EventKind::ToolHookBlocked,
            Self::ToolHookPost { .. } => EventKind::ToolHookPost,
        }
    }

    /// Whether the payload ends a stage's story
    pub fn is_stage_terminal(&self) -> bool {
        matches!(self, Self::StageComplete { .. } | Self::StageError { .. })
    }
}
