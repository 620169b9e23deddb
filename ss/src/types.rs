//! Session store domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque session identifier (UUIDv7, time-ordered)
pub type SessionId = String;

/// Current UTC timestamp
pub fn now_utc() -> DateTime<Utc> {
    Utc::now()
}

/// Generate a fresh session id
pub fn generate_session_id() -> SessionId {
    uuid::Uuid::now_v7().to_string()
}

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Accepting appends
    #[default]
    Live,
    /// Finished successfully (or partially)
    Completed,
    /// Finished with failure
    Failed,
    /// Cancelled by the caller
    Aborted,
}

impl SessionState {
    /// Terminal states refuse further appends
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionState::Live)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "live"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

/// One line of a session log file
///
/// Either an opaque event payload or a store-level control record. Control
/// records let `rebuild_index` recover session state without understanding
/// the event payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    /// Monotonic per-session sequence number
    pub seq: u64,
    /// Timestamp of the append
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,
    /// Event payload (absent for control lines)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<Value>,
    /// Store control record (absent for event lines)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub control: Option<ControlRecord>,
}

/// Store-level control records interleaved with events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControlRecord {
    /// Written as the first line of every log
    Created { command: String, args: Value },
    /// Session state transition
    StateChanged { state: SessionState },
}

/// An event read back from a session log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEvent {
    pub seq: u64,
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,
    pub event: Value,
}

/// Index entry describing one session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    /// Session id
    pub id: SessionId,
    /// Command that created the session
    pub command: String,
    /// Command arguments
    #[serde(default)]
    pub args: Value,
    /// Current state
    pub state: SessionState,
    /// Number of event lines appended
    pub events: u64,
    /// Sequence number of the last line written (control lines included)
    #[serde(default)]
    pub last_seq: u64,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Timestamp of the last append or state change
    pub updated_at: DateTime<Utc>,
}

/// A full session read back from the store
#[derive(Debug, Clone)]
pub struct SessionData {
    pub summary: SessionSummary,
    pub events: Vec<StoredEvent>,
}
