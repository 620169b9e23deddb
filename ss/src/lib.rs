//! SessionStore - append-only session event-log persistence
//!
//! Each session is one JSONL file under `<root>/sessions/<id>.log` plus a
//! sidecar `index.json` holding summaries for fast listing and search. The
//! log is the source of truth: the index may lag or go missing and is always
//! rebuildable from the logs.
//!
//! # Guarantees
//!
//! - **Durability**: `append` returns only after the line is flushed to disk
//! - **Terminal sessions are frozen**: appends to a completed/failed/aborted
//!   session fail with [`StoreError::SessionTerminal`]
//! - **Single writer**: the store serialises appends per session; callers
//!   needing cross-task access should own the store behind an actor
//!
//! External consumers must go through this API; the on-disk line format is
//! not a supported contract and may migrate.

mod error;
mod store;
mod types;

pub use error::StoreError;
pub use store::SessionStore;
pub use types::{
    ControlRecord, LogLine, SessionData, SessionId, SessionState, SessionSummary, StoredEvent, generate_session_id,
    now_utc,
};
