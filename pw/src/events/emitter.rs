//! Emitter handles - durable, ordered event emission
//!
//! A [`SessionEmitter`] stamps payloads into envelopes, appends them to the
//! session store (durability first), then publishes on the bus. The
//! [`StageEmitter`] wraps it per stage task and, while the stage runs inside
//! a parallel cohort, buffers the stage's narrative so observers read it as
//! one contiguous block.

use std::sync::Arc;

use tracing::{debug, warn};

use super::bus::EventBus;
use super::types::{EventPayload, PipelineEvent};
use crate::session::SessionManager;

/// Handle for components to emit events for one session
#[derive(Clone)]
pub struct SessionEmitter {
    session_id: String,
    bus: Arc<EventBus>,
    store: SessionManager,
}

impl SessionEmitter {
    pub fn new(session_id: impl Into<String>, bus: Arc<EventBus>, store: SessionManager) -> Self {
        let session_id = session_id.into();
        debug!(%session_id, "SessionEmitter::new: creating emitter");
        Self { session_id, bus, store }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Append to the store, then publish
    ///
    /// Timestamps are assigned here, at append time, which keeps the
    /// per-session log monotonic even when stage tasks interleave. A store
    /// write failure degrades to a warning so the live event flow survives
    /// a sick disk; the bus still sees the event.
    pub async fn emit(&self, stage: Option<String>, payload: EventPayload) {
        let event = PipelineEvent::now(&self.session_id, stage, payload);
        if let Err(e) = self.store.append(&self.session_id, event.clone()).await {
            warn!(session_id = %self.session_id, error = %e, "SessionEmitter: failed to persist event");
        }
        self.bus.publish(event);
    }
}

/// Per-stage emitter with cohort buffering
///
/// `StageStart` and the terminal event always go out immediately; interior
/// events (`AgentThinking`, `StageProgress`, LLM request/response,
/// escalation markers) are buffered while `buffered` is set and flushed as
/// one block right before the terminal event.
pub struct StageEmitter {
    inner: SessionEmitter,
    stage: String,
    buffered: bool,
    buffer: Vec<EventPayload>,
}

impl StageEmitter {
    pub fn new(inner: SessionEmitter, stage: impl Into<String>, buffered: bool) -> Self {
        Self {
            inner,
            stage: stage.into(),
            buffered,
            buffer: Vec::new(),
        }
    }

    pub fn stage(&self) -> &str {
        &self.stage
    }

    pub fn session_id(&self) -> &str {
        self.inner.session_id()
    }

    /// Emit immediately, bypassing the buffer (used for `StageStart`)
    pub async fn emit_now(&self, payload: EventPayload) {
        self.inner.emit(Some(self.stage.clone()), payload).await;
    }

    /// Emit an interior event; buffered while the cohort runs
    pub async fn emit(&mut self, payload: EventPayload) {
        if self.buffered {
            self.buffer.push(payload);
        } else {
            self.inner.emit(Some(self.stage.clone()), payload).await;
        }
    }

    /// Flush any buffered narrative, then emit the terminal event
    pub async fn finish(&mut self, terminal: EventPayload) {
        for payload in self.buffer.drain(..) {
            self.inner.emit(Some(self.stage.clone()), payload).await;
        }
        self.inner.emit(Some(self.stage.clone()), terminal).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::bus::create_event_bus;
    use crate::events::types::EventKind;
    use tempfile::TempDir;

    fn thinking(text: &str) -> EventPayload {
        EventPayload::AgentThinking {
            agent: "planner".to_string(),
            text: text.to_string(),
        }
    }

    fn complete() -> EventPayload {
        EventPayload::StageComplete {
            outputs: serde_json::Map::new(),
            attempts: 1,
            duration_ms: 5,
        }
    }

    async fn emitter(dir: &TempDir, buffered: bool) -> (StageEmitter, Arc<EventBus>, SessionManager, String) {
        let bus = create_event_bus();
        let store = SessionManager::spawn(dir.path()).unwrap();
        let id = store.create("plan", serde_json::json!({})).await.unwrap();
        let session = SessionEmitter::new(&id, bus.clone(), store.clone());
        (StageEmitter::new(session, "gather", buffered), bus, store, id)
    }

    #[tokio::test]
    async fn test_unbuffered_passthrough() {
        let dir = TempDir::new().unwrap();
        let (mut stage, bus, _store, _id) = emitter(&dir, false).await;
        let mut rx = bus.subscribe();

        stage.emit(thinking("first")).await;
        assert_eq!(rx.recv().await.unwrap().kind(), EventKind::AgentThinking);
    }

    #[tokio::test]
    async fn test_buffered_until_finish() {
        let dir = TempDir::new().unwrap();
        let (mut stage, bus, _store, _id) = emitter(&dir, true).await;
        let mut rx = bus.subscribe();

        stage.emit(thinking("a")).await;
        stage.emit(thinking("b")).await;
        assert!(rx.try_recv().is_err(), "interior events must stay buffered");

        stage.finish(complete()).await;

        assert_eq!(rx.recv().await.unwrap().kind(), EventKind::AgentThinking);
        assert_eq!(rx.recv().await.unwrap().kind(), EventKind::AgentThinking);
        assert_eq!(rx.recv().await.unwrap().kind(), EventKind::StageComplete);
    }

    #[tokio::test]
    async fn test_events_persisted_in_flush_order() {
        let dir = TempDir::new().unwrap();
        let (mut stage, _bus, store, id) = emitter(&dir, true).await;

        stage.emit(thinking("a")).await;
        stage.finish(complete()).await;

        let events = store.get_events(&id).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind(), EventKind::AgentThinking);
        assert_eq!(events[1].kind(), EventKind::StageComplete);
        assert!(events[0].timestamp <= events[1].timestamp);
    }
}
