//! SessionManager - actor that owns the session store
//!
//! Processes commands via channels so that exactly one writer touches the
//! store, which keeps appends serialised per session.

use std::path::Path;

use sessionstore::{SessionData, SessionId, SessionState, SessionStore, SessionSummary, StoreError};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::events::PipelineEvent;

/// Errors surfaced by session operations
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Session manager is shut down")]
    ChannelClosed,
}

enum StoreCommand {
    Create {
        command: String,
        args: Value,
        resp: oneshot::Sender<Result<SessionId, StoreError>>,
    },
    Append {
        id: SessionId,
        event: Box<PipelineEvent>,
        resp: oneshot::Sender<Result<u64, StoreError>>,
    },
    SetState {
        id: SessionId,
        state: SessionState,
        resp: oneshot::Sender<Result<(), StoreError>>,
    },
    Get {
        id: SessionId,
        resp: oneshot::Sender<Result<SessionData, StoreError>>,
    },
    Search {
        query: String,
        resp: oneshot::Sender<Vec<SessionSummary>>,
    },
    ListRecent {
        limit: usize,
        resp: oneshot::Sender<Vec<SessionSummary>>,
    },
}

/// Handle to the session store actor; cheap to clone
#[derive(Clone)]
pub struct SessionManager {
    tx: mpsc::Sender<StoreCommand>,
}

impl SessionManager {
    /// Open the store at `root` and spawn the actor task
    pub fn spawn(root: impl AsRef<Path>) -> Result<Self, SessionError> {
        debug!(root = %root.as_ref().display(), "SessionManager::spawn: called");
        let store = SessionStore::open(root)?;
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(actor_loop(store, rx));
        info!("SessionManager spawned");
        Ok(Self { tx })
    }

    async fn send<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> StoreCommand,
    ) -> Result<T, SessionError> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(build(resp))
            .await
            .map_err(|_| SessionError::ChannelClosed)?;
        rx.await.map_err(|_| SessionError::ChannelClosed)
    }

    /// Create a new live session
    pub async fn create(&self, command: &str, args: Value) -> Result<SessionId, SessionError> {
        let command = command.to_string();
        Ok(self.send(move |resp| StoreCommand::Create { command, args, resp }).await??)
    }

    /// Append one event, durable on return
    pub async fn append(&self, id: &str, event: PipelineEvent) -> Result<u64, SessionError> {
        let id = id.to_string();
        Ok(self
            .send(move |resp| StoreCommand::Append {
                id,
                event: Box::new(event),
                resp,
            })
            .await??)
    }

    /// Transition the session's lifecycle state
    pub async fn set_state(&self, id: &str, state: SessionState) -> Result<(), SessionError> {
        let id = id.to_string();
        Ok(self.send(move |resp| StoreCommand::SetState { id, state, resp }).await??)
    }

    /// Read a session's summary and raw events
    pub async fn get(&self, id: &str) -> Result<SessionData, SessionError> {
        let id = id.to_string();
        Ok(self.send(move |resp| StoreCommand::Get { id, resp }).await??)
    }

    /// Read a session's events decoded as pipeline events
    ///
    /// Lines that no longer decode (format drift) are skipped with a
    /// warning rather than failing the read.
    pub async fn get_events(&self, id: &str) -> Result<Vec<PipelineEvent>, SessionError> {
        let data = self.get(id).await?;
        let mut events = Vec::with_capacity(data.events.len());
        for stored in data.events {
            match serde_json::from_value::<PipelineEvent>(stored.event) {
                Ok(event) => events.push(event),
                Err(e) => warn!(session_id = %id, seq = stored.seq, error = %e, "get_events: skipping undecodable event"),
            }
        }
        Ok(events)
    }

    pub async fn search(&self, query: &str) -> Result<Vec<SessionSummary>, SessionError> {
        let query = query.to_string();
        self.send(move |resp| StoreCommand::Search { query, resp }).await
    }

    pub async fn list_recent(&self, limit: usize) -> Result<Vec<SessionSummary>, SessionError> {
        self.send(move |resp| StoreCommand::ListRecent { limit, resp }).await
    }
}

async fn actor_loop(mut store: SessionStore, mut rx: mpsc::Receiver<StoreCommand>) {
    debug!("SessionManager actor started");
    while let Some(command) = rx.recv().await {
        match command {
            StoreCommand::Create { command, args, resp } => {
                let _ = resp.send(store.create(&command, args));
            }
            StoreCommand::Append { id, event, resp } => {
                let result = serde_json::to_value(&*event)
                    .map_err(StoreError::Json)
                    .and_then(|value| store.append(&id, &value));
                let _ = resp.send(result);
            }
            StoreCommand::SetState { id, state, resp } => {
                let _ = resp.send(store.set_state(&id, state));
            }
            StoreCommand::Get { id, resp } => {
                let _ = resp.send(store.get(&id));
            }
            StoreCommand::Search { query, resp } => {
                let _ = resp.send(store.search(&query));
            }
            StoreCommand::ListRecent { limit, resp } => {
                let _ = resp.send(store.list_recent(limit));
            }
        }
    }
    debug!("SessionManager actor stopped");
}
