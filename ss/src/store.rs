//! SessionStore implementation
//!
//! One JSONL log per session, sidecar index for summaries. The log is the
//! source of truth; the index is a rebuildable cache.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::types::{
    ControlRecord, LogLine, SessionData, SessionId, SessionState, SessionSummary, StoredEvent, generate_session_id,
    now_utc,
};

/// Flush the index to disk every this many appends per store
const INDEX_FLUSH_INTERVAL: u64 = 64;

struct SessionWriter {
    writer: BufWriter<File>,
    next_seq: u64,
}

/// Append-only session event-log store
///
/// Not internally synchronised: callers that share a store across tasks own
/// it behind an actor or a lock so that appends stay serialised per session.
pub struct SessionStore {
    sessions_dir: PathBuf,
    index_path: PathBuf,
    index: HashMap<SessionId, SessionSummary>,
    writers: HashMap<SessionId, SessionWriter>,
    appends_since_flush: u64,
}

impl SessionStore {
    /// Open (or create) a store rooted at `root`
    ///
    /// Loads the sidecar index if present; a missing or unreadable index is
    /// rebuilt from the log files.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref();
        debug!(root = %root.display(), "SessionStore::open: called");

        let sessions_dir = root.join("sessions");
        fs::create_dir_all(&sessions_dir)?;
        let index_path = root.join("index.json");

        let mut store = Self {
            sessions_dir,
            index_path,
            index: HashMap::new(),
            writers: HashMap::new(),
            appends_since_flush: 0,
        };

        match store.load_index() {
            Ok(count) => {
                debug!(count, "SessionStore::open: index loaded");
            }
            Err(e) => {
                warn!(error = %e, "SessionStore::open: index unreadable, rebuilding from logs");
                store.rebuild_index()?;
            }
        }

        Ok(store)
    }

    fn load_index(&mut self) -> Result<usize, StoreError> {
        if !self.index_path.exists() {
            debug!("SessionStore::load_index: no index file, rebuilding");
            self.rebuild_index()?;
            return Ok(self.index.len());
        }
        let content = fs::read_to_string(&self.index_path)?;
        let summaries: Vec<SessionSummary> = serde_json::from_str(&content)?;
        self.index = summaries.into_iter().map(|s| (s.id.clone(), s)).collect();
        Ok(self.index.len())
    }

    fn log_path(&self, id: &str) -> PathBuf {
        self.sessions_dir.join(format!("{}.log", id))
    }

    /// Create a new session, returning its id
    ///
    /// Writes the `created` control line immediately so the log file exists
    /// before the first event arrives.
    pub fn create(&mut self, command: &str, args: Value) -> Result<SessionId, StoreError> {
        let id = generate_session_id();
        debug!(%id, command, "SessionStore::create: called");

        let now = now_utc();
        let line = LogLine {
            seq: 0,
            timestamp: now,
            event: None,
            control: Some(ControlRecord::Created {
                command: command.to_string(),
                args: args.clone(),
            }),
        };

        let file = OpenOptions::new().create_new(true).append(true).open(self.log_path(&id))?;
        let mut writer = BufWriter::new(file);
        writeln!(writer, "{}", serde_json::to_string(&line)?)?;
        writer.flush()?;

        self.writers.insert(id.clone(), SessionWriter { writer, next_seq: 1 });
        self.index.insert(
            id.clone(),
            SessionSummary {
                id: id.clone(),
                command: command.to_string(),
                args,
                state: SessionState::Live,
                events: 0,
                last_seq: 0,
                created_at: now,
                updated_at: now,
            },
        );
        self.flush_index()?;

        info!(%id, command, "Session created");
        Ok(id)
    }

    /// Append an event line, returning its sequence number
    ///
    /// Durable on return: the line has been flushed to the log file.
    pub fn append(&mut self, id: &str, event: &Value) -> Result<u64, StoreError> {
        let summary = self
            .index
            .get(id)
            .ok_or_else(|| StoreError::SessionNotFound(id.to_string()))?;
        if summary.state.is_terminal() {
            return Err(StoreError::SessionTerminal(id.to_string()));
        }

        let now = now_utc();
        let seq = self.write_line(
            id,
            LogLine {
                seq: 0, // patched by write_line
                timestamp: now,
                event: Some(event.clone()),
                control: None,
            },
        )?;

        let summary = self.index.get_mut(id).expect("summary checked above");
        summary.events += 1;
        summary.last_seq = seq;
        summary.updated_at = now;

        self.appends_since_flush += 1;
        if self.appends_since_flush >= INDEX_FLUSH_INTERVAL {
            self.flush_index()?;
        }

        Ok(seq)
    }

    /// Transition a session's state
    ///
    /// Terminal transitions close the cached writer; further appends fail.
    pub fn set_state(&mut self, id: &str, state: SessionState) -> Result<(), StoreError> {
        debug!(%id, %state, "SessionStore::set_state: called");
        let summary = self
            .index
            .get(id)
            .ok_or_else(|| StoreError::SessionNotFound(id.to_string()))?;
        if summary.state.is_terminal() {
            return Err(StoreError::SessionTerminal(id.to_string()));
        }

        let now = now_utc();
        let seq = self.write_line(
            id,
            LogLine {
                seq: 0,
                timestamp: now,
                event: None,
                control: Some(ControlRecord::StateChanged { state }),
            },
        )?;

        let summary = self.index.get_mut(id).expect("summary checked above");
        summary.state = state;
        summary.last_seq = seq;
        summary.updated_at = now;

        if state.is_terminal() {
            if let Some(mut w) = self.writers.remove(id) {
                let _ = w.writer.flush();
            }
        }
        self.flush_index()?;
        Ok(())
    }

    fn write_line(&mut self, id: &str, mut line: LogLine) -> Result<u64, StoreError> {
        if !self.writers.contains_key(id) {
            // Reopen a writer for a session created in a previous process
            let path = self.log_path(id);
            debug!(%id, path = %path.display(), "SessionStore::write_line: reopening log");
            let file = OpenOptions::new().append(true).open(&path)?;
            let next_seq = self.index.get(id).map(|s| s.last_seq + 1).unwrap_or(0);
            self.writers.insert(
                id.to_string(),
                SessionWriter {
                    writer: BufWriter::new(file),
                    next_seq,
                },
            );
        }
        let entry = self.writers.get_mut(id).expect("writer ensured above");

        line.seq = entry.next_seq;
        writeln!(entry.writer, "{}", serde_json::to_string(&line)?)?;
        entry.writer.flush()?;
        entry.next_seq += 1;
        Ok(line.seq)
    }

    /// Read a session's summary and all of its event lines
    pub fn get(&self, id: &str) -> Result<SessionData, StoreError> {
        let summary = self
            .index
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::SessionNotFound(id.to_string()))?;
        let events = self.read_events(id)?;
        Ok(SessionData { summary, events })
    }

    /// Read only the event lines of a session
    pub fn read_events(&self, id: &str) -> Result<Vec<StoredEvent>, StoreError> {
        let path = self.log_path(id);
        if !path.exists() {
            return Err(StoreError::SessionNotFound(id.to_string()));
        }

        let content = fs::read_to_string(&path)?;
        let mut events = Vec::new();
        for (lineno, raw) in content.lines().enumerate() {
            if raw.trim().is_empty() {
                continue;
            }
            let line: LogLine = serde_json::from_str(raw).map_err(|e| StoreError::CorruptLog {
                path: path.display().to_string(),
                line: lineno + 1,
                reason: e.to_string(),
            })?;
            if let Some(event) = line.event {
                events.push(StoredEvent {
                    seq: line.seq,
                    timestamp: line.timestamp,
                    event,
                });
            }
        }
        Ok(events)
    }

    /// Look up a session's summary without reading the log
    pub fn summary(&self, id: &str) -> Result<SessionSummary, StoreError> {
        self.index
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::SessionNotFound(id.to_string()))
    }

    /// Case-insensitive substring search over id, command, and args
    pub fn search(&self, query: &str) -> Vec<SessionSummary> {
        let needle = query.to_lowercase();
        let mut hits: Vec<_> = self
            .index
            .values()
            .filter(|s| {
                s.id.to_lowercase().contains(&needle)
                    || s.command.to_lowercase().contains(&needle)
                    || s.args.to_string().to_lowercase().contains(&needle)
            })
            .cloned()
            .collect();
        hits.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        hits
    }

    /// Most recently created sessions, newest first
    pub fn list_recent(&self, limit: usize) -> Vec<SessionSummary> {
        let mut all: Vec<_> = self.index.values().cloned().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        all.truncate(limit);
        all
    }

    /// Rebuild the index by scanning every log file
    ///
    /// Recovers command, args, state, and counters from control and event
    /// lines. Unparseable files are skipped with a warning rather than
    /// failing the rebuild.
    pub fn rebuild_index(&mut self) -> Result<usize, StoreError> {
        debug!(dir = %self.sessions_dir.display(), "SessionStore::rebuild_index: called");
        self.index.clear();

        for dir_entry in fs::read_dir(&self.sessions_dir)? {
            let dir_entry = dir_entry?;
            let path = dir_entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("log") {
                continue;
            }
            let id = match path.file_stem().and_then(|s| s.to_str()) {
                Some(s) => s.to_string(),
                None => continue,
            };
            match self.scan_log(&path, &id) {
                Ok(summary) => {
                    self.index.insert(id, summary);
                }
                Err(e) => {
                    warn!(%id, error = %e, "rebuild_index: skipping unreadable log");
                }
            }
        }

        self.flush_index()?;
        info!(count = self.index.len(), "Index rebuilt from session logs");
        Ok(self.index.len())
    }

    fn scan_log(&self, path: &Path, id: &str) -> Result<SessionSummary, StoreError> {
        let content = fs::read_to_string(path)?;
        let mut summary: Option<SessionSummary> = None;

        for (lineno, raw) in content.lines().enumerate() {
            if raw.trim().is_empty() {
                continue;
            }
            let line: LogLine = serde_json::from_str(raw).map_err(|e| StoreError::CorruptLog {
                path: path.display().to_string(),
                line: lineno + 1,
                reason: e.to_string(),
            })?;

            match (&mut summary, &line.control, &line.event) {
                (None, Some(ControlRecord::Created { command, args }), _) => {
                    summary = Some(SessionSummary {
                        id: id.to_string(),
                        command: command.clone(),
                        args: args.clone(),
                        state: SessionState::Live,
                        events: 0,
                        last_seq: line.seq,
                        created_at: line.timestamp,
                        updated_at: line.timestamp,
                    });
                }
                (Some(s), Some(ControlRecord::StateChanged { state }), _) => {
                    s.state = *state;
                    s.last_seq = line.seq;
                    s.updated_at = line.timestamp;
                }
                (Some(s), None, Some(_)) => {
                    s.events += 1;
                    s.last_seq = line.seq;
                    s.updated_at = line.timestamp;
                }
                _ => {
                    return Err(StoreError::CorruptLog {
                        path: path.display().to_string(),
                        line: lineno + 1,
                        reason: "log does not begin with a created record".to_string(),
                    });
                }
            }
        }

        summary.ok_or_else(|| StoreError::CorruptLog {
            path: path.display().to_string(),
            line: 0,
            reason: "empty log file".to_string(),
        })
    }

    /// Write the index atomically (write-temp-and-rename under an advisory lock)
    pub fn flush_index(&mut self) -> Result<(), StoreError> {
        let lock_path = self.index_path.with_extension("lock");
        let lock_file = OpenOptions::new().create(true).truncate(false).write(true).open(&lock_path)?;
        lock_file.lock_exclusive()?;

        let mut summaries: Vec<_> = self.index.values().cloned().collect();
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        let tmp_path = self.index_path.with_extension("json.tmp");
        fs::write(&tmp_path, serde_json::to_vec_pretty(&summaries)?)?;
        fs::rename(&tmp_path, &self.index_path)?;

        fs2::FileExt::unlock(&lock_file)?;
        self.appends_since_flush = 0;
        Ok(())
    }
}

impl Drop for SessionStore {
    fn drop(&mut self) {
        for (_, mut w) in self.writers.drain() {
            let _ = w.writer.flush();
        }
        let _ = self.flush_index();
    }
}
