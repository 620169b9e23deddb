//! MCP approval cache - two-tier store of user decisions
//!
//! Session-scope entries live in memory and die with the process;
//! persistent entries live in `.mcp-approvals.json` and survive restarts.
//! Denials are cached with the same precedence as approvals so a refused
//! server doesn't re-prompt on every stage.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Scope of a user's approval decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalMemory {
    /// Never cache; ask every time
    AlwaysAsk,
    /// Cache in memory for this process, 8-hour TTL
    Session,
    /// Cache on disk, 30-day TTL
    Persistent,
}

/// Session-scope TTL
const SESSION_TTL_HOURS: i64 = 8;
/// Persistent-scope TTL
const PERSISTENT_TTL_DAYS: i64 = 30;

/// One cached decision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpApprovalEntry {
    pub server_id: String,
    pub approved: bool,
    /// Tools the approval is limited to; `None` means all
    #[serde(default)]
    pub allowed_tools: Option<Vec<String>>,
    pub granted_at: DateTime<Utc>,
    /// Missing means never expires
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    pub memory_kind: ApprovalMemory,
}

impl McpApprovalEntry {
    fn is_valid(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|e| e > now).unwrap_or(true)
    }
}

/// On-disk shape of the persistent file
#[derive(Debug, Serialize, Deserialize)]
struct ApprovalFile {
    saved_at: DateTime<Utc>,
    entries: Vec<McpApprovalEntry>,
}

/// Two-tier approval cache
pub struct McpApprovalCache {
    path: PathBuf,
    session: HashMap<String, McpApprovalEntry>,
    persistent: HashMap<String, McpApprovalEntry>,
    persistent_loaded: bool,
}

impl McpApprovalCache {
    /// A cache backed by the given persistent file; the file is read lazily
    /// on first use
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            session: HashMap::new(),
            persistent: HashMap::new(),
            persistent_loaded: false,
        }
    }

    fn ensure_loaded(&mut self) {
        if self.persistent_loaded {
            return;
        }
        self.persistent_loaded = true;

        if !self.path.exists() {
            debug!(path = %self.path.display(), "McpApprovalCache: no persistent file yet");
            return;
        }
        match fs::read_to_string(&self.path) {
            Ok(content) => match serde_json::from_str::<ApprovalFile>(&content) {
                Ok(file) => {
                    debug!(entries = file.entries.len(), "McpApprovalCache: loaded persistent entries");
                    self.persistent = file.entries.into_iter().map(|e| (e.server_id.clone(), e)).collect();
                }
                Err(e) => warn!(error = %e, "McpApprovalCache: persistent file unparseable, starting empty"),
            },
            Err(e) => warn!(error = %e, "McpApprovalCache: persistent file unreadable"),
        }
    }

    /// Look up the cached decision for a server
    ///
    /// Session tier wins over persistent; expired entries are ignored.
    /// `None` means no valid decision is cached.
    pub fn decision(&mut self, server_id: &str) -> Option<bool> {
        let now = Utc::now();
        if let Some(entry) = self.session.get(server_id) {
            if entry.is_valid(now) {
                return Some(entry.approved);
            }
        }
        self.ensure_loaded();
        if let Some(entry) = self.persistent.get(server_id) {
            if entry.is_valid(now) {
                return Some(entry.approved);
            }
        }
        None
    }

    /// Convenience: is there a valid positive decision?
    pub fn is_approved(&mut self, server_id: &str) -> bool {
        self.decision(server_id) == Some(true)
    }

    /// Record a decision under the requested memory kind
    ///
    /// `always_ask` caches nothing. Persistent decisions are flushed to
    /// disk immediately.
    pub fn cache(
        &mut self,
        server_id: &str,
        approved: bool,
        allowed_tools: Option<Vec<String>>,
        memory_kind: ApprovalMemory,
    ) -> eyre::Result<()> {
        let now = Utc::now();
        debug!(server_id, approved, ?memory_kind, "McpApprovalCache::cache: called");

        match memory_kind {
            ApprovalMemory::AlwaysAsk => Ok(()),
            ApprovalMemory::Session => {
                self.session.insert(
                    server_id.to_string(),
                    McpApprovalEntry {
                        server_id: server_id.to_string(),
                        approved,
                        allowed_tools,
                        granted_at: now,
                        expires_at: Some(now + Duration::hours(SESSION_TTL_HOURS)),
                        memory_kind,
                    },
                );
                Ok(())
            }
            ApprovalMemory::Persistent => {
                self.ensure_loaded();
                self.persistent.insert(
                    server_id.to_string(),
                    McpApprovalEntry {
                        server_id: server_id.to_string(),
                        approved,
                        allowed_tools,
                        granted_at: now,
                        expires_at: Some(now + Duration::days(PERSISTENT_TTL_DAYS)),
                        memory_kind,
                    },
                );
                self.flush()
            }
        }
    }

    /// Remove a server's decision from both tiers and flush
    pub fn revoke(&mut self, server_id: &str) -> eyre::Result<()> {
        debug!(server_id, "McpApprovalCache::revoke: called");
        self.ensure_loaded();
        self.session.remove(server_id);
        if self.persistent.remove(server_id).is_some() {
            self.flush()?;
        }
        Ok(())
    }

    /// Write the persistent tier, crash-safe (write-temp-and-rename)
    fn flush(&self) -> eyre::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = ApprovalFile {
            saved_at: Utc::now(),
            entries: self.persistent.values().cloned().collect(),
        };
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&file)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn persistent_path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cache_at(dir: &TempDir) -> McpApprovalCache {
        McpApprovalCache::new(dir.path().join(".mcp-approvals.json"))
    }

    #[test]
    fn test_no_decision_initially() {
        let dir = TempDir::new().unwrap();
        let mut cache = cache_at(&dir);
        assert_eq!(cache.decision("github"), None);
        assert!(!cache.is_approved("github"));
    }

    #[test]
    fn test_always_ask_caches_nothing() {
        let dir = TempDir::new().unwrap();
        let mut cache = cache_at(&dir);
        cache.cache("github", true, None, ApprovalMemory::AlwaysAsk).unwrap();
        assert_eq!(cache.decision("github"), None);
    }

    #[test]
    fn test_session_decision_in_memory_only() {
        let dir = TempDir::new().unwrap();
        let mut cache = cache_at(&dir);
        cache.cache("github", true, None, ApprovalMemory::Session).unwrap();
        assert!(cache.is_approved("github"));
        // Nothing written to disk
        assert!(!cache.persistent_path().exists());

        // A fresh cache (new process) has no memory of it
        let mut fresh = cache_at(&dir);
        assert_eq!(fresh.decision("github"), None);
    }

    #[test]
    fn test_persistent_decision_survives_restart() {
        let dir = TempDir::new().unwrap();
        {
            let mut cache = cache_at(&dir);
            cache.cache("github", true, None, ApprovalMemory::Persistent).unwrap();
        }
        let mut fresh = cache_at(&dir);
        assert!(fresh.is_approved("github"));
    }

    #[test]
    fn test_denial_cached_with_same_precedence() {
        let dir = TempDir::new().unwrap();
        let mut cache = cache_at(&dir);
        cache.cache("sketchy", false, None, ApprovalMemory::Persistent).unwrap();
        assert_eq!(cache.decision("sketchy"), Some(false));

        let mut fresh = cache_at(&dir);
        assert_eq!(fresh.decision("sketchy"), Some(false));
    }

    #[test]
    fn test_session_tier_wins_over_persistent() {
        let dir = TempDir::new().unwrap();
        let mut cache = cache_at(&dir);
        cache.cache("github", false, None, ApprovalMemory::Persistent).unwrap();
        cache.cache("github", true, None, ApprovalMemory::Session).unwrap();
        assert_eq!(cache.decision("github"), Some(true));
    }

    #[test]
    fn test_revoke_clears_both_tiers() {
        let dir = TempDir::new().unwrap();
        let mut cache = cache_at(&dir);
        cache.cache("github", true, None, ApprovalMemory::Session).unwrap();
        cache.cache("github", true, None, ApprovalMemory::Persistent).unwrap();
        cache.revoke("github").unwrap();
        assert_eq!(cache.decision("github"), None);

        let mut fresh = cache_at(&dir);
        assert_eq!(fresh.decision("github"), None);
    }

    #[test]
    fn test_expired_entry_ignored() {
        let dir = TempDir::new().unwrap();
        let mut cache = cache_at(&dir);
        cache.cache("github", true, None, ApprovalMemory::Session).unwrap();
        // Force expiry
        cache.session.get_mut("github").unwrap().expires_at = Some(Utc::now() - Duration::minutes(1));
        assert_eq!(cache.decision("github"), None);
    }

    #[test]
    fn test_missing_expires_at_never_expires() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".mcp-approvals.json");
        // Hand-written file without expires_at
        std::fs::write(
            &path,
            r#"{"saved_at": "2025-01-01T00:00:00Z", "entries": [
                {"server_id": "github", "approved": true, "granted_at": "2025-01-01T00:00:00Z", "memory_kind": "persistent"}
            ]}"#,
        )
        .unwrap();

        let mut cache = McpApprovalCache::new(&path);
        assert!(cache.is_approved("github"));
    }

    #[test]
    fn test_unparseable_file_starts_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".mcp-approvals.json");
        std::fs::write(&path, "not json at all").unwrap();
        let mut cache = McpApprovalCache::new(&path);
        assert_eq!(cache.decision("github"), None);
    }
}
