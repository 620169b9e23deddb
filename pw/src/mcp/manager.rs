//! MCP client manager - server registry, availability probing, approval gate
//!
//! Before a stage may touch an external tool server the manager checks the
//! server is configured and reachable, then consults the approval cache.
//! Missing approvals suspend the stage on the prompter; under `MCP_MODE`
//! prompting is suppressed and unapproved servers are blocked outright.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::approval::{ApprovalMemory, McpApprovalCache};
use crate::events::{EventPayload, StageEmitter};

/// Probe at most this many servers concurrently
const PROBE_CONCURRENCY: usize = 4;

/// Configuration for one external tool server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct McpServerConfig {
    /// Transport; reference implementation supports `stdio`
    pub transport: String,
    /// Command to launch the server
    pub command: Option<String>,
    pub args: Vec<String>,
    pub disabled: bool,
}

impl Default for McpServerConfig {
    fn default() -> Self {
        Self {
            transport: "stdio".to_string(),
            command: None,
            args: vec![],
            disabled: false,
        }
    }
}

/// Result of an availability probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    Ready,
    NotConfigured,
    NotInstalled,
    Disabled,
    ConnectionFailed,
}

impl std::fmt::Display for Availability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Ready => "ready",
            Self::NotConfigured => "not_configured",
            Self::NotInstalled => "not_installed",
            Self::Disabled => "disabled",
            Self::ConnectionFailed => "connection_failed",
        };
        write!(f, "{}", s)
    }
}

/// MCP failures as the scheduler sees them
#[derive(Debug, Error)]
pub enum McpError {
    #[error("MCP server not configured: {0}")]
    ServerNotConfigured(String),

    #[error("MCP server '{server_id}' unavailable: {availability}")]
    ServerUnavailable { server_id: String, availability: Availability },

    #[error("MCP approval denied for server: {0}")]
    ApprovalDenied(String),
}

/// A user's answer to an approval prompt
#[derive(Debug, Clone)]
pub struct ApprovalDecision {
    pub approved: bool,
    pub memory: ApprovalMemory,
    pub allowed_tools: Option<Vec<String>>,
}

/// Asks the user whether a server may be used
///
/// The engine core has no terminal; the caller injects whatever prompting
/// surface it has. The stage suspends on `decide` until an answer arrives.
#[async_trait]
pub trait ApprovalPrompter: Send + Sync {
    async fn decide(&self, server_id: &str) -> ApprovalDecision;
}

/// Registry and gatekeeper for external tool servers
pub struct McpClientManager {
    servers: HashMap<String, McpServerConfig>,
    approvals: Mutex<McpApprovalCache>,
    prompter: Option<Arc<dyn ApprovalPrompter>>,
    /// `MCP_MODE=true`: never prompt, block anything unapproved
    suppress_prompts: bool,
}

impl McpClientManager {
    pub fn new(
        servers: HashMap<String, McpServerConfig>,
        approvals: McpApprovalCache,
        prompter: Option<Arc<dyn ApprovalPrompter>>,
    ) -> Self {
        let suppress_prompts = std::env::var("MCP_MODE").map(|v| v == "true").unwrap_or(false);
        if suppress_prompts {
            info!("MCP_MODE set: approval prompting suppressed");
        }
        Self {
            servers,
            approvals: Mutex::new(approvals),
            prompter,
            suppress_prompts,
        }
    }

    /// Override the MCP_MODE environment detection (tests)
    pub fn with_suppressed_prompts(mut self, suppress: bool) -> Self {
        self.suppress_prompts = suppress;
        self
    }

    /// Probe one server
    pub async fn check_availability(&self, server_id: &str) -> Availability {
        let Some(config) = self.servers.get(server_id) else {
            return Availability::NotConfigured;
        };
        probe(config).await
    }

    /// Probe every configured server, bounded concurrency
    ///
    /// Collects per-server outcomes; one broken server never fails the
    /// sweep.
    pub async fn check_all(&self) -> HashMap<String, Availability> {
        debug!(servers = self.servers.len(), "McpClientManager::check_all: called");
        futures::stream::iter(self.servers.iter())
            .map(|(id, config)| async move { (id.clone(), probe(config).await) })
            .buffer_unordered(PROBE_CONCURRENCY)
            .collect()
            .await
    }

    /// Record an approval decision out-of-band (CLI `mcp approve`)
    pub async fn record_decision(&self, server_id: &str, decision: &ApprovalDecision) -> eyre::Result<()> {
        let mut approvals = self.approvals.lock().await;
        approvals.cache(server_id, decision.approved, decision.allowed_tools.clone(), decision.memory)
    }

    /// Drop a server's cached approval from both tiers
    pub async fn revoke(&self, server_id: &str) -> eyre::Result<()> {
        self.approvals.lock().await.revoke(server_id)
    }

    /// Gate a stage's use of a server
    ///
    /// Emits `ToolHookTriggered` when approval is needed, suspends on the
    /// prompter for the decision, and emits `ToolHookBlocked` on any
    /// refusal. The stage treats a block as a permanent failure.
    pub async fn ensure_approved(&self, server_id: &str, emitter: &mut StageEmitter) -> Result<(), McpError> {
        let Some(config) = self.servers.get(server_id) else {
            emitter
                .emit(EventPayload::ToolHookBlocked {
                    server_id: server_id.to_string(),
                    reason: "not_configured".to_string(),
                })
                .await;
            return Err(McpError::ServerNotConfigured(server_id.to_string()));
        };

        let availability = probe(config).await;
        if availability != Availability::Ready {
            warn!(server_id, %availability, "ensure_approved: server unavailable");
            emitter
                .emit(EventPayload::ToolHookBlocked {
                    server_id: server_id.to_string(),
                    reason: availability.to_string(),
                })
                .await;
            return Err(McpError::ServerUnavailable {
                server_id: server_id.to_string(),
                availability,
            });
        }

        if let Some(approved) = self.approvals.lock().await.decision(server_id) {
            if approved {
                debug!(server_id, "ensure_approved: cached approval");
                return Ok(());
            }
            emitter
                .emit(EventPayload::ToolHookBlocked {
                    server_id: server_id.to_string(),
                    reason: "approval_denied".to_string(),
                })
                .await;
            return Err(McpError::ApprovalDenied(server_id.to_string()));
        }

        // No cached decision: surface the approval request
        emitter
            .emit(EventPayload::ToolHookTriggered {
                server_id: server_id.to_string(),
                needs_approval: true,
            })
            .await;

        let prompter = match (&self.prompter, self.suppress_prompts) {
            (Some(p), false) => p.clone(),
            _ => {
                emitter
                    .emit(EventPayload::ToolHookBlocked {
                        server_id: server_id.to_string(),
                        reason: "approval_required".to_string(),
                    })
                    .await;
                return Err(McpError::ApprovalDenied(server_id.to_string()));
            }
        };

        // Suspend the stage until the user answers
        let decision = prompter.decide(server_id).await;
        {
            let mut approvals = self.approvals.lock().await;
            if let Err(e) = approvals.cache(
                server_id,
                decision.approved,
                decision.allowed_tools.clone(),
                decision.memory,
            ) {
                warn!(server_id, error = %e, "ensure_approved: failed to cache decision");
            }
        }

        if decision.approved {
            Ok(())
        } else {
            emitter
                .emit(EventPayload::ToolHookBlocked {
                    server_id: server_id.to_string(),
                    reason: "approval_denied".to_string(),
                })
                .await;
            Err(McpError::ApprovalDenied(server_id.to_string()))
        }
    }

    /// Mark a successful tool call
    pub async fn post_success(&self, server_id: &str, emitter: &mut StageEmitter) {
        emitter
            .emit(EventPayload::ToolHookPost {
                server_id: server_id.to_string(),
            })
            .await;
    }
}

/// Probe a server's availability
async fn probe(config: &McpServerConfig) -> Availability {
    if config.disabled {
        return Availability::Disabled;
    }
    if config.transport != "stdio" {
        return Availability::NotConfigured;
    }
    let Some(command) = &config.command else {
        return Availability::NotConfigured;
    };
    if find_in_path(command).is_none() {
        return Availability::NotInstalled;
    }

    // Launch and immediately reap: we only care that the binary starts
    let spawn = tokio::process::Command::new(command)
        .args(&config.args)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .kill_on_drop(true)
        .spawn();

    match spawn {
        Ok(mut child) => {
            let _ = tokio::time::timeout(Duration::from_millis(200), child.wait()).await;
            let _ = child.start_kill();
            Availability::Ready
        }
        Err(e) => {
            debug!(command, error = %e, "probe: spawn failed");
            Availability::ConnectionFailed
        }
    }
}

/// Resolve a command against PATH (absolute/relative paths checked as-is)
fn find_in_path(command: &str) -> Option<std::path::PathBuf> {
    let candidate = std::path::Path::new(command);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(command))
        .find(|p| p.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventKind, SessionEmitter, create_event_bus};
    use crate::session::SessionManager;
    use tempfile::TempDir;

    struct FixedPrompter(ApprovalDecision);

    #[async_trait]
    impl ApprovalPrompter for FixedPrompter {
        async fn decide(&self, _server_id: &str) -> ApprovalDecision {
            self.0.clone()
        }
    }

    fn approve(memory: ApprovalMemory) -> ApprovalDecision {
        ApprovalDecision {
            approved: true,
            memory,
            allowed_tools: None,
        }
    }

    fn deny() -> ApprovalDecision {
        ApprovalDecision {
            approved: false,
            memory: ApprovalMemory::Session,
            allowed_tools: None,
        }
    }

    fn ready_server() -> McpServerConfig {
        // `true` exists on any unix PATH and exits immediately
        McpServerConfig {
            transport: "stdio".to_string(),
            command: Some("true".to_string()),
            args: vec![],
            disabled: false,
        }
    }

    async fn emitter_for(dir: &TempDir) -> (StageEmitter, SessionManager, String) {
        let bus = create_event_bus();
        let store = SessionManager::spawn(dir.path()).unwrap();
        let id = store.create("plan", serde_json::json!({})).await.unwrap();
        let emitter = StageEmitter::new(SessionEmitter::new(&id, bus, store.clone()), "stage", false);
        (emitter, store, id)
    }

    fn manager(
        dir: &TempDir,
        servers: HashMap<String, McpServerConfig>,
        prompter: Option<Arc<dyn ApprovalPrompter>>,
    ) -> McpClientManager {
        let cache = McpApprovalCache::new(dir.path().join(".mcp-approvals.json"));
        McpClientManager::new(servers, cache, prompter).with_suppressed_prompts(false)
    }

    #[tokio::test]
    async fn test_unknown_server_not_configured() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir, HashMap::new(), None);
        assert_eq!(manager.check_availability("ghost").await, Availability::NotConfigured);
    }

    #[tokio::test]
    async fn test_disabled_server() {
        let dir = TempDir::new().unwrap();
        let mut servers = HashMap::new();
        servers.insert(
            "tool".to_string(),
            McpServerConfig {
                disabled: true,
                ..ready_server()
            },
        );
        let manager = manager(&dir, servers, None);
        assert_eq!(manager.check_availability("tool").await, Availability::Disabled);
    }

    #[tokio::test]
    async fn test_missing_command_not_configured() {
        let dir = TempDir::new().unwrap();
        let mut servers = HashMap::new();
        servers.insert("tool".to_string(), McpServerConfig::default());
        let manager = manager(&dir, servers, None);
        assert_eq!(manager.check_availability("tool").await, Availability::NotConfigured);
    }

    #[tokio::test]
    async fn test_unsupported_transport_not_configured() {
        let dir = TempDir::new().unwrap();
        let mut servers = HashMap::new();
        servers.insert(
            "tool".to_string(),
            McpServerConfig {
                transport: "websocket".to_string(),
                command: Some("true".to_string()),
                ..Default::default()
            },
        );
        let manager = manager(&dir, servers, None);
        assert_eq!(manager.check_availability("tool").await, Availability::NotConfigured);
    }

    #[tokio::test]
    async fn test_uninstalled_binary() {
        let dir = TempDir::new().unwrap();
        let mut servers = HashMap::new();
        servers.insert(
            "tool".to_string(),
            McpServerConfig {
                command: Some("definitely-not-a-real-binary-xyz".to_string()),
                ..ready_server()
            },
        );
        let manager = manager(&dir, servers, None);
        assert_eq!(manager.check_availability("tool").await, Availability::NotInstalled);
    }

    #[tokio::test]
    async fn test_ready_server_probe() {
        let dir = TempDir::new().unwrap();
        let mut servers = HashMap::new();
        servers.insert("tool".to_string(), ready_server());
        let manager = manager(&dir, servers, None);
        assert_eq!(manager.check_availability("tool").await, Availability::Ready);
    }

    #[tokio::test]
    async fn test_check_all_collects_outcomes() {
        let dir = TempDir::new().unwrap();
        let mut servers = HashMap::new();
        servers.insert("good".to_string(), ready_server());
        servers.insert(
            "bad".to_string(),
            McpServerConfig {
                command: Some("definitely-not-a-real-binary-xyz".to_string()),
                ..ready_server()
            },
        );
        let manager = manager(&dir, servers, None);
        let results = manager.check_all().await;
        assert_eq!(results["good"], Availability::Ready);
        assert_eq!(results["bad"], Availability::NotInstalled);
    }

    #[tokio::test]
    async fn test_prompt_then_approve_emits_trigger() {
        let dir = TempDir::new().unwrap();
        let (mut emitter, store, id) = emitter_for(&dir).await;
        let mut servers = HashMap::new();
        servers.insert("tool".to_string(), ready_server());
        let manager = manager(
            &dir,
            servers,
            Some(Arc::new(FixedPrompter(approve(ApprovalMemory::Session)))),
        );

        manager.ensure_approved("tool", &mut emitter).await.unwrap();

        let events = store.get_events(&id).await.unwrap();
        let kinds: Vec<_> = events.iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, vec![EventKind::ToolHookTriggered]);

        // Second call hits the cache: no new prompt events
        manager.ensure_approved("tool", &mut emitter).await.unwrap();
        assert_eq!(store.get_events(&id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_denial_blocks_and_caches() {
        let dir = TempDir::new().unwrap();
        let (mut emitter, store, id) = emitter_for(&dir).await;
        let mut servers = HashMap::new();
        servers.insert("tool".to_string(), ready_server());
        let manager = manager(&dir, servers, Some(Arc::new(FixedPrompter(deny()))));

        let err = manager.ensure_approved("tool", &mut emitter).await.unwrap_err();
        assert!(matches!(err, McpError::ApprovalDenied(_)));

        // Denial is cached: second refusal comes without a new trigger
        let err = manager.ensure_approved("tool", &mut emitter).await.unwrap_err();
        assert!(matches!(err, McpError::ApprovalDenied(_)));

        let events = store.get_events(&id).await.unwrap();
        let triggers = events.iter().filter(|e| e.kind() == EventKind::ToolHookTriggered).count();
        let blocks = events.iter().filter(|e| e.kind() == EventKind::ToolHookBlocked).count();
        assert_eq!(triggers, 1, "denial must not re-prompt");
        assert_eq!(blocks, 2);
    }

    #[tokio::test]
    async fn test_suppressed_prompting_blocks_unapproved() {
        let dir = TempDir::new().unwrap();
        let (mut emitter, store, id) = emitter_for(&dir).await;
        let mut servers = HashMap::new();
        servers.insert("tool".to_string(), ready_server());
        let cache = McpApprovalCache::new(dir.path().join(".mcp-approvals.json"));
        let manager = McpClientManager::new(servers, cache, Some(Arc::new(FixedPrompter(approve(ApprovalMemory::Session)))))
            .with_suppressed_prompts(true);

        let err = manager.ensure_approved("tool", &mut emitter).await.unwrap_err();
        assert!(matches!(err, McpError::ApprovalDenied(_)));

        let events = store.get_events(&id).await.unwrap();
        let kinds: Vec<_> = events.iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, vec![EventKind::ToolHookTriggered, EventKind::ToolHookBlocked]);
    }

    #[tokio::test]
    async fn test_cached_approval_skips_probe_prompt() {
        let dir = TempDir::new().unwrap();
        let (mut emitter, _store, _id) = emitter_for(&dir).await;
        let mut servers = HashMap::new();
        servers.insert("tool".to_string(), ready_server());
        let manager = manager(&dir, servers, None);

        manager
            .record_decision("tool", &approve(ApprovalMemory::Session))
            .await
            .unwrap();
        manager.ensure_approved("tool", &mut emitter).await.unwrap();
    }

    #[tokio::test]
    #[serial_test::serial]
    async fn test_mcp_mode_env_suppresses_prompting() {
        let dir = TempDir::new().unwrap();
        let (mut emitter, _store, _id) = emitter_for(&dir).await;
        let mut servers = HashMap::new();
        servers.insert("tool".to_string(), ready_server());

        unsafe { std::env::set_var("MCP_MODE", "true") };
        let cache = McpApprovalCache::new(dir.path().join(".mcp-approvals.json"));
        let built = McpClientManager::new(
            servers,
            cache,
            Some(Arc::new(FixedPrompter(approve(ApprovalMemory::Session)))),
        );
        unsafe { std::env::remove_var("MCP_MODE") };

        let err = built.ensure_approved("tool", &mut emitter).await.unwrap_err();
        assert!(matches!(err, McpError::ApprovalDenied(_)));
    }

    #[tokio::test]
    async fn test_unavailable_server_blocked() {
        let dir = TempDir::new().unwrap();
        let (mut emitter, store, id) = emitter_for(&dir).await;
        let mut servers = HashMap::new();
        servers.insert(
            "tool".to_string(),
            McpServerConfig {
                disabled: true,
                ..ready_server()
            },
        );
        let manager = manager(&dir, servers, None);

        let err = manager.ensure_approved("tool", &mut emitter).await.unwrap_err();
        assert!(matches!(
            err,
            McpError::ServerUnavailable {
                availability: Availability::Disabled,
                ..
            }
        ));
        let events = store.get_events(&id).await.unwrap();
        assert_eq!(events[0].kind(), EventKind::ToolHookBlocked);
    }
}
