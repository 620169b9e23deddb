//! AgentRegistry - role capabilities and best-agent selection

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use tracing::{debug, info, warn};

use super::error::RegistryError;
use crate::domain::AgentCapability;

/// On-disk shape of the registry document
#[derive(Debug, Deserialize)]
struct RegistryDocument {
    #[serde(default)]
    agents: HashMap<String, AgentCapability>,
    #[serde(default, rename = "selectionCriteria")]
    selection_criteria: HashMap<String, String>,
    #[serde(default, rename = "taskDomains")]
    task_domains: HashMap<String, String>,
}

/// Role → capability lookup with ranked selection
pub struct AgentRegistry {
    agents: HashMap<String, AgentCapability>,
    selection_criteria: HashMap<String, String>,
    task_domains: HashMap<String, String>,
    loaded: bool,
}

impl AgentRegistry {
    /// An empty registry; every query fails until [`load`](Self::load)
    pub fn new() -> Self {
        Self {
            agents: HashMap::new(),
            selection_criteria: HashMap::new(),
            task_domains: HashMap::new(),
            loaded: false,
        }
    }

    /// Load the single JSON registry document
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let path = path.as_ref();
        debug!(path = %path.display(), "AgentRegistry::load: called");

        let content = std::fs::read_to_string(path)?;
        let document: RegistryDocument =
            serde_json::from_str(&content).map_err(|e| RegistryError::AgentsMalformed {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;

        let mut registry = Self {
            agents: HashMap::new(),
            selection_criteria: document.selection_criteria,
            task_domains: document.task_domains,
            loaded: true,
        };

        for (role, mut capability) in document.agents {
            capability.role = role.clone();
            for domain in &capability.domains {
                if !registry.task_domains.contains_key(domain) {
                    warn!(%role, %domain, "AgentRegistry: role references undeclared domain");
                }
            }
            for criterion in &capability.selection_criteria {
                if !registry.selection_criteria.contains_key(criterion) {
                    warn!(%role, %criterion, "AgentRegistry: role references undeclared criterion");
                }
            }
            registry.agents.insert(role, capability);
        }

        info!(agents = registry.agents.len(), "Agent registry loaded");
        Ok(registry)
    }

    /// Build directly from capability records (tests, embedded defaults)
    pub fn from_capabilities(capabilities: impl IntoIterator<Item = AgentCapability>) -> Self {
        let agents = capabilities.into_iter().map(|c| (c.role.clone(), c)).collect();
        Self {
            agents,
            selection_criteria: HashMap::new(),
            task_domains: HashMap::new(),
            loaded: true,
        }
    }

    fn ensure_loaded(&self) -> Result<(), RegistryError> {
        if self.loaded {
            Ok(())
        } else {
            Err(RegistryError::RegistryNotInitialised)
        }
    }

    /// Best agent for a domain: filter by domain, rank by criteria match
    /// count then priority; none if no role covers the domain
    ///
    /// This is also how escalation rebinds a failed stage: the caller
    /// discards the answer when it names the agent that just failed.
    pub fn find_best_agent(&self, domain: &str, criteria: &[String]) -> Result<Option<String>, RegistryError> {
        self.ensure_loaded()?;
        debug!(%domain, ?criteria, "AgentRegistry::find_best_agent: called");

        let best = self
            .agents
            .values()
            .filter(|c| c.domains.contains(domain))
            .max_by_key(|c| (c.match_count(criteria), c.priority))
            .map(|c| c.role.clone());

        debug!(?best, "AgentRegistry::find_best_agent: selected");
        Ok(best)
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}
