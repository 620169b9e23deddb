//! AgentCapability - what a role can do and how strongly it claims work

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Capability record for one agent role
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCapability {
    /// Role name (map key in the registry document; duplicated here for
    /// convenience when records travel alone)
    #[serde(default)]
    pub role: String,

    /// Task domains this role covers
    #[serde(default)]
    pub domains: BTreeSet<String>,

    /// Criteria this role is selected on
    #[serde(default, rename = "selectionCriteria")]
    pub selection_criteria: BTreeSet<String>,

    /// Total ordering among candidates; higher wins
    #[serde(default)]
    pub priority: i32,
}

impl AgentCapability {
    /// How many of the requested criteria this role matches
    pub fn match_count(&self, criteria: &[String]) -> usize {
        criteria.iter().filter(|c| self.selection_criteria.contains(*c)).count()
    }
}
