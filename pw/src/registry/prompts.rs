//! PromptRegistry - one-shot load of the prompt and command trees
//!
//! Prompt files are UTF-8 text with a YAML front-matter header between
//! `---` fences followed by the free-form body. Command pipelines live
//! beside them as plain YAML documents. Loading happens once at startup;
//! there is no hot reload.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::error::RegistryError;
use crate::domain::{CommandDescriptor, PromptDescriptor};
use crate::scheduler::graph;

/// Header fields we understand; anything else warns and is ignored
const KNOWN_PROMPT_FIELDS: &[&str] = &[
    "id",
    "version",
    "category",
    "agents",
    "dependencies",
    "inputs",
    "outputs",
    "model_requirements",
    "tokens",
];

/// Indexed, validated prompt and command descriptors
pub struct PromptRegistry {
    prompts: HashMap<String, Arc<PromptDescriptor>>,
    commands: HashMap<String, Arc<CommandDescriptor>>,
    /// Per prompt id: which optional dependencies actually resolved
    available_optionals: HashMap<String, Vec<String>>,
}

impl PromptRegistry {
    /// Scan `root/prompts` and `root/commands`, parse, index, validate
    pub fn load(root: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let root = root.as_ref();
        debug!(root = %root.display(), "PromptRegistry::load: called");

        let mut registry = Self {
            prompts: HashMap::new(),
            commands: HashMap::new(),
            available_optionals: HashMap::new(),
        };

        registry.load_prompts(&root.join("prompts"))?;
        registry.validate_graph()?;
        registry.load_commands(&root.join("commands"))?;

        info!(
            prompts = registry.prompts.len(),
            commands = registry.commands.len(),
            "Prompt registry loaded"
        );
        Ok(registry)
    }

    fn load_prompts(&mut self, dir: &Path) -> Result<(), RegistryError> {
        if !dir.exists() {
            warn!(dir = %dir.display(), "load_prompts: no prompts directory");
            return Ok(());
        }

        for entry in WalkDir::new(dir).sort_by_file_name() {
            let entry = entry.map_err(|e| RegistryError::PromptMalformed {
                path: dir.display().to_string(),
                reason: e.to_string(),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("md") {
                continue;
            }

            let descriptor = parse_prompt_file(path)?;
            debug!(id = %descriptor.id, path = %path.display(), "load_prompts: indexed");
            if self
                .prompts
                .insert(descriptor.id.clone(), Arc::new(descriptor))
                .is_some()
            {
                let id = path.display().to_string();
                return Err(RegistryError::PromptMalformed {
                    path: id,
                    reason: "duplicate prompt id".to_string(),
                });
            }
        }
        Ok(())
    }

    fn load_commands(&mut self, dir: &Path) -> Result<(), RegistryError> {
        if !dir.exists() {
            warn!(dir = %dir.display(), "load_commands: no commands directory");
            return Ok(());
        }

        for entry in WalkDir::new(dir).max_depth(1).sort_by_file_name() {
            let entry = entry.map_err(|e| RegistryError::CommandMalformed {
                path: dir.display().to_string(),
                reason: e.to_string(),
            })?;
            let path = entry.path();
            let ext = path.extension().and_then(|e| e.to_str());
            if !entry.file_type().is_file() || !matches!(ext, Some("yml") | Some("yaml")) {
                continue;
            }

            let content = std::fs::read_to_string(path)?;
            let command: CommandDescriptor =
                serde_yaml::from_str(&content).map_err(|e| RegistryError::CommandMalformed {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                })?;

            self.validate_command(&command, path)?;
            debug!(name = %command.name, "load_commands: indexed");
            self.commands.insert(command.name.clone(), Arc::new(command));
        }
        Ok(())
    }

    fn validate_command(&self, command: &CommandDescriptor, path: &Path) -> Result<(), RegistryError> {
        graph::validate_dag(command).map_err(|e| RegistryError::CommandMalformed {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        for stage in &command.stages {
            if !self.prompts.contains_key(&stage.prompt_id) {
                return Err(RegistryError::CommandMalformed {
                    path: path.display().to_string(),
                    reason: format!("stage '{}' references unknown prompt '{}'", stage.name, stage.prompt_id),
                });
            }
        }

        let names: HashSet<_> = command.stages.iter().map(|s| s.name.as_str()).collect();
        for output in &command.required_outputs {
            if !names.contains(output.stage.as_str()) {
                return Err(RegistryError::CommandMalformed {
                    path: path.display().to_string(),
                    reason: format!("required output references unknown stage '{}'", output.stage),
                });
            }
        }
        Ok(())
    }

    /// Resolve a prompt id to its descriptor
    pub fn resolve(&self, id: &str) -> Result<Arc<PromptDescriptor>, RegistryError> {
        self.prompts
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::PromptNotFound(id.to_string()))
    }

    /// Resolve a command name to its descriptor
    pub fn resolve_command(&self, name: &str) -> Result<Arc<CommandDescriptor>, RegistryError> {
        self.commands
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::CommandNotFound(name.to_string()))
    }

    /// All prompts in a category, sorted by id
    pub fn list_by_category(&self, category: &str) -> Vec<Arc<PromptDescriptor>> {
        let mut hits: Vec<_> = self
            .prompts
            .values()
            .filter(|p| p.category == category)
            .cloned()
            .collect();
        hits.sort_by(|a, b| a.id.cmp(&b.id));
        hits
    }

    /// Optional dependencies of `id` that were actually present at load
    pub fn available_optionals(&self, id: &str) -> &[String] {
        self.available_optionals.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Reject cycles and unresolved required dependencies
    ///
    /// Records which optional dependencies resolved; absent optionals are
    /// permitted.
    pub fn validate_graph(&mut self) -> Result<(), RegistryError> {
        for prompt in self.prompts.values() {
            for dep in &prompt.dependencies.required {
                if !self.prompts.contains_key(dep) {
                    return Err(RegistryError::PromptNotFound(format!(
                        "{} (required by {})",
                        dep, prompt.id
                    )));
                }
            }
        }

        // Iterative DFS over required edges, three-colour cycle detection
        let mut state: HashMap<&str, u8> = HashMap::new(); // 1 = on stack, 2 = done
        for start in self.prompts.keys() {
            if state.get(start.as_str()).copied().unwrap_or(0) == 2 {
                continue;
            }
            let mut stack: Vec<(&str, usize)> = vec![(start.as_str(), 0)];
            state.insert(start.as_str(), 1);

            while let Some((id, next_child)) = stack.pop() {
                let deps = &self.prompts[id].dependencies.required;
                if next_child < deps.len() {
                    stack.push((id, next_child + 1));
                    let child = deps[next_child].as_str();
                    match state.get(child).copied().unwrap_or(0) {
                        1 => return Err(RegistryError::PromptCyclicDependency(child.to_string())),
                        2 => {}
                        _ => {
                            state.insert(child, 1);
                            stack.push((child, 0));
                        }
                    }
                } else {
                    state.insert(id, 2);
                }
            }
        }

        let mut optionals = HashMap::new();
        for prompt in self.prompts.values() {
            let present: Vec<String> = prompt
                .dependencies
                .optional
                .iter()
                .filter(|d| self.prompts.contains_key(*d))
                .cloned()
                .collect();
            for absent in prompt.dependencies.optional.iter().filter(|d| !self.prompts.contains_key(*d)) {
                debug!(prompt = %prompt.id, optional = %absent, "validate_graph: optional dependency absent");
            }
            optionals.insert(prompt.id.clone(), present);
        }
        self.available_optionals = optionals;
        Ok(())
    }
}

/// Parse one prompt file: front-matter header plus body
fn parse_prompt_file(path: &Path) -> Result<PromptDescriptor, RegistryError> {
    let content = std::fs::read_to_string(path)?;
    let malformed = |reason: &str| RegistryError::PromptMalformed {
        path: path.display().to_string(),
        reason: reason.to_string(),
    };

    let rest = content
        .strip_prefix("---")
        .ok_or_else(|| malformed("missing front-matter header"))?;
    let (header, body) = rest
        .split_once("\n---")
        .ok_or_else(|| malformed("unterminated front-matter header"))?;

    let raw: serde_yaml::Value = serde_yaml::from_str(header).map_err(|e| malformed(&e.to_string()))?;
    let mapping = raw.as_mapping().ok_or_else(|| malformed("header is not a mapping"))?;

    for (key, _) in mapping.iter() {
        if let Some(name) = key.as_str() {
            if !KNOWN_PROMPT_FIELDS.contains(&name) {
                warn!(path = %path.display(), field = name, "parse_prompt_file: ignoring unknown header field");
            }
        }
    }

    let mut descriptor: PromptDescriptor =
        serde_yaml::from_value(raw.clone()).map_err(|e| malformed(&e.to_string()))?;
    if descriptor.id.is_empty() {
        return Err(malformed("header missing id"));
    }
    if descriptor.category.is_empty() {
        descriptor.category = descriptor.id.split('.').next().unwrap_or_default().to_string();
    }
    descriptor.body = body.trim_start_matches('\n').to_string();
    Ok(descriptor)
}
