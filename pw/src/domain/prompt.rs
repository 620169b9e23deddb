//! PromptDescriptor - the typed form of a prompt file
//!
//! Built once by the registry at startup and immutable afterwards.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A fully resolved prompt definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptDescriptor {
    /// Dotted name, e.g. `review.validate-security`
    pub id: String,

    /// Descriptor version string
    #[serde(default = "default_version")]
    pub version: String,

    /// Category (usually the first segment of the id)
    #[serde(default)]
    pub category: String,

    /// Roles allowed to run this prompt
    #[serde(default)]
    pub agents: Vec<String>,

    /// Prompt dependencies
    #[serde(default)]
    pub dependencies: PromptDependencies,

    /// Ordered input parameters
    #[serde(default)]
    pub inputs: Vec<PromptInput>,

    /// Named fields the prompt is contracted to produce
    #[serde(default)]
    pub outputs: Vec<String>,

    /// Model requirements
    #[serde(default)]
    pub model_requirements: ModelRequirements,

    /// Token budget estimates
    #[serde(default)]
    pub tokens: TokenBudget,

    /// Free-form prompt body (handlebars template)
    #[serde(skip)]
    pub body: String,
}

fn default_version() -> String {
    "1".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptDependencies {
    /// Prompt ids that must resolve for this prompt to be usable
    pub required: Vec<String>,
    /// Prompt ids that enrich this prompt when present
    pub optional: Vec<String>,
}

/// One named input parameter with optional validation bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptInput {
    pub name: String,

    #[serde(rename = "type", default)]
    pub kind: InputKind,

    #[serde(default = "default_true")]
    pub required: bool,

    /// Inclusive lower bound for numbers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,

    /// Inclusive upper bound for numbers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,

    /// Permitted values for enum-like string inputs
    #[serde(default, rename = "enum", skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<String>>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputKind {
    #[default]
    String,
    Number,
    Boolean,
    Object,
    List,
}

impl PromptInput {
    /// Validate a concrete value against this parameter's declared shape
    pub fn validate(&self, value: &Value) -> Result<(), String> {
        let type_ok = match self.kind {
            InputKind::String => value.is_string(),
            InputKind::Number => value.is_number(),
            InputKind::Boolean => value.is_boolean(),
            InputKind::Object => value.is_object(),
            InputKind::List => value.is_array(),
        };
        if !type_ok {
            return Err(format!("input '{}' expects {:?}", self.name, self.kind));
        }

        if let Some(n) = value.as_f64() {
            if let Some(min) = self.min {
                if n < min {
                    return Err(format!("input '{}' below minimum {}", self.name, min));
                }
            }
            if let Some(max) = self.max {
                if n > max {
                    return Err(format!("input '{}' above maximum {}", self.name, max));
                }
            }
        }

        if let (Some(allowed), Some(s)) = (&self.allowed, value.as_str()) {
            if !allowed.iter().any(|a| a == s) {
                return Err(format!("input '{}' not one of {:?}", self.name, allowed));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelRequirements {
    /// Minimum context window in tokens
    pub min_context: u64,
    /// Preferred model ids, best first
    pub recommended: Vec<String>,
}

/// Token budget estimates carried by the descriptor
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenBudget {
    pub min: u64,
    pub avg: u64,
    pub max: u64,
}
