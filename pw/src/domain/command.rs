//! CommandDescriptor - a declarative stage DAG
//!
//! Commands are loaded from YAML documents beside the prompt tree. The
//! scheduler consumes the descriptor as-is; DAG validation happens at load
//! time in the registry.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use super::session::FailureKind;

/// Default cohort concurrency bound
pub const DEFAULT_MAX_CONCURRENCY: usize = 4;

fn default_max_concurrency() -> usize {
    DEFAULT_MAX_CONCURRENCY
}

/// A named pipeline of stages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandDescriptor {
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Upper bound on concurrently running stages within one cohort
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Stage outputs that must be present for the run to count as SUCCESS
    /// or PARTIAL; written as `stage` or `stage.field`
    #[serde(default)]
    pub required_outputs: Vec<OutputRef>,

    pub stages: Vec<Stage>,
}

impl CommandDescriptor {
    /// Look up a stage by name
    pub fn stage(&self, name: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Stage names listed in `required_outputs`
    pub fn required_stages(&self) -> impl Iterator<Item = &str> {
        self.required_outputs.iter().map(|r| r.stage.as_str())
    }
}

/// Reference to a stage output, `stage` or `stage.field`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputRef {
    pub stage: String,
    pub field: Option<String>,
}

impl Serialize for OutputRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match &self.field {
            Some(f) => serializer.serialize_str(&format!("{}.{}", self.stage, f)),
            None => serializer.serialize_str(&self.stage),
        }
    }
}

impl<'de> Deserialize<'de> for OutputRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        match s.split_once('.') {
            Some((stage, field)) => Ok(OutputRef {
                stage: stage.to_string(),
                field: Some(field.to_string()),
            }),
            None => Ok(OutputRef { stage: s, field: None }),
        }
    }
}

/// One node in a command's DAG
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    /// Unique per command
    pub name: String,

    /// Prompt to dispatch
    #[serde(rename = "prompt")]
    pub prompt_id: String,

    /// Agent role the prompt runs as
    pub agent: String,

    /// Stage names that must terminate before this one starts
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Stages sharing a tag in the same depth layer execute concurrently
    #[serde(default)]
    pub parallel_group: Option<String>,

    #[serde(default, rename = "retry")]
    pub retry_policy: RetryPolicy,

    #[serde(default)]
    pub escalation: Option<EscalationPolicy>,

    /// Hard per-stage deadline
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// How to assemble the prompt's inputs
    #[serde(default, rename = "inputs")]
    pub inputs_map: BTreeMap<String, InputSource>,

    /// External tool servers this stage may call
    #[serde(default)]
    pub tool_servers: Vec<String>,
}

fn default_timeout_ms() -> u64 {
    300_000
}

impl Stage {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Retry behaviour for transient dispatch failures
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    /// Base backoff before the first retry
    pub backoff_ms: u64,
    /// Exponential growth factor
    pub backoff_multiplier: f64,
    /// Add random jitter on top of the computed backoff
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 1_000,
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `retry` (0-based: the sleep after the
    /// first failed attempt is `backoff(0)`)
    pub fn backoff(&self, retry: u32) -> Duration {
        let base = self.backoff_ms as f64 * self.backoff_multiplier.powi(retry as i32);
        let jitter = if self.jitter {
            // Up to a quarter of the base delay
            rand::random::<f64>() * base / 4.0
        } else {
            0.0
        };
        Duration::from_millis((base + jitter) as u64)
    }
}

/// What to do when a stage exhausts its retries (or produces a
/// low-confidence result)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationPolicy {
    pub trigger: EscalationTrigger,
    pub action: EscalationAction,
}

/// Condition under which the escalation action fires
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationTrigger {
    /// Parsed outputs carry a `confidence` below this threshold
    ConfidenceBelow(f64),
    /// The stage's final failure kind is one of these
    ErrorKindIn(Vec<FailureKind>),
}

impl EscalationTrigger {
    /// Does a failure of this kind fire the trigger?
    pub fn matches_error(&self, kind: FailureKind) -> bool {
        match self {
            EscalationTrigger::ErrorKindIn(kinds) => kinds.contains(&kind),
            EscalationTrigger::ConfidenceBelow(_) => false,
        }
    }

    /// Does a successful result with this confidence fire the trigger?
    pub fn matches_confidence(&self, confidence: Option<f64>) -> bool {
        match (self, confidence) {
            (EscalationTrigger::ConfidenceBelow(threshold), Some(c)) => c < *threshold,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationAction {
    /// Rebind to a higher-priority agent and re-dispatch once with a
    /// higher-context model
    EscalateToAgent,
    /// Switch to a declared fallback prompt and retry once
    FallbackPrompt { prompt: String },
    /// Record the failure and stop the stage
    Abort,
}

/// Where one prompt input comes from
///
/// Serialised as a prefixed string (`stage:implement.diff`, `arg:topic`,
/// `context:branch`); any non-string YAML value is a literal.
#[derive(Debug, Clone, PartialEq)]
pub enum InputSource {
    /// Output field of an upstream stage
    StageOutput { stage: String, field: String },
    /// Command-line / invocation argument
    Arg(String),
    /// Session context key supplied by the caller
    Context(String),
    /// Inline literal
    Literal(Value),
}

impl Serialize for InputSource {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            InputSource::StageOutput { stage, field } => serializer.serialize_str(&format!("stage:{}.{}", stage, field)),
            InputSource::Arg(name) => serializer.serialize_str(&format!("arg:{}", name)),
            InputSource::Context(key) => serializer.serialize_str(&format!("context:{}", key)),
            InputSource::Literal(v) => v.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for InputSource {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        let Some(s) = value.as_str() else {
            return Ok(InputSource::Literal(value));
        };

        if let Some(rest) = s.strip_prefix("stage:") {
            let (stage, field) = rest
                .split_once('.')
                .ok_or_else(|| D::Error::custom(format!("stage reference '{}' needs a field: stage:NAME.FIELD", s)))?;
            return Ok(InputSource::StageOutput {
                stage: stage.to_string(),
                field: field.to_string(),
            });
        }
        if let Some(name) = s.strip_prefix("arg:") {
            return Ok(InputSource::Arg(name.to_string()));
        }
        if let Some(key) = s.strip_prefix("context:") {
            return Ok(InputSource::Context(key.to_string()));
        }
        Ok(InputSource::Literal(Value::String(s.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_backoff_progression() {
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff_ms: 1_000,
            backoff_multiplier: 2.0,
            jitter: false,
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(1_000));
        assert_eq!(policy.backoff(1), Duration::from_millis(2_000));
        assert_eq!(policy.backoff(2), Duration::from_millis(4_000));
    }

    #[test]
    fn test_retry_backoff_jitter_bounded() {
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff_ms: 1_000,
            backoff_multiplier: 2.0,
            jitter: true,
        };
        for _ in 0..50 {
            let d = policy.backoff(0).as_millis() as u64;
            assert!((1_000..=1_250).contains(&d), "jittered backoff {} out of range", d);
        }
    }

    #[test]
    fn test_input_source_parsing() {
        let yaml = r#"
code: "stage:implement.diff"
topic: "arg:topic"
branch: "context:branch"
mode: "fast"
depth: 3
"#;
        let map: BTreeMap<String, InputSource> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            map["code"],
            InputSource::StageOutput {
                stage: "implement".to_string(),
                field: "diff".to_string()
            }
        );
        assert_eq!(map["topic"], InputSource::Arg("topic".to_string()));
        assert_eq!(map["branch"], InputSource::Context("branch".to_string()));
        assert_eq!(map["mode"], InputSource::Literal(Value::String("fast".to_string())));
        assert_eq!(map["depth"], InputSource::Literal(serde_json::json!(3)));
    }

    #[test]
    fn test_input_source_rejects_fieldless_stage_ref() {
        let result: Result<InputSource, _> = serde_yaml::from_str("\"stage:implement\"");
        assert!(result.is_err());
    }

    #[test]
    fn test_output_ref_parsing() {
        let r: OutputRef = serde_yaml::from_str("\"plan.document\"").unwrap();
        assert_eq!(r.stage, "plan");
        assert_eq!(r.field.as_deref(), Some("document"));

        let r: OutputRef = serde_yaml::from_str("\"plan\"").unwrap();
        assert_eq!(r.stage, "plan");
        assert!(r.field.is_none());
    }

    #[test]
    fn test_escalation_trigger_matching() {
        let t = EscalationTrigger::ErrorKindIn(vec![FailureKind::ResponseInvalid]);
        assert!(t.matches_error(FailureKind::ResponseInvalid));
        assert!(!t.matches_error(FailureKind::ProviderTimeout));
        assert!(!t.matches_confidence(Some(0.1)));

        let t = EscalationTrigger::ConfidenceBelow(0.7);
        assert!(t.matches_confidence(Some(0.5)));
        assert!(!t.matches_confidence(Some(0.9)));
        assert!(!t.matches_confidence(None));
        assert!(!t.matches_error(FailureKind::ResponseInvalid));
    }

    #[test]
    fn test_command_descriptor_from_yaml() {
        let yaml = r#"
name: plan
description: Draft an implementation plan
required_outputs: ["synthesize.document"]
stages:
  - name: gather
    prompt: plan.gather-context
    agent: planner
    inputs:
      topic: "arg:topic"
  - name: synthesize
    prompt: plan.synthesize
    agent: planner
    depends_on: [gather]
    timeout_ms: 60000
    retry: {max_attempts: 2, backoff_ms: 500}
    inputs:
      context: "stage:gather.notes"
"#;
        let cmd: CommandDescriptor = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cmd.name, "plan");
        assert_eq!(cmd.max_concurrency, DEFAULT_MAX_CONCURRENCY);
        assert_eq!(cmd.stages.len(), 2);
        let synth = cmd.stage("synthesize").unwrap();
        assert_eq!(synth.depends_on, vec!["gather"]);
        assert_eq!(synth.timeout_ms, 60_000);
        assert_eq!(synth.retry_policy.max_attempts, 2);
        // Unspecified retry fields fall back to defaults
        assert_eq!(synth.retry_policy.backoff_multiplier, 2.0);
        assert_eq!(cmd.required_stages().collect::<Vec<_>>(), vec!["synthesize"]);
    }
}
