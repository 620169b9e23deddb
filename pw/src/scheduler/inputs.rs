//! Stage input assembly and output parsing
//!
//! Inputs come from upstream stage outputs, command arguments, and session
//! context, per the stage's `inputs_map`; they are validated against the
//! prompt's declared parameters and rendered into the prompt body. Outputs
//! travel back as JSON and are checked against the prompt's contract.

use std::collections::HashMap;

use handlebars::Handlebars;
use serde_json::{Map, Value};
use tracing::debug;

use crate::domain::{InputSource, PromptDescriptor, Stage, StageRecord, StageState};

/// Assemble a stage's inputs from its declared sources
///
/// Every declared-required parameter must resolve and validate; extra
/// mapped keys the prompt doesn't declare are passed through to the
/// template untouched.
pub fn build_inputs(
    stage: &Stage,
    prompt: &PromptDescriptor,
    records: &HashMap<String, StageRecord>,
    args: &Map<String, Value>,
    context: &Map<String, Value>,
) -> Result<Map<String, Value>, String> {
    debug!(stage = %stage.name, "build_inputs: called");
    let mut inputs = Map::new();

    for (name, source) in &stage.inputs_map {
        match resolve(source, records, args, context) {
            Some(value) => {
                inputs.insert(name.clone(), value);
            }
            None => {
                debug!(stage = %stage.name, input = %name, "build_inputs: source unresolved");
            }
        }
    }

    for param in &prompt.inputs {
        match inputs.get(&param.name) {
            Some(value) => param.validate(value)?,
            None if param.required => {
                return Err(format!("required input '{}' is missing", param.name));
            }
            None => {}
        }
    }

    Ok(inputs)
}

fn resolve(
    source: &InputSource,
    records: &HashMap<String, StageRecord>,
    args: &Map<String, Value>,
    context: &Map<String, Value>,
) -> Option<Value> {
    match source {
        InputSource::StageOutput { stage, field } => records
            .get(stage)
            .filter(|r| r.state == StageState::Completed)
            .and_then(|r| r.outputs.get(field))
            .cloned(),
        InputSource::Arg(name) => args.get(name).cloned(),
        InputSource::Context(key) => context.get(key).cloned(),
        InputSource::Literal(value) => Some(value.clone()),
    }
}

/// Render the prompt body with the assembled inputs
pub fn render_prompt(body: &str, inputs: &Map<String, Value>) -> Result<String, String> {
    let hbs = Handlebars::new();
    hbs.render_template(body, inputs)
        .map_err(|e| format!("prompt template render failed: {}", e))
}

/// Parse a response against the prompt's declared outputs
///
/// The response is expected to be a JSON object, either bare or inside a
/// fenced ```json block. With no declared outputs the whole text is kept
/// under `text`. A declared output that the object lacks invalidates the
/// response.
pub fn parse_outputs(content: &str, declared: &[String]) -> Result<Map<String, Value>, String> {
    if declared.is_empty() {
        let mut outputs = Map::new();
        outputs.insert("text".to_string(), Value::String(content.to_string()));
        return Ok(outputs);
    }

    let object = extract_json_object(content)
        .ok_or_else(|| "response does not contain a JSON object".to_string())?;

    for field in declared {
        if !object.contains_key(field) {
            return Err(format!("response missing declared output '{}'", field));
        }
    }
    Ok(object)
}

fn extract_json_object(content: &str) -> Option<Map<String, Value>> {
    if let Ok(Value::Object(map)) = serde_json::from_str(content.trim()) {
        return Some(map);
    }

    // Fenced block: take the first ```json ... ``` region
    let fence_start = content.find("```json")?;
    let after = &content[fence_start + 7..];
    let fence_end = after.find("```")?;
    match serde_json::from_str(after[..fence_end].trim()) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{InputKind, PromptInput};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn prompt_with_inputs(inputs: Vec<PromptInput>) -> PromptDescriptor {
        PromptDescriptor {
            id: "p".to_string(),
            version: "1".to_string(),
            category: "test".to_string(),
            agents: vec![],
            dependencies: Default::default(),
            inputs,
            outputs: vec![],
            model_requirements: Default::default(),
            tokens: Default::default(),
            body: String::new(),
        }
    }

    fn param(name: &str, required: bool) -> PromptInput {
        PromptInput {
            name: name.to_string(),
            kind: InputKind::String,
            required,
            min: None,
            max: None,
            allowed: None,
        }
    }

    fn stage_with_map(map: BTreeMap<String, InputSource>) -> Stage {
        Stage {
            name: "s".to_string(),
            prompt_id: "p".to_string(),
            agent: "a".to_string(),
            depends_on: vec![],
            parallel_group: None,
            retry_policy: Default::default(),
            escalation: None,
            timeout_ms: 1000,
            inputs_map: map,
            tool_servers: vec![],
        }
    }

    fn completed_record(name: &str, outputs: &[(&str, Value)]) -> StageRecord {
        let mut record = StageRecord::new(name);
        record.state = StageState::Completed;
        for (k, v) in outputs {
            record.outputs.insert(k.to_string(), v.clone());
        }
        record
    }

    #[test]
    fn test_build_inputs_from_all_sources() {
        let mut map = BTreeMap::new();
        map.insert("code".to_string(), InputSource::StageOutput {
            stage: "implement".to_string(),
            field: "diff".to_string(),
        });
        map.insert("topic".to_string(), InputSource::Arg("topic".to_string()));
        map.insert("branch".to_string(), InputSource::Context("branch".to_string()));
        map.insert("mode".to_string(), InputSource::Literal(json!("fast")));

        let stage = stage_with_map(map);
        let prompt = prompt_with_inputs(vec![param("code", true), param("topic", true)]);

        let mut records = HashMap::new();
        records.insert("implement".to_string(), completed_record("implement", &[("diff", json!("+1 line"))]));

        let mut args = Map::new();
        args.insert("topic".to_string(), json!("auth"));
        let mut context = Map::new();
        context.insert("branch".to_string(), json!("main"));

        let inputs = build_inputs(&stage, &prompt, &records, &args, &context).unwrap();
        assert_eq!(inputs["code"], json!("+1 line"));
        assert_eq!(inputs["topic"], json!("auth"));
        assert_eq!(inputs["branch"], json!("main"));
        assert_eq!(inputs["mode"], json!("fast"));
    }

    #[test]
    fn test_missing_required_input() {
        let stage = stage_with_map(BTreeMap::new());
        let prompt = prompt_with_inputs(vec![param("code", true)]);
        let err = build_inputs(&stage, &prompt, &HashMap::new(), &Map::new(), &Map::new()).unwrap_err();
        assert!(err.contains("code"));
    }

    #[test]
    fn test_missing_optional_input_ok() {
        let stage = stage_with_map(BTreeMap::new());
        let prompt = prompt_with_inputs(vec![param("notes", false)]);
        assert!(build_inputs(&stage, &prompt, &HashMap::new(), &Map::new(), &Map::new()).is_ok());
    }

    #[test]
    fn test_incomplete_upstream_stage_does_not_resolve() {
        let mut map = BTreeMap::new();
        map.insert("code".to_string(), InputSource::StageOutput {
            stage: "implement".to_string(),
            field: "diff".to_string(),
        });
        let stage = stage_with_map(map);
        let prompt = prompt_with_inputs(vec![param("code", true)]);

        let mut records = HashMap::new();
        let mut incomplete = completed_record("implement", &[("diff", json!("x"))]);
        incomplete.state = StageState::Failed;
        records.insert("implement".to_string(), incomplete);

        assert!(build_inputs(&stage, &prompt, &records, &Map::new(), &Map::new()).is_err());
    }

    #[test]
    fn test_type_validation_failure() {
        let mut map = BTreeMap::new();
        map.insert("code".to_string(), InputSource::Literal(json!(42)));
        let stage = stage_with_map(map);
        let prompt = prompt_with_inputs(vec![param("code", true)]);
        assert!(build_inputs(&stage, &prompt, &HashMap::new(), &Map::new(), &Map::new()).is_err());
    }

    #[test]
    fn test_render_prompt() {
        let mut inputs = Map::new();
        inputs.insert("topic".to_string(), json!("caching"));
        let rendered = render_prompt("Plan work on {{topic}}.", &inputs).unwrap();
        assert_eq!(rendered, "Plan work on caching.");
    }

    #[test]
    fn test_parse_outputs_bare_json() {
        let outputs = parse_outputs(r#"{"document": "the plan", "confidence": 0.9}"#, &["document".to_string()]).unwrap();
        assert_eq!(outputs["document"], json!("the plan"));
        assert_eq!(outputs["confidence"], json!(0.9));
    }

    #[test]
    fn test_parse_outputs_fenced_json() {
        let content = "Here is the result:\n```json\n{\"document\": \"plan\"}\n```\nDone.";
        let outputs = parse_outputs(content, &["document".to_string()]).unwrap();
        assert_eq!(outputs["document"], json!("plan"));
    }

    #[test]
    fn test_parse_outputs_missing_declared_field() {
        let err = parse_outputs(r#"{"other": 1}"#, &["document".to_string()]).unwrap_err();
        assert!(err.contains("document"));
    }

    #[test]
    fn test_parse_outputs_not_json() {
        assert!(parse_outputs("just prose", &["document".to_string()]).is_err());
    }

    #[test]
    fn test_parse_outputs_no_contract_keeps_text() {
        let outputs = parse_outputs("free-form answer", &[]).unwrap();
        assert_eq!(outputs["text"], json!("free-form answer"));
    }
}
