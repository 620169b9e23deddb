//! Stage scheduler - drives a command's DAG to completion
//!
//! Layers execute in order; cohorts within a layer run on distinct tasks
//! bounded by the command's `max_concurrency`. Each stage builds its inputs
//! from upstream records, passes the MCP gate, dispatches through the LLM
//! dispatcher, and parses its contracted outputs. Failed stages go through
//! the declared escalation policy; downstream dependents of a failure are
//! skipped while independent branches continue.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::config::SchedulerConfig;
use super::graph;
use super::inputs::{build_inputs, parse_outputs, render_prompt};
use crate::cancel::CancelToken;
use crate::domain::{
    CommandDescriptor, EscalationAction, FailureKind, PromptDescriptor, RetryPolicy, RunOutcome, RunResult, Stage,
    StageFailure, StageRecord, StageState,
};
use crate::events::{EventPayload, SessionEmitter, StageEmitter};
use crate::llm::{CompletionRequest, LlmDispatcher};
use crate::mcp::McpClientManager;
use crate::registry::{AgentRegistry, PromptRegistry};
use crate::session::SessionReplay;

/// The pipeline executor
///
/// Cheap to clone: stage tasks each carry a clone.
#[derive(Clone)]
pub struct StageScheduler {
    prompts: Arc<PromptRegistry>,
    agents: Arc<AgentRegistry>,
    dispatcher: Arc<LlmDispatcher>,
    mcp: Arc<McpClientManager>,
    emitter: SessionEmitter,
    config: SchedulerConfig,
    default_model: String,
    escalation_model: Option<String>,
    max_output_tokens: u64,
}

impl StageScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        prompts: Arc<PromptRegistry>,
        agents: Arc<AgentRegistry>,
        dispatcher: Arc<LlmDispatcher>,
        mcp: Arc<McpClientManager>,
        emitter: SessionEmitter,
        config: SchedulerConfig,
        default_model: String,
        escalation_model: Option<String>,
        max_output_tokens: u64,
    ) -> Self {
        Self {
            prompts,
            agents,
            dispatcher,
            mcp,
            emitter,
            config,
            default_model,
            escalation_model,
            max_output_tokens,
        }
    }

    /// Execute the command to SUCCESS, PARTIAL, or FAILURE
    ///
    /// `replay` carries prior state when the session is resumed; a fresh
    /// session passes a default replay.
    pub async fn run(
        &self,
        command: &CommandDescriptor,
        args: &Map<String, Value>,
        context: &Map<String, Value>,
        mut replay: SessionReplay,
        cancel: CancelToken,
    ) -> RunResult {
        info!(command = %command.name, stages = command.stages.len(), "StageScheduler::run: starting");
        replay.reset_failures();
        let mut records = std::mem::take(&mut replay.records);
        let pending_responses = std::mem::take(&mut replay.pending_responses);
        let mut cancelled = false;

        let layers = graph::topological_layers(command);
        'layers: for layer in &layers {
            for cohort in graph::cohorts(layer) {
                if cancel.is_cancelled() {
                    debug!("run: cancellation observed, refusing to start new stages");
                    cancelled = true;
                    break 'layers;
                }

                let mut runnable: Vec<&Stage> = Vec::new();
                for stage in cohort {
                    if records.get(&stage.name).map(|r| r.state == StageState::Completed) == Some(true) {
                        debug!(stage = %stage.name, "run: already completed, skipping (resume)");
                        continue;
                    }
                    if let Some(record) = self.skip_record(stage, &records) {
                        debug!(stage = %stage.name, "run: skipped");
                        records.insert(stage.name.clone(), record);
                        continue;
                    }
                    runnable.push(stage);
                }
                if runnable.is_empty() {
                    continue;
                }

                let is_parallel = runnable.len() > 1;
                let snapshot = Arc::new(records.clone());
                let args = Arc::new(args.clone());
                let context = Arc::new(context.clone());
                let permits = Arc::new(Semaphore::new(command.max_concurrency.max(1)));

                let mut tasks = JoinSet::new();
                for stage in runnable {
                    let this = self.clone();
                    let stage = stage.clone();
                    let snapshot = snapshot.clone();
                    let args = args.clone();
                    let context = context.clone();
                    let permits = permits.clone();
                    let cancel = cancel.clone();
                    let pending = pending_responses.get(&stage.name).cloned();
                    tasks.spawn(async move {
                        let _permit = permits.acquire_owned().await.expect("semaphore never closed");
                        this.execute_stage(stage, snapshot, args, context, is_parallel, pending, cancel)
                            .await
                    });
                }

                // Cohort failure policy: in-flight members always complete
                while let Some(joined) = tasks.join_next().await {
                    match joined {
                        Ok(record) => {
                            records.insert(record.stage.clone(), record);
                        }
                        Err(e) => warn!(error = %e, "run: stage task panicked"),
                    }
                }
            }
        }

        let outcome = if cancelled {
            RunOutcome::Cancelled
        } else {
            self.compute_outcome(command, &records)
        };

        let total_prompt_tokens = records.values().map(|r| r.prompt_tokens).sum();
        let total_output_tokens = records.values().map(|r| r.output_tokens).sum();
        info!(command = %command.name, %outcome, "StageScheduler::run: finished");

        RunResult {
            session_id: self.emitter.session_id().to_string(),
            outcome,
            stages: records,
            total_prompt_tokens,
            total_output_tokens,
        }
    }

    /// Should this stage be skipped instead of run?
    fn skip_record(&self, stage: &Stage, records: &HashMap<String, StageRecord>) -> Option<StageRecord> {
        for dep in &stage.depends_on {
            let dep_record = records.get(dep);
            let failed = match dep_record {
                Some(r) => matches!(r.state, StageState::Failed | StageState::Skipped),
                // A dependency with no record never ran at all
                None => true,
            };
            if failed {
                let mut record = StageRecord::new(&stage.name);
                record.state = StageState::Skipped;
                record.failure = Some(StageFailure::new(
                    FailureKind::DependencyFailed,
                    format!("dependency '{}' did not complete", dep),
                ));
                return Some(record);
            }
            if dep_record.map(|r| r.skip_downstream()) == Some(true) {
                // Upstream declared downstream work unnecessary; clean skip
                let mut record = StageRecord::new(&stage.name);
                record.state = StageState::Skipped;
                return Some(record);
            }
        }
        None
    }

    async fn execute_stage(
        &self,
        stage: Stage,
        snapshot: Arc<HashMap<String, StageRecord>>,
        args: Arc<Map<String, Value>>,
        context: Arc<Map<String, Value>>,
        is_parallel: bool,
        pending_response: Option<String>,
        cancel: CancelToken,
    ) -> StageRecord {
        let mut record = StageRecord::new(&stage.name);
        if let Some(prior) = snapshot.get(&stage.name) {
            record.attempts = prior.attempts;
            record.prompt_tokens = prior.prompt_tokens;
            record.output_tokens = prior.output_tokens;
        }
        record.state = StageState::Running;
        record.started_at = Some(Utc::now());

        let mut emitter = StageEmitter::new(self.emitter.clone(), &stage.name, is_parallel);
        emitter
            .emit_now(EventPayload::StageStart {
                agent: stage.agent.clone(),
                prompt_id: stage.prompt_id.clone(),
                is_parallel,
                worktree: self.config.worktree.clone(),
                branch: self.config.branch.clone(),
            })
            .await;

        let started = Instant::now();
        let outcome = self
            .run_stage_inner(&stage, &snapshot, &args, &context, pending_response, &mut record, &mut emitter, &cancel)
            .await;

        record.ended_at = Some(Utc::now());
        match outcome {
            Ok(outputs) => {
                record.state = StageState::Completed;
                record.outputs = outputs;
                emitter
                    .finish(EventPayload::StageComplete {
                        outputs: record.outputs.clone(),
                        attempts: record.attempts,
                        duration_ms: started.elapsed().as_millis() as u64,
                    })
                    .await;
            }
            Err(failure) => {
                warn!(stage = %stage.name, kind = %failure.kind, "execute_stage: failed");
                record.state = StageState::Failed;
                record.failure = Some(failure.clone());
                emitter
                    .finish(EventPayload::StageError {
                        kind: failure.kind,
                        message: failure.message,
                        attempts: record.attempts,
                    })
                    .await;
            }
        }
        record
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_stage_inner(
        &self,
        stage: &Stage,
        snapshot: &HashMap<String, StageRecord>,
        args: &Map<String, Value>,
        context: &Map<String, Value>,
        pending_response: Option<String>,
        record: &mut StageRecord,
        emitter: &mut StageEmitter,
        cancel: &CancelToken,
    ) -> Result<Map<String, Value>, StageFailure> {
        let prompt = self
            .prompts
            .resolve(&stage.prompt_id)
            .map_err(|e| StageFailure::new(FailureKind::StageInputInvalid, e.to_string()))?;

        // Resume: a dispatched response whose post-processing was
        // interrupted is replayed through output parsing only
        if let Some(content) = pending_response {
            debug!(stage = %stage.name, "run_stage_inner: replaying buffered response");
            match parse_outputs(&content, &prompt.outputs) {
                Ok(outputs) => return Ok(outputs),
                Err(e) => {
                    let failure = StageFailure::new(FailureKind::ResponseInvalid, e);
                    return self
                        .maybe_escalate(stage, &prompt, snapshot, args, context, record, emitter, cancel, failure)
                        .await;
                }
            }
        }

        // External tool gate before any dispatch
        for server in &stage.tool_servers {
            if let Err(e) = self.mcp.ensure_approved(server, emitter).await {
                let failure = StageFailure::new(FailureKind::ToolBlocked, e.to_string());
                return self
                    .maybe_escalate(stage, &prompt, snapshot, args, context, record, emitter, cancel, failure)
                    .await;
            }
        }

        let result = match build_inputs(stage, &prompt, snapshot, args, context) {
            Err(e) => {
                let failure = StageFailure::new(FailureKind::StageInputInvalid, e);
                self.maybe_escalate(stage, &prompt, snapshot, args, context, record, emitter, cancel, failure)
                    .await
            }
            Ok(inputs) => {
                let deadline = Instant::now() + stage.timeout();
                let primary = self
                    .attempt(stage, &prompt, &self.default_model, &inputs, deadline, record, emitter, cancel, false)
                    .await;
                self.resolve_primary(stage, &prompt, snapshot, args, context, record, emitter, cancel, primary)
                    .await
            }
        };

        // The gate above passed for every declared server; a successful
        // dispatch closes each hook
        if result.is_ok() {
            for server in &stage.tool_servers {
                self.mcp.post_success(server, emitter).await;
            }
        }
        result
    }

    /// Apply confidence triggers and failure escalation to the first
    /// dispatch's outcome
    #[allow(clippy::too_many_arguments)]
    async fn resolve_primary(
        &self,
        stage: &Stage,
        prompt: &PromptDescriptor,
        snapshot: &HashMap<String, StageRecord>,
        args: &Map<String, Value>,
        context: &Map<String, Value>,
        record: &mut StageRecord,
        emitter: &mut StageEmitter,
        cancel: &CancelToken,
        primary: Result<Map<String, Value>, StageFailure>,
    ) -> Result<Map<String, Value>, StageFailure> {
        match primary {
            Ok(outputs) => {
                let confidence_trigger = stage
                    .escalation
                    .as_ref()
                    .map(|p| p.trigger.matches_confidence(outputs.get("confidence").and_then(Value::as_f64)))
                    .unwrap_or(false);
                if confidence_trigger {
                    let confidence = outputs.get("confidence").and_then(Value::as_f64);
                    debug!(stage = %stage.name, ?confidence, "resolve_primary: confidence below threshold");
                    let reason = format!("confidence {:?} below threshold", confidence);
                    match self
                        .escalate(stage, prompt, snapshot, args, context, record, emitter, cancel, &reason)
                        .await
                    {
                        Ok(better) => Ok(better),
                        // Keep the original result when escalation cannot
                        // improve on it
                        Err(_) => Ok(outputs),
                    }
                } else {
                    Ok(outputs)
                }
            }
            Err(failure) => {
                self.maybe_escalate(stage, prompt, snapshot, args, context, record, emitter, cancel, failure)
                    .await
            }
        }
    }

    /// Apply the stage's escalation policy to a failure, when it matches
    #[allow(clippy::too_many_arguments)]
    async fn maybe_escalate(
        &self,
        stage: &Stage,
        prompt: &PromptDescriptor,
        snapshot: &HashMap<String, StageRecord>,
        args: &Map<String, Value>,
        context: &Map<String, Value>,
        record: &mut StageRecord,
        emitter: &mut StageEmitter,
        cancel: &CancelToken,
        failure: StageFailure,
    ) -> Result<Map<String, Value>, StageFailure> {
        let Some(policy) = &stage.escalation else {
            return Err(failure);
        };
        if failure.kind == FailureKind::Cancelled || !policy.trigger.matches_error(failure.kind) {
            return Err(failure);
        }
        if matches!(policy.action, EscalationAction::Abort) {
            return Err(failure);
        }
        match self
            .escalate(stage, prompt, snapshot, args, context, record, emitter, cancel, &failure.kind.to_string())
            .await
        {
            Ok(outputs) => Ok(outputs),
            // Escalation could not recover; surface the original failure
            Err(_) => Err(failure),
        }
    }

    /// One post-failure re-dispatch: stronger agent + bigger model, or a
    /// declared fallback prompt
    #[allow(clippy::too_many_arguments)]
    async fn escalate(
        &self,
        stage: &Stage,
        prompt: &PromptDescriptor,
        snapshot: &HashMap<String, StageRecord>,
        args: &Map<String, Value>,
        context: &Map<String, Value>,
        record: &mut StageRecord,
        emitter: &mut StageEmitter,
        cancel: &CancelToken,
        reason: &str,
    ) -> Result<Map<String, Value>, StageFailure> {
        let policy = stage.escalation.as_ref().expect("caller checked policy");

        match &policy.action {
            EscalationAction::Abort => Err(StageFailure::new(
                FailureKind::ProviderPermanent,
                "escalation action is abort".to_string(),
            )),

            EscalationAction::EscalateToAgent => {
                emitter
                    .emit(EventPayload::EscalationTriggered {
                        from_agent: stage.agent.clone(),
                        reason: reason.to_string(),
                        action: "escalate-to-agent".to_string(),
                    })
                    .await;

                // The registry's ranked selection picks the strongest role
                // for the prompt's domain; re-dispatching to the agent that
                // just failed is pointless
                let best = self
                    .agents
                    .find_best_agent(&prompt.category, &[])
                    .unwrap_or(None)
                    .filter(|agent| agent != &stage.agent);

                let Some(agent) = best else {
                    emitter
                        .emit(EventPayload::EscalationAborted {
                            reason: "no stronger agent available".to_string(),
                        })
                        .await;
                    return Err(StageFailure::new(
                        FailureKind::ProviderPermanent,
                        "escalation found no stronger agent".to_string(),
                    ));
                };

                let model = self.escalation_model.clone().unwrap_or_else(|| self.default_model.clone());
                info!(stage = %stage.name, %agent, %model, "escalate: rebinding to stronger agent");

                let inputs = build_inputs(stage, prompt, snapshot, args, context)
                    .map_err(|e| StageFailure::new(FailureKind::StageInputInvalid, e))?;
                let deadline = Instant::now() + stage.timeout();
                match self
                    .attempt(stage, prompt, &model, &inputs, deadline, record, emitter, cancel, true)
                    .await
                {
                    Ok(outputs) => {
                        emitter
                            .emit(EventPayload::EscalationResolved {
                                to_agent: agent,
                                model,
                            })
                            .await;
                        Ok(outputs)
                    }
                    Err(failure) => {
                        emitter
                            .emit(EventPayload::EscalationAborted {
                                reason: failure.message.clone(),
                            })
                            .await;
                        Err(failure)
                    }
                }
            }

            EscalationAction::FallbackPrompt { prompt: fallback_id } => {
                emitter
                    .emit(EventPayload::EscalationTriggered {
                        from_agent: stage.agent.clone(),
                        reason: reason.to_string(),
                        action: "fallback-prompt".to_string(),
                    })
                    .await;

                let fallback = match self.prompts.resolve(fallback_id) {
                    Ok(p) => p,
                    Err(e) => {
                        emitter
                            .emit(EventPayload::EscalationAborted {
                                reason: e.to_string(),
                            })
                            .await;
                        return Err(StageFailure::new(FailureKind::StageInputInvalid, e.to_string()));
                    }
                };

                let inputs = build_inputs(stage, &fallback, snapshot, args, context)
                    .map_err(|e| StageFailure::new(FailureKind::StageInputInvalid, e))?;
                let deadline = Instant::now() + stage.timeout();
                match self
                    .attempt(stage, &fallback, &self.default_model, &inputs, deadline, record, emitter, cancel, true)
                    .await
                {
                    Ok(outputs) => {
                        emitter
                            .emit(EventPayload::EscalationResolved {
                                to_agent: stage.agent.clone(),
                                model: self.default_model.clone(),
                            })
                            .await;
                        Ok(outputs)
                    }
                    Err(failure) => {
                        emitter
                            .emit(EventPayload::EscalationAborted {
                                reason: failure.message.clone(),
                            })
                            .await;
                        Err(failure)
                    }
                }
            }
        }
    }

    /// One dispatch + parse round
    #[allow(clippy::too_many_arguments)]
    async fn attempt(
        &self,
        stage: &Stage,
        prompt: &PromptDescriptor,
        model: &str,
        inputs: &Map<String, Value>,
        deadline: Instant,
        record: &mut StageRecord,
        emitter: &mut StageEmitter,
        cancel: &CancelToken,
        single_shot: bool,
    ) -> Result<Map<String, Value>, StageFailure> {
        let body = render_prompt(&prompt.body, inputs)
            .map_err(|e| StageFailure::new(FailureKind::StageInputInvalid, e))?;

        let request = CompletionRequest {
            model: model.to_string(),
            system_prompt: String::new(),
            prompt_body: body,
            max_output_tokens: self.max_output_tokens,
            session_id: emitter.session_id().to_string(),
            stage_name: stage.name.clone(),
        };

        let retry = if single_shot {
            RetryPolicy {
                max_attempts: 1,
                ..stage.retry_policy
            }
        } else {
            stage.retry_policy
        };

        record.attempts += 1;
        match self.dispatcher.dispatch(request, &retry, deadline, emitter, cancel).await {
            Ok(response) => {
                record.prompt_tokens += response.prompt_tokens;
                record.output_tokens += response.output_tokens;
                parse_outputs(&response.content, &prompt.outputs)
                    .map_err(|e| StageFailure::new(FailureKind::ResponseInvalid, e))
            }
            Err(e) => Err(StageFailure::new(e.failure_kind(), e.to_string())),
        }
    }

    /// SUCCESS / PARTIAL / FAILURE per the command's required outputs
    ///
    /// Optional-stage failures never demote a run unless the
    /// `demote_on_optional_failure` knob is set.
    fn compute_outcome(&self, command: &CommandDescriptor, records: &HashMap<String, StageRecord>) -> RunOutcome {
        let any_failed = records.values().any(|r| r.state == StageState::Failed);
        let any_completed = records.values().any(|r| r.state == StageState::Completed);

        if command.required_outputs.is_empty() {
            return if !any_failed {
                RunOutcome::Success
            } else if any_completed {
                RunOutcome::Partial
            } else {
                RunOutcome::Failure
            };
        }

        let mut present = 0usize;
        let mut missing = 0usize;
        for output in &command.required_outputs {
            let satisfied = records
                .get(&output.stage)
                .filter(|r| r.state == StageState::Completed)
                .map(|r| output.field.as_ref().map(|f| r.outputs.contains_key(f)).unwrap_or(true))
                .unwrap_or(false);
            if satisfied {
                present += 1;
            } else {
                missing += 1;
            }
        }

        if missing == 0 {
            if any_failed && self.config.demote_on_optional_failure {
                RunOutcome::Partial
            } else {
                RunOutcome::Success
            }
        } else if present > 0 {
            RunOutcome::Partial
        } else {
            RunOutcome::Failure
        }
    }
}
