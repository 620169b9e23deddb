//! Orchestrator - thin façade over the engine
//!
//! Receives a command invocation, creates or resumes the session, wires the
//! dispatcher and scheduler together, brackets the run with pipeline
//! events, and returns the outcome. No exception escapes: failures surface
//! as a structured `PipelineError` and a failed `RunResult`.

use std::sync::Arc;

use eyre::{Result, eyre};
use serde_json::{Map, Value};
use sessionstore::SessionState;
use tracing::{info, warn};

use crate::cancel::CancelToken;
use crate::config::Config;
use crate::domain::{RunOutcome, RunResult};
use crate::events::{EventBus, EventPayload, SessionEmitter};
use crate::llm::{LlmDispatcher, ProviderClient};
use crate::mcp::McpClientManager;
use crate::registry::{AgentRegistry, PromptRegistry};
use crate::scheduler::{SchedulerConfig, StageScheduler};
use crate::session::{SessionManager, SessionReplay};

/// Options for one run
pub struct RunOptions {
    /// Resume this session instead of creating a fresh one
    pub resume: Option<String>,
    /// Cooperative cancellation token
    pub cancel: CancelToken,
    /// Session context exposed to `context:` input sources
    pub context: Map<String, Value>,
    /// Worktree metadata stamped onto StageStart events
    pub worktree: Option<String>,
    /// Branch metadata stamped onto StageStart events
    pub branch: Option<String>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            resume: None,
            cancel: CancelToken::never(),
            context: Map::new(),
            worktree: None,
            branch: None,
        }
    }
}

/// Composition root for one engine instance
pub struct Orchestrator {
    config: Config,
    prompts: Arc<PromptRegistry>,
    agents: Arc<AgentRegistry>,
    provider: Arc<dyn ProviderClient>,
    mcp: Arc<McpClientManager>,
    sessions: SessionManager,
    bus: Arc<EventBus>,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        prompts: Arc<PromptRegistry>,
        agents: Arc<AgentRegistry>,
        provider: Arc<dyn ProviderClient>,
        mcp: Arc<McpClientManager>,
        sessions: SessionManager,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            config,
            prompts,
            agents,
            provider,
            mcp,
            sessions,
            bus,
        }
    }

    /// Observers subscribe here
    pub fn event_bus(&self) -> Arc<EventBus> {
        self.bus.clone()
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Execute a command to completion and return its result
    pub async fn run(&self, command_name: &str, args: Map<String, Value>, options: RunOptions) -> Result<RunResult> {
        let command = self.prompts.resolve_command(command_name)?;

        // Create or resume the session
        let (session_id, replay, is_resumed) = match &options.resume {
            Some(id) => {
                let data = self.sessions.get(id).await?;
                if data.summary.state.is_terminal() {
                    return Err(eyre!(
                        "session {} is {} and cannot be resumed",
                        id,
                        data.summary.state
                    ));
                }
                let events = self.sessions.get_events(id).await?;
                let replay = SessionReplay::from_events(&events);
                info!(session_id = %id, completed = replay.completed_stages().count(), "Resuming session");
                (id.clone(), replay, true)
            }
            None => {
                let id = self
                    .sessions
                    .create(command_name, Value::Object(args.clone()))
                    .await?;
                (id, SessionReplay::default(), false)
            }
        };

        let dispatcher = Arc::new(LlmDispatcher::new(
            self.provider.clone(),
            self.config.model_catalog(),
            &self.config.llm.model,
            self.config.thresholds(),
        ));
        dispatcher.prime(replay.total_output_tokens).await;

        let emitter = SessionEmitter::new(&session_id, self.bus.clone(), self.sessions.clone());
        emitter
            .emit(
                None,
                EventPayload::PipelineStart {
                    command: command_name.to_string(),
                    is_resumed,
                },
            )
            .await;

        let scheduler = StageScheduler::new(
            self.prompts.clone(),
            self.agents.clone(),
            dispatcher,
            self.mcp.clone(),
            emitter.clone(),
            SchedulerConfig {
                demote_on_optional_failure: self.config.scheduler.demote_on_optional_failure,
                worktree: options.worktree.clone(),
                branch: options.branch.clone(),
            },
            self.config.llm.model.clone(),
            self.config.llm.escalation_model.clone(),
            self.config.llm.max_output_tokens,
        );

        let result = scheduler
            .run(&command, &args, &options.context, replay, options.cancel)
            .await;

        let final_state = match result.outcome {
            RunOutcome::Success | RunOutcome::Partial => {
                emitter
                    .emit(
                        None,
                        EventPayload::PipelineComplete {
                            outcome: result.outcome,
                            total_prompt_tokens: result.total_prompt_tokens,
                            total_output_tokens: result.total_output_tokens,
                        },
                    )
                    .await;
                SessionState::Completed
            }
            RunOutcome::Failure => {
                emitter
                    .emit(
                        None,
                        EventPayload::PipelineComplete {
                            outcome: result.outcome,
                            total_prompt_tokens: result.total_prompt_tokens,
                            total_output_tokens: result.total_output_tokens,
                        },
                    )
                    .await;
                SessionState::Failed
            }
            RunOutcome::Cancelled => {
                emitter
                    .emit(
                        None,
                        EventPayload::PipelineError {
                            reason: "cancelled".to_string(),
                            message: "run cancelled by caller".to_string(),
                        },
                    )
                    .await;
                SessionState::Aborted
            }
        };

        if let Err(e) = self.sessions.set_state(&session_id, final_state).await {
            warn!(session_id = %session_id, error = %e, "run: failed to finalise session state");
        }

        info!(session_id = %session_id, outcome = %result.outcome, "Run finished");
        Ok(result)
    }
}
