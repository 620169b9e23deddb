//! Session replay - rebuild scheduler state from a stored event log
//!
//! On resume, the scheduler needs to know which stages already completed
//! (with their outputs), which failed, and whether any stage has a
//! dispatched-but-unparsed response that can be replayed through output
//! parsing without hitting the provider again.

use std::collections::HashMap;

use tracing::debug;

use crate::domain::{StageFailure, StageRecord, StageState};
use crate::events::{EventPayload, PipelineEvent};

/// Reconstructed view of a prior (interrupted) run
#[derive(Debug, Default)]
pub struct SessionReplay {
    /// Per-stage records rebuilt from the log
    pub records: HashMap<String, StageRecord>,
    /// Stages whose last LlmResponse has no matching terminal event:
    /// the dispatch succeeded but post-processing was interrupted. The
    /// stored content is replayed through output parsing only.
    pub pending_responses: HashMap<String, String>,
    /// Token totals accumulated before the interruption
    pub total_prompt_tokens: u64,
    pub total_output_tokens: u64,
}

impl SessionReplay {
    /// Rebuild from an ordered event log
    pub fn from_events(events: &[PipelineEvent]) -> Self {
        debug!(count = events.len(), "SessionReplay::from_events: called");
        let mut replay = SessionReplay::default();

        for event in events {
            let Some(stage_name) = event.stage.as_deref() else {
                continue;
            };

            match &event.payload {
                EventPayload::StageStart { .. } => {
                    let record = replay
                        .records
                        .entry(stage_name.to_string())
                        .or_insert_with(|| StageRecord::new(stage_name));
                    record.state = StageState::Running;
                    record.started_at = Some(event.timestamp);
                    // A fresh start supersedes any stale pending response
                    replay.pending_responses.remove(stage_name);
                }
                EventPayload::LlmRequest { .. } => {
                    if let Some(record) = replay.records.get_mut(stage_name) {
                        record.attempts += 1;
                    }
                }
                EventPayload::LlmResponse {
                    prompt_tokens,
                    output_tokens,
                    content,
                    ..
                } => {
                    replay.total_prompt_tokens += prompt_tokens;
                    replay.total_output_tokens += output_tokens;
                    if let Some(record) = replay.records.get_mut(stage_name) {
                        record.prompt_tokens += prompt_tokens;
                        record.output_tokens += output_tokens;
                    }
                    replay.pending_responses.insert(stage_name.to_string(), content.clone());
                }
                EventPayload::StageComplete {
                    outputs, attempts, ..
                } => {
                    if let Some(record) = replay.records.get_mut(stage_name) {
                        record.state = StageState::Completed;
                        record.outputs = outputs.clone();
                        record.attempts = record.attempts.max(*attempts);
                        record.ended_at = Some(event.timestamp);
                    }
                    replay.pending_responses.remove(stage_name);
                }
                EventPayload::StageError { kind, message, attempts } => {
                    if let Some(record) = replay.records.get_mut(stage_name) {
                        record.state = StageState::Failed;
                        record.failure = Some(StageFailure::new(*kind, message.clone()));
                        record.attempts = record.attempts.max(*attempts);
                        record.ended_at = Some(event.timestamp);
                    }
                    replay.pending_responses.remove(stage_name);
                }
                _ => {}
            }
        }

        debug!(
            stages = replay.records.len(),
            pending = replay.pending_responses.len(),
            "SessionReplay::from_events: rebuilt"
        );
        replay
    }

    /// Stage names that already completed and need no re-dispatch
    pub fn completed_stages(&self) -> impl Iterator<Item = &str> {
        self.records
            .iter()
            .filter(|(_, r)| r.state == StageState::Completed)
            .map(|(name, _)| name.as_str())
    }

    /// Whether this stage completed in the prior run
    pub fn is_completed(&self, stage: &str) -> bool {
        self.records
            .get(stage)
            .map(|r| r.state == StageState::Completed)
            .unwrap_or(false)
    }

    /// Mark stages that failed (or were mid-flight) in the prior run back
    /// to pending so resume re-attempts them from scratch
    pub fn reset_failures(&mut self) {
        for record in self.records.values_mut() {
            if matches!(record.state, StageState::Failed | StageState::Running) {
                record.state = StageState::Pending;
                record.failure = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::FailureKind;
    use serde_json::Map;

    fn event(stage: &str, payload: EventPayload) -> PipelineEvent {
        PipelineEvent::now("sess", Some(stage.to_string()), payload)
    }

    fn start(stage: &str) -> PipelineEvent {
        event(
            stage,
            EventPayload::StageStart {
                agent: "planner".to_string(),
                prompt_id: "p".to_string(),
                is_parallel: false,
                worktree: None,
                branch: None,
            },
        )
    }

    fn request(stage: &str) -> PipelineEvent {
        event(
            stage,
            EventPayload::LlmRequest {
                model: "m1".to_string(),
                attempt: 1,
                estimated_prompt_tokens: 100,
                max_output_tokens: 1000,
            },
        )
    }

    fn response(stage: &str, content: &str) -> PipelineEvent {
        event(
            stage,
            EventPayload::LlmResponse {
                model: "m1".to_string(),
                prompt_tokens: 100,
                output_tokens: 40,
                duration_ms: 900,
                content: content.to_string(),
            },
        )
    }

    fn complete(stage: &str) -> PipelineEvent {
        let mut outputs = Map::new();
        outputs.insert("notes".to_string(), serde_json::json!("done"));
        event(
            stage,
            EventPayload::StageComplete {
                outputs,
                attempts: 1,
                duration_ms: 950,
            },
        )
    }

    #[test]
    fn test_completed_stage_reconstruction() {
        let events = vec![start("gather"), request("gather"), response("gather", "{}"), complete("gather")];
        let replay = SessionReplay::from_events(&events);

        assert!(replay.is_completed("gather"));
        let record = &replay.records["gather"];
        assert_eq!(record.attempts, 1);
        assert_eq!(record.prompt_tokens, 100);
        assert_eq!(record.outputs["notes"], serde_json::json!("done"));
        assert!(replay.pending_responses.is_empty());
        assert_eq!(replay.total_prompt_tokens, 100);
        assert_eq!(replay.total_output_tokens, 40);
    }

    #[test]
    fn test_interrupted_postprocessing_leaves_pending_response() {
        // Response arrived but the process died before StageComplete
        let events = vec![
            start("gather"),
            request("gather"),
            response("gather", "{\"notes\": \"partial\"}"),
        ];
        let replay = SessionReplay::from_events(&events);

        assert!(!replay.is_completed("gather"));
        assert_eq!(
            replay.pending_responses.get("gather").map(String::as_str),
            Some("{\"notes\": \"partial\"}")
        );
    }

    #[test]
    fn test_failed_stage_resets_to_pending() {
        let events = vec![
            start("gather"),
            request("gather"),
            event(
                "gather",
                EventPayload::StageError {
                    kind: FailureKind::ProviderTimeout,
                    message: "deadline".to_string(),
                    attempts: 3,
                },
            ),
        ];
        let mut replay = SessionReplay::from_events(&events);
        assert_eq!(replay.records["gather"].state, StageState::Failed);

        replay.reset_failures();
        assert_eq!(replay.records["gather"].state, StageState::Pending);
        assert!(replay.records["gather"].failure.is_none());
    }

    #[test]
    fn test_multiple_attempts_counted() {
        let events = vec![start("gather"), request("gather"), request("gather"), request("gather")];
        let replay = SessionReplay::from_events(&events);
        assert_eq!(replay.records["gather"].attempts, 3);
    }
}
