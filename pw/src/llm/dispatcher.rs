//! LLM request dispatcher
//!
//! The single gate every provider call goes through: context-window
//! enforcement before the call, retries with exponential backoff for
//! transient failures, hard deadlines derived from the stage budget, token
//! accounting and utilisation warnings after the response.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::context::ContextWindowState;
use super::error::DispatchError;
use super::provider::ProviderClient;
use super::types::{CompletionRequest, CompletionResponse};
use crate::cancel::CancelToken;
use crate::domain::RetryPolicy;
use crate::events::{EventPayload, StageEmitter};

/// Utilisation thresholds, percent of the declared window
#[derive(Debug, Clone, Copy)]
pub struct ContextThresholds {
    /// Crossing this emits a StageProgress warning
    pub warn_percent: f64,
    /// At or above this, dispatches are refused until utilisation drops
    pub stop_percent: f64,
}

impl Default for ContextThresholds {
    fn default() -> Self {
        Self {
            warn_percent: 70.0,
            stop_percent: 85.0,
        }
    }
}

/// Known models and their context windows
#[derive(Debug, Clone, Default)]
pub struct ModelCatalog {
    windows: HashMap<String, u64>,
    serialized: HashMap<String, bool>,
}

impl ModelCatalog {
    pub fn insert(&mut self, model: impl Into<String>, window: u64, serialize_requests: bool) {
        let model = model.into();
        self.windows.insert(model.clone(), window);
        self.serialized.insert(model, serialize_requests);
    }

    /// Window size for a model; unknown models get a conservative default
    pub fn window(&self, model: &str) -> u64 {
        self.windows.get(model).copied().unwrap_or(100_000)
    }

    /// Whether requests for this model must be serialised
    pub fn serialize_requests(&self, model: &str) -> bool {
        self.serialized.get(model).copied().unwrap_or(false)
    }
}

/// Per-session dispatcher owning the context-window state
pub struct LlmDispatcher {
    provider: Arc<dyn ProviderClient>,
    catalog: ModelCatalog,
    thresholds: ContextThresholds,
    state: Mutex<ContextWindowState>,
    warned: AtomicBool,
    /// Per-model serialisation locks, for providers whose rate limits
    /// require one request in flight at a time
    model_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LlmDispatcher {
    pub fn new(
        provider: Arc<dyn ProviderClient>,
        catalog: ModelCatalog,
        declared_model: &str,
        thresholds: ContextThresholds,
    ) -> Self {
        let window = catalog.window(declared_model);
        debug!(model = declared_model, window, "LlmDispatcher::new: called");
        Self {
            provider,
            thresholds,
            state: Mutex::new(ContextWindowState::new(declared_model, window)),
            warned: AtomicBool::new(false),
            model_locks: Mutex::new(HashMap::new()),
            catalog,
        }
    }

    /// Seed token totals from a resumed session's replay
    pub async fn prime(&self, output_tokens_total: u64) {
        let mut state = self.state.lock().await;
        state.output_tokens_total = output_tokens_total;
    }

    /// Snapshot of the current window state
    pub async fn context_state(&self) -> ContextWindowState {
        self.state.lock().await.clone()
    }

    async fn model_lock(&self, model: &str) -> Arc<Mutex<()>> {
        let mut locks = self.model_locks.lock().await;
        locks.entry(model.to_string()).or_default().clone()
    }

    /// Dispatch one request under the stage's retry policy and deadline
    ///
    /// Emits `LlmRequest` before each attempt and `LlmResponse` on success
    /// through the stage's emitter, so a cohort's narrative buffers
    /// correctly. Returns the final error once retries are exhausted.
    pub async fn dispatch(
        &self,
        request: CompletionRequest,
        retry: &RetryPolicy,
        deadline: Instant,
        emitter: &mut StageEmitter,
        cancel: &CancelToken,
    ) -> Result<CompletionResponse, DispatchError> {
        let window = self.catalog.window(&request.model);
        let estimated = request.estimated_prompt_tokens();

        // Context-window enforcement: fail fast, no provider call, no
        // LlmRequest event
        {
            let mut state = self.state.lock().await;
            let utilisation = state.utilisation_percent();
            if utilisation >= self.thresholds.stop_percent {
                warn!(utilisation, "dispatch: refused, utilisation at hard stop");
                return Err(DispatchError::ContextOverflow {
                    needed: state.prompt_tokens_in_flight + state.output_tokens_total,
                    window: state.window_size,
                });
            }
            if state.would_overflow(estimated, request.max_output_tokens, window) {
                debug!(estimated, reserved = request.max_output_tokens, window, "dispatch: would overflow");
                return Err(DispatchError::ContextOverflow {
                    needed: estimated + request.max_output_tokens,
                    window,
                });
            }
            state.begin_dispatch(estimated);
        }

        // Optional per-model serialisation
        let _serial_guard = if self.catalog.serialize_requests(&request.model) {
            let lock = self.model_lock(&request.model).await;
            Some(lock.lock_owned().await)
        } else {
            None
        };

        let mut last_error: Option<DispatchError> = None;
        for attempt in 1..=retry.max_attempts.max(1) {
            if cancel.is_cancelled() {
                self.state.lock().await.abort_dispatch();
                return Err(DispatchError::Cancelled);
            }

            if attempt > 1 {
                // Rate-limit hints override the computed backoff
                let backoff = last_error
                    .as_ref()
                    .and_then(DispatchError::retry_after)
                    .unwrap_or_else(|| retry.backoff(attempt - 2));
                debug!(attempt, ?backoff, "dispatch: sleeping before retry");
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = cancel.cancelled() => {
                        self.state.lock().await.abort_dispatch();
                        return Err(DispatchError::Cancelled);
                    }
                }
            }

            let Some(remaining) = deadline.checked_duration_since(Instant::now()).filter(|d| !d.is_zero()) else {
                self.state.lock().await.abort_dispatch();
                return Err(DispatchError::ProviderTimeout(std::time::Duration::ZERO));
            };

            emitter
                .emit(EventPayload::LlmRequest {
                    model: request.model.clone(),
                    attempt,
                    estimated_prompt_tokens: estimated,
                    max_output_tokens: request.max_output_tokens,
                })
                .await;

            let started = Instant::now();
            let result = tokio::select! {
                r = self.provider.complete(&request) => r,
                _ = tokio::time::sleep(remaining) => Err(DispatchError::ProviderTimeout(remaining)),
                _ = cancel.cancelled() => Err(DispatchError::Cancelled),
            };

            match result {
                Ok(response) => {
                    let duration_ms = started.elapsed().as_millis() as u64;
                    let utilisation = {
                        let mut state = self.state.lock().await;
                        state.on_response(response.prompt_tokens, response.output_tokens);
                        state.utilisation_percent()
                    };

                    emitter
                        .emit(EventPayload::LlmResponse {
                            model: response.model.clone(),
                            prompt_tokens: response.prompt_tokens,
                            output_tokens: response.output_tokens,
                            duration_ms,
                            content: response.content.clone(),
                        })
                        .await;

                    if utilisation >= self.thresholds.warn_percent && !self.warned.swap(true, Ordering::SeqCst) {
                        emitter
                            .emit(EventPayload::StageProgress {
                                message: format!("context window at {:.0}% utilisation", utilisation),
                                warning: true,
                                utilisation_percent: Some(utilisation),
                            })
                            .await;
                    }

                    return Ok(response);
                }
                Err(DispatchError::Cancelled) => {
                    self.state.lock().await.abort_dispatch();
                    return Err(DispatchError::Cancelled);
                }
                Err(e) if e.is_transient() && attempt < retry.max_attempts => {
                    warn!(attempt, error = %e, "dispatch: transient failure, will retry");
                    last_error = Some(e);
                }
                Err(e) => {
                    debug!(attempt, error = %e, "dispatch: giving up");
                    self.state.lock().await.abort_dispatch();
                    return Err(e);
                }
            }
        }

        self.state.lock().await.abort_dispatch();
        Err(last_error.unwrap_or_else(|| DispatchError::ResponseInvalid("retries exhausted".to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventKind, SessionEmitter, create_event_bus};
    use crate::llm::provider::mock::{MockOutcome, MockProvider};
    use crate::session::SessionManager;
    use std::time::Duration;
    use tempfile::TempDir;

    fn catalog() -> ModelCatalog {
        let mut catalog = ModelCatalog::default();
        catalog.insert("m1", 200_000, false);
        catalog
    }

    fn request(body_len: usize) -> CompletionRequest {
        CompletionRequest {
            model: "m1".to_string(),
            system_prompt: String::new(),
            prompt_body: "x".repeat(body_len),
            max_output_tokens: 1_000,
            session_id: "s".to_string(),
            stage_name: "plan".to_string(),
        }
    }

    async fn stage_emitter(dir: &TempDir) -> (StageEmitter, std::sync::Arc<crate::events::EventBus>, SessionManager, String) {
        let bus = create_event_bus();
        let store = SessionManager::spawn(dir.path()).unwrap();
        let id = store.create("plan", serde_json::json!({})).await.unwrap();
        let emitter = StageEmitter::new(SessionEmitter::new(&id, bus.clone(), store.clone()), "plan", false);
        (emitter, bus, store, id)
    }

    fn deadline(secs: u64) -> Instant {
        Instant::now() + Duration::from_secs(secs)
    }

    #[tokio::test]
    async fn test_happy_path_accounts_tokens() {
        let dir = TempDir::new().unwrap();
        let (mut emitter, _bus, store, id) = stage_emitter(&dir).await;
        let provider = Arc::new(MockProvider::new(vec![MockOutcome::Ok(MockProvider::response("ok"))]));
        let dispatcher = LlmDispatcher::new(provider.clone(), catalog(), "m1", ContextThresholds::default());

        let response = dispatcher
            .dispatch(request(400), &RetryPolicy::default(), deadline(5), &mut emitter, &CancelToken::never())
            .await
            .unwrap();

        assert_eq!(response.content, "ok");
        assert_eq!(provider.call_count(), 1);

        let state = dispatcher.context_state().await;
        assert_eq!(state.prompt_tokens_in_flight, 100);
        assert_eq!(state.output_tokens_total, 50);

        let events = store.get_events(&id).await.unwrap();
        let kinds: Vec<_> = events.iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, vec![EventKind::LlmRequest, EventKind::LlmResponse]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_then_success() {
        let dir = TempDir::new().unwrap();
        let (mut emitter, _bus, store, id) = stage_emitter(&dir).await;
        let provider = Arc::new(MockProvider::new(vec![
            MockOutcome::Err(DispatchError::ProviderTimeout(Duration::from_secs(1))),
            MockOutcome::Err(DispatchError::ProviderTimeout(Duration::from_secs(1))),
            MockOutcome::Ok(MockProvider::response("finally")),
        ]));
        let dispatcher = LlmDispatcher::new(provider.clone(), catalog(), "m1", ContextThresholds::default());

        let policy = RetryPolicy {
            max_attempts: 3,
            backoff_ms: 1_000,
            backoff_multiplier: 2.0,
            jitter: false,
        };

        let started = tokio::time::Instant::now();
        let response = dispatcher
            .dispatch(request(40), &policy, deadline(600), &mut emitter, &CancelToken::never())
            .await
            .unwrap();

        assert_eq!(response.content, "finally");
        assert_eq!(provider.call_count(), 3);
        // Sleeps observed: 1000ms then 2000ms
        assert_eq!(started.elapsed(), Duration::from_millis(3_000));

        let events = store.get_events(&id).await.unwrap();
        let requests = events.iter().filter(|e| e.kind() == EventKind::LlmRequest).count();
        let responses = events.iter().filter(|e| e.kind() == EventKind::LlmResponse).count();
        assert_eq!(requests, 3);
        assert_eq!(responses, 1);
    }

    #[tokio::test]
    async fn test_permanent_error_aborts_retry() {
        let dir = TempDir::new().unwrap();
        let (mut emitter, _bus, _store, _id) = stage_emitter(&dir).await;
        let provider = Arc::new(MockProvider::new(vec![MockOutcome::Err(DispatchError::ProviderPermanent {
            status: 400,
            message: "bad request".to_string(),
        })]));
        let dispatcher = LlmDispatcher::new(provider.clone(), catalog(), "m1", ContextThresholds::default());

        let err = dispatcher
            .dispatch(request(40), &RetryPolicy::default(), deadline(5), &mut emitter, &CancelToken::never())
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::ProviderPermanent { status: 400, .. }));
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn test_context_overflow_no_provider_call() {
        let dir = TempDir::new().unwrap();
        let (mut emitter, _bus, store, id) = stage_emitter(&dir).await;
        let provider = Arc::new(MockProvider::always_ok("{}"));
        let dispatcher = LlmDispatcher::new(provider.clone(), catalog(), "m1", ContextThresholds::default());

        // 160k estimated prompt + 50k reserved output > 200k window
        let mut big = request(640_000);
        big.max_output_tokens = 50_000;

        let err = dispatcher
            .dispatch(big, &RetryPolicy::default(), deadline(5), &mut emitter, &CancelToken::never())
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::ContextOverflow { window: 200_000, .. }));
        assert_eq!(provider.call_count(), 0, "no provider call on overflow");
        assert!(store.get_events(&id).await.unwrap().is_empty(), "no LlmRequest emitted");
    }

    #[tokio::test]
    async fn test_hard_stop_refuses_dispatch() {
        let dir = TempDir::new().unwrap();
        let (mut emitter, _bus, _store, _id) = stage_emitter(&dir).await;
        let provider = Arc::new(MockProvider::always_ok("{}"));
        let dispatcher = LlmDispatcher::new(provider.clone(), catalog(), "m1", ContextThresholds::default());

        // Drive utilisation to 85%: 170k of 200k
        dispatcher.prime(170_000).await;

        let err = dispatcher
            .dispatch(request(40), &RetryPolicy::default(), deadline(5), &mut emitter, &CancelToken::never())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::ContextOverflow { .. }));
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn test_warning_emitted_once_on_crossing() {
        let dir = TempDir::new().unwrap();
        let (mut emitter, _bus, store, id) = stage_emitter(&dir).await;
        // Each response reports 140k prompt tokens: utilisation lands above
        // 70% of the 200k window
        let provider = Arc::new(MockProvider::new(vec![
            MockOutcome::Ok(CompletionResponse {
                content: "a".to_string(),
                prompt_tokens: 140_000,
                output_tokens: 1_000,
                model: "m1".to_string(),
            }),
            MockOutcome::Ok(CompletionResponse {
                content: "b".to_string(),
                prompt_tokens: 140_000,
                output_tokens: 1_000,
                model: "m1".to_string(),
            }),
        ]));
        let dispatcher = LlmDispatcher::new(provider, catalog(), "m1", ContextThresholds::default());

        for _ in 0..2 {
            dispatcher
                .dispatch(request(40), &RetryPolicy::default(), deadline(5), &mut emitter, &CancelToken::never())
                .await
                .unwrap();
        }

        let events = store.get_events(&id).await.unwrap();
        let warnings = events
            .iter()
            .filter(|e| matches!(&e.payload, EventPayload::StageProgress { warning: true, .. }))
            .count();
        assert_eq!(warnings, 1, "warning fires once on crossing, not per dispatch");
    }

    #[tokio::test]
    async fn test_cancel_aborts_in_flight_call() {
        let dir = TempDir::new().unwrap();
        let (mut emitter, _bus, _store, _id) = stage_emitter(&dir).await;
        let provider = Arc::new(MockProvider::new(vec![MockOutcome::Slow(
            Duration::from_secs(30),
            MockProvider::response("late"),
        )]));
        let dispatcher = Arc::new(LlmDispatcher::new(provider, catalog(), "m1", ContextThresholds::default()));

        let (handle, token) = crate::cancel::cancel_pair();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            handle.cancel();
        });

        let started = Instant::now();
        let err = dispatcher
            .dispatch(request(40), &RetryPolicy::default(), deadline(60), &mut emitter, &token)
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_deadline_enforced() {
        let dir = TempDir::new().unwrap();
        let (mut emitter, _bus, _store, _id) = stage_emitter(&dir).await;
        let provider = Arc::new(MockProvider::new(vec![MockOutcome::Slow(
            Duration::from_secs(30),
            MockProvider::response("late"),
        )]));
        let dispatcher = LlmDispatcher::new(provider, catalog(), "m1", ContextThresholds::default());

        let policy = RetryPolicy {
            max_attempts: 1,
            ..Default::default()
        };
        let err = dispatcher
            .dispatch(
                request(40),
                &policy,
                Instant::now() + Duration::from_millis(100),
                &mut emitter,
                &CancelToken::never(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::ProviderTimeout(_)));
    }
}
