//! Context-window accounting
//!
//! One rolling view per session: how many prompt tokens are in flight, how
//! much output the session has generated, and how close it is to the
//! model's window. The dispatcher consults this before every provider call
//! and reconciles it from every response.

use tracing::debug;

/// Per-session context-window state
#[derive(Debug, Clone)]
pub struct ContextWindowState {
    pub model: String,
    pub window_size: u64,
    pub prompt_tokens_in_flight: u64,
    pub output_tokens_total: u64,
}

impl ContextWindowState {
    pub fn new(model: impl Into<String>, window_size: u64) -> Self {
        Self {
            model: model.into(),
            window_size,
            prompt_tokens_in_flight: 0,
            output_tokens_total: 0,
        }
    }

    /// Would dispatching `estimated_prompt + reserved_output` tokens against
    /// `window` overflow it?
    pub fn would_overflow(&self, estimated_prompt: u64, reserved_output: u64, window: u64) -> bool {
        estimated_prompt + reserved_output > window
    }

    /// Utilisation of the session's declared window, percent
    pub fn utilisation_percent(&self) -> f64 {
        if self.window_size == 0 {
            return 100.0;
        }
        (self.prompt_tokens_in_flight + self.output_tokens_total) as f64 / self.window_size as f64 * 100.0
    }

    /// Record the start of a dispatch
    pub fn begin_dispatch(&mut self, estimated_prompt: u64) {
        self.prompt_tokens_in_flight = estimated_prompt;
    }

    /// Reconcile from a provider response
    pub fn on_response(&mut self, prompt_tokens: u64, output_tokens: u64) {
        self.prompt_tokens_in_flight = prompt_tokens;
        self.output_tokens_total += output_tokens;
        debug!(
            prompt_tokens,
            output_tokens,
            utilisation = self.utilisation_percent(),
            "ContextWindowState::on_response"
        );
    }

    /// Clear in-flight tokens after a failed dispatch
    pub fn abort_dispatch(&mut self) {
        self.prompt_tokens_in_flight = 0;
    }
}
