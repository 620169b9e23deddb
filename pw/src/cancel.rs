//! Cooperative cancellation
//!
//! A watch channel pair: the caller holds the [`CancelHandle`], every task
//! gets a cloned [`CancelToken`] and checks it at suspension points. An
//! aborting run refuses new work and finishes in-flight calls under a
//! shortened deadline.

use tokio::sync::watch;
use tracing::debug;

/// Caller-side handle that triggers cancellation
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Signal every token; idempotent
    pub fn cancel(&self) {
        debug!("CancelHandle::cancel: signalling");
        let _ = self.tx.send(true);
    }

    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.tx.subscribe(),
            _keepalive: None,
        }
    }
}

/// Task-side view of the cancellation state
#[derive(Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
    /// Keeps the channel open for detached tokens (see [`CancelToken::never`])
    _keepalive: Option<std::sync::Arc<watch::Sender<bool>>>,
}

impl CancelToken {
    /// Non-blocking check, used before starting new work
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve when cancellation is signalled; pends forever if the handle
    /// is dropped without cancelling
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
        std::future::pending::<()>().await;
    }

    /// A token that never fires (for callers that don't need cancellation)
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            rx,
            _keepalive: Some(std::sync::Arc::new(tx)),
        }
    }
}

/// Create a connected handle/token pair
pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    let token = CancelToken {
        rx,
        _keepalive: None,
    };
    (CancelHandle { tx }, token)
}
