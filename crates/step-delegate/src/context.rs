//! Cancellation context passed to every blocking delegate operation.
//!
//! A step's governing context can be cancelled at any time (build aborted,
//! worker lost). Sub-plan runs race against [`StepContext::cancelled`] so an
//! abort unwinds them promptly instead of waiting for completion.

use tokio::sync::watch;

/// Handle that cancels every [`StepContext`] cloned from its pair.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        // send only fails when no context is left to observe it
        let _ = self.tx.send(true);
    }
}

/// Ambient execution context for a step.
#[derive(Debug, Clone)]
pub struct StepContext {
    cancel_rx: watch::Receiver<bool>,
}

impl StepContext {
    /// A cancellable context and the handle that cancels it.
    pub fn new() -> (CancelHandle, Self) {
        let (tx, rx) = watch::channel(false);
        (CancelHandle { tx }, StepContext { cancel_rx: rx })
    }

    /// A context that is never cancelled.
    pub fn background() -> Self {
        let (_tx, rx) = watch::channel(false);
        StepContext { cancel_rx: rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    /// Resolves once the context is cancelled; pends forever otherwise.
    pub async fn cancelled(&self) {
        let mut rx = self.cancel_rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                // sender dropped without cancelling: nothing can cancel us now
                std::future::pending::<()>().await;
            }
        }
    }
}
