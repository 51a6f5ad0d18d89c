use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

/// Cooperative stop flag for one execution.
///
/// Cancelling the signal also cancels every request token derived from it
/// with [`StopSignal::request_token`]. `by_user` records whether the stop came
/// from [`FlowEngine::stop`](crate::core::FlowEngine::stop) or from the engine
/// halting the flow itself.
#[derive(Clone, Debug)]
pub struct StopSignal {
    token: CancellationToken,
    by_user: Arc<AtomicBool>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            by_user: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Stop requested from outside the engine.
    pub fn trigger(&self) {
        self.by_user.store(true, Ordering::Relaxed);
        self.token.cancel();
    }

    /// Stop requested by the engine after a fatal step failure.
    pub fn halt(&self) {
        self.token.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn is_user_stop(&self) -> bool {
        self.by_user.load(Ordering::Relaxed)
    }

    pub fn cancelled(&self) -> tokio_util::sync::WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    /// Child token for one in-flight request.
    pub fn request_token(&self) -> CancellationToken {
        self.token.child_token()
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}
