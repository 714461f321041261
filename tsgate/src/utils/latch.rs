//! One-shot latch.

use tokio_util::sync::CancellationToken;

/// A signal released exactly once.
///
/// Waiters parked before the release wake together; waiters arriving after
/// the release proceed immediately. Used for "became active" / "ready" /
/// "segment done" signals.
#[derive(Debug, Clone, Default)]
pub struct Latch {
    token: CancellationToken,
}

impl Latch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Release the latch. Idempotent.
    pub fn release(&self) {
        self.token.cancel();
    }

    pub fn released(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wait until released. Completes immediately when already released.
    pub async fn wait(&self) {
        self.token.cancelled().await;
    }
}
