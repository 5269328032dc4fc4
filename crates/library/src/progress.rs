use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Receives progress from long-running operations.
///
/// Called from blocking worker threads as well as async tasks, so
/// implementations must be cheap and must not block.
pub trait ProgressCallback: Send + Sync {
    fn on_progress(&self, current: u64, total: u64, message: &str);

    /// Polled between members and segments.
    fn should_cancel(&self) -> bool {
        false
    }
}

/// Discards progress and never cancels.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoProgress;

impl ProgressCallback for NoProgress {
    fn on_progress(&self, _current: u64, _total: u64, _message: &str) {}
}

/// Progress reporting and cancellation for one operation.
#[derive(Clone)]
pub struct OperationContext {
    progress: Arc<dyn ProgressCallback>,
    cancel: CancellationToken,
}

impl OperationContext {
    pub fn new() -> Self {
        Self {
            progress: Arc::new(NoProgress),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressCallback>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.progress.should_cancel()
    }

    pub(crate) fn report(&self, current: u64, total: u64, message: &str) {
        self.progress.on_progress(current, total, message);
    }
}

impl Default for OperationContext {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for OperationContext {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("OperationContext")
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::Recorder;
    use super::*;

    #[test]
    fn test_token_cancels() {
        let ctx = OperationContext::new();
        assert!(!ctx.is_cancelled());
        ctx.cancellation_token().cancel();
        assert!(ctx.is_cancelled());
    }

    #[test]
    fn test_callback_cancels() {
        let recorder = Arc::new(Recorder::cancelling_after(2));
        let ctx = OperationContext::new().with_progress(recorder.clone());
        ctx.report(1, 3, "a");
        assert!(!ctx.is_cancelled());
        ctx.report(2, 3, "b");
        assert!(ctx.is_cancelled());
        assert_eq!(recorder.count(), 2);
    }
}
