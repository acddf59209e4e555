//! Per-attempt task context handed to user functions.

use tokio_util::sync::CancellationToken;

/// Context passed to every invocation of a user function.
///
/// Carries the item index, the 1-indexed attempt number, and the cancellation
/// token for this attempt. Cooperative user functions should poll
/// [`TaskContext::canceled`] (or check [`TaskContext::is_canceled`]) inside
/// long-running work.
#[derive(Debug, Clone)]
pub struct TaskContext {
    index: u64,
    attempt: u32,
    token: CancellationToken,
}

impl TaskContext {
    pub(crate) fn new(index: u64, attempt: u32, token: CancellationToken) -> Self {
        Self { index, attempt, token }
    }

    /// Zero-based index of the work item in input order.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Attempt number for this invocation, starting at 1.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_canceled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves when the execution (or this attempt) is canceled.
    pub async fn canceled(&self) {
        self.token.cancelled().await
    }

    /// The raw token, for handing to nested cancellation-aware calls.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn context_reports_cancellation() {
        let token = CancellationToken::new();
        let ctx = TaskContext::new(3, 1, token.child_token());
        assert_eq!(ctx.index(), 3);
        assert_eq!(ctx.attempt(), 1);
        assert!(!ctx.is_canceled());

        token.cancel();
        assert!(ctx.is_canceled());
        ctx.canceled().await;
    }
}
