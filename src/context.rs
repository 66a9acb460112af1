//! Per-call deadline and cancellation.
//!
//! Every network-bound operation takes a `CallContext`. The context combines an
//! optional deadline with a cancellation token so a caller can abandon a call
//! from outside (e.g. the collaborator's own request was dropped).

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a bounded call stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupted {
    /// The caller cancelled the context.
    Cancelled,
    /// The local limit or the context deadline elapsed.
    TimedOut,
}

/// Deadline plus cancellation signal for one logical call.
#[derive(Debug, Clone)]
pub struct CallContext {
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl Default for CallContext {
    fn default() -> Self {
        Self::background()
    }
}

impl CallContext {
    /// A context with no deadline that is never cancelled by the gateway itself.
    pub fn background() -> Self {
        Self {
            deadline: None,
            cancel: CancellationToken::new(),
        }
    }

    /// A context that expires `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::background().deadline_in(timeout)
    }

    /// Set (or tighten) the deadline to `timeout` from now.
    pub fn deadline_in(mut self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        self.deadline = Some(match self.deadline {
            Some(existing) if existing < candidate => existing,
            _ => candidate,
        });
        self
    }

    /// Use an externally owned cancellation token.
    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Time left before the deadline, `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Clamp a local limit to the time remaining on the context.
    pub fn clamp(&self, limit: Duration) -> Duration {
        match self.remaining() {
            Some(remaining) => remaining.min(limit),
            None => limit,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// True once cancelled or past the deadline.
    pub fn is_done(&self) -> bool {
        self.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Run `fut` bounded by `limit`, the deadline and the cancellation token.
    pub async fn run<F>(&self, limit: Duration, fut: F) -> Result<F::Output, Interrupted>
    where
        F: Future,
    {
        let limit = self.clamp(limit);
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Interrupted::Cancelled),
            res = tokio::time::timeout(limit, fut) => res.map_err(|_| Interrupted::TimedOut),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn run_respects_deadline() {
        let ctx = CallContext::with_timeout(Duration::from_millis(50));
        let res = ctx
            .run(Duration::from_secs(10), tokio::time::sleep(Duration::from_secs(1)))
            .await;
        assert_eq!(res, Err(Interrupted::TimedOut));
    }

    #[tokio::test]
    async fn run_observes_cancellation() {
        let ctx = CallContext::background();
        let token = ctx.token().clone();
        token.cancel();
        let res = ctx
            .run(Duration::from_secs(10), tokio::time::sleep(Duration::from_secs(1)))
            .await;
        assert_eq!(res, Err(Interrupted::Cancelled));
        assert!(ctx.is_done());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_only_tightens() {
        let ctx = CallContext::with_timeout(Duration::from_millis(100))
            .deadline_in(Duration::from_secs(5));
        assert!(ctx.remaining().unwrap() <= Duration::from_millis(100));
        assert_eq!(ctx.clamp(Duration::from_secs(1)), Duration::from_millis(100));
    }
}
