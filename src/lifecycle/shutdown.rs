//! Shutdown coordination for the gateway.

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::context::CallContext;

/// Coordinator for graceful shutdown.
///
/// Background tasks subscribe to the broadcast channel; in-flight calls made
/// with a context from `context()` are cancelled when shutdown triggers.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: broadcast::Sender<()>,
    token: CancellationToken,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self {
            tx,
            token: CancellationToken::new(),
        }
    }

    /// Subscribe to the shutdown signal.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    /// A call context cancelled when shutdown triggers.
    pub fn context(&self) -> CallContext {
        CallContext::background().with_token(self.token.child_token())
    }

    /// Trigger the shutdown signal.
    pub fn trigger(&self) {
        self.token.cancel();
        let _ = self.tx.send(());
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Number of tasks still listening.
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
