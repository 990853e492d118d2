// src/shutdown/coordinator.rs
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum ShutdownError {
    #[error("timed out after {limit:?} waiting for {expected} completions ({received} received)")]
    TimedOut {
        expected: u64,
        received: u64,
        limit: Duration,
    },

    #[error("dispatcher task failed: {0}")]
    Dispatcher(#[from] tokio::task::JoinError),
}

/// Collection point for unit completion signals.
///
/// Every task that must finish before shutdown holds a [`Completion`]
/// obtained from a [`CompletionSender`]. The controller knows how many
/// tasks it caused to exist and waits for that many signals. Signals carry
/// no identity; only the count matters. Signals sent before anyone waits
/// are buffered, so arrival order never matters.
pub struct ShutdownCoordinator {
    tx: mpsc::UnboundedSender<()>,
    rx: mpsc::UnboundedReceiver<()>,
    received: u64,
}

/// Cloneable producer side of a [`ShutdownCoordinator`].
#[derive(Clone)]
pub struct CompletionSender {
    tx: mpsc::UnboundedSender<()>,
}

/// One task's completion signal.
///
/// Emitted exactly once: by [`Completion::signal`], or when the token is
/// dropped if the owning task unwinds before reaching it.
#[must_use = "a completion that is dropped immediately signals immediately"]
pub struct Completion {
    tx: mpsc::UnboundedSender<()>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx, received: 0 }
    }

    pub fn completions(&self) -> CompletionSender {
        CompletionSender {
            tx: self.tx.clone(),
        }
    }

    /// Signals observed so far by `wait_for*`.
    pub fn received(&self) -> u64 {
        self.received
    }

    /// Blocks until the cumulative number of received signals reaches
    /// `expected`. Returns immediately if it already has.
    ///
    /// There is no upper bound on the wait; see [`wait_for_timeout`].
    ///
    /// [`wait_for_timeout`]: ShutdownCoordinator::wait_for_timeout
    pub async fn wait_for(&mut self, expected: u64) {
        while self.received < expected {
            // The coordinator keeps its own sender alive, so `recv` only
            // returns `None` if that invariant is broken.
            if self.rx.recv().await.is_none() {
                break;
            }
            self.received += 1;
            debug!(received = self.received, expected, "completion received");
        }
    }

    pub async fn wait_for_timeout(
        &mut self,
        expected: u64,
        limit: Duration,
    ) -> Result<(), ShutdownError> {
        let waited = timeout(limit, self.wait_for(expected)).await;
        match waited {
            Ok(()) => Ok(()),
            Err(_) => {
                warn!(
                    received = self.received,
                    expected, "shutdown wait timed out"
                );
                Err(ShutdownError::TimedOut {
                    expected,
                    received: self.received,
                    limit,
                })
            }
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionSender {
    pub fn token(&self) -> Completion {
        Completion {
            tx: self.tx.clone(),
        }
    }
}

impl Completion {
    pub fn signal(self) {
        // Dropping does the send.
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        // The receiver only goes away with the coordinator, at which point
        // nobody is left to count.
        let _ = self.tx.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_signals_before_wait_are_counted() {
        let mut coordinator = ShutdownCoordinator::new();
        let completions = coordinator.completions();

        completions.token().signal();
        completions.token().signal();

        coordinator.wait_for(2).await;
        assert_eq!(coordinator.received(), 2);
    }

    #[tokio::test]
    async fn test_wait_is_cumulative() {
        let mut coordinator = ShutdownCoordinator::new();
        let completions = coordinator.completions();

        completions.token().signal();
        coordinator.wait_for(1).await;

        completions.token().signal();
        coordinator.wait_for(2).await;

        // Already satisfied, must not block.
        coordinator.wait_for(1).await;
        assert_eq!(coordinator.received(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_producers() {
        let mut coordinator = ShutdownCoordinator::new();
        let completions = coordinator.completions();

        for _ in 0..64 {
            let token = completions.token();
            tokio::spawn(async move {
                tokio::task::yield_now().await;
                token.signal();
            });
        }

        coordinator
            .wait_for_timeout(64, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(coordinator.received(), 64);
    }

    #[tokio::test]
    async fn test_panicking_task_still_signals() {
        let mut coordinator = ShutdownCoordinator::new();
        let token = coordinator.completions().token();

        let handle = tokio::spawn(async move {
            let _token = token;
            panic!("reader blew up");
        });
        assert!(handle.await.is_err());

        coordinator
            .wait_for_timeout(1, Duration::from_secs(5))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let mut coordinator = ShutdownCoordinator::new();
        coordinator.completions().token().signal();

        let err = coordinator
            .wait_for_timeout(2, Duration::from_millis(50))
            .await
            .unwrap_err();

        match err {
            ShutdownError::TimedOut {
                expected, received, ..
            } => {
                assert_eq!(expected, 2);
                assert_eq!(received, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
