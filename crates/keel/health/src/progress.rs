//! Progress messages streamed from a check task to its control loop

use keel_types::ContainerKey;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{HealthError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Progress {
    /// An attempt failed, another one follows
    Checking,
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressMessage {
    pub key: ContainerKey,
    pub progress: Progress,

    /// Error of the last attempt, if any
    pub error: Option<String>,
}

/// How a wait ended
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success,
    Failed(HealthError),

    /// The caller went away; no terminal message was sent
    Cancelled,
}

/// Sending half of a check, bound to the caller's lifetime.
///
/// Every send races the cancellation token, so nothing is delivered once the
/// owning control loop has started tearing down.
#[derive(Debug, Clone)]
pub struct Reporter {
    key: ContainerKey,
    tx: mpsc::Sender<ProgressMessage>,
    token: CancellationToken,
}

impl Reporter {
    pub fn new(key: ContainerKey, tx: mpsc::Sender<ProgressMessage>, token: CancellationToken) -> Self {
        Self { key, tx, token }
    }

    pub fn key(&self) -> &ContainerKey {
        &self.key
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Returns false when cancelled or when the receiver is gone.
    pub async fn send(&self, progress: Progress, error: Option<String>) -> bool {
        if self.token.is_cancelled() {
            return false;
        }

        let message = ProgressMessage {
            key: self.key.clone(),
            progress,
            error,
        };

        tokio::select! {
            biased;
            _ = self.token.cancelled() => false,
            sent = self.tx.send(message) => sent.is_ok(),
        }
    }

    /// Deliver the single terminal message for `result`.
    pub(crate) async fn finish(&self, result: Result<()>) -> Outcome {
        match result {
            Ok(()) => {
                if self.send(Progress::Success, None).await {
                    Outcome::Success
                } else {
                    Outcome::Cancelled
                }
            }
            Err(HealthError::Cancelled) => Outcome::Cancelled,
            Err(err) => {
                if self.send(Progress::Failed, Some(err.to_string())).await {
                    Outcome::Failed(err)
                } else {
                    Outcome::Cancelled
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_no_send_after_cancel() {
        let (tx, mut rx) = mpsc::channel(4);
        let token = CancellationToken::new();
        let reporter = Reporter::new(ContainerKey::new("g", "g-a-1"), tx, token.clone());

        assert!(reporter.send(Progress::Checking, None).await);
        token.cancel();
        assert!(!reporter.send(Progress::Success, None).await);
        assert_eq!(reporter.finish(Ok(())).await, Outcome::Cancelled);

        drop(reporter);
        assert_eq!(rx.recv().await.map(|m| m.progress), Some(Progress::Checking));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_full_channel_does_not_block_cancel() {
        let (tx, _rx) = mpsc::channel(1);
        let token = CancellationToken::new();
        let reporter = Reporter::new(ContainerKey::new("g", "g-a-1"), tx, token.clone());

        assert!(reporter.send(Progress::Checking, None).await);

        let blocked = tokio::spawn({
            let reporter = reporter.clone();
            async move { reporter.send(Progress::Checking, None).await }
        });
        tokio::task::yield_now().await;
        token.cancel();

        assert!(!blocked.await.unwrap());
    }
}
