//! The Messaging Gateway contract.
//!
//! The orchestration core never speaks to a transport directly.  Commands
//! leave through [`MessagingGateway::send_command`] and module status flows
//! back through [`MessagingGateway::subscribe_events`].  Whether a module sits
//! behind SSH, a serial bus or a message broker is the gateway's business.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use skyward_types::{Command, CommandOutcome, ModuleId, StatusEvent};
use tokio::sync::oneshot;

/// Every transport implementation must implement this trait.
///
/// # Contract
///
/// * `send_command` – hands `command` to the module and returns a
///   [`CommandHandle`] immediately.  The handle resolves once the module has
///   acknowledged, failed, or timed out.  Transport errors are reported
///   through the handle, never by panicking.
///
/// * `subscribe_events` – returns a live stream of [`StatusEvent`]s for the
///   module (heartbeats, faults).  The stream ends when the gateway drops the
///   module.
#[async_trait]
pub trait MessagingGateway: Send + Sync {
    /// Send `command` to `module_id`.
    async fn send_command(&self, module_id: &ModuleId, command: Command) -> CommandHandle;

    /// Stream of status events emitted by `module_id`.
    fn subscribe_events(&self, module_id: &ModuleId) -> BoxStream<'static, StatusEvent>;
}

/// Pending result of a module command.
#[derive(Debug)]
pub struct CommandHandle {
    receiver: oneshot::Receiver<CommandOutcome>,
}

impl CommandHandle {
    /// Create a handle and the sender the transport uses to resolve it.
    pub fn channel() -> (oneshot::Sender<CommandOutcome>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { receiver: rx })
    }

    /// A handle that is already resolved.
    pub fn resolved(outcome: CommandOutcome) -> Self {
        let (tx, handle) = Self::channel();
        // The receiver is alive in `handle`, so this cannot fail.
        let _ = tx.send(outcome);
        handle
    }

    /// Wait for the outcome.  A transport that drops the sender without
    /// answering is reported as a [`CommandOutcome::Failure`].
    pub async fn outcome(self) -> CommandOutcome {
        self.receiver
            .await
            .unwrap_or_else(|_| CommandOutcome::Failure("gateway dropped the command".to_string()))
    }

    /// Wait for the outcome for at most `limit`; elapsing yields
    /// [`CommandOutcome::Timeout`].
    pub async fn outcome_within(self, limit: Duration) -> CommandOutcome {
        match tokio::time::timeout(limit, self.outcome()).await {
            Ok(outcome) => outcome,
            Err(_) => CommandOutcome::Timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolved_handle_yields_outcome() {
        let handle = CommandHandle::resolved(CommandOutcome::Success);
        assert_eq!(handle.outcome().await, CommandOutcome::Success);
    }

    #[tokio::test]
    async fn dropped_sender_is_failure() {
        let (tx, handle) = CommandHandle::channel();
        drop(tx);
        assert!(matches!(handle.outcome().await, CommandOutcome::Failure(_)));
    }

    #[tokio::test]
    async fn outcome_within_times_out() {
        let (_tx, handle) = CommandHandle::channel();
        let outcome = handle.outcome_within(Duration::from_millis(20)).await;
        assert_eq!(outcome, CommandOutcome::Timeout);
    }

    #[tokio::test]
    async fn outcome_within_returns_late_answer_before_limit() {
        let (tx, handle) = CommandHandle::channel();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = tx.send(CommandOutcome::Failure("dome jammed".into()));
        });
        let outcome = handle.outcome_within(Duration::from_secs(2)).await;
        assert_eq!(outcome, CommandOutcome::Failure("dome jammed".into()));
    }
}
