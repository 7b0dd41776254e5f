//! Transport-facing message types and the outbound notifier contract.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{OppTickError, Result};

/// An interactive choice attached to a message (an inline button, a quick
/// reply). `value` is what the transport sends back when it is chosen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub label: String,
    pub value: String,
}

impl Action {
    pub fn new(label: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            value: value.into(),
        }
    }

    pub fn done(id: Uuid) -> Self {
        Self::new("Mark done", format!("done:{id}"))
    }

    pub fn archive(id: Uuid) -> Self {
        Self::new("Archive", format!("archive:{id}"))
    }

    pub fn keep(id: Uuid) -> Self {
        Self::new("Keep", format!("keep:{id}"))
    }
}

/// A message received from the chat transport. Forwarded and typed text are
/// handled the same way; `is_forward` is kept for the record only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub owner_id: String,
    pub conversation_id: String,
    pub text: String,
    #[serde(default)]
    pub is_forward: bool,
    /// Opaque reference to the transport message, stored as `source_ref`.
    #[serde(default)]
    pub message_ref: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl InboundMessage {
    pub fn new(
        owner_id: impl Into<String>,
        conversation_id: impl Into<String>,
        text: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            owner_id: owner_id.into(),
            conversation_id: conversation_id.into(),
            text: text.into(),
            is_forward: false,
            message_ref: None,
            timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub owner_id: String,
    pub conversation_id: String,
    pub text: String,
    #[serde(default)]
    pub actions: Vec<Action>,
}

/// Delivers messages to users. Failures are reported as
/// [`OppTickError::Delivery`] and retried by the caller.
pub trait Notifier: Send + Sync {
    fn send(&self, message: &OutboundMessage) -> impl Future<Output = Result<()>> + Send;
}

/// Send through `notifier`, turning a send that outlasts `limit` into an
/// [`OppTickError::Delivery`]. Callers that hold an opportunity lock use
/// this so a stuck transport cannot hold the lock indefinitely.
pub async fn send_within<N: Notifier>(
    notifier: &N,
    message: &OutboundMessage,
    limit: Duration,
) -> Result<()> {
    match tokio::time::timeout(limit, notifier.send(message)).await {
        Ok(result) => result,
        Err(_) => Err(OppTickError::Delivery(format!(
            "delivery timed out after {}s",
            limit.as_secs()
        ))),
    }
}

/// Writes notifications to stdout and the log. Used by the CLI daemon.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    async fn send(&self, message: &OutboundMessage) -> Result<()> {
        tracing::info!(
            owner = %message.owner_id,
            conversation = %message.conversation_id,
            actions = message.actions.len(),
            "notification"
        );
        println!("[{}] {}", message.owner_id, message.text);
        for action in &message.actions {
            println!("    ({}) -> {}", action.label, action.value);
        }
        Ok(())
    }
}

/// In-process outbox: records every delivered message. Can be told to fail
/// or stall, for exercising retry and timeout paths.
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    sent: Vec<OutboundMessage>,
    fail_next: usize,
    always_fail: bool,
    rejecting: bool,
    delay: Option<Duration>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Messages delivered so far, oldest first.
    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.state().sent.clone()
    }

    pub fn take(&self) -> Vec<OutboundMessage> {
        std::mem::take(&mut self.state().sent)
    }

    /// Fail the next `n` sends.
    pub fn fail_next(&self, n: usize) {
        self.state().fail_next = n;
    }

    pub fn set_always_fail(&self, fail: bool) {
        self.state().always_fail = fail;
    }

    /// Refuse every message with a non-transient error, as a transport does
    /// for a recipient that no longer exists.
    pub fn set_rejecting(&self, rejecting: bool) {
        self.state().rejecting = rejecting;
    }

    /// Sleep this long before each delivery.
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.state().delay = delay;
    }
}

impl Notifier for MemoryNotifier {
    async fn send(&self, message: &OutboundMessage) -> Result<()> {
        let delay = self.state().delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state();
        if state.rejecting {
            return Err(OppTickError::InvalidInput("recipient rejected message".into()));
        }
        if state.always_fail {
            return Err(OppTickError::Delivery("transport unavailable".into()));
        }
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(OppTickError::Delivery("transport unavailable".into()));
        }
        state.sent.push(message.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(text: &str) -> OutboundMessage {
        OutboundMessage {
            owner_id: "alice".into(),
            conversation_id: "chat-1".into(),
            text: text.into(),
            actions: vec![],
        }
    }

    #[test]
    fn action_values_carry_id() {
        let id = Uuid::now_v7();
        assert_eq!(Action::done(id).value, format!("done:{id}"));
        assert_eq!(Action::archive(id).value, format!("archive:{id}"));
        assert_eq!(Action::keep(id).value, format!("keep:{id}"));
    }

    #[tokio::test]
    async fn memory_notifier_records_and_fails_on_demand() {
        let notifier = MemoryNotifier::new();
        notifier.fail_next(1);
        let err = notifier.send(&message("first")).await.unwrap_err();
        assert!(err.is_transient());

        notifier.send(&message("second")).await.unwrap();
        let sent = notifier.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].text, "second");
        assert!(notifier.sent().is_empty());
    }

    #[tokio::test]
    async fn rejected_message_is_not_transient() {
        let notifier = MemoryNotifier::new();
        notifier.set_rejecting(true);
        let err = notifier.send(&message("hello")).await.unwrap_err();
        assert!(!err.is_transient());
        assert!(notifier.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn send_within_bounds_a_stalled_send() {
        let notifier = MemoryNotifier::new();
        notifier.set_delay(Some(Duration::from_secs(3600)));
        let started = tokio::time::Instant::now();

        let err = send_within(&notifier, &message("late"), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, OppTickError::Delivery(_)));
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(notifier.sent().is_empty());
    }

    #[tokio::test]
    async fn log_notifier_never_fails() {
        LogNotifier.send(&message("hello")).await.unwrap();
    }
}
