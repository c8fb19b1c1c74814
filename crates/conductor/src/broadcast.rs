//! Broadcast hook: fan-out to any external subscriber (e.g. a dashboard),
//! invoked after every Store-mutating command commits (§4.8). The dashboard
//! itself is out of scope for this crate.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Default bounded backlog. Slow or absent subscribers drop the oldest
/// event rather than back-pressuring the kernel.
pub const DEFAULT_BACKLOG: usize = 1024;

/// A notable state change, published after commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastEvent {
    pub kind: String,
    pub detail: serde_json::Value,
    pub at: DateTime<Utc>,
}

impl BroadcastEvent {
    #[must_use]
    pub fn new(kind: impl Into<String>, detail: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            detail,
            at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait BroadcastHook: Send + Sync {
    fn publish(&self, event: BroadcastEvent);
}

/// `tokio::sync::broadcast`-backed implementation. Cloning shares the same
/// underlying channel.
#[derive(Clone)]
pub struct ChannelBroadcast {
    sender: broadcast::Sender<BroadcastEvent>,
}

impl ChannelBroadcast {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity);
        Self { sender }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<BroadcastEvent> {
        self.sender.subscribe()
    }
}

impl Default for ChannelBroadcast {
    fn default() -> Self {
        Self::new(DEFAULT_BACKLOG)
    }
}

#[async_trait]
impl BroadcastHook for ChannelBroadcast {
    fn publish(&self, event: BroadcastEvent) {
        // No subscribers is not an error: the dashboard may not be attached.
        let _ = self.sender.send(event);
    }
}

/// No-op used when no subscriber is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullBroadcast;

#[async_trait]
impl BroadcastHook for NullBroadcast {
    fn publish(&self, _event: BroadcastEvent) {}
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let hook = ChannelBroadcast::new(8);
        let mut rx = hook.subscribe();

        hook.publish(BroadcastEvent::new("task_assigned", json!({"task_id": 1})));

        let received = rx.recv().await.expect("recv");
        assert_eq!(received.kind, "task_assigned");
    }

    #[tokio::test]
    async fn publish_without_subscribers_does_not_error() {
        let hook = ChannelBroadcast::new(8);
        hook.publish(BroadcastEvent::new("ping", json!(null)));
    }

    #[tokio::test]
    async fn null_broadcast_is_inert() {
        let hook = NullBroadcast;
        hook.publish(BroadcastEvent::new("ping", json!(null)));
    }
}
