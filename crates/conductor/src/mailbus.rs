//! The Mail bus: a thin, FIFO-per-recipient view over the `mail` table with
//! a blocking inbox operation (§4.2).
//!
//! Alongside interval polling, a `tokio::sync::Notify` is kept per recipient
//! so a same-process sender wakes a waiting reader immediately; cross-process
//! writers (a CLI hitting the same database directly) are still picked up by
//! the next poll tick. The notify is purely a wakeup hint — the actual
//! consume is the same atomic transaction the Store already performs, so a
//! spurious or missed notify never loses read-once semantics.

use conductor_core::{MailMessage, MailPayload};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

use crate::error::Result;
use crate::store::Store;

/// Default interval the blocking inbox polls at when no notify fires first.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Default deadline for `inbox-block` before returning an empty result.
pub const DEFAULT_BLOCK_DEADLINE: Duration = Duration::from_secs(5 * 60);

/// Per-recipient wakeup channel, shared by every mailbox handle cloned from
/// the same bus.
#[derive(Debug, Default)]
struct Waiters {
    by_recipient: Mutex<HashMap<String, Arc<Notify>>>,
}

impl Waiters {
    fn notify_for(&self, recipient: &str) -> Arc<Notify> {
        let mut guard = self.by_recipient.lock().unwrap_or_else(|e| e.into_inner());
        guard
            .entry(recipient.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    fn wake(&self, recipient: &str) {
        let guard = self.by_recipient.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(notify) = guard.get(recipient) {
            notify.notify_waiters();
        }
    }
}

/// Cheaply cloneable handle to the Mail bus, threaded through the command
/// surface, the allocator, the watchdog, and the merger.
#[derive(Clone)]
pub struct MailBus {
    store: Store,
    waiters: Arc<Waiters>,
}

impl MailBus {
    #[must_use]
    pub fn new(store: Store) -> Self {
        Self {
            store,
            waiters: Arc::new(Waiters::default()),
        }
    }

    /// Send mail and wake any blocked reader for `recipient`.
    pub async fn send(&self, recipient: &str, payload: &MailPayload) -> Result<()> {
        self.store.mail_send(recipient, payload).await?;
        self.waiters.wake(recipient);
        Ok(())
    }

    /// `inbox`: return and consume every currently-unread message for
    /// `recipient` without blocking.
    pub async fn drain(&self, recipient: &str) -> Result<Vec<MailMessage>> {
        let mut messages = Vec::new();
        while let Some(message) = self.store.mail_consume_one(recipient).await? {
            messages.push(message);
        }
        Ok(messages)
    }

    /// `inbox-block`: wait up to `deadline` for at least one message, then
    /// drain and return everything available. Returns an empty vector if the
    /// deadline elapses or `shutdown` fires first; neither path consumes
    /// anything that wasn't already read.
    pub async fn block_until_available(
        &self,
        recipient: &str,
        poll_interval: Duration,
        deadline: Duration,
        shutdown: &mut tokio::sync::watch::Receiver<bool>,
    ) -> Result<Vec<MailMessage>> {
        let notify = self.waiters.notify_for(recipient);
        let deadline_at = tokio::time::Instant::now() + deadline;

        loop {
            if self.store.mail_has_unread(recipient).await? {
                return self.drain(recipient).await;
            }
            if tokio::time::Instant::now() >= deadline_at {
                return Ok(Vec::new());
            }

            tokio::select! {
                () = notify.notified() => {}
                () = tokio::time::sleep(poll_interval) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Ok(Vec::new());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn drain_consumes_all_pending_messages() {
        let store = Store::open_in_memory().await.expect("open");
        let bus = MailBus::new(store);
        bus.send("worker-1", &MailPayload::Heartbeat).await.expect("send 1");
        bus.send("worker-1", &MailPayload::Heartbeat).await.expect("send 2");

        let drained = bus.drain("worker-1").await.expect("drain");
        assert_eq!(drained.len(), 2);
        assert!(bus.drain("worker-1").await.expect("drain again").is_empty());
    }

    #[tokio::test]
    async fn block_returns_immediately_when_mail_already_present() {
        let store = Store::open_in_memory().await.expect("open");
        let bus = MailBus::new(store);
        bus.send("architect", &MailPayload::Heartbeat).await.expect("send");

        let (_tx, mut rx) = tokio::sync::watch::channel(false);
        let messages = bus
            .block_until_available(
                "architect",
                Duration::from_millis(10),
                Duration::from_secs(1),
                &mut rx,
            )
            .await
            .expect("block");
        assert_eq!(messages.len(), 1);
    }

    #[tokio::test]
    async fn block_wakes_on_notify_before_deadline() {
        let store = Store::open_in_memory().await.expect("open");
        let bus = MailBus::new(store);
        let waiter_bus = bus.clone();

        let (_tx, mut rx) = tokio::sync::watch::channel(false);
        let waiter = tokio::spawn(async move {
            waiter_bus
                .block_until_available(
                    "worker-2",
                    Duration::from_secs(30),
                    Duration::from_secs(30),
                    &mut rx,
                )
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.send("worker-2", &MailPayload::Heartbeat).await.expect("send");

        let result = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("did not time out")
            .expect("join")
            .expect("block ok");
        assert_eq!(result.len(), 1);
    }

    #[tokio::test]
    async fn block_respects_shutdown_signal() {
        let store = Store::open_in_memory().await.expect("open");
        let bus = MailBus::new(store);
        let (tx, mut rx) = tokio::sync::watch::channel(false);

        let waiter = tokio::spawn(async move {
            bus.block_until_available(
                "worker-3",
                Duration::from_secs(30),
                Duration::from_secs(30),
                &mut rx,
            )
            .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).expect("signal shutdown");

        let result = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("did not time out")
            .expect("join")
            .expect("block ok");
        assert!(result.is_empty());
    }
}
