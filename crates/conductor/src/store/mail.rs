//! Mail CRUD: durable, recipient-addressed, read-once messages (§4.2).
//!
//! The atomic consume-and-mark operation is what gives `inbox`/`inbox-block`
//! their read-once guarantee — two concurrent readers for the same recipient
//! never see the same row twice.

use chrono::{DateTime, Utc};
use conductor_core::{MailId, MailMessage, MailPayload, MailType};
use std::str::FromStr;

use super::Store;
use crate::error::{Error, Result};

#[derive(sqlx::FromRow)]
struct MailRow {
    id: i64,
    recipient: String,
    mail_type: String,
    payload: String,
    consumed: i64,
    created_at: String,
}

impl TryFrom<MailRow> for MailMessage {
    type Error = Error;

    fn try_from(row: MailRow) -> Result<Self> {
        Ok(Self {
            id: MailId::new(row.id),
            recipient: row.recipient,
            mail_type: MailType::from_str(&row.mail_type)
                .map_err(|_| Error::config(format!("bad mail_type in db: {}", row.mail_type)))?,
            payload: serde_json::from_str(&row.payload)?,
            consumed: row.consumed != 0,
            created_at: super::requests::parse_ts(&row.created_at)?,
        })
    }
}

impl Store {
    /// Send mail to `recipient`. Returns the assigned id.
    pub async fn mail_send(&self, recipient: &str, payload: &MailPayload) -> Result<MailId> {
        let now = Utc::now();
        let id = sqlx::query(
            "INSERT INTO mail (recipient, mail_type, payload, consumed, created_at)
             VALUES (?, ?, ?, 0, ?)",
        )
        .bind(recipient)
        .bind(payload.mail_type().to_string())
        .bind(serde_json::to_string(payload)?)
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?
        .last_insert_rowid();
        Ok(MailId::new(id))
    }

    /// Peek at a recipient's unconsumed mail without marking it read, oldest
    /// first (FIFO, §4.2).
    pub async fn mail_peek(&self, recipient: &str, limit: i64) -> Result<Vec<MailMessage>> {
        let rows: Vec<MailRow> = sqlx::query_as(
            "SELECT * FROM mail WHERE recipient = ? AND consumed = 0 ORDER BY id ASC LIMIT ?",
        )
        .bind(recipient)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(MailMessage::try_from).collect()
    }

    /// Atomically fetch and mark-consumed the oldest unread message for
    /// `recipient`, if any. A cancelled caller (e.g. client disconnect
    /// mid-poll) never loses mail: the row is only marked once this
    /// transaction commits.
    pub async fn mail_consume_one(&self, recipient: &str) -> Result<Option<MailMessage>> {
        let mut tx = self.pool.begin().await?;

        let row: Option<MailRow> = sqlx::query_as(
            "SELECT * FROM mail WHERE recipient = ? AND consumed = 0 ORDER BY id ASC LIMIT 1",
        )
        .bind(recipient)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };

        sqlx::query("UPDATE mail SET consumed = 1 WHERE id = ? AND consumed = 0")
            .bind(row.id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        MailMessage::try_from(row).map(Some)
    }

    /// `true` if `recipient` has at least one unread message. Used by the
    /// Notify-vs-poll race in the mail bus to avoid a wasted round trip.
    pub async fn mail_has_unread(&self, recipient: &str) -> Result<bool> {
        let row: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM mail WHERE recipient = ? AND consumed = 0")
                .bind(recipient)
                .fetch_one(&self.pool)
                .await?;
        Ok(row.0 > 0)
    }

    /// Purge consumed mail older than `older_than`, returning the number of
    /// rows removed (§4.5 hourly watchdog sweep).
    pub async fn mail_purge_older_than(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM mail WHERE consumed = 1 AND created_at < ?")
            .bind(older_than.to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn consume_one_is_read_once() {
        let store = Store::open_in_memory().await.expect("open");
        store
            .mail_send("worker-1", &MailPayload::Heartbeat)
            .await
            .expect("send");

        let first = store.mail_consume_one("worker-1").await.expect("consume");
        assert!(first.is_some());
        let second = store.mail_consume_one("worker-1").await.expect("consume again");
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn fifo_order_per_recipient() {
        let store = Store::open_in_memory().await.expect("open");
        store
            .mail_send("architect", &MailPayload::RequestAcknowledged {
                request_id: conductor_core::RequestId::parse("req-a").unwrap(),
            })
            .await
            .expect("send a");
        store
            .mail_send("architect", &MailPayload::RequestAcknowledged {
                request_id: conductor_core::RequestId::parse("req-b").unwrap(),
            })
            .await
            .expect("send b");

        let first = store.mail_consume_one("architect").await.expect("consume").expect("present");
        match first.payload {
            MailPayload::RequestAcknowledged { request_id } => {
                assert_eq!(request_id.as_str(), "req-a");
            }
            _ => panic!("unexpected payload"),
        }
    }

    #[tokio::test]
    async fn purge_only_removes_consumed_and_old() {
        let store = Store::open_in_memory().await.expect("open");
        store
            .mail_send("worker-1", &MailPayload::Heartbeat)
            .await
            .expect("send");
        store.mail_consume_one("worker-1").await.expect("consume");

        let removed = store
            .mail_purge_older_than(Utc::now() + Duration::seconds(1))
            .await
            .expect("purge");
        assert_eq!(removed, 1);
    }
}
