//! Merge queue CRUD plus `getNext`, the single-entry-at-a-time dequeue the
//! merger relies on for its one-in-flight guarantee (§4.6).

use chrono::Utc;
use conductor_core::{
    MergeQueueEntry, MergeQueueEntryId, MergeQueueStatus, MergeQueueUpdate, RequestId, TaskId,
};
use std::str::FromStr;

use super::Store;
use crate::error::{Error, Result};

#[derive(sqlx::FromRow)]
struct MergeQueueRow {
    id: i64,
    request_id: String,
    task_id: i64,
    pr_url: String,
    branch: String,
    status: String,
    priority: i64,
    created_at: String,
    merged_at: Option<String>,
    error: Option<String>,
}

impl TryFrom<MergeQueueRow> for MergeQueueEntry {
    type Error = Error;

    fn try_from(row: MergeQueueRow) -> Result<Self> {
        Ok(Self {
            id: MergeQueueEntryId::new(row.id),
            request_id: RequestId::parse(row.request_id)?,
            task_id: TaskId::new(row.task_id),
            pr_url: row.pr_url,
            branch: row.branch,
            status: MergeQueueStatus::from_str(&row.status)
                .map_err(|_| Error::config(format!("bad status in db: {}", row.status)))?,
            priority: row.priority,
            created_at: super::requests::parse_ts(&row.created_at)?,
            merged_at: row.merged_at.as_deref().map(super::requests::parse_ts).transpose()?,
            error: row.error,
        })
    }
}

impl Store {
    pub async fn merge_queue_enqueue(
        &self,
        request_id: &RequestId,
        task_id: TaskId,
        pr_url: &str,
        branch: &str,
        priority: i64,
    ) -> Result<MergeQueueEntryId> {
        let now = Utc::now().to_rfc3339();
        let id = sqlx::query(
            "INSERT INTO merge_queue
                (request_id, task_id, pr_url, branch, status, priority, created_at)
             VALUES (?, ?, ?, ?, 'pending', ?, ?)",
        )
        .bind(request_id.as_str())
        .bind(task_id.get())
        .bind(pr_url)
        .bind(branch)
        .bind(priority)
        .bind(now)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();
        Ok(MergeQueueEntryId::new(id))
    }

    pub async fn merge_queue_get(&self, id: MergeQueueEntryId) -> Result<Option<MergeQueueEntry>> {
        let row: Option<MergeQueueRow> = sqlx::query_as("SELECT * FROM merge_queue WHERE id = ?")
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await?;
        row.map(MergeQueueEntry::try_from).transpose()
    }

    /// `getNext`: the highest-priority, oldest `pending`/`ready` entry not
    /// currently `merging`. The merger holds a single in-flight guard on top
    /// of this, so there is at most one caller at a time in practice, but the
    /// ordering alone already gives deterministic FIFO-within-priority.
    pub async fn merge_queue_get_next(&self) -> Result<Option<MergeQueueEntry>> {
        let row: Option<MergeQueueRow> = sqlx::query_as(
            "SELECT * FROM merge_queue WHERE status IN ('pending', 'ready')
             ORDER BY priority DESC, id ASC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        row.map(MergeQueueEntry::try_from).transpose()
    }

    pub async fn merge_queue_update(
        &self,
        id: MergeQueueEntryId,
        update: MergeQueueUpdate,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE merge_queue SET
                status = COALESCE(?, status),
                merged_at = COALESCE(?, merged_at),
                error = COALESCE(?, error)
             WHERE id = ?",
        )
        .bind(update.status.map(|s| s.to_string()))
        .bind(update.merged_at.map(|t| t.to_rfc3339()))
        .bind(update.error)
        .bind(id.get())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Mark an entry `merging` iff it is still `pending`/`ready`; returns
    /// `false` if another caller already claimed it (single in-flight guard
    /// backstop, §4.6).
    pub async fn merge_queue_try_start(&self, id: MergeQueueEntryId) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE merge_queue SET status = 'merging'
             WHERE id = ? AND status IN ('pending', 'ready')",
        )
        .bind(id.get())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// All merge queue entries belonging to a request, oldest first. Used by
    /// request-completion checks to decide whether every PR has landed.
    pub async fn merge_queue_list_by_request(&self, request_id: &RequestId) -> Result<Vec<MergeQueueEntry>> {
        let rows: Vec<MergeQueueRow> =
            sqlx::query_as("SELECT * FROM merge_queue WHERE request_id = ? ORDER BY id ASC")
                .bind(request_id.as_str())
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(MergeQueueEntry::try_from).collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    async fn seed(store: &Store) -> RequestId {
        let r = conductor_core::Request::new("parent");
        store.requests_create(&r).await.expect("create request");
        r.id
    }

    #[tokio::test]
    async fn get_next_orders_by_priority_then_id() {
        let store = Store::open_in_memory().await.expect("open");
        let request_id = seed(&store).await;
        store
            .merge_queue_enqueue(&request_id, TaskId::new(1), "https://example.com/pr/1", "b1", 50)
            .await
            .expect("low");
        store
            .merge_queue_enqueue(&request_id, TaskId::new(2), "https://example.com/pr/2", "b2", 100)
            .await
            .expect("urgent");

        let next = store.merge_queue_get_next().await.expect("next").expect("present");
        assert_eq!(next.priority, 100);
    }

    #[tokio::test]
    async fn try_start_is_exclusive() {
        let store = Store::open_in_memory().await.expect("open");
        let request_id = seed(&store).await;
        let id = store
            .merge_queue_enqueue(&request_id, TaskId::new(1), "https://example.com/pr/1", "b1", 50)
            .await
            .expect("enqueue");

        assert!(store.merge_queue_try_start(id).await.expect("first"));
        assert!(!store.merge_queue_try_start(id).await.expect("second"));
    }
}
