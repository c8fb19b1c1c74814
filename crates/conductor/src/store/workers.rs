//! Worker CRUD, the idle/claim projections the allocator and command
//! surface need, and the atomic claim/release pair (§4.1, §4.4, §4.7).

use chrono::Utc;
use conductor_core::{TaskId, Worker, WorkerId, WorkerStatus, WorkerUpdate};
use std::str::FromStr;

use super::Store;
use crate::error::{Error, Result};

#[derive(sqlx::FromRow)]
struct WorkerRow {
    id: i64,
    status: String,
    current_domain: Option<String>,
    worktree_path: String,
    branch: Option<String>,
    session_name: Option<String>,
    window_name: Option<String>,
    current_task_id: Option<i64>,
    last_heartbeat: String,
    launched_at: String,
    tasks_completed: i64,
    claimed_by: Option<String>,
    claimed_at: Option<String>,
}

impl TryFrom<WorkerRow> for Worker {
    type Error = Error;

    fn try_from(row: WorkerRow) -> Result<Self> {
        Ok(Self {
            id: WorkerId::new(row.id),
            status: WorkerStatus::from_str(&row.status)
                .map_err(|_| Error::config(format!("bad status in db: {}", row.status)))?,
            current_domain: row.current_domain,
            worktree_path: row.worktree_path,
            branch: row.branch,
            session_name: row.session_name,
            window_name: row.window_name,
            current_task_id: row.current_task_id.map(TaskId::new),
            last_heartbeat: super::requests::parse_ts(&row.last_heartbeat)?,
            launched_at: super::requests::parse_ts(&row.launched_at)?,
            tasks_completed: u64::try_from(row.tasks_completed).unwrap_or(0),
            claimed_by: row.claimed_by,
            claimed_at: row.claimed_at.as_deref().map(super::requests::parse_ts).transpose()?,
        })
    }
}

impl Store {
    /// Register (upsert) a worker slot. Re-registering an existing slot
    /// leaves its runtime state untouched except `worktree_path`/`branch`.
    pub async fn workers_register(&self, worker: &Worker) -> Result<()> {
        sqlx::query(
            "INSERT INTO workers
                (id, status, worktree_path, last_heartbeat, launched_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                worktree_path = excluded.worktree_path",
        )
        .bind(worker.id.get())
        .bind(worker.status.to_string())
        .bind(&worker.worktree_path)
        .bind(worker.last_heartbeat.to_rfc3339())
        .bind(worker.launched_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn workers_get(&self, id: WorkerId) -> Result<Option<Worker>> {
        let row: Option<WorkerRow> = sqlx::query_as("SELECT * FROM workers WHERE id = ?")
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await?;
        row.map(Worker::try_from).transpose()
    }

    pub async fn workers_list(&self) -> Result<Vec<Worker>> {
        let rows: Vec<WorkerRow> = sqlx::query_as("SELECT * FROM workers ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Worker::try_from).collect()
    }

    /// `listIdle`: unclaimed idle workers, ascending id (stable allocation
    /// order, §4.4).
    pub async fn workers_list_idle(&self) -> Result<Vec<Worker>> {
        let rows: Vec<WorkerRow> = sqlx::query_as(
            "SELECT * FROM workers WHERE status = 'idle' AND claimed_by IS NULL ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Worker::try_from).collect()
    }

    pub async fn workers_update(&self, id: WorkerId, update: WorkerUpdate) -> Result<()> {
        let (task_touch, task_value): (bool, Option<i64>) = match update.current_task_id {
            Some(inner) => (true, inner.map(TaskId::get)),
            None => (false, None),
        };
        let (claim_touch, claim_value): (bool, Option<String>) = match update.claimed_by {
            Some(inner) => (true, inner),
            None => (false, None),
        };

        sqlx::query(
            "UPDATE workers SET
                status = COALESCE(?, status),
                current_domain = COALESCE(?, current_domain),
                branch = COALESCE(?, branch),
                session_name = COALESCE(?, session_name),
                window_name = COALESCE(?, window_name),
                current_task_id = CASE WHEN ? THEN ? ELSE current_task_id END,
                last_heartbeat = COALESCE(?, last_heartbeat),
                tasks_completed = COALESCE(?, tasks_completed),
                claimed_by = CASE WHEN ? THEN ? ELSE claimed_by END
             WHERE id = ?",
        )
        .bind(update.status.map(|s| s.to_string()))
        .bind(update.current_domain)
        .bind(update.branch)
        .bind(update.session_name)
        .bind(update.window_name)
        .bind(task_touch)
        .bind(task_value)
        .bind(update.last_heartbeat.map(|t| t.to_rfc3339()))
        .bind(update.tasks_completed.map(|n| i64::try_from(n).unwrap_or(i64::MAX)))
        .bind(claim_touch)
        .bind(claim_value)
        .bind(id.get())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Atomic "claim a free worker slot": only succeeds if the worker is
    /// currently idle and unclaimed (§4.7 exclusive tmux-window lease).
    pub async fn workers_claim(&self, id: WorkerId, claimant: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE workers SET claimed_by = ?, claimed_at = ?
             WHERE id = ? AND status = 'idle' AND claimed_by IS NULL",
        )
        .bind(claimant)
        .bind(Utc::now().to_rfc3339())
        .bind(id.get())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Release a claim. Only the holder may release (idempotent no-op
    /// otherwise).
    pub async fn workers_release(&self, id: WorkerId, claimant: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE workers SET claimed_by = NULL, claimed_at = NULL WHERE id = ? AND claimed_by = ?",
        )
        .bind(id.get())
        .bind(claimant)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Unconditionally release any claim held on `id`, regardless of holder.
    /// Used by the watchdog's stale-claim sweep (§4.5), where the holder's
    /// agent process may be long gone.
    pub async fn workers_release_stale(&self, id: WorkerId) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE workers SET claimed_by = NULL, claimed_at = NULL
             WHERE id = ? AND claimed_by IS NOT NULL",
        )
        .bind(id.get())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Reset a worker to `idle` with no current task and no claim, regardless
    /// of its prior status (§4.5 orphan task recovery / `completed_task`
    /// auto-reset).
    pub async fn workers_reset_idle(&self, id: WorkerId) -> Result<()> {
        sqlx::query(
            "UPDATE workers SET status = 'idle', current_task_id = NULL,
                claimed_by = NULL, claimed_at = NULL
             WHERE id = ?",
        )
        .bind(id.get())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Conditional death transition: only flips a worker to `idle` if it is
    /// still tracked as busy running the same task (§4.5 single-conditional
    /// UPDATE, avoids clobbering a worker that already self-recovered).
    pub async fn workers_mark_dead(&self, id: WorkerId, last_known_task: Option<TaskId>) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let result = match last_known_task {
            Some(task_id) => {
                sqlx::query(
                    "UPDATE workers SET status = 'idle', current_task_id = NULL,
                        claimed_by = NULL, last_heartbeat = ?
                     WHERE id = ? AND current_task_id = ?",
                )
                .bind(&now)
                .bind(id.get())
                .bind(task_id.get())
                .execute(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "UPDATE workers SET status = 'idle', current_task_id = NULL,
                        claimed_by = NULL, last_heartbeat = ?
                     WHERE id = ? AND current_task_id IS NULL",
                )
                .bind(&now)
                .bind(id.get())
                .execute(&self.pool)
                .await?
            }
        };
        Ok(result.rows_affected() == 1)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_get_update_round_trips() {
        let store = Store::open_in_memory().await.expect("open");
        let worker = Worker::new(WorkerId::new(1), "/tmp/wt-1");
        store.workers_register(&worker).await.expect("register");

        let fetched = store
            .workers_get(worker.id)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(fetched.status, WorkerStatus::Idle);
        assert!(fetched.is_assignable());

        store
            .workers_update(worker.id, WorkerUpdate::assign(TaskId::new(7), Some("backend".into())))
            .await
            .expect("assign");
        let after = store.workers_get(worker.id).await.expect("get").expect("present");
        assert_eq!(after.status, WorkerStatus::Assigned);
        assert_eq!(after.current_task_id, Some(TaskId::new(7)));
    }

    #[tokio::test]
    async fn claim_is_exclusive() {
        let store = Store::open_in_memory().await.expect("open");
        let worker = Worker::new(WorkerId::new(1), "/tmp/wt-1");
        store.workers_register(&worker).await.expect("register");

        assert!(store.workers_claim(worker.id, "human-a").await.expect("claim a"));
        assert!(!store.workers_claim(worker.id, "human-b").await.expect("claim b"));

        assert!(!store.workers_release(worker.id, "human-b").await.expect("release wrong"));
        assert!(store.workers_release(worker.id, "human-a").await.expect("release right"));
        assert!(store.workers_claim(worker.id, "human-b").await.expect("reclaim"));
    }

    #[tokio::test]
    async fn claim_records_timestamp_and_reset_clears_it() {
        let store = Store::open_in_memory().await.expect("open");
        let worker = Worker::new(WorkerId::new(1), "/tmp/wt-1");
        store.workers_register(&worker).await.expect("register");

        store.workers_claim(worker.id, "architect").await.expect("claim");
        let claimed = store.workers_get(worker.id).await.expect("get").expect("present");
        assert!(claimed.claimed_at.is_some());
        assert!(claimed.claim_is_stale(Utc::now() + chrono::Duration::seconds(121), 120));
        assert!(!claimed.claim_is_stale(Utc::now() + chrono::Duration::seconds(10), 120));

        assert!(store.workers_release_stale(worker.id).await.expect("release stale"));
        let released = store.workers_get(worker.id).await.expect("get").expect("present");
        assert!(released.claimed_by.is_none());
        assert!(released.claimed_at.is_none());
    }

    #[tokio::test]
    async fn reset_idle_clears_task_and_claim_from_any_status() {
        let store = Store::open_in_memory().await.expect("open");
        let worker = Worker::new(WorkerId::new(1), "/tmp/wt-1");
        store.workers_register(&worker).await.expect("register");
        store
            .workers_update(worker.id, WorkerUpdate::assign(TaskId::new(9), Some("backend".into())))
            .await
            .expect("assign");

        store.workers_reset_idle(worker.id).await.expect("reset");
        let after = store.workers_get(worker.id).await.expect("get").expect("present");
        assert_eq!(after.status, WorkerStatus::Idle);
        assert!(after.current_task_id.is_none());
        assert!(after.claimed_by.is_none());
    }

    #[tokio::test]
    async fn list_idle_excludes_claimed_and_busy() {
        let store = Store::open_in_memory().await.expect("open");
        let idle = Worker::new(WorkerId::new(1), "/tmp/wt-1");
        let claimed = Worker::new(WorkerId::new(2), "/tmp/wt-2");
        store.workers_register(&idle).await.expect("idle");
        store.workers_register(&claimed).await.expect("claimed");
        store.workers_claim(claimed.id, "someone").await.expect("claim");

        let list = store.workers_list_idle().await.expect("list");
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id, idle.id);
    }

    #[tokio::test]
    async fn mark_dead_only_if_task_matches() {
        let store = Store::open_in_memory().await.expect("open");
        let worker = Worker::new(WorkerId::new(1), "/tmp/wt-1");
        store.workers_register(&worker).await.expect("register");
        store
            .workers_update(worker.id, WorkerUpdate::assign(TaskId::new(5), None))
            .await
            .expect("assign");

        assert!(!store
            .workers_mark_dead(worker.id, Some(TaskId::new(999)))
            .await
            .expect("mismatched"));
        assert!(store
            .workers_mark_dead(worker.id, Some(TaskId::new(5)))
            .await
            .expect("matched"));

        let after = store.workers_get(worker.id).await.expect("get").expect("present");
        assert_eq!(after.status, WorkerStatus::Idle);
    }
}
