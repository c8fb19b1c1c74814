//! Task CRUD plus the dependency-promotion and ready-task projections
//! central to the allocator (§4.1, §4.4).

use chrono::Utc;
use conductor_core::{
    NewTask, RequestId, Task, TaskFilter, TaskId, TaskPriority, TaskStatus, TaskUpdate,
    ValidationDescriptor, WorkerId,
};
use std::str::FromStr;

use super::Store;
use crate::error::{Error, Result};

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: i64,
    request_id: String,
    subject: String,
    description: String,
    domain: Option<String>,
    files: Option<String>,
    priority: String,
    tier: i64,
    depends_on: String,
    assigned_to: Option<i64>,
    status: String,
    pr_url: Option<String>,
    branch: Option<String>,
    validation: Option<String>,
    created_at: String,
    updated_at: String,
    result_summary: Option<String>,
}

impl TryFrom<TaskRow> for Task {
    type Error = Error;

    fn try_from(row: TaskRow) -> Result<Self> {
        let depends_on: Vec<i64> = serde_json::from_str(&row.depends_on)?;
        Ok(Self {
            id: TaskId::new(row.id),
            request_id: RequestId::parse(row.request_id)?,
            subject: row.subject,
            description: row.description,
            domain: row.domain,
            files: row
                .files
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            priority: TaskPriority::from_str(&row.priority)
                .map_err(|_| Error::config(format!("bad priority in db: {}", row.priority)))?,
            tier: u8::try_from(row.tier).unwrap_or(3),
            depends_on: depends_on.into_iter().map(TaskId::new).collect(),
            assigned_to: row.assigned_to.map(WorkerId::new),
            status: TaskStatus::from_str(&row.status)
                .map_err(|_| Error::config(format!("bad status in db: {}", row.status)))?,
            pr_url: row.pr_url,
            branch: row.branch,
            validation: row
                .validation
                .as_deref()
                .map(serde_json::from_str::<ValidationDescriptor>)
                .transpose()?,
            created_at: super::requests::parse_ts(&row.created_at)?,
            updated_at: super::requests::parse_ts(&row.updated_at)?,
            result_summary: row.result_summary,
        })
    }
}

impl Store {
    /// Insert a task in `pending`, then immediately attempt promotion so a
    /// dependency-free task reaches `ready` in the same logical step
    /// (§8 round-trip property).
    pub async fn tasks_create(&self, new: NewTask) -> Result<Task> {
        let now = Utc::now();
        let depends_on: Vec<i64> = new.depends_on.iter().map(|id| id.get()).collect();
        let files_json = new
            .files
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let validation_json = new
            .validation
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let id = sqlx::query(
            "INSERT INTO tasks
                (request_id, subject, description, domain, files, priority, tier,
                 depends_on, status, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'pending', ?, ?)",
        )
        .bind(new.request_id.as_str())
        .bind(&new.subject)
        .bind(&new.description)
        .bind(&new.domain)
        .bind(files_json)
        .bind(new.priority.to_string())
        .bind(i64::from(new.tier))
        .bind(serde_json::to_string(&depends_on)?)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        let task_id = TaskId::new(id);
        self.tasks_try_promote_one(task_id).await?;

        self.tasks_get(task_id)
            .await?
            .ok_or_else(|| Error::config("task vanished immediately after insert"))
            .map_err(|_| Error::config("task vanished immediately after insert"))
    }

    pub async fn tasks_get(&self, id: TaskId) -> Result<Option<Task>> {
        let row: Option<TaskRow> = sqlx::query_as("SELECT * FROM tasks WHERE id = ?")
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await?;
        row.map(Task::try_from).transpose()
    }

    /// Typed updater over the column whitelist (§9).
    pub async fn tasks_update(&self, id: TaskId, update: TaskUpdate) -> Result<()> {
        let now = Utc::now();
        // assigned_to needs tri-state handling: None = leave alone, Some(None) = clear.
        let (assign_touch, assign_value): (bool, Option<i64>) = match update.assigned_to {
            Some(inner) => (true, inner.map(WorkerId::get)),
            None => (false, None),
        };

        sqlx::query(
            "UPDATE tasks SET
                status = COALESCE(?, status),
                assigned_to = CASE WHEN ? THEN ? ELSE assigned_to END,
                pr_url = COALESCE(?, pr_url),
                branch = COALESCE(?, branch),
                result_summary = COALESCE(?, result_summary),
                updated_at = ?
             WHERE id = ?",
        )
        .bind(update.status.map(|s| s.to_string()))
        .bind(assign_touch)
        .bind(assign_value)
        .bind(update.pr_url)
        .bind(update.branch)
        .bind(update.result_summary)
        .bind(now.to_rfc3339())
        .bind(id.get())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn tasks_list(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let mut sql = String::from("SELECT * FROM tasks WHERE 1=1");
        if filter.status.is_some() {
            sql.push_str(" AND status = ?");
        }
        if filter.request_id.is_some() {
            sql.push_str(" AND request_id = ?");
        }
        if filter.assignee.is_some() {
            sql.push_str(" AND assigned_to = ?");
        }
        sql.push_str(" ORDER BY id ASC");

        let mut query = sqlx::query_as::<_, TaskRow>(&sql);
        if let Some(s) = filter.status {
            query = query.bind(s.to_string());
        }
        if let Some(r) = &filter.request_id {
            query = query.bind(r.as_str().to_string());
        }
        if let Some(w) = filter.assignee {
            query = query.bind(w.get());
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.into_iter().map(Task::try_from).collect()
    }

    /// `getReady`: tasks with `status=ready AND assigned_to IS NULL`, ordered
    /// by priority (urgent > high > normal > low) then id (§4.1, §8).
    pub async fn tasks_get_ready(&self) -> Result<Vec<Task>> {
        let rows: Vec<TaskRow> = sqlx::query_as(
            "SELECT * FROM tasks WHERE status = 'ready' AND assigned_to IS NULL
             ORDER BY CASE priority
                WHEN 'urgent' THEN 0 WHEN 'high' THEN 1 WHEN 'normal' THEN 2 ELSE 3 END,
                id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Task::try_from).collect()
    }

    /// Scan `pending` tasks and promote any whose dependencies are all
    /// `completed`. Never moves a task backward (§4.1, §3 invariant).
    pub async fn tasks_check_and_promote(&self) -> Result<u64> {
        let pending: Vec<TaskRow> = sqlx::query_as("SELECT * FROM tasks WHERE status = 'pending'")
            .fetch_all(&self.pool)
            .await?;

        let mut promoted = 0u64;
        for row in pending {
            let id = TaskId::new(row.id);
            if self.dependencies_all_completed(&row.depends_on).await? {
                self.tasks_update(id, TaskUpdate::status(TaskStatus::Ready))
                    .await?;
                promoted += 1;
            }
        }
        Ok(promoted)
    }

    async fn tasks_try_promote_one(&self, id: TaskId) -> Result<()> {
        let Some(task) = self.tasks_get(id).await? else {
            return Ok(());
        };
        if task.status != TaskStatus::Pending {
            return Ok(());
        }
        if task.depends_on.is_empty() {
            self.tasks_update(id, TaskUpdate::status(TaskStatus::Ready))
                .await?;
            return Ok(());
        }
        let depends_on_json = serde_json::to_string(
            &task.depends_on.iter().map(|d| d.get()).collect::<Vec<_>>(),
        )?;
        if self.dependencies_all_completed(&depends_on_json).await? {
            self.tasks_update(id, TaskUpdate::status(TaskStatus::Ready))
                .await?;
        }
        Ok(())
    }

    async fn dependencies_all_completed(&self, depends_on_json: &str) -> Result<bool> {
        let ids: Vec<i64> = serde_json::from_str(depends_on_json)?;
        if ids.is_empty() {
            return Ok(true);
        }
        for dep_id in ids {
            let status: Option<(String,)> =
                sqlx::query_as("SELECT status FROM tasks WHERE id = ?")
                    .bind(dep_id)
                    .fetch_optional(&self.pool)
                    .await?;
            match status {
                Some((s,)) if s == "completed" => {}
                _ => return Ok(false),
            }
        }
        Ok(true)
    }

    /// Atomic assignment: re-reads task and worker inside the transaction and
    /// only commits if the task is still `ready`/unassigned and the worker is
    /// still idle (§4.4's TOCTOU guard).
    pub async fn tasks_assign_atomic(
        &self,
        task_id: TaskId,
        worker_id: WorkerId,
    ) -> Result<std::result::Result<(), &'static str>> {
        let mut tx = self.pool.begin().await?;

        let task_status: Option<(String, Option<i64>)> =
            sqlx::query_as("SELECT status, assigned_to FROM tasks WHERE id = ?")
                .bind(task_id.get())
                .fetch_optional(&mut *tx)
                .await?;
        let Some((status, assignee)) = task_status else {
            tx.rollback().await?;
            return Ok(Err("task_not_found"));
        };
        if status != "ready" || assignee.is_some() {
            tx.rollback().await?;
            return Ok(Err("task_not_ready"));
        }

        let worker_status: Option<(String,)> =
            sqlx::query_as("SELECT status FROM workers WHERE id = ?")
                .bind(worker_id.get())
                .fetch_optional(&mut *tx)
                .await?;
        match worker_status {
            Some((s,)) if s == "idle" => {}
            Some(_) => {
                tx.rollback().await?;
                return Ok(Err("worker_not_idle"));
            }
            None => {
                tx.rollback().await?;
                return Ok(Err("worker_not_found"));
            }
        }

        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "UPDATE tasks SET status = 'assigned', assigned_to = ?, updated_at = ? WHERE id = ?",
        )
        .bind(worker_id.get())
        .bind(&now)
        .bind(task_id.get())
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE workers SET status = 'assigned', current_task_id = ?, claimed_by = NULL
             WHERE id = ?",
        )
        .bind(task_id.get())
        .bind(worker_id.get())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Ok(()))
    }

    /// Single conditional requeue used by watchdog death handling and orphan
    /// recovery: only fires if the task hasn't already reached a terminal
    /// status via a race with `complete-task`/`fail-task` (§4.5, §5).
    pub async fn tasks_requeue_if_active(&self, id: TaskId) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "UPDATE tasks SET status = 'ready', assigned_to = NULL, updated_at = ?
             WHERE id = ? AND status NOT IN ('completed', 'failed')",
        )
        .bind(now)
        .bind(id.get())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use conductor_core::Request;

    async fn seed_request(store: &Store) -> RequestId {
        let r = Request::new("parent");
        store.requests_create(&r).await.expect("create request");
        r.id
    }

    fn new_task(request_id: RequestId, depends_on: Vec<TaskId>) -> NewTask {
        NewTask {
            request_id,
            subject: "do thing".to_string(),
            description: "do the thing".to_string(),
            domain: Some("backend".to_string()),
            files: None,
            priority: TaskPriority::Normal,
            tier: 3,
            depends_on,
            validation: None,
        }
    }

    #[tokio::test]
    async fn dependency_free_task_auto_promotes() {
        let store = Store::open_in_memory().await.expect("open");
        let request_id = seed_request(&store).await;
        let task = store
            .tasks_create(new_task(request_id, vec![]))
            .await
            .expect("create task");
        assert_eq!(task.status, TaskStatus::Ready);
    }

    #[tokio::test]
    async fn dependent_task_stays_pending_until_dependency_completes() {
        let store = Store::open_in_memory().await.expect("open");
        let request_id = seed_request(&store).await;
        let t1 = store
            .tasks_create(new_task(request_id.clone(), vec![]))
            .await
            .expect("t1");
        let t2 = store
            .tasks_create(new_task(request_id, vec![t1.id]))
            .await
            .expect("t2");
        assert_eq!(t2.status, TaskStatus::Pending);

        store
            .tasks_update(t1.id, TaskUpdate::complete("https://github.com/a/b/pull/1", "b1"))
            .await
            .expect("complete t1");
        let promoted = store.tasks_check_and_promote().await.expect("promote");
        assert_eq!(promoted, 1);

        let t2_after = store.tasks_get(t2.id).await.expect("get").expect("present");
        assert_eq!(t2_after.status, TaskStatus::Ready);
    }

    #[tokio::test]
    async fn completing_a_task_clears_its_assignee() {
        let store = Store::open_in_memory().await.expect("open");
        let request_id = seed_request(&store).await;
        let task = store
            .tasks_create(new_task(request_id, vec![]))
            .await
            .expect("create task");

        sqlx::query(
            "INSERT INTO workers (id, status, worktree_path, last_heartbeat, launched_at)
             VALUES (1, 'idle', '/tmp/wt-1', ?, ?)",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .execute(store.pool())
        .await
        .expect("seed worker");

        store
            .tasks_assign_atomic(task.id, WorkerId::new(1))
            .await
            .expect("assign")
            .expect("won race");
        let assigned = store.tasks_get(task.id).await.expect("get").expect("present");
        assert_eq!(assigned.assigned_to, Some(WorkerId::new(1)));

        store
            .tasks_update(task.id, TaskUpdate::complete("https://github.com/a/b/pull/1", "b1"))
            .await
            .expect("complete");
        let completed = store.tasks_get(task.id).await.expect("get").expect("present");
        assert_eq!(completed.status, TaskStatus::Completed);
        assert!(completed.assigned_to.is_none());
    }

    #[tokio::test]
    async fn failing_a_task_clears_its_assignee() {
        let store = Store::open_in_memory().await.expect("open");
        let request_id = seed_request(&store).await;
        let task = store
            .tasks_create(new_task(request_id, vec![]))
            .await
            .expect("create task");

        sqlx::query(
            "INSERT INTO workers (id, status, worktree_path, last_heartbeat, launched_at)
             VALUES (1, 'idle', '/tmp/wt-1', ?, ?)",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .execute(store.pool())
        .await
        .expect("seed worker");

        store
            .tasks_assign_atomic(task.id, WorkerId::new(1))
            .await
            .expect("assign")
            .expect("won race");

        store
            .tasks_update(task.id, TaskUpdate::fail("could not complete"))
            .await
            .expect("fail");
        let failed = store.tasks_get(task.id).await.expect("get").expect("present");
        assert_eq!(failed.status, TaskStatus::Failed);
        assert!(failed.assigned_to.is_none());
    }

    #[tokio::test]
    async fn ready_tasks_ordered_by_priority_then_id() {
        let store = Store::open_in_memory().await.expect("open");
        let request_id = seed_request(&store).await;
        let mut low = new_task(request_id.clone(), vec![]);
        low.priority = TaskPriority::Low;
        let mut urgent = new_task(request_id, vec![]);
        urgent.priority = TaskPriority::Urgent;

        store.tasks_create(low).await.expect("low");
        store.tasks_create(urgent).await.expect("urgent");

        let ready = store.tasks_get_ready().await.expect("ready");
        assert_eq!(ready.len(), 2);
        assert_eq!(ready[0].priority, TaskPriority::Urgent);
    }

    #[tokio::test]
    async fn concurrent_assignment_only_one_wins() {
        let store = Store::open_in_memory().await.expect("open");
        let request_id = seed_request(&store).await;
        let task = store
            .tasks_create(new_task(request_id, vec![]))
            .await
            .expect("task");

        sqlx::query(
            "INSERT INTO workers (id, status, worktree_path, last_heartbeat, launched_at)
             VALUES (1, 'idle', '/tmp/wt-1', ?, ?), (2, 'idle', '/tmp/wt-2', ?, ?)",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .execute(store.pool())
        .await
        .expect("seed workers");

        let first = store
            .tasks_assign_atomic(task.id, WorkerId::new(1))
            .await
            .expect("first assign");
        let second = store
            .tasks_assign_atomic(task.id, WorkerId::new(2))
            .await
            .expect("second assign");

        assert!(first.is_ok());
        assert_eq!(second, Err("task_not_ready"));
    }
}
