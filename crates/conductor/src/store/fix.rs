//! The atomic `fix` command: one transaction creating both the request and
//! its single urgent task (§4.3, §8 round-trip property).

use chrono::Utc;
use conductor_core::{Request, RequestTier, Task, TaskId};

use super::Store;
use crate::error::{Error, Result};

impl Store {
    /// Insert a tier-2, already-`decomposed` request and a single `ready`
    /// task with no dependencies in one write transaction.
    pub async fn fix_create(
        &self,
        description: &str,
        domain: Option<String>,
        files: Option<Vec<String>>,
    ) -> Result<(Request, Task)> {
        let mut tx = self.pool.begin().await?;
        let request = Request::new_fix(description);

        sqlx::query(
            "INSERT INTO requests (id, description, tier, status, created_at, updated_at, completed_at, result_summary)
             VALUES (?, ?, ?, ?, ?, ?, NULL, NULL)",
        )
        .bind(request.id.as_str())
        .bind(&request.description)
        .bind(request.tier.map(RequestTier::as_i64))
        .bind(request.status.to_string())
        .bind(request.created_at.to_rfc3339())
        .bind(request.updated_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        let files_json = files.as_ref().map(serde_json::to_string).transpose()?;
        let now = Utc::now().to_rfc3339();
        let task_id = sqlx::query(
            "INSERT INTO tasks
                (request_id, subject, description, domain, files, priority, tier,
                 depends_on, status, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, 'urgent', 2, '[]', 'ready', ?, ?)",
        )
        .bind(request.id.as_str())
        .bind(description)
        .bind(description)
        .bind(&domain)
        .bind(files_json)
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        tx.commit().await?;

        let task = self
            .tasks_get(TaskId::new(task_id))
            .await?
            .ok_or_else(|| Error::config("fix task vanished immediately after insert"))?;
        Ok((request, task))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use conductor_core::{RequestStatus, TaskPriority, TaskStatus};

    #[tokio::test]
    async fn fix_creates_decomposed_request_and_ready_urgent_task() {
        let store = Store::open_in_memory().await.expect("open");
        let (request, task) = store
            .fix_create("urgent hotfix", Some("backend".to_string()), None)
            .await
            .expect("fix_create");

        assert_eq!(request.tier, Some(RequestTier::Tier2));
        assert_eq!(request.status, RequestStatus::Decomposed);
        assert_eq!(task.status, TaskStatus::Ready);
        assert_eq!(task.priority, TaskPriority::Urgent);
        assert_eq!(task.request_id, request.id);
        assert!(task.depends_on.is_empty());
    }
}
