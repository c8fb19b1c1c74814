//! Activity log append/query, and the age-bound purge resolving the
//! retention Open Question (see DESIGN.md).

use chrono::{DateTime, Utc};
use conductor_core::{ActivityFilter, ActivityLogEntry, ActivityLogId, NewActivityLogEntry};

use super::Store;
use crate::error::{Error, Result};

#[derive(sqlx::FromRow)]
struct ActivityRow {
    id: i64,
    actor: String,
    action: String,
    details: String,
    created_at: String,
}

impl TryFrom<ActivityRow> for ActivityLogEntry {
    type Error = Error;

    fn try_from(row: ActivityRow) -> Result<Self> {
        Ok(Self {
            id: ActivityLogId::new(row.id),
            actor: row.actor,
            action: row.action,
            details: serde_json::from_str(&row.details)?,
            created_at: super::requests::parse_ts(&row.created_at)?,
        })
    }
}

impl Store {
    pub async fn activity_append(&self, entry: NewActivityLogEntry) -> Result<ActivityLogId> {
        let now = Utc::now().to_rfc3339();
        let id = sqlx::query(
            "INSERT INTO activity_log (actor, action, details, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&entry.actor)
        .bind(&entry.action)
        .bind(serde_json::to_string(&entry.details)?)
        .bind(now)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();
        Ok(ActivityLogId::new(id))
    }

    pub async fn activity_query(&self, filter: &ActivityFilter) -> Result<Vec<ActivityLogEntry>> {
        let mut sql = String::from("SELECT * FROM activity_log WHERE 1=1");
        if filter.actor.is_some() {
            sql.push_str(" AND actor = ?");
        }
        sql.push_str(" ORDER BY id DESC");
        if filter.limit.is_some() {
            sql.push_str(" LIMIT ?");
        }

        let mut query = sqlx::query_as::<_, ActivityRow>(&sql);
        if let Some(actor) = &filter.actor {
            query = query.bind(actor.clone());
        }
        if let Some(limit) = filter.limit {
            query = query.bind(i64::from(limit));
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.into_iter().map(ActivityLogEntry::try_from).collect()
    }

    /// Age-bound purge: delete entries older than `older_than` (§9 retention
    /// decision — default window is 30 days, enforced by the watchdog).
    pub async fn activity_purge_older_than(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM activity_log WHERE created_at < ?")
            .bind(older_than.to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    #[tokio::test]
    async fn append_and_query_by_actor() {
        let store = Store::open_in_memory().await.expect("open");
        store
            .activity_append(NewActivityLogEntry::new("allocator", "assigned_task"))
            .await
            .expect("append");
        store
            .activity_append(
                NewActivityLogEntry::new("merger", "merged_pr").with_details(json!({"pr": 7})),
            )
            .await
            .expect("append");

        let filtered = store
            .activity_query(&ActivityFilter {
                actor: Some("merger".to_string()),
                limit: None,
            })
            .await
            .expect("query");
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].action, "merged_pr");
    }

    #[tokio::test]
    async fn purge_removes_only_old_entries() {
        let store = Store::open_in_memory().await.expect("open");
        store
            .activity_append(NewActivityLogEntry::new("watchdog", "tick"))
            .await
            .expect("append");

        let removed = store
            .activity_purge_older_than(Utc::now() + Duration::seconds(1))
            .await
            .expect("purge");
        assert_eq!(removed, 1);
    }
}
