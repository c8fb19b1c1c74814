//! Request CRUD (§4.1 "Requests: create, get, update, list").

use chrono::{DateTime, Utc};
use conductor_core::{Request, RequestId, RequestStatus, RequestTier, RequestUpdate};
use std::str::FromStr;

use super::Store;
use crate::error::{Error, Result};

#[derive(sqlx::FromRow)]
struct RequestRow {
    id: String,
    description: String,
    tier: Option<i64>,
    status: String,
    created_at: String,
    updated_at: String,
    completed_at: Option<String>,
    result_summary: Option<String>,
}

impl TryFrom<RequestRow> for Request {
    type Error = Error;

    fn try_from(row: RequestRow) -> Result<Self> {
        Ok(Self {
            id: RequestId::parse(row.id)?,
            description: row.description,
            tier: row.tier.and_then(RequestTier::from_i64),
            status: RequestStatus::from_str(&row.status)
                .map_err(|_| Error::config(format!("bad status in db: {}", row.status)))?,
            created_at: parse_ts(&row.created_at)?,
            updated_at: parse_ts(&row.updated_at)?,
            completed_at: row.completed_at.as_deref().map(parse_ts).transpose()?,
            result_summary: row.result_summary,
        })
    }
}

pub(super) fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::config(format!("bad timestamp in db: {e}")))
}

impl Store {
    pub async fn requests_create(&self, request: &Request) -> Result<()> {
        sqlx::query(
            "INSERT INTO requests (id, description, tier, status, created_at, updated_at, completed_at, result_summary)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(request.id.as_str())
        .bind(&request.description)
        .bind(request.tier.map(RequestTier::as_i64))
        .bind(request.status.to_string())
        .bind(request.created_at.to_rfc3339())
        .bind(request.updated_at.to_rfc3339())
        .bind(request.completed_at.map(|t| t.to_rfc3339()))
        .bind(&request.result_summary)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn requests_get(&self, id: &RequestId) -> Result<Option<Request>> {
        let row: Option<RequestRow> = sqlx::query_as("SELECT * FROM requests WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(Request::try_from).transpose()
    }

    /// Typed updater: only the columns named in [`RequestUpdate`] ever reach
    /// the generated `UPDATE`, so no caller can smuggle an arbitrary column
    /// name through untrusted input (§4.1 column whitelist, §9).
    pub async fn requests_update(&self, id: &RequestId, update: RequestUpdate) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            "UPDATE requests SET
                tier = COALESCE(?, tier),
                status = COALESCE(?, status),
                completed_at = COALESCE(?, completed_at),
                result_summary = COALESCE(?, result_summary),
                updated_at = ?
             WHERE id = ?",
        )
        .bind(update.tier.map(RequestTier::as_i64))
        .bind(update.status.map(|s| s.to_string()))
        .bind(update.completed_at.map(|t| t.to_rfc3339()))
        .bind(update.result_summary)
        .bind(now.to_rfc3339())
        .bind(id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// List requests, optionally filtered by status, newest first.
    pub async fn requests_list(&self, status: Option<RequestStatus>) -> Result<Vec<Request>> {
        let rows: Vec<RequestRow> = match status {
            Some(s) => {
                sqlx::query_as("SELECT * FROM requests WHERE status = ? ORDER BY created_at DESC")
                    .bind(s.to_string())
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query_as("SELECT * FROM requests ORDER BY created_at DESC")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.into_iter().map(Request::try_from).collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_get_update_round_trips() {
        let store = Store::open_in_memory().await.expect("open");
        let request = Request::new("add dark mode");
        store.requests_create(&request).await.expect("create");

        let fetched = store
            .requests_get(&request.id)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(fetched.status, RequestStatus::Pending);

        store
            .requests_update(&request.id, RequestUpdate::status(RequestStatus::Completed))
            .await
            .expect("update");
        let updated = store
            .requests_get(&request.id)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(updated.status, RequestStatus::Completed);
    }

    #[tokio::test]
    async fn list_filters_by_status() {
        let store = Store::open_in_memory().await.expect("open");
        let a = Request::new("a");
        let mut b = Request::new("b");
        b.status = RequestStatus::Completed;
        store.requests_create(&a).await.expect("create a");
        store.requests_create(&b).await.expect("create b");

        let completed = store
            .requests_list(Some(RequestStatus::Completed))
            .await
            .expect("list");
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].id, b.id);
    }
}
