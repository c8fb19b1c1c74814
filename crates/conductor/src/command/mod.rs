//! Command surface: schema-validated RPC over a local socket, dispatched
//! against the Store and mail bus (§4.3).

pub mod args;
mod dispatch;
pub mod server;

pub use dispatch::dispatch;

use chrono::Utc;
use conductor_core::{
    MailPayload, MergeQueueStatus, Recipient, RequestId, RequestStatus, RequestUpdate, TaskFilter,
    TaskStatus,
};
use serde_json::json;

use crate::broadcast::BroadcastEvent;
use crate::context::AppContext;
use crate::error::{Error, Result};

/// Shared by `complete-task`, `fail-task`, `check-completion`, and the
/// merger: advance a request to `integrating`, then to `completed` or
/// `failed`, once every one of its tasks is terminal and every merge queue
/// entry it spawned has landed.
///
/// Resolves both of §9's open questions: a failed task still counts toward
/// "every task terminal", and if one is present the final status is
/// `failed` rather than `completed` (recorded in DESIGN.md).
pub(crate) async fn check_request_completion(ctx: &AppContext, request_id: &RequestId) -> Result<()> {
    let tasks = ctx
        .store
        .tasks_list(&TaskFilter {
            request_id: Some(request_id.clone()),
            ..TaskFilter::default()
        })
        .await?;
    if tasks.is_empty() {
        return Ok(());
    }
    if !tasks.iter().all(|t| t.status.is_terminal()) {
        return Ok(());
    }

    let request = ctx
        .store
        .requests_get(request_id)
        .await?
        .ok_or_else(|| Error::Core(conductor_core::Error::invalid_input("request not found")))?;
    if request.status.is_terminal() {
        return Ok(());
    }

    if request.status != RequestStatus::Integrating {
        ctx.store
            .requests_update(request_id, RequestUpdate::status(RequestStatus::Integrating))
            .await?;
    }

    let entries = ctx.store.merge_queue_list_by_request(request_id).await?;
    let all_merged = entries.iter().all(|e| e.status == MergeQueueStatus::Merged);
    if !all_merged {
        return Ok(());
    }

    let any_failed = tasks.iter().any(|t| t.status == TaskStatus::Failed);
    let (final_status, summary) = if any_failed {
        (RequestStatus::Failed, "One or more tasks failed".to_string())
    } else {
        (RequestStatus::Completed, "All tasks completed and merged".to_string())
    };

    ctx.store
        .requests_update(
            request_id,
            RequestUpdate {
                status: Some(final_status),
                completed_at: Some(Utc::now()),
                result_summary: Some(summary.clone()),
                ..RequestUpdate::default()
            },
        )
        .await?;

    ctx.mail
        .send(
            &Recipient::master(1).as_key(),
            &MailPayload::RequestCompleted {
                request_id: request_id.clone(),
                summary,
            },
        )
        .await?;
    ctx.broadcast.publish(BroadcastEvent::new(
        "request_closed",
        json!({"request_id": request_id.to_string(), "status": final_status.to_string()}),
    ));

    Ok(())
}
