//! The Merger loop: drains the merge queue one entry at a time through a
//! four-tier conflict-resolution ladder (§4.6).
//!
//! | Tier | Action | On failure |
//! |---|---|---|
//! | 1 | `gh pr merge` directly | escalate to tier 2 |
//! | 2 | rebase onto latest mainline, force-push, retry the merge | escalate to tier 3 |
//! | 3 | enqueue a high-priority fix task in the same request for an agent to resolve the conflict | escalate to tier 4 only if the fix task itself cannot be created |
//! | 4 | enqueue a from-scratch redo task and mark this entry `conflict` | n/a (terminal for this entry) |
//!
//! ## Open question resolved here
//!
//! §9 flags an ambiguity in the tier-3 outcome: whether the *original* queue
//! entry should be marked `merged` the moment a fix task is scheduled, or
//! left pending until that fix task's own PR lands. This implementation
//! marks it `merged` immediately, matching the literal "returns success to
//! the queue" wording — the fix task's eventual completion enqueues its own
//! fresh entry under the same request, so the work still gets merged, just
//! under a different queue row. The accepted trade-off (documented in
//! DESIGN.md) is that a request can be observed `completed` before the fix
//! task has actually landed, if the fix task is still the only outstanding
//! task. A tier-4 entry does **not** get this treatment: it is left
//! `conflict`, since that branch's code is being discarded rather than
//! merged under a different name.

use conductor_core::{
    MergeQueueEntry, MergeQueueUpdate, NewActivityLogEntry, NewTask, TaskPriority,
};
use serde_json::json;
use std::time::Duration;
use tracing::{info, warn};

use crate::broadcast::BroadcastEvent;
use crate::context::AppContext;
use crate::error::Result;

/// One merge attempt: dequeue the highest-priority entry and drive it
/// through the resolution ladder. A no-op when the queue is empty.
pub async fn tick(ctx: &AppContext) -> Result<()> {
    let Some(entry) = ctx.store.merge_queue_get_next().await? else {
        return Ok(());
    };
    if !ctx.store.merge_queue_try_start(entry.id).await? {
        // Lost a race for the same entry; another tick (or a future
        // concurrent caller) already owns it.
        return Ok(());
    }
    resolve(ctx, &entry).await
}

async fn resolve(ctx: &AppContext, entry: &MergeQueueEntry) -> Result<()> {
    if crate::vcs::merge_pr(&entry.pr_url, &entry.branch).await.is_ok() {
        return finish_merged(ctx, entry, "tier 1: clean merge").await;
    }
    info!(entry_id = %entry.id, branch = %entry.branch, "tier 1 merge failed, escalating to rebase+retry");

    if crate::vcs::rebase_and_push(&entry.branch).await.is_ok()
        && crate::vcs::merge_pr(&entry.pr_url, &entry.branch).await.is_ok()
    {
        return finish_merged(ctx, entry, "tier 2: rebase and retry").await;
    }
    info!(entry_id = %entry.id, branch = %entry.branch, "tier 2 rebase+retry failed, escalating to fix task");

    match create_follow_up_task(ctx, entry, FollowUp::Fix).await {
        Ok(()) => finish_merged(ctx, entry, "tier 3: conflict resolution task scheduled").await,
        Err(e) => {
            warn!(entry_id = %entry.id, error = %e, "tier 3 fix task creation failed, escalating to redo");
            create_follow_up_task(ctx, entry, FollowUp::Redo).await?;
            finish_conflict(ctx, entry, "Needs reimplementation on latest main").await
        }
    }
}

enum FollowUp {
    Fix,
    Redo,
}

async fn create_follow_up_task(ctx: &AppContext, entry: &MergeQueueEntry, kind: FollowUp) -> Result<()> {
    let original = ctx
        .store
        .tasks_get(entry.task_id)
        .await?
        .ok_or_else(|| crate::error::Error::config("original task for merge queue entry not found"))?;

    let (subject, description) = match kind {
        FollowUp::Fix => (
            format!("Resolve merge conflict: {}", original.subject),
            format!(
                "The PR for task {} (branch `{}`) could not be merged even after a rebase. \
                 Resolve the conflict against the latest mainline and open a new PR.\n\nOriginal task:\n{}",
                entry.task_id, entry.branch, original.description
            ),
        ),
        FollowUp::Redo => (
            format!("Redo: {}", original.subject),
            format!(
                "The conflict-resolution attempt for task {} (branch `{}`) also failed to merge. \
                 Implement this from scratch against the latest mainline.\n\nOriginal task:\n{}",
                entry.task_id, entry.branch, original.description
            ),
        ),
    };

    let tier = match kind {
        // spec.md:161 mandates the conflict-resolution fix task be created
        // at the literal tier 2, regardless of the original task's tier.
        FollowUp::Fix => 2,
        FollowUp::Redo => original.tier,
    };

    let task = ctx
        .store
        .tasks_create(NewTask {
            request_id: entry.request_id.clone(),
            subject,
            description,
            domain: original.domain.clone(),
            files: original.files.clone(),
            priority: TaskPriority::High,
            tier,
            depends_on: vec![],
            validation: original.validation.clone(),
        })
        .await?;

    ctx.store
        .activity_append(
            NewActivityLogEntry::new("merger", "follow_up_task_created").with_details(json!({
                "merge_queue_entry_id": entry.id,
                "original_task_id": entry.task_id,
                "follow_up_task_id": task.id,
            })),
        )
        .await?;
    Ok(())
}

async fn finish_merged(ctx: &AppContext, entry: &MergeQueueEntry, note: &str) -> Result<()> {
    ctx.store
        .merge_queue_update(entry.id, MergeQueueUpdate::merged(chrono::Utc::now()))
        .await?;
    ctx.store
        .activity_append(
            NewActivityLogEntry::new("merger", "merged").with_details(json!({
                "merge_queue_entry_id": entry.id,
                "branch": entry.branch,
                "note": note,
            })),
        )
        .await?;
    ctx.broadcast.publish(BroadcastEvent::new(
        "merge_succeeded",
        json!({"merge_queue_entry_id": entry.id, "branch": entry.branch}),
    ));

    crate::command::check_request_completion(ctx, &entry.request_id).await?;
    Ok(())
}

async fn finish_conflict(ctx: &AppContext, entry: &MergeQueueEntry, error: &str) -> Result<()> {
    ctx.store
        .merge_queue_update(entry.id, MergeQueueUpdate::conflict(error))
        .await?;
    ctx.store
        .activity_append(
            NewActivityLogEntry::new("merger", "conflict").with_details(json!({
                "merge_queue_entry_id": entry.id,
                "branch": entry.branch,
                "error": error,
            })),
        )
        .await?;
    ctx.broadcast.publish(BroadcastEvent::new(
        "merge_conflict",
        json!({"merge_queue_entry_id": entry.id, "branch": entry.branch}),
    ));
    Ok(())
}

/// Drive the merger on a fixed interval until `shutdown` fires. One entry is
/// processed per tick; a deep queue drains across several ticks rather than
/// all at once, so a single stuck `gh`/`git` subprocess can't monopolize a
/// tick indefinitely.
pub async fn run(ctx: AppContext, interval: Duration, mut shutdown: tokio::sync::watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = tick(&ctx).await {
                    warn!(error = %e, "merger tick failed");
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::broadcast::NullBroadcast;
    use crate::supervisor::NullSupervisor;
    use conductor_core::{Config, MergeQueueStatus, NewTask, Request};
    use std::sync::Arc;

    async fn context() -> AppContext {
        let store = crate::store::Store::open_in_memory().await.expect("open");
        AppContext::new(
            store,
            Config { project_dir: "/tmp".to_string(), ..Config::default() },
            Arc::new(NullSupervisor::new()),
            Arc::new(NullBroadcast),
        )
    }

    #[tokio::test]
    async fn tick_is_a_no_op_on_an_empty_queue() {
        let ctx = context().await;
        tick(&ctx).await.expect("tick");
    }

    #[tokio::test]
    async fn dequeued_entry_is_exclusively_owned() {
        let ctx = context().await;
        let request = Request::new("parent");
        ctx.store.requests_create(&request).await.expect("request");
        let task = ctx
            .store
            .tasks_create(NewTask {
                request_id: request.id.clone(),
                subject: "work".to_string(),
                description: "work".to_string(),
                domain: None,
                files: None,
                priority: TaskPriority::Normal,
                tier: 3,
                depends_on: vec![],
                validation: None,
            })
            .await
            .expect("task");
        let entry_id = ctx
            .store
            .merge_queue_enqueue(&request.id, task.id, "https://github.com/acme/repo/pull/1", "feature/x", 50)
            .await
            .expect("enqueue");

        // Simulate the exclusivity guard without actually shelling out to
        // `gh`/`git`: a second `try_start` on an already-`merging` entry
        // must fail, regardless of how resolution eventually finishes.
        assert!(ctx.store.merge_queue_try_start(entry_id).await.expect("first"));
        assert!(!ctx.store.merge_queue_try_start(entry_id).await.expect("second"));
    }

    #[tokio::test]
    async fn tier4_redo_marks_entry_conflict_with_spec_message() {
        let ctx = context().await;
        let request = Request::new("parent");
        ctx.store.requests_create(&request).await.expect("request");
        let task = ctx
            .store
            .tasks_create(NewTask {
                request_id: request.id.clone(),
                subject: "work".to_string(),
                description: "work".to_string(),
                domain: None,
                files: None,
                priority: TaskPriority::Normal,
                tier: 3,
                depends_on: vec![],
                validation: None,
            })
            .await
            .expect("task");
        let entry_id = ctx
            .store
            .merge_queue_enqueue(&request.id, task.id, "https://github.com/acme/repo/pull/1", "feature/x", 50)
            .await
            .expect("enqueue");
        let entry = ctx.store.merge_queue_get(entry_id).await.expect("get").expect("present");

        create_follow_up_task(&ctx, &entry, FollowUp::Redo).await.expect("redo task");
        finish_conflict(&ctx, &entry, "Needs reimplementation on latest main").await.expect("finish");

        let after = ctx.store.merge_queue_get(entry_id).await.expect("get").expect("present");
        assert_eq!(after.status, MergeQueueStatus::Conflict);
        assert_eq!(after.error.as_deref(), Some("Needs reimplementation on latest main"));

        let tasks = ctx
            .store
            .tasks_list(&conductor_core::TaskFilter { request_id: Some(request.id.clone()), ..Default::default() })
            .await
            .expect("list");
        assert_eq!(tasks.len(), 2);
        assert!(tasks.iter().any(|t| t.subject.starts_with("Redo:") && t.tier == 3));
    }

    #[tokio::test]
    async fn tier3_fix_task_creation_marks_original_entry_merged() {
        let ctx = context().await;
        let request = Request::new("parent");
        ctx.store.requests_create(&request).await.expect("request");
        let task = ctx
            .store
            .tasks_create(NewTask {
                request_id: request.id.clone(),
                subject: "work".to_string(),
                description: "work".to_string(),
                domain: None,
                files: None,
                priority: TaskPriority::Normal,
                tier: 3,
                depends_on: vec![],
                validation: None,
            })
            .await
            .expect("task");
        let entry_id = ctx
            .store
            .merge_queue_enqueue(&request.id, task.id, "https://github.com/acme/repo/pull/1", "feature/x", 50)
            .await
            .expect("enqueue");
        let entry = ctx.store.merge_queue_get(entry_id).await.expect("get").expect("present");

        create_follow_up_task(&ctx, &entry, FollowUp::Fix).await.expect("fix task");
        finish_merged(&ctx, &entry, "tier 3: conflict resolution task scheduled").await.expect("finish");

        let after = ctx.store.merge_queue_get(entry_id).await.expect("get").expect("present");
        assert_eq!(after.status, MergeQueueStatus::Merged);

        let tasks = ctx
            .store
            .tasks_list(&conductor_core::TaskFilter { request_id: Some(request.id.clone()), ..Default::default() })
            .await
            .expect("list");
        assert_eq!(tasks.len(), 2);
        assert!(tasks
            .iter()
            .any(|t| t.subject.starts_with("Resolve merge conflict:") && t.priority == TaskPriority::High && t.tier == 2));
    }
}
