//! The Watchdog loop: detects dead worker processes, escalates stale
//! heartbeats through warn -> nudge -> triage -> terminate, recovers orphan
//! tasks left behind by a crashed assignment, releases stale claims, and
//! purges old mail/activity on an hourly cadence (§4.5).

use chrono::{DateTime, Utc};
use conductor_core::{
    HeartbeatThresholds, HeartbeatTier, MailPayload, NewActivityLogEntry, Recipient, TaskFilter,
    TaskStatus, Worker, WorkerStatus,
};
use serde_json::json;
use std::time::Duration;
use tracing::{info, warn};

use crate::broadcast::BroadcastEvent;
use crate::context::AppContext;
use crate::error::Result;

/// Grace period after launch before heartbeat escalation begins (§4.5).
const LAUNCH_GRACE_S: i64 = 60;
/// A worker sits in `completed_task` this long before being auto-reset idle.
const COMPLETED_TASK_RESET_S: i64 = 30;
/// A worker claim outlives this many seconds without being renewed or
/// released before the watchdog releases it unconditionally.
const STALE_CLAIM_S: i64 = 120;
/// Pane lines captured at the `triage` tier for the activity log.
const TRIAGE_CAPTURE_LINES: u32 = 50;
/// Mail and activity purge retention (§3 default / §9 resolved decision).
const MAIL_RETENTION_DAYS: i64 = 7;
const ACTIVITY_RETENTION_DAYS: i64 = 30;
const PURGE_INTERVAL: Duration = Duration::from_secs(3600);

/// One watchdog pass: liveness, heartbeat escalation, stale claims, orphans.
/// Does not purge mail/activity; that runs on its own hourly cadence from
/// [`run`], or immediately via [`repair_now`].
pub async fn tick(ctx: &AppContext) -> Result<()> {
    let thresholds = HeartbeatThresholds::scaled_from(ctx.config.heartbeat_timeout_s);
    let now = Utc::now();

    for worker in ctx.store.workers_list().await? {
        if worker.status == WorkerStatus::Idle {
            continue;
        }
        process_worker(ctx, &worker, now, &thresholds).await?;
    }

    release_stale_claims(ctx, now).await?;
    recover_orphan_tasks(ctx).await?;
    Ok(())
}

/// Delete mail and activity rows past their retention window.
pub async fn purge(ctx: &AppContext) -> Result<()> {
    let now = Utc::now();
    let mail_removed = ctx
        .store
        .mail_purge_older_than(now - chrono::Duration::days(MAIL_RETENTION_DAYS))
        .await?;
    let activity_removed = ctx
        .store
        .activity_purge_older_than(now - chrono::Duration::days(ACTIVITY_RETENTION_DAYS))
        .await?;
    if mail_removed > 0 || activity_removed > 0 {
        info!(mail_removed, activity_removed, "purged stale mail and activity log rows");
    }
    Ok(())
}

/// Run a full watchdog pass plus a purge immediately, on demand from the
/// `repair` command rather than waiting for the next scheduled tick.
pub async fn repair_now(ctx: &AppContext) -> Result<()> {
    tick(ctx).await?;
    purge(ctx).await
}

async fn process_worker(
    ctx: &AppContext,
    worker: &Worker,
    now: DateTime<Utc>,
    thresholds: &HeartbeatThresholds,
) -> Result<()> {
    let window = Recipient::worker(worker.id).as_key();

    if worker.status == WorkerStatus::CompletedTask {
        if (now - worker.last_heartbeat).num_seconds() >= COMPLETED_TASK_RESET_S {
            ctx.store.workers_reset_idle(worker.id).await?;
        }
        return Ok(());
    }

    if !ctx.supervisor.is_alive(&window).await {
        return death_handling(ctx, worker, "supervisor window is not alive").await;
    }

    if (now - worker.launched_at).num_seconds() < LAUNCH_GRACE_S {
        return Ok(());
    }

    if !worker.status.is_heartbeat_tracked() {
        return Ok(());
    }

    let staleness = worker.heartbeat_staleness(now);
    match thresholds.classify(staleness) {
        HeartbeatTier::Fresh => {}
        HeartbeatTier::Warn => {
            warn!(worker_id = %worker.id, staleness_s = staleness.num_seconds(), "heartbeat stale (warn)");
        }
        HeartbeatTier::Nudge => {
            send_nudge(ctx, worker, "heartbeat is stale, please report status").await?;
        }
        HeartbeatTier::Triage => {
            let captured = ctx
                .supervisor
                .capture_pane(&window, TRIAGE_CAPTURE_LINES)
                .await
                .unwrap_or_default();
            ctx.store
                .activity_append(
                    NewActivityLogEntry::new("watchdog", "triage_capture")
                        .with_details(json!({"worker_id": worker.id, "output": captured})),
                )
                .await?;
            send_nudge(ctx, worker, "heartbeat critically stale, status requested").await?;
        }
        HeartbeatTier::Terminate => {
            ctx.supervisor.kill_window(&window).await.ok();
            death_handling(ctx, worker, "heartbeat terminate threshold exceeded").await?;
        }
    }
    Ok(())
}

/// Conditionally transitions a worker to idle and requeues its task, via the
/// single-conditional-UPDATE primitives that avoid clobbering a worker that
/// already self-recovered through a racing heartbeat or `complete-task`.
async fn death_handling(ctx: &AppContext, worker: &Worker, reason: &str) -> Result<()> {
    if !ctx.store.workers_mark_dead(worker.id, worker.current_task_id).await? {
        return Ok(());
    }

    if let Some(task_id) = worker.current_task_id {
        if ctx.store.tasks_requeue_if_active(task_id).await? {
            info!(worker_id = %worker.id, task_id = %task_id, reason, "requeued task after worker death");
        }
    }

    ctx.store
        .activity_append(
            NewActivityLogEntry::new("watchdog", "worker_death")
                .with_details(json!({"worker_id": worker.id, "reason": reason})),
        )
        .await?;
    ctx.broadcast.publish(BroadcastEvent::new(
        "worker_death",
        json!({"worker_id": worker.id, "reason": reason}),
    ));
    Ok(())
}

async fn send_nudge(ctx: &AppContext, worker: &Worker, message: &str) -> Result<()> {
    ctx.mail
        .send(
            &Recipient::worker(worker.id).as_key(),
            &MailPayload::Nudge {
                task_id: worker.current_task_id,
                message: message.to_string(),
            },
        )
        .await?;
    Ok(())
}

async fn release_stale_claims(ctx: &AppContext, now: DateTime<Utc>) -> Result<()> {
    for worker in ctx.store.workers_list().await? {
        if worker.claim_is_stale(now, STALE_CLAIM_S) {
            if ctx.store.workers_release_stale(worker.id).await? {
                ctx.store
                    .activity_append(
                        NewActivityLogEntry::new("watchdog", "released_stale_claim")
                            .with_details(json!({"worker_id": worker.id})),
                    )
                    .await?;
            }
        }
    }
    Ok(())
}

/// A task can be left `assigned`/`in_progress` while its worker has already
/// gone idle (the assignment committed but a subsequent step crashed before
/// the task left that status, or a crash-recovery path reset the worker
/// without touching the task). Requeue it so the allocator can hand it out
/// again.
async fn recover_orphan_tasks(ctx: &AppContext) -> Result<()> {
    for status in [TaskStatus::Assigned, TaskStatus::InProgress] {
        let filter = TaskFilter { status: Some(status), ..TaskFilter::default() };
        for task in ctx.store.tasks_list(&filter).await? {
            let Some(worker_id) = task.assigned_to else { continue };
            let Some(worker) = ctx.store.workers_get(worker_id).await? else { continue };
            if worker.status == WorkerStatus::Idle && worker.current_task_id.is_none()
                && ctx.store.tasks_requeue_if_active(task.id).await?
            {
                info!(task_id = %task.id, worker_id = %worker_id, "recovered orphan task");
            }
        }
    }
    Ok(())
}

/// Drive the watchdog's liveness pass on `interval` and the mail/activity
/// purge on a fixed hourly cadence, until `shutdown` fires.
pub async fn run(ctx: AppContext, interval: Duration, mut shutdown: tokio::sync::watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval);
    let mut purge_ticker = tokio::time::interval(PURGE_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = tick(&ctx).await {
                    warn!(error = %e, "watchdog tick failed");
                }
            }
            _ = purge_ticker.tick() => {
                if let Err(e) = purge(&ctx).await {
                    warn!(error = %e, "watchdog purge failed");
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
