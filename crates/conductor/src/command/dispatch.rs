//! The `dispatch` function: one match arm per command in the catalog,
//! each mapping directly to Store/mail-bus operations (§4.3).

use chrono::Utc;
use conductor_core::config::{branch_regex, pr_url_regex};
use conductor_core::{
    MailPayload, MergeQueueEntry, NewActivityLogEntry, NewTask, Recipient, Request, RequestId,
    RequestStatus, RequestTier, RequestUpdate, TaskFilter, TaskId, TaskPriority, TaskStatus,
    TaskUpdate, Worker, WorkerId, WorkerStatus, WorkerUpdate,
};
use serde_json::{json, Value};
use std::time::Duration;

use super::args::*;
use super::check_request_completion;
use crate::broadcast::BroadcastEvent;
use crate::context::AppContext;
use crate::error::{Error, Result};
use crate::mailbus::{DEFAULT_BLOCK_DEADLINE, DEFAULT_POLL_INTERVAL};

fn parse<T: serde::de::DeserializeOwned>(args: Value) -> Result<T> {
    serde_json::from_value(args)
        .map_err(|e| Error::Core(conductor_core::Error::invalid_input(format!("bad arguments: {e}"))))
}

/// Route one command, returning the success payload (the server wraps it in
/// `{"ok":true,...}`) or propagating an error (wrapped per §7's taxonomy).
pub async fn dispatch(
    ctx: &AppContext,
    command: &str,
    args: Value,
    shutdown: &mut tokio::sync::watch::Receiver<bool>,
) -> Result<Value> {
    match command {
        "request" => cmd_request(ctx, parse(args)?).await,
        "fix" => cmd_fix(ctx, parse(args)?).await,
        "status" => cmd_status(ctx, parse(args)?).await,
        "clarify" => cmd_clarify(ctx, parse(args)?).await,
        "log" => cmd_log(ctx, parse(args)?).await,
        "triage" => cmd_triage(ctx, parse(args)?).await,
        "create-task" => cmd_create_task(ctx, parse(args)?).await,
        "tier1-complete" => cmd_tier1_complete(ctx, parse(args)?).await,
        "ask-clarification" => cmd_ask_clarification(ctx, parse(args)?).await,
        "my-task" => cmd_my_task(ctx, parse(args)?).await,
        "start-task" => cmd_start_task(ctx, parse(args)?).await,
        "heartbeat" => cmd_heartbeat(ctx, parse(args)?).await,
        "complete-task" => cmd_complete_task(ctx, parse(args)?).await,
        "fail-task" => cmd_fail_task(ctx, parse(args)?).await,
        "distill" => cmd_distill(ctx).await,
        "inbox" => cmd_inbox(ctx, parse(args)?).await,
        "inbox-block" => cmd_inbox_block(ctx, parse(args)?, shutdown).await,
        "ready-tasks" => cmd_ready_tasks(ctx).await,
        "assign-task" => cmd_assign_task(ctx, parse(args)?).await,
        "claim-worker" => cmd_claim_worker(ctx, parse(args)?).await,
        "release-worker" => cmd_release_worker(ctx, parse(args)?).await,
        "worker-status" => cmd_worker_status(ctx).await,
        "check-completion" => cmd_check_completion(ctx, parse(args)?).await,
        "register-worker" => cmd_register_worker(ctx, parse(args)?).await,
        "repair" => cmd_repair(ctx).await,
        "ping" => Ok(json!({})),
        other => Err(Error::Core(conductor_core::Error::invalid_input(format!(
            "unknown command '{other}'"
        )))),
    }
}

async fn cmd_request(ctx: &AppContext, args: RequestArgs) -> Result<Value> {
    let request = Request::new(args.description);
    ctx.store.requests_create(&request).await?;
    ctx.mail
        .send(
            &Recipient::Architect.as_key(),
            &MailPayload::NewRequest { request_id: request.id.clone() },
        )
        .await?;
    ctx.mail
        .send(
            &Recipient::master(1).as_key(),
            &MailPayload::RequestAcknowledged { request_id: request.id.clone() },
        )
        .await?;
    ctx.store
        .activity_append(
            NewActivityLogEntry::new("interface", "request_created")
                .with_details(json!({"request_id": request.id.to_string()})),
        )
        .await?;
    ctx.broadcast.publish(BroadcastEvent::new(
        "request_created",
        json!({"request_id": request.id.to_string()}),
    ));
    Ok(json!({"request_id": request.id}))
}

async fn cmd_fix(ctx: &AppContext, args: FixArgs) -> Result<Value> {
    let (request, task) = ctx.store.fix_create(&args.description, args.domain, args.files).await?;
    ctx.mail
        .send(
            &Recipient::Architect.as_key(),
            &MailPayload::NewRequest { request_id: request.id.clone() },
        )
        .await?;
    ctx.mail
        .send(
            &Recipient::Allocator.as_key(),
            &MailPayload::TasksReady { request_id: request.id.clone() },
        )
        .await?;
    ctx.store
        .activity_append(
            NewActivityLogEntry::new("interface", "fix_created")
                .with_details(json!({"request_id": request.id.to_string(), "task_id": task.id})),
        )
        .await?;
    ctx.broadcast.publish(BroadcastEvent::new(
        "fix_created",
        json!({"request_id": request.id.to_string(), "task_id": task.id}),
    ));
    Ok(json!({"request_id": request.id, "task_id": task.id}))
}

async fn cmd_status(ctx: &AppContext, args: StatusArgs) -> Result<Value> {
    let request_id = RequestId::parse(args.request_id)?;
    let request = ctx
        .store
        .requests_get(&request_id)
        .await?
        .ok_or_else(|| Error::Core(conductor_core::Error::invalid_input("request not found")))?;
    let tasks = ctx
        .store
        .tasks_list(&TaskFilter { request_id: Some(request_id), ..TaskFilter::default() })
        .await?;

    let mut rollup = std::collections::HashMap::new();
    for task in &tasks {
        *rollup.entry(task.status.to_string()).or_insert(0u32) += 1;
    }
    Ok(json!({"request": request, "task_count": tasks.len(), "task_status_rollup": rollup}))
}

async fn cmd_clarify(ctx: &AppContext, args: ClarifyArgs) -> Result<Value> {
    let request_id = RequestId::parse(args.request_id)?;
    ctx.mail
        .send(
            &Recipient::Architect.as_key(),
            &MailPayload::ClarificationReply { request_id, reply: args.reply },
        )
        .await?;
    Ok(json!({}))
}

async fn cmd_log(ctx: &AppContext, args: LogArgs) -> Result<Value> {
    let mut entry = NewActivityLogEntry::new(args.actor, args.action);
    if let Some(details) = args.details {
        entry = entry.with_details(details);
    }
    let id = ctx.store.activity_append(entry).await?;
    Ok(json!({"activity_id": id}))
}

async fn cmd_triage(ctx: &AppContext, args: TriageArgs) -> Result<Value> {
    let request_id = RequestId::parse(args.request_id)?;
    let tier = RequestTier::from_i64(i64::from(args.tier))
        .ok_or_else(|| Error::Core(conductor_core::Error::invalid_input("tier must be 1, 2 or 3")))?;
    let status = if tier == RequestTier::Tier1 {
        RequestStatus::ExecutingTier1
    } else {
        RequestStatus::Decomposed
    };
    ctx.store
        .requests_update(
            &request_id,
            RequestUpdate { tier: Some(tier), status: Some(status), ..RequestUpdate::default() },
        )
        .await?;
    ctx.store
        .activity_append(
            NewActivityLogEntry::new("architect", "triaged")
                .with_details(json!({"request_id": request_id.to_string(), "tier": args.tier})),
        )
        .await?;
    Ok(json!({"request_id": request_id, "tier": args.tier, "status": status.to_string()}))
}

async fn cmd_create_task(ctx: &AppContext, args: CreateTaskArgs) -> Result<Value> {
    let request_id = RequestId::parse(args.request_id)?;
    let priority = match args.priority {
        Some(raw) => raw
            .parse::<TaskPriority>()
            .map_err(|_| Error::Core(conductor_core::Error::invalid_input("invalid priority")))?,
        None => TaskPriority::Normal,
    };
    let new_task = NewTask {
        request_id,
        subject: args.subject,
        description: args.description,
        domain: args.domain,
        files: args.files,
        priority,
        tier: args.tier.unwrap_or(3),
        depends_on: args.depends_on.into_iter().map(TaskId::new).collect(),
        validation: args.validation,
    };
    let task = ctx.store.tasks_create(new_task).await?;
    Ok(json!({"task": task}))
}

async fn cmd_tier1_complete(ctx: &AppContext, args: Tier1CompleteArgs) -> Result<Value> {
    let request_id = RequestId::parse(args.request_id)?;
    ctx.store
        .requests_update(
            &request_id,
            RequestUpdate {
                status: Some(RequestStatus::Completed),
                completed_at: Some(Utc::now()),
                result_summary: Some(args.summary.clone()),
                ..RequestUpdate::default()
            },
        )
        .await?;
    ctx.mail
        .send(
            &Recipient::master(1).as_key(),
            &MailPayload::RequestCompleted { request_id: request_id.clone(), summary: args.summary },
        )
        .await?;
    Ok(json!({"request_id": request_id}))
}

async fn cmd_ask_clarification(ctx: &AppContext, args: AskClarificationArgs) -> Result<Value> {
    let request_id = RequestId::parse(args.request_id)?;
    ctx.mail
        .send(
            &Recipient::master(1).as_key(),
            &MailPayload::ClarificationAsk { request_id, question: args.question },
        )
        .await?;
    Ok(json!({}))
}

async fn cmd_my_task(ctx: &AppContext, args: MyTaskArgs) -> Result<Value> {
    let worker_id = WorkerId::new(args.worker_id);
    let tasks = ctx
        .store
        .tasks_list(&TaskFilter { assignee: Some(worker_id), ..TaskFilter::default() })
        .await?;
    let current = tasks.into_iter().find(|t| t.status.holds_assignee());
    Ok(json!({"task": current}))
}

async fn cmd_start_task(ctx: &AppContext, args: StartTaskArgs) -> Result<Value> {
    let worker_id = WorkerId::new(args.worker_id);
    let task_id = TaskId::new(args.task_id);
    let task = ctx
        .store
        .tasks_get(task_id)
        .await?
        .ok_or_else(|| Error::Core(conductor_core::Error::invalid_input("task not found")))?;
    if task.assigned_to != Some(worker_id) || task.status != TaskStatus::Assigned {
        return Err(Error::Core(conductor_core::Error::conflicting_state(
            "task is not assigned to this worker",
        )));
    }
    ctx.store.tasks_update(task_id, TaskUpdate::status(TaskStatus::InProgress)).await?;
    ctx.store
        .workers_update(
            worker_id,
            WorkerUpdate { status: Some(WorkerStatus::Running), ..WorkerUpdate::default() },
        )
        .await?;
    Ok(json!({}))
}

async fn cmd_heartbeat(ctx: &AppContext, args: HeartbeatArgs) -> Result<Value> {
    let worker_id = WorkerId::new(args.worker_id);
    ctx.store.workers_update(worker_id, WorkerUpdate::heartbeat(Utc::now())).await?;
    Ok(json!({}))
}

async fn cmd_complete_task(ctx: &AppContext, args: CompleteTaskArgs) -> Result<Value> {
    let worker_id = WorkerId::new(args.worker_id);
    let task_id = TaskId::new(args.task_id);
    let task = ctx
        .store
        .tasks_get(task_id)
        .await?
        .ok_or_else(|| Error::Core(conductor_core::Error::invalid_input("task not found")))?;
    if task.assigned_to != Some(worker_id) {
        return Err(Error::Core(conductor_core::Error::conflicting_state(
            "task is not assigned to this worker",
        )));
    }
    if !pr_url_regex().is_match(&args.pr_url) || !branch_regex().is_match(&args.branch) {
        return Err(Error::Core(conductor_core::Error::invalid_input(
            "pr_url or branch failed validation",
        )));
    }

    let mut update = TaskUpdate::complete(args.pr_url.clone(), args.branch.clone());
    update.result_summary = args.result_summary;
    ctx.store.tasks_update(task_id, update).await?;

    let worker = ctx
        .store
        .workers_get(worker_id)
        .await?
        .ok_or_else(|| Error::Core(conductor_core::Error::invalid_input("worker not found")))?;
    ctx.store
        .workers_update(
            worker_id,
            WorkerUpdate {
                status: Some(WorkerStatus::CompletedTask),
                tasks_completed: Some(worker.tasks_completed + 1),
                last_heartbeat: Some(Utc::now()),
                ..WorkerUpdate::default()
            },
        )
        .await?;

    ctx.mail
        .send(
            &Recipient::Allocator.as_key(),
            &MailPayload::TaskCompleted { task_id, request_id: task.request_id.clone() },
        )
        .await?;
    ctx.mail
        .send(
            &Recipient::Architect.as_key(),
            &MailPayload::TaskCompleted { task_id, request_id: task.request_id.clone() },
        )
        .await?;

    let priority = MergeQueueEntry::priority_for(task.priority);
    ctx.store
        .merge_queue_enqueue(&task.request_id, task_id, &args.pr_url, &args.branch, priority)
        .await?;

    ctx.store
        .activity_append(
            NewActivityLogEntry::new(format!("worker-{}", worker_id.get()), "task_completed")
                .with_details(json!({"task_id": task_id, "pr_url": args.pr_url})),
        )
        .await?;
    ctx.broadcast.publish(BroadcastEvent::new(
        "task_completed",
        json!({"task_id": task_id, "worker_id": worker_id}),
    ));

    check_request_completion(ctx, &task.request_id).await?;

    Ok(json!({}))
}

async fn cmd_fail_task(ctx: &AppContext, args: FailTaskArgs) -> Result<Value> {
    let worker_id = WorkerId::new(args.worker_id);
    let task_id = TaskId::new(args.task_id);
    let task = ctx
        .store
        .tasks_get(task_id)
        .await?
        .ok_or_else(|| Error::Core(conductor_core::Error::invalid_input("task not found")))?;
    if task.assigned_to != Some(worker_id) {
        return Err(Error::Core(conductor_core::Error::conflicting_state(
            "task is not assigned to this worker",
        )));
    }
    ctx.store.tasks_update(task_id, TaskUpdate::fail(args.reason.clone())).await?;
    ctx.store.workers_reset_idle(worker_id).await?;

    ctx.mail
        .send(
            &Recipient::Allocator.as_key(),
            &MailPayload::TaskFailed {
                task_id,
                request_id: task.request_id.clone(),
                reason: args.reason.clone(),
            },
        )
        .await?;
    ctx.mail
        .send(
            &Recipient::Architect.as_key(),
            &MailPayload::TaskFailed { task_id, request_id: task.request_id.clone(), reason: args.reason },
        )
        .await?;

    check_request_completion(ctx, &task.request_id).await?;
    Ok(json!({}))
}

async fn cmd_distill(ctx: &AppContext) -> Result<Value> {
    ctx.store.tasks_check_and_promote().await?;
    let ready = ctx.store.tasks_get_ready().await?;
    let idle = ctx.store.workers_list_idle().await?;
    ctx.mail
        .send(
            &Recipient::Allocator.as_key(),
            &MailPayload::TasksAvailable {
                ready_count: ready.len() as u64,
                idle_count: idle.len() as u64,
            },
        )
        .await?;
    Ok(json!({}))
}

async fn cmd_inbox(ctx: &AppContext, args: InboxArgs) -> Result<Value> {
    let messages = ctx.mail.drain(&args.recipient).await?;
    Ok(json!({"messages": messages}))
}

async fn cmd_inbox_block(
    ctx: &AppContext,
    args: InboxBlockArgs,
    shutdown: &mut tokio::sync::watch::Receiver<bool>,
) -> Result<Value> {
    let deadline = args.deadline_ms.map(Duration::from_millis).unwrap_or(DEFAULT_BLOCK_DEADLINE);
    let messages = ctx
        .mail
        .block_until_available(&args.recipient, DEFAULT_POLL_INTERVAL, deadline, shutdown)
        .await?;
    Ok(json!({"messages": messages}))
}

async fn cmd_ready_tasks(ctx: &AppContext) -> Result<Value> {
    let tasks = ctx.store.tasks_get_ready().await?;
    Ok(json!({"tasks": tasks}))
}

async fn cmd_assign_task(ctx: &AppContext, args: AssignTaskArgs) -> Result<Value> {
    let task_id = TaskId::new(args.task_id);
    let worker_id = WorkerId::new(args.worker_id);
    match ctx.store.tasks_assign_atomic(task_id, worker_id).await? {
        Ok(()) => {
            let task = ctx
                .store
                .tasks_get(task_id)
                .await?
                .ok_or_else(|| Error::Core(conductor_core::Error::invalid_input("task vanished after assignment")))?;
            ctx.mail
                .send(
                    &Recipient::worker(worker_id).as_key(),
                    &MailPayload::TaskAssigned { task_id, request_id: task.request_id.clone() },
                )
                .await?;

            let window = Recipient::worker(worker_id).as_key();
            if !ctx.supervisor.has_window(&window).await {
                let worker = ctx
                    .store
                    .workers_get(worker_id)
                    .await?
                    .ok_or_else(|| Error::Core(conductor_core::Error::invalid_input("worker not found")))?;
                let launch_command = std::env::var("CONDUCTOR_WORKER_SCRIPT")
                    .unwrap_or_else(|_| crate::allocator::FALLBACK_LAUNCH_COMMAND.to_string());
                ctx.supervisor.create_window(&window, &launch_command, &worker.worktree_path).await?;
            }
            Ok(json!({}))
        }
        Err(reason) => Err(Error::Core(conductor_core::Error::conflicting_state(reason))),
    }
}

async fn cmd_claim_worker(ctx: &AppContext, args: ClaimWorkerArgs) -> Result<Value> {
    let worker_id = WorkerId::new(args.worker_id);
    let claimed = ctx.store.workers_claim(worker_id, &args.claimant).await?;
    if claimed {
        Ok(json!({}))
    } else {
        Err(Error::Core(conductor_core::Error::conflicting_state(
            "worker is not idle or already claimed",
        )))
    }
}

async fn cmd_release_worker(ctx: &AppContext, args: ReleaseWorkerArgs) -> Result<Value> {
    let worker_id = WorkerId::new(args.worker_id);
    let released = ctx.store.workers_release(worker_id, &args.claimant).await?;
    if released {
        Ok(json!({}))
    } else {
        Err(Error::Core(conductor_core::Error::conflicting_state(
            "caller does not hold this worker's claim",
        )))
    }
}

async fn cmd_worker_status(ctx: &AppContext) -> Result<Value> {
    let workers = ctx.store.workers_list().await?;
    Ok(json!({"workers": workers}))
}

async fn cmd_check_completion(ctx: &AppContext, args: CheckCompletionArgs) -> Result<Value> {
    let request_id = RequestId::parse(args.request_id)?;
    check_request_completion(ctx, &request_id).await?;
    let request = ctx
        .store
        .requests_get(&request_id)
        .await?
        .ok_or_else(|| Error::Core(conductor_core::Error::invalid_input("request not found")))?;
    Ok(json!({"request": request}))
}

async fn cmd_register_worker(ctx: &AppContext, args: RegisterWorkerArgs) -> Result<Value> {
    let worker = Worker::new(WorkerId::new(args.worker_id), args.worktree_path);
    ctx.store.workers_register(&worker).await?;
    Ok(json!({}))
}

async fn cmd_repair(ctx: &AppContext) -> Result<Value> {
    crate::watchdog::repair_now(ctx).await?;
    Ok(json!({}))
}
