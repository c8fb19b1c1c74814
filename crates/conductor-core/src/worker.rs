//! The Worker entity: a logical slot bound to a git worktree.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::ids::{TaskId, WorkerId};

/// Lifecycle status of a worker slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Assigned,
    Running,
    Busy,
    CompletedTask,
    Resetting,
}

impl WorkerStatus {
    /// `current_task_id` is set iff status is one of these (§3 invariant).
    #[must_use]
    pub const fn holds_task(self) -> bool {
        matches!(
            self,
            Self::Assigned | Self::Running | Self::Busy | Self::CompletedTask
        )
    }

    /// Heartbeat staleness escalation only applies to these (§4.5).
    #[must_use]
    pub const fn is_heartbeat_tracked(self) -> bool {
        matches!(self, Self::Running | Self::Busy)
    }

    pub const ALL: &'static [Self] = &[
        Self::Idle,
        Self::Assigned,
        Self::Running,
        Self::Busy,
        Self::CompletedTask,
        Self::Resetting,
    ];
}

/// A logical worker slot, numbered 1..=`max_workers`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: WorkerId,
    pub status: WorkerStatus,
    pub current_domain: Option<String>,
    pub worktree_path: String,
    pub branch: Option<String>,
    pub session_name: Option<String>,
    pub window_name: Option<String>,
    pub current_task_id: Option<TaskId>,
    pub last_heartbeat: DateTime<Utc>,
    pub launched_at: DateTime<Utc>,
    pub tasks_completed: u64,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
}

impl Worker {
    /// Build a freshly registered worker, idle, with no task and no claim.
    #[must_use]
    pub fn new(id: WorkerId, worktree_path: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            status: WorkerStatus::Idle,
            current_domain: None,
            worktree_path: worktree_path.into(),
            branch: None,
            session_name: None,
            window_name: None,
            current_task_id: None,
            last_heartbeat: now,
            launched_at: now,
            tasks_completed: 0,
            claimed_by: None,
            claimed_at: None,
        }
    }

    /// Whether this worker's claim (if any) has outlived `threshold_s` seconds
    /// (§4.5 stale claim cleanup).
    #[must_use]
    pub fn claim_is_stale(&self, now: DateTime<Utc>, threshold_s: i64) -> bool {
        match self.claimed_at {
            Some(claimed_at) => self.claimed_by.is_some() && (now - claimed_at).num_seconds() > threshold_s,
            None => false,
        }
    }

    /// A worker is eligible for new assignment iff idle and unclaimed (§3).
    #[must_use]
    pub fn is_assignable(&self) -> bool {
        self.status == WorkerStatus::Idle && self.claimed_by.is_none()
    }

    #[must_use]
    pub fn heartbeat_staleness(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.last_heartbeat
    }
}

/// Nullable-field options record for `Store::workers_update` (see §9).
#[derive(Debug, Clone, Default)]
pub struct WorkerUpdate {
    pub status: Option<WorkerStatus>,
    pub current_domain: Option<String>,
    pub branch: Option<String>,
    pub session_name: Option<String>,
    pub window_name: Option<String>,
    pub current_task_id: Option<Option<TaskId>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub tasks_completed: Option<u64>,
    pub claimed_by: Option<Option<String>>,
}

impl WorkerUpdate {
    #[must_use]
    pub fn heartbeat(now: DateTime<Utc>) -> Self {
        Self {
            last_heartbeat: Some(now),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn assign(task_id: TaskId, domain: Option<String>) -> Self {
        Self {
            status: Some(WorkerStatus::Assigned),
            current_task_id: Some(Some(task_id)),
            current_domain: domain,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn reset_idle() -> Self {
        Self {
            status: Some(WorkerStatus::Idle),
            current_task_id: Some(None),
            claimed_by: Some(None),
            ..Self::default()
        }
    }
}

/// Escalation tier reached by the watchdog's heartbeat-staleness ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HeartbeatTier {
    Fresh,
    Warn,
    Nudge,
    Triage,
    Terminate,
}

/// Thresholds for the heartbeat escalation ladder, in seconds (§4.5 defaults).
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatThresholds {
    pub warn_s: i64,
    pub nudge_s: i64,
    pub triage_s: i64,
    pub terminate_s: i64,
}

impl Default for HeartbeatThresholds {
    fn default() -> Self {
        Self {
            warn_s: 60,
            nudge_s: 90,
            triage_s: 120,
            terminate_s: 180,
        }
    }
}

impl HeartbeatThresholds {
    /// Scale the default ladder so `terminate_s` matches the configured
    /// `heartbeat_timeout_s`, keeping the warn/nudge/triage ratios from the
    /// §4.5 defaults (60:90:120:180, i.e. 1/3 : 1/2 : 2/3 : 1).
    #[must_use]
    pub fn scaled_from(heartbeat_timeout_s: i64) -> Self {
        let terminate_s = heartbeat_timeout_s.max(1);
        Self {
            warn_s: terminate_s / 3,
            nudge_s: terminate_s / 2,
            triage_s: terminate_s * 2 / 3,
            terminate_s,
        }
    }

    /// Classify a staleness duration into an escalation tier.
    #[must_use]
    pub fn classify(&self, staleness: chrono::Duration) -> HeartbeatTier {
        let secs = staleness.num_seconds();
        if secs >= self.terminate_s {
            HeartbeatTier::Terminate
        } else if secs >= self.triage_s {
            HeartbeatTier::Triage
        } else if secs >= self.nudge_s {
            HeartbeatTier::Nudge
        } else if secs >= self.warn_s {
            HeartbeatTier::Warn
        } else {
            HeartbeatTier::Fresh
        }
    }
}

/// Column whitelist for `workers`, checked by every update path.
pub const WORKER_COLUMNS: &[&str] = &[
    "status",
    "current_domain",
    "branch",
    "session_name",
    "window_name",
    "current_task_id",
    "last_heartbeat",
    "tasks_completed",
    "claimed_by",
    "claimed_at",
];
