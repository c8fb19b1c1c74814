//! The Task entity: a unit of work assignable to exactly one worker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::ids::{RequestId, TaskId, WorkerId};

/// Scheduling priority; lower numeric value sorts first in `getReady`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskPriority {
    Urgent = 0,
    High = 1,
    Normal = 2,
    Low = 3,
}

impl TaskPriority {
    #[must_use]
    pub const fn rank(self) -> i64 {
        self as i64
    }

    pub const ALL: &'static [Self] = &[Self::Urgent, Self::High, Self::Normal, Self::Low];
}

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Ready,
    Assigned,
    InProgress,
    Completed,
    Failed,
    Blocked,
}

impl TaskStatus {
    /// A completed/failed task is terminal and must not be reassigned.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// `assigned_to` is set iff status is one of these (§3 invariant).
    #[must_use]
    pub const fn holds_assignee(self) -> bool {
        matches!(self, Self::Assigned | Self::InProgress)
    }

    pub const ALL: &'static [Self] = &[
        Self::Pending,
        Self::Ready,
        Self::Assigned,
        Self::InProgress,
        Self::Completed,
        Self::Failed,
        Self::Blocked,
    ];
}

/// Optional build/test/lint commands run to validate a task's PR.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationDescriptor {
    pub build: Option<String>,
    pub test: Option<String>,
    pub lint: Option<String>,
}

/// A unit of work assignable to exactly one worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub request_id: RequestId,
    pub subject: String,
    pub description: String,
    pub domain: Option<String>,
    pub files: Option<Vec<String>>,
    pub priority: TaskPriority,
    pub tier: u8,
    pub depends_on: Vec<TaskId>,
    pub assigned_to: Option<WorkerId>,
    pub status: TaskStatus,
    pub pr_url: Option<String>,
    pub branch: Option<String>,
    pub validation: Option<ValidationDescriptor>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub result_summary: Option<String>,
}

/// Fields accepted by `create-task`; everything else is computed.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub request_id: RequestId,
    pub subject: String,
    pub description: String,
    pub domain: Option<String>,
    pub files: Option<Vec<String>>,
    pub priority: TaskPriority,
    pub tier: u8,
    pub depends_on: Vec<TaskId>,
    pub validation: Option<ValidationDescriptor>,
}

/// Nullable-field options record for `Store::tasks_update` (see §9).
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub assigned_to: Option<Option<WorkerId>>,
    pub pr_url: Option<String>,
    pub branch: Option<String>,
    pub result_summary: Option<String>,
}

impl TaskUpdate {
    #[must_use]
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn assign(worker: WorkerId) -> Self {
        Self {
            status: Some(TaskStatus::Assigned),
            assigned_to: Some(Some(worker)),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn complete(pr_url: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            status: Some(TaskStatus::Completed),
            assigned_to: Some(None),
            pr_url: Some(pr_url.into()),
            branch: Some(branch.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn fail(result_summary: impl Into<String>) -> Self {
        Self {
            status: Some(TaskStatus::Failed),
            assigned_to: Some(None),
            result_summary: Some(result_summary.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn requeue() -> Self {
        Self {
            status: Some(TaskStatus::Ready),
            assigned_to: Some(None),
            ..Self::default()
        }
    }
}

/// Filter used by `Store::tasks_list`.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub request_id: Option<RequestId>,
    pub assignee: Option<WorkerId>,
}

/// Column whitelist for `tasks`, checked by every update path.
pub const TASK_COLUMNS: &[&str] = &[
    "status",
    "assigned_to",
    "pr_url",
    "branch",
    "result_summary",
    "updated_at",
];


#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn priority_strategy() -> impl Strategy<Value = TaskPriority> {
        prop_oneof![
            Just(TaskPriority::Urgent),
            Just(TaskPriority::High),
            Just(TaskPriority::Normal),
            Just(TaskPriority::Low),
        ]
    }

    fn touched_columns(update: &TaskUpdate) -> Vec<&'static str> {
        let mut out = Vec::new();
        if update.status.is_some() {
            out.push("status");
        }
        if update.assigned_to.is_some() {
            out.push("assigned_to");
        }
        if update.pr_url.is_some() {
            out.push("pr_url");
        }
        if update.branch.is_some() {
            out.push("branch");
        }
        if update.result_summary.is_some() {
            out.push("result_summary");
        }
        out
    }

    proptest! {
        /// `getReady`'s ordering invariant (§8 "Priority order") holds for any
        /// arrangement of priorities, not just a hand-picked sample.
        #[test]
        fn sorted_priorities_are_always_urgent_first(
            mut priorities in proptest::collection::vec(priority_strategy(), 0..16),
        ) {
            let original_min = priorities.iter().copied().min();
            priorities.sort();
            for pair in priorities.windows(2) {
                prop_assert!(pair[0].rank() <= pair[1].rank());
            }
            prop_assert_eq!(priorities.first().copied(), original_min);
        }

        /// Every field a typed `TaskUpdate` can touch names a column on the
        /// whitelist the store's update path is built against (§9).
        #[test]
        fn task_update_fields_are_all_whitelisted(
            touch_status in any::<bool>(),
            touch_assigned in any::<bool>(),
            touch_pr_url in any::<bool>(),
            touch_branch in any::<bool>(),
            touch_result_summary in any::<bool>(),
        ) {
            let update = TaskUpdate {
                status: touch_status.then_some(TaskStatus::Ready),
                assigned_to: touch_assigned.then_some(None),
                pr_url: touch_pr_url.then_some("x".to_string()),
                branch: touch_branch.then_some("x".to_string()),
                result_summary: touch_result_summary.then_some("x".to_string()),
            };
            for name in touched_columns(&update) {
                prop_assert!(TASK_COLUMNS.contains(&name));
            }
        }
    }
}
