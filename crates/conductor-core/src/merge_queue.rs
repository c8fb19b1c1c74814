//! The Merge queue entity: one row per completed PR awaiting integration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::ids::{MergeQueueEntryId, RequestId, TaskId};

/// Lifecycle status of a merge queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MergeQueueStatus {
    Pending,
    Ready,
    Merging,
    Merged,
    Conflict,
    Failed,
}

impl MergeQueueStatus {
    /// Once `merged`, the entry is terminal (§3 invariant).
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Merged)
    }

    pub const ALL: &'static [Self] = &[
        Self::Pending,
        Self::Ready,
        Self::Merging,
        Self::Merged,
        Self::Conflict,
        Self::Failed,
    ];
}

/// One completed PR awaiting integration into the mainline branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeQueueEntry {
    pub id: MergeQueueEntryId,
    pub request_id: RequestId,
    pub task_id: TaskId,
    pub pr_url: String,
    pub branch: String,
    pub status: MergeQueueStatus,
    pub priority: i64,
    pub created_at: DateTime<Utc>,
    pub merged_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl MergeQueueEntry {
    /// Priority assigned at enqueue time: urgent tasks sort ahead of others
    /// (§4.6: "priorities break ties at enqueue time, not at merge time").
    #[must_use]
    pub fn priority_for(task_priority: crate::task::TaskPriority) -> i64 {
        match task_priority {
            crate::task::TaskPriority::Urgent => 100,
            crate::task::TaskPriority::High => 75,
            crate::task::TaskPriority::Normal => 50,
            crate::task::TaskPriority::Low => 25,
        }
    }
}

/// Nullable-field options record for `Store::merge_queue_update` (see §9).
#[derive(Debug, Clone, Default)]
pub struct MergeQueueUpdate {
    pub status: Option<MergeQueueStatus>,
    pub merged_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl MergeQueueUpdate {
    #[must_use]
    pub fn merged(at: DateTime<Utc>) -> Self {
        Self {
            status: Some(MergeQueueStatus::Merged),
            merged_at: Some(at),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: Some(MergeQueueStatus::Failed),
            error: Some(error.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn conflict(error: impl Into<String>) -> Self {
        Self {
            status: Some(MergeQueueStatus::Conflict),
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// Column whitelist for `merge_queue`, checked by every update path.
pub const MERGE_QUEUE_COLUMNS: &[&str] = &["status", "merged_at", "error"];

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::task::TaskPriority;

    #[test]
    fn urgent_outranks_low_priority() {
        assert!(
            MergeQueueEntry::priority_for(TaskPriority::Urgent)
                > MergeQueueEntry::priority_for(TaskPriority::Low)
        );
    }

    #[test]
    fn only_merged_is_terminal() {
        assert!(MergeQueueStatus::Merged.is_terminal());
        assert!(!MergeQueueStatus::Conflict.is_terminal());
        assert!(!MergeQueueStatus::Failed.is_terminal());
    }
}
