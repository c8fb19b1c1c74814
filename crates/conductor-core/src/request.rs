//! The Request entity: a single user intention.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::ids::RequestId;

/// Triage class assigned to a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestTier {
    /// Architect executes directly, no tasks.
    Tier1 = 1,
    /// Exactly one task.
    Tier2 = 2,
    /// Many tasks.
    Tier3 = 3,
}

impl RequestTier {
    #[must_use]
    pub const fn as_i64(self) -> i64 {
        self as i64
    }

    #[must_use]
    pub const fn from_i64(value: i64) -> Option<Self> {
        match value {
            1 => Some(Self::Tier1),
            2 => Some(Self::Tier2),
            3 => Some(Self::Tier3),
            _ => None,
        }
    }
}

/// Lifecycle status of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Triaging,
    ExecutingTier1,
    Decomposed,
    InProgress,
    Integrating,
    Completed,
    Failed,
}

impl RequestStatus {
    /// A request in a terminal status never transitions again (§8 monotonic closure).
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// All status values, for CHECK-constraint generation and schema tests.
    pub const ALL: &'static [Self] = &[
        Self::Pending,
        Self::Triaging,
        Self::ExecutingTier1,
        Self::Decomposed,
        Self::InProgress,
        Self::Integrating,
        Self::Completed,
        Self::Failed,
    ];
}

/// A single user intention, possibly decomposed into many tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub description: String,
    pub tier: Option<RequestTier>,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result_summary: Option<String>,
}

impl Request {
    /// Build a brand-new request in `pending`, as created by the `request` command.
    #[must_use]
    pub fn new(description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: RequestId::generate(),
            description: description.into(),
            tier: None,
            status: RequestStatus::Pending,
            created_at: now,
            updated_at: now,
            completed_at: None,
            result_summary: None,
        }
    }

    /// Build the request half of the atomic `fix` command: tier 2, already `decomposed`.
    #[must_use]
    pub fn new_fix(description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: RequestId::generate(),
            description: description.into(),
            tier: Some(RequestTier::Tier2),
            status: RequestStatus::Decomposed,
            created_at: now,
            updated_at: now,
            completed_at: None,
            result_summary: None,
        }
    }
}

/// Nullable-field options record for `Store::requests_update`, replacing the
/// dynamic string-keyed column path with a typed updater (see §9).
#[derive(Debug, Clone, Default)]
pub struct RequestUpdate {
    pub tier: Option<RequestTier>,
    pub status: Option<RequestStatus>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result_summary: Option<String>,
}

impl RequestUpdate {
    #[must_use]
    pub fn status(status: RequestStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

/// Column whitelist for `requests`, checked by every update path.
pub const REQUEST_COLUMNS: &[&str] = &[
    "tier",
    "status",
    "completed_at",
    "result_summary",
    "updated_at",
];

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn new_fix_request_is_already_decomposed() {
        let r = Request::new_fix("urgent hotfix");
        assert_eq!(r.tier, Some(RequestTier::Tier2));
        assert_eq!(r.status, RequestStatus::Decomposed);
    }

    #[test]
    fn terminal_statuses() {
        assert!(RequestStatus::Completed.is_terminal());
        assert!(RequestStatus::Failed.is_terminal());
        assert!(!RequestStatus::InProgress.is_terminal());
    }
}
