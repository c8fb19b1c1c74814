//! The Activity log entity: append-only audit trail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::ActivityLogId;

/// One append-only audit entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityLogEntry {
    pub id: ActivityLogId,
    pub actor: String,
    pub action: String,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Fields accepted when appending; `id`/`created_at` are assigned by the Store.
#[derive(Debug, Clone)]
pub struct NewActivityLogEntry {
    pub actor: String,
    pub action: String,
    pub details: serde_json::Value,
}

impl NewActivityLogEntry {
    #[must_use]
    pub fn new(actor: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            actor: actor.into(),
            action: action.into(),
            details: serde_json::Value::Null,
        }
    }

    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

/// Query filter for `Store::activity_query` (§4.1: "query by actor or limit").
///
/// §9's open question on activity-log retention is resolved here: this
/// expansion adopts an age-bound purge (default 30 days), run by the
/// watchdog's hourly mail-purge pass, documented in DESIGN.md.
#[derive(Debug, Clone, Default)]
pub struct ActivityFilter {
    pub actor: Option<String>,
    pub limit: Option<u32>,
}
