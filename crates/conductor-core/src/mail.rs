//! The Mail bus entity: durable, recipient-addressed, read-once messages.
//!
//! §9 flags duck-typed JSON payloads for replacement with tagged variants.
//! [`MailPayload`] is that replacement, with one variant per row of the
//! §4.2 message-type table; only the command surface deals in untyped
//! `serde_json::Value`, at its own request/response boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::ids::{MailId, RequestId, TaskId};

/// Well-known mailbox recipients. Worker recipients are `worker-N`, addressed
/// by [`Recipient::worker`] since the fleet size is configurable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Recipient {
    Architect,
    Allocator,
    MasterN(u32),
    Worker(i64),
}

impl Recipient {
    #[must_use]
    pub fn worker(id: crate::ids::WorkerId) -> Self {
        Self::Worker(id.get())
    }

    #[must_use]
    pub fn master(n: u32) -> Self {
        Self::MasterN(n)
    }

    #[must_use]
    pub fn as_key(&self) -> String {
        match self {
            Self::Architect => "architect".to_string(),
            Self::Allocator => "allocator".to_string(),
            Self::MasterN(n) => format!("master-{n}"),
            Self::Worker(n) => format!("worker-{n}"),
        }
    }
}

impl std::fmt::Display for Recipient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_key())
    }
}

/// The enumerated mail type names from the §4.2 contract table, stored as
/// the row's `type` discriminator column alongside the typed JSON payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MailType {
    NewRequest,
    ClarificationReply,
    ClarificationAsk,
    TasksReady,
    TasksAvailable,
    TaskAssigned,
    TaskCompleted,
    TaskFailed,
    Nudge,
    RequestCompleted,
    RequestAcknowledged,
    Heartbeat,
    Terminate,
}

/// One tagged variant per row of the §4.2 message-type table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MailPayload {
    NewRequest { request_id: RequestId },
    ClarificationReply { request_id: RequestId, reply: String },
    ClarificationAsk { request_id: RequestId, question: String },
    TasksReady { request_id: RequestId },
    TasksAvailable { ready_count: u64, idle_count: u64 },
    TaskAssigned { task_id: TaskId, request_id: RequestId },
    TaskCompleted { task_id: TaskId, request_id: RequestId },
    TaskFailed { task_id: TaskId, request_id: RequestId, reason: String },
    Nudge { task_id: Option<TaskId>, message: String },
    RequestCompleted { request_id: RequestId, summary: String },
    RequestAcknowledged { request_id: RequestId },
    Heartbeat,
    Terminate { reason: String },
}

impl MailPayload {
    #[must_use]
    pub fn mail_type(&self) -> MailType {
        match self {
            Self::NewRequest { .. } => MailType::NewRequest,
            Self::ClarificationReply { .. } => MailType::ClarificationReply,
            Self::ClarificationAsk { .. } => MailType::ClarificationAsk,
            Self::TasksReady { .. } => MailType::TasksReady,
            Self::TasksAvailable { .. } => MailType::TasksAvailable,
            Self::TaskAssigned { .. } => MailType::TaskAssigned,
            Self::TaskCompleted { .. } => MailType::TaskCompleted,
            Self::TaskFailed { .. } => MailType::TaskFailed,
            Self::Nudge { .. } => MailType::Nudge,
            Self::RequestCompleted { .. } => MailType::RequestCompleted,
            Self::RequestAcknowledged { .. } => MailType::RequestAcknowledged,
            Self::Heartbeat => MailType::Heartbeat,
            Self::Terminate { .. } => MailType::Terminate,
        }
    }
}

/// A durable, recipient-addressed, read-once message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailMessage {
    pub id: MailId,
    pub recipient: String,
    pub mail_type: MailType,
    pub payload: MailPayload,
    pub consumed: bool,
    pub created_at: DateTime<Utc>,
}
