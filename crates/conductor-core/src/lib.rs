//! Conductor-core - coordination kernel domain types and state machines
//!
//! This crate holds the typed entities (Request, Task, Worker, Mail,
//! MergeQueueEntry, ActivityLogEntry, Config), their status enums and
//! invariant-bearing helper methods, and the error taxonomy. It has no I/O:
//! persistence, the command surface, and the periodic loops live in the
//! `conductor` binary crate.

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod activity;
pub mod config;
pub mod error;
pub mod ids;
pub mod mail;
pub mod merge_queue;
pub mod request;
pub mod task;
pub mod worker;

pub use activity::{ActivityFilter, ActivityLogEntry, NewActivityLogEntry};
pub use config::{Config, PartialConfig};
pub use error::{Error, Result};
pub use ids::{ActivityLogId, MailId, MergeQueueEntryId, RequestId, TaskId, WorkerId};
pub use mail::{MailMessage, MailPayload, MailType, Recipient};
pub use merge_queue::{MergeQueueEntry, MergeQueueStatus, MergeQueueUpdate};
pub use request::{Request, RequestStatus, RequestTier, RequestUpdate};
pub use task::{NewTask, Task, TaskFilter, TaskPriority, TaskStatus, TaskUpdate, ValidationDescriptor};
pub use worker::{HeartbeatTier, HeartbeatThresholds, Worker, WorkerStatus, WorkerUpdate};
