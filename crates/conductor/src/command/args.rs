//! Typed argument structs for every command in the catalog (§4.3). Only the
//! dispatcher ever sees these; unknown keys in a caller's JSON are silently
//! dropped by serde's default (non-`deny_unknown_fields`) behavior, which is
//! all the "unknown keys are stripped" requirement needs.

use conductor_core::ValidationDescriptor;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct RequestArgs {
    pub description: String,
}

#[derive(Debug, Deserialize)]
pub struct FixArgs {
    pub description: String,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub files: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct StatusArgs {
    pub request_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ClarifyArgs {
    pub request_id: String,
    pub reply: String,
}

#[derive(Debug, Deserialize)]
pub struct LogArgs {
    pub actor: String,
    pub action: String,
    #[serde(default)]
    pub details: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct TriageArgs {
    pub request_id: String,
    pub tier: u8,
}

#[derive(Debug, Deserialize)]
pub struct CreateTaskArgs {
    pub request_id: String,
    pub subject: String,
    pub description: String,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub files: Option<Vec<String>>,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub tier: Option<u8>,
    #[serde(default)]
    pub depends_on: Vec<i64>,
    #[serde(default)]
    pub validation: Option<ValidationDescriptor>,
}

#[derive(Debug, Deserialize)]
pub struct Tier1CompleteArgs {
    pub request_id: String,
    pub summary: String,
}

#[derive(Debug, Deserialize)]
pub struct AskClarificationArgs {
    pub request_id: String,
    pub question: String,
}

#[derive(Debug, Deserialize)]
pub struct MyTaskArgs {
    pub worker_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct StartTaskArgs {
    pub worker_id: i64,
    pub task_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatArgs {
    pub worker_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct CompleteTaskArgs {
    pub worker_id: i64,
    pub task_id: i64,
    pub pr_url: String,
    pub branch: String,
    #[serde(default)]
    pub result_summary: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct FailTaskArgs {
    pub worker_id: i64,
    pub task_id: i64,
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct InboxArgs {
    pub recipient: String,
}

#[derive(Debug, Deserialize)]
pub struct InboxBlockArgs {
    pub recipient: String,
    #[serde(default)]
    pub deadline_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct AssignTaskArgs {
    pub task_id: i64,
    pub worker_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct ClaimWorkerArgs {
    pub worker_id: i64,
    pub claimant: String,
}

#[derive(Debug, Deserialize)]
pub struct ReleaseWorkerArgs {
    pub worker_id: i64,
    pub claimant: String,
}

#[derive(Debug, Deserialize)]
pub struct CheckCompletionArgs {
    pub request_id: String,
}

#[derive(Debug, Deserialize)]
pub struct RegisterWorkerArgs {
    pub worker_id: i64,
    pub worktree_path: String,
}
