//! The Store: an embedded, transactional SQLite-backed key/table store
//! holding every persisted entity named in SPEC_FULL.md §3.
//!
//! Grounded in the teacher's `AgentRegistry` (schema-init-in-`new`, sqlx
//! query builder style, `#[tokio::test]` with an in-memory pool) and its
//! `domain::repository` module (typed repository errors, column whitelists).

mod activity;
mod config_table;
mod fix;
mod mail;
mod merge_queue;
mod requests;
mod tasks;
mod workers;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

/// Bounded busy-wait for write contention (§4.1 default 5s).
const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// The coordination kernel's only shared mutable resource (§5).
///
/// Cheap to clone: wraps a `sqlx::SqlitePool`, itself an `Arc`-backed
/// connection pool, so every component gets its own handle with no
/// process-wide mutable statics (§9).
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if absent) the database file at `path` and run schema
    /// initialization. `path` is typically `<project>/.claude/state/<db>`.
    pub async fn open(path: &std::path::Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))
            .map_err(Error::Database)?
            .create_if_missing(true)
            .busy_timeout(DEFAULT_BUSY_TIMEOUT)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Open a private in-memory database, for tests.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(Error::Database)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS requests (
                id TEXT PRIMARY KEY,
                description TEXT NOT NULL,
                tier INTEGER,
                status TEXT NOT NULL CHECK (status IN (
                    'pending','triaging','executing_tier1','decomposed',
                    'in_progress','integrating','completed','failed'
                )),
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                completed_at TEXT,
                result_summary TEXT
            );

            CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                request_id TEXT NOT NULL REFERENCES requests(id),
                subject TEXT NOT NULL,
                description TEXT NOT NULL,
                domain TEXT,
                files TEXT,
                priority TEXT NOT NULL CHECK (priority IN ('urgent','high','normal','low')),
                tier INTEGER NOT NULL,
                depends_on TEXT NOT NULL DEFAULT '[]',
                assigned_to INTEGER,
                status TEXT NOT NULL CHECK (status IN (
                    'pending','ready','assigned','in_progress','completed','failed','blocked'
                )),
                pr_url TEXT,
                branch TEXT,
                validation TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                result_summary TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
            CREATE INDEX IF NOT EXISTS idx_tasks_request ON tasks(request_id);

            CREATE TABLE IF NOT EXISTS workers (
                id INTEGER PRIMARY KEY,
                status TEXT NOT NULL CHECK (status IN (
                    'idle','assigned','running','busy','completed_task','resetting'
                )),
                current_domain TEXT,
                worktree_path TEXT NOT NULL,
                branch TEXT,
                session_name TEXT,
                window_name TEXT,
                current_task_id INTEGER,
                last_heartbeat TEXT NOT NULL,
                launched_at TEXT NOT NULL,
                tasks_completed INTEGER NOT NULL DEFAULT 0,
                claimed_by TEXT,
                claimed_at TEXT
            );

            CREATE TABLE IF NOT EXISTS mail (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                recipient TEXT NOT NULL,
                mail_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                consumed INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_mail_recipient ON mail(recipient, consumed, id);

            CREATE TABLE IF NOT EXISTS merge_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                request_id TEXT NOT NULL REFERENCES requests(id),
                task_id INTEGER NOT NULL REFERENCES tasks(id),
                pr_url TEXT NOT NULL,
                branch TEXT NOT NULL,
                status TEXT NOT NULL CHECK (status IN (
                    'pending','ready','merging','merged','conflict','failed'
                )),
                priority INTEGER NOT NULL DEFAULT 50,
                created_at TEXT NOT NULL,
                merged_at TEXT,
                error TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_merge_queue_status ON merge_queue(status, priority);

            CREATE TABLE IF NOT EXISTS activity_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                actor TEXT NOT NULL,
                action TEXT NOT NULL,
                details TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_activity_actor ON activity_log(actor);

            CREATE TABLE IF NOT EXISTS config (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            ",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
