//! The Config entity (§3, §6) and the regex allow-lists shared by the Store,
//! the command surface and the merger.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use crate::error::{Error, Result};

/// The coordinator's tunable surface (§6 "Config surface (keys)").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub max_workers: u8,
    pub heartbeat_timeout_s: i64,
    pub watchdog_interval_ms: u64,
    pub allocator_interval_ms: u64,
    pub merge_validation: bool,
    pub project_dir: String,
    pub coordinator_version: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_workers: 4,
            heartbeat_timeout_s: 180,
            watchdog_interval_ms: 10_000,
            allocator_interval_ms: 2_000,
            merge_validation: true,
            project_dir: ".".to_string(),
            coordinator_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl Config {
    /// Validate range/shape constraints not expressible in the type system
    /// alone (`max_workers` 1-8 per §6); called once at startup.
    pub fn validate(&self) -> Result<()> {
        if !(1..=8).contains(&self.max_workers) {
            return Err(Error::fatal(format!(
                "max_workers must be between 1 and 8, got {}",
                self.max_workers
            )));
        }
        if self.heartbeat_timeout_s <= 0 {
            return Err(Error::fatal("heartbeat_timeout_s must be positive"));
        }
        let path_re = project_path_regex();
        if !path_re.is_match(&self.project_dir) {
            return Err(Error::fatal(format!(
                "project_dir '{}' does not match {}",
                self.project_dir,
                path_re.as_str()
            )));
        }
        Ok(())
    }
}

/// A sparse, all-`Option` view of [`Config`] used for file/env layering so an
/// absent key never shadows a lower-precedence layer (§9 "explicit-key merge
/// semantics", grounded in the teacher's own `PartialConfig`).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PartialConfig {
    pub max_workers: Option<u8>,
    pub heartbeat_timeout_s: Option<i64>,
    pub watchdog_interval_ms: Option<u64>,
    pub allocator_interval_ms: Option<u64>,
    pub merge_validation: Option<bool>,
    pub project_dir: Option<String>,
    pub coordinator_version: Option<String>,
}

impl PartialConfig {
    /// Merge `self` on top of `base`, a present key in `self` always wins.
    #[must_use]
    pub fn apply_onto(self, base: Config) -> Config {
        Config {
            max_workers: self.max_workers.unwrap_or(base.max_workers),
            heartbeat_timeout_s: self.heartbeat_timeout_s.unwrap_or(base.heartbeat_timeout_s),
            watchdog_interval_ms: self
                .watchdog_interval_ms
                .unwrap_or(base.watchdog_interval_ms),
            allocator_interval_ms: self
                .allocator_interval_ms
                .unwrap_or(base.allocator_interval_ms),
            merge_validation: self.merge_validation.unwrap_or(base.merge_validation),
            project_dir: self.project_dir.unwrap_or(base.project_dir),
            coordinator_version: self
                .coordinator_version
                .unwrap_or(base.coordinator_version),
        }
    }
}

/// The dot-notation keys accepted by `config get`/`config set`-style tooling.
pub const VALID_CONFIG_KEYS: &[&str] = &[
    "max_workers",
    "heartbeat_timeout_s",
    "watchdog_interval_ms",
    "allocator_interval_ms",
    "merge_validation",
    "project_dir",
    "coordinator_version",
];

pub fn validate_config_key(key: &str) -> Result<()> {
    if VALID_CONFIG_KEYS.contains(&key) {
        Ok(())
    } else {
        Err(Error::invalid_input(format!("unknown config key '{key}'")))
    }
}

fn compiled(cell: &'static OnceLock<Regex>, pattern: &str) -> Regex {
    cell.get_or_init(|| {
        #[allow(clippy::expect_used)]
        Regex::new(pattern).expect("static validation regex must compile")
    })
    .clone()
}

static BRANCH_RE: OnceLock<Regex> = OnceLock::new();
static PR_URL_RE: OnceLock<Regex> = OnceLock::new();
static REPO_SPEC_RE: OnceLock<Regex> = OnceLock::new();
static PROJECT_PATH_RE: OnceLock<Regex> = OnceLock::new();

/// Branch name allow-list: `^[A-Za-z0-9._/-]+$` (§6).
#[must_use]
pub fn branch_regex() -> Regex {
    compiled(&BRANCH_RE, r"^[A-Za-z0-9._/-]+$")
}

/// PR URL allow-list: GitHub pull request URLs only (§6).
#[must_use]
pub fn pr_url_regex() -> Regex {
    compiled(
        &PR_URL_RE,
        r"^https://github\.com/[A-Za-z0-9._-]+/[A-Za-z0-9._-]+/pull/\d+$",
    )
}

/// Repo spec allow-list, used when validating `project_dir`-adjacent config (§6).
#[must_use]
pub fn repo_spec_regex() -> Regex {
    compiled(
        &REPO_SPEC_RE,
        r"^(https?://github\.com/)?[A-Za-z0-9._-]+/[A-Za-z0-9._-]+(\.git)?$",
    )
}

/// Project path allow-list: `^/[A-Za-z0-9._/ -]+$` (§6).
#[must_use]
pub fn project_path_regex() -> Regex {
    compiled(&PROJECT_PATH_RE, r"^/[A-Za-z0-9._/ -]+$")
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid_once_project_dir_is_absolute() {
        let mut cfg = Config::default();
        cfg.project_dir = "/tmp/project".to_string();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn max_workers_out_of_range_is_fatal() {
        let mut cfg = Config::default();
        cfg.project_dir = "/tmp/project".to_string();
        cfg.max_workers = 9;
        assert!(cfg.validate().is_err());
        cfg.max_workers = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn partial_config_only_overrides_present_keys() {
        let base = Config::default();
        let partial = PartialConfig {
            max_workers: Some(6),
            ..PartialConfig::default()
        };
        let merged = partial.apply_onto(base.clone());
        assert_eq!(merged.max_workers, 6);
        assert_eq!(merged.heartbeat_timeout_s, base.heartbeat_timeout_s);
    }

    #[test]
    fn regexes_match_spec_examples() {
        assert!(branch_regex().is_match("feature/x-1.2"));
        assert!(!branch_regex().is_match("main; rm -rf /"));
        assert!(pr_url_regex().is_match("https://github.com/acme/repo/pull/42"));
        assert!(!pr_url_regex().is_match("https://evil.example/x"));
    }
}
