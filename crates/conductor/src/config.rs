//! Layered configuration loading: defaults → project file → environment →
//! CLI flags, grounded in the teacher's own `ConfigManager`/`PartialConfig`
//! split (see SPEC_FULL.md §6 "Configuration layering").

use conductor_core::config::{validate_config_key, Config, PartialConfig, VALID_CONFIG_KEYS};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// 1 MiB cap on the project config file, mirroring the command surface's own
/// max-request-size discipline (§4.3) so no single ambient concern gets a
/// free pass on input bounds.
const MAX_CONFIG_FILE_SIZE: u64 = 1_048_576;

const ENV_PREFIX: &str = "CONDUCTOR_";

/// CLI-flag overrides accepted by `conductor serve`; all optional so absence
/// never shadows a lower-precedence layer.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub max_workers: Option<u8>,
    pub heartbeat_timeout_s: Option<i64>,
    pub watchdog_interval_ms: Option<u64>,
    pub allocator_interval_ms: Option<u64>,
    pub project_dir: Option<String>,
}

impl CliOverrides {
    fn into_partial(self) -> PartialConfig {
        PartialConfig {
            max_workers: self.max_workers,
            heartbeat_timeout_s: self.heartbeat_timeout_s,
            watchdog_interval_ms: self.watchdog_interval_ms,
            allocator_interval_ms: self.allocator_interval_ms,
            project_dir: self.project_dir,
            merge_validation: None,
            coordinator_version: None,
        }
    }
}

/// Load the effective config for `project_dir`, applying every layer in
/// increasing precedence order and validating the result.
pub fn load_config(project_dir: &Path, cli: CliOverrides) -> Result<Config> {
    let mut config = Config {
        project_dir: project_dir.to_string_lossy().into_owned(),
        ..Config::default()
    };

    if let Some(file_partial) = read_project_config_file(project_dir)? {
        config = file_partial.apply_onto(config);
    }

    config = env_overrides()?.apply_onto(config);
    config = cli.into_partial().apply_onto(config);

    config
        .validate()
        .map_err(|e| Error::config(e.to_string()))?;

    Ok(config)
}

fn config_file_path(project_dir: &Path) -> PathBuf {
    project_dir.join(".claude").join("state").join("config.toml")
}

/// Database filename under `<project>/.claude/state/` (§6 "Persisted state layout").
pub const DB_FILENAME: &str = "conductor.db";
/// Socket path-hint filename under the same directory.
pub const SOCKET_PATH_HINT_FILENAME: &str = "conductor.sock.path";
/// Single-instance lock filename under the same directory.
pub const LOCK_FILENAME: &str = "conductor.lock";

/// `<project>/.claude/state/conductor.db`, the embedded SQLite file.
#[must_use]
pub fn db_path(project_dir: &Path) -> PathBuf {
    state_dir(project_dir).join(DB_FILENAME)
}

/// `<project>/.claude/state/conductor.sock.path`, a small text file that
/// records wherever the command socket actually lives. The socket itself is
/// not placed under the project directory: a few hosts cap Unix socket path
/// length, and a project directory may sit on a filesystem (e.g. a network
/// mount) that cannot host a socket at all.
#[must_use]
pub fn socket_path_hint_file(project_dir: &Path) -> PathBuf {
    state_dir(project_dir).join(SOCKET_PATH_HINT_FILENAME)
}

/// `<project>/.claude/state/conductor.lock`, held for the process lifetime
/// to prevent two `conductor serve` instances racing on the same project.
#[must_use]
pub fn lock_path(project_dir: &Path) -> PathBuf {
    state_dir(project_dir).join(LOCK_FILENAME)
}

#[must_use]
fn state_dir(project_dir: &Path) -> PathBuf {
    project_dir.join(".claude").join("state")
}

/// Pick a runtime directory for the socket itself: the OS's per-user runtime
/// directory (`XDG_RUNTIME_DIR` on Linux) when available, falling back to
/// the system temp directory.
#[must_use]
pub fn default_socket_dir() -> PathBuf {
    directories::BaseDirs::new()
        .and_then(|dirs| dirs.runtime_dir().map(std::path::Path::to_path_buf))
        .unwrap_or_else(std::env::temp_dir)
}

/// A socket path derived from `project_dir`, stable across restarts of the
/// same project but distinct from any other project's socket.
#[must_use]
pub fn default_socket_path(project_dir: &Path) -> PathBuf {
    default_socket_dir().join(format!("conductor-{}.sock", project_tag(project_dir)))
}

/// The tmux session name for this project, stable across restarts.
#[must_use]
pub fn session_name(project_dir: &Path) -> String {
    format!("conductor-{}", project_tag(project_dir))
}

fn project_tag(project_dir: &Path) -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    project_dir.to_string_lossy().hash(&mut hasher);
    format!("{:x}", hasher.finish())
}

fn read_project_config_file(project_dir: &Path) -> Result<Option<PartialConfig>> {
    let path = config_file_path(project_dir);
    if !path.exists() {
        return Ok(None);
    }

    let metadata = std::fs::symlink_metadata(&path)?;
    if metadata.file_type().is_symlink() {
        return Err(Error::config(format!(
            "refusing to read config file through a symlink: {}",
            path.display()
        )));
    }
    if metadata.len() > MAX_CONFIG_FILE_SIZE {
        return Err(Error::config(format!(
            "config file {} exceeds {MAX_CONFIG_FILE_SIZE} bytes",
            path.display()
        )));
    }

    let raw = std::fs::read_to_string(&path)?;
    validate_toml_keys(&raw)?;
    let partial: PartialConfig =
        toml::from_str(&raw).map_err(|e| Error::config(format!("invalid config.toml: {e}")))?;
    debug!(path = %path.display(), "loaded project config file");
    Ok(Some(partial))
}

/// Reject unknown top-level keys rather than silently ignoring typos,
/// mirroring the teacher's `validate_toml_keys`.
fn validate_toml_keys(raw: &str) -> Result<()> {
    let value: toml::Value =
        toml::from_str(raw).map_err(|e| Error::config(format!("invalid config.toml: {e}")))?;
    let Some(table) = value.as_table() else {
        return Err(Error::config("config.toml must be a table"));
    };
    for key in table.keys() {
        if !VALID_CONFIG_KEYS.contains(&key.as_str()) {
            return Err(Error::config(format!("unknown config key '{key}' in config.toml")));
        }
    }
    Ok(())
}

fn env_overrides() -> Result<PartialConfig> {
    let mut partial = PartialConfig::default();

    if let Some(v) = env_var("MAX_WORKERS")? {
        partial.max_workers = Some(parse_env(&v, "max_workers")?);
    }
    if let Some(v) = env_var("HEARTBEAT_TIMEOUT_S")? {
        partial.heartbeat_timeout_s = Some(parse_env(&v, "heartbeat_timeout_s")?);
    }
    if let Some(v) = env_var("WATCHDOG_INTERVAL_MS")? {
        partial.watchdog_interval_ms = Some(parse_env(&v, "watchdog_interval_ms")?);
    }
    if let Some(v) = env_var("ALLOCATOR_INTERVAL_MS")? {
        partial.allocator_interval_ms = Some(parse_env(&v, "allocator_interval_ms")?);
    }
    if let Some(v) = env_var("MERGE_VALIDATION")? {
        partial.merge_validation = Some(parse_env(&v, "merge_validation")?);
    }
    if let Some(v) = env_var("PROJECT_DIR")? {
        partial.project_dir = Some(v);
    }

    Ok(partial)
}

fn env_var(suffix: &str) -> Result<Option<String>> {
    let key = format!("{ENV_PREFIX}{suffix}");
    match std::env::var(&key) {
        Ok(v) => Ok(Some(v)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(std::env::VarError::NotUnicode(_)) => {
            warn!(key, "environment override is not valid UTF-8, ignoring");
            Ok(None)
        }
    }
}

fn parse_env<T: std::str::FromStr>(raw: &str, key: &str) -> Result<T> {
    raw.parse::<T>()
        .map_err(|_| Error::config(format!("invalid value for {ENV_PREFIX}{key}: '{raw}'")))
}

/// Validate a `config set` key against the known surface (§4.3 `Config:` ops).
pub fn validate_key(key: &str) -> Result<()> {
    validate_config_key(key).map_err(|e| Error::config(e.to_string()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_validate_with_absolute_project_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(dir.path(), CliOverrides::default()).expect("load");
        assert_eq!(cfg.max_workers, 4);
    }

    #[test]
    fn project_file_overrides_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state_dir = dir.path().join(".claude").join("state");
        std::fs::create_dir_all(&state_dir).expect("mkdir");
        let mut file = std::fs::File::create(state_dir.join("config.toml")).expect("create");
        writeln!(file, "max_workers = 6").expect("write");

        let cfg = load_config(dir.path(), CliOverrides::default()).expect("load");
        assert_eq!(cfg.max_workers, 6);
    }

    #[test]
    fn unknown_key_in_file_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state_dir = dir.path().join(".claude").join("state");
        std::fs::create_dir_all(&state_dir).expect("mkdir");
        let mut file = std::fs::File::create(state_dir.join("config.toml")).expect("create");
        writeln!(file, "not_a_real_key = 1").expect("write");

        assert!(load_config(dir.path(), CliOverrides::default()).is_err());
    }

    #[test]
    fn cli_override_wins_over_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state_dir = dir.path().join(".claude").join("state");
        std::fs::create_dir_all(&state_dir).expect("mkdir");
        let mut file = std::fs::File::create(state_dir.join("config.toml")).expect("create");
        writeln!(file, "max_workers = 6").expect("write");

        let cli = CliOverrides {
            max_workers: Some(2),
            ..CliOverrides::default()
        };
        let cfg = load_config(dir.path(), cli).expect("load");
        assert_eq!(cfg.max_workers, 2);
    }
}
