//! Process supervisor: the narrow interface the allocator and watchdog use
//! to manage worker sentinel processes (§4.7), plus a `tmux`-backed and a
//! no-op implementation.
//!
//! Grounded in the teacher's `zjj-core::zellij` module: argument-vector
//! `tokio::process::Command` invocations, `.output()` + exit-status check,
//! stderr surfaced in the error message.

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::{Error, Result};

/// A narrow interface over whatever terminal multiplexer or process group
/// facility actually launches and tracks worker sentinels. Every operation
/// either succeeds or reports a failure the caller treats as non-fatal
/// (logged and retried on the next tick).
#[async_trait]
pub trait ProcessSupervisor: Send + Sync {
    async fn has_window(&self, name: &str) -> bool;
    async fn create_window(&self, name: &str, command: &str, cwd: &str) -> Result<()>;
    async fn send_keys(&self, name: &str, keys: &str) -> Result<()>;
    async fn is_alive(&self, name: &str) -> bool;
    async fn capture_pane(&self, name: &str, lines: u32) -> Result<String>;
    async fn kill_window(&self, name: &str) -> Result<()>;
    async fn kill_session(&self) -> Result<()>;
}

/// Shells out to `tmux`, one session per coordinator instance and one
/// window per worker.
pub struct TmuxSupervisor {
    session: String,
}

impl TmuxSupervisor {
    #[must_use]
    pub fn new(session: impl Into<String>) -> Self {
        Self {
            session: session.into(),
        }
    }

    fn target(&self, window: &str) -> String {
        format!("{}:{window}", self.session)
    }

    async fn run(&self, args: &[&str]) -> Result<std::process::Output> {
        Command::new("tmux")
            .args(args)
            .output()
            .await
            .map_err(|e| Error::config(format!("failed to execute tmux: {e}")))
    }
}

#[async_trait]
impl ProcessSupervisor for TmuxSupervisor {
    async fn has_window(&self, name: &str) -> bool {
        self.run(&["list-windows", "-t", &self.session, "-F", "#{window_name}"])
            .await
            .is_ok_and(|out| {
                out.status.success()
                    && String::from_utf8_lossy(&out.stdout)
                        .lines()
                        .any(|line| line == name)
            })
    }

    async fn create_window(&self, name: &str, command: &str, cwd: &str) -> Result<()> {
        let output = self
            .run(&[
                "new-window", "-d", "-t", &self.session, "-n", name, "-c", cwd, command,
            ])
            .await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(Error::config(format!(
                "tmux new-window failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )))
        }
    }

    async fn send_keys(&self, name: &str, keys: &str) -> Result<()> {
        let target = self.target(name);
        let output = self.run(&["send-keys", "-t", &target, keys, "Enter"]).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(Error::config(format!(
                "tmux send-keys failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )))
        }
    }

    async fn is_alive(&self, name: &str) -> bool {
        self.has_window(name).await
    }

    async fn capture_pane(&self, name: &str, lines: u32) -> Result<String> {
        let target = self.target(name);
        let start = format!("-{lines}");
        let output = self
            .run(&["capture-pane", "-p", "-t", &target, "-S", &start])
            .await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(Error::config(format!(
                "tmux capture-pane failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )))
        }
    }

    async fn kill_window(&self, name: &str) -> Result<()> {
        let target = self.target(name);
        let output = self.run(&["kill-window", "-t", &target]).await?;
        if output.status.success() || !self.has_window(name).await {
            Ok(())
        } else {
            Err(Error::config(format!(
                "tmux kill-window failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )))
        }
    }

    async fn kill_session(&self) -> Result<()> {
        let output = self.run(&["kill-session", "-t", &self.session]).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(Error::config(format!(
                "tmux kill-session failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )))
        }
    }
}

/// No-op supervisor for tests and deployments where sentinel processes are
/// managed externally. Every window is reported alive once "created".
#[derive(Debug, Default)]
pub struct NullSupervisor {
    windows: std::sync::Mutex<std::collections::HashSet<String>>,
}

impl NullSupervisor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProcessSupervisor for NullSupervisor {
    async fn has_window(&self, name: &str) -> bool {
        self.windows
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(name)
    }

    async fn create_window(&self, name: &str, _command: &str, _cwd: &str) -> Result<()> {
        self.windows
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string());
        Ok(())
    }

    async fn send_keys(&self, _name: &str, _keys: &str) -> Result<()> {
        Ok(())
    }

    async fn is_alive(&self, name: &str) -> bool {
        self.has_window(name).await
    }

    async fn capture_pane(&self, _name: &str, _lines: u32) -> Result<String> {
        Ok(String::new())
    }

    async fn kill_window(&self, name: &str) -> Result<()> {
        self.windows
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name);
        Ok(())
    }

    async fn kill_session(&self) -> Result<()> {
        self.windows.lock().unwrap_or_else(|e| e.into_inner()).clear();
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_supervisor_tracks_window_lifecycle() {
        let sup = NullSupervisor::new();
        assert!(!sup.has_window("worker-1").await);

        sup.create_window("worker-1", "claude", "/tmp").await.expect("create");
        assert!(sup.has_window("worker-1").await);
        assert!(sup.is_alive("worker-1").await);

        sup.kill_window("worker-1").await.expect("kill");
        assert!(!sup.has_window("worker-1").await);
    }
}
