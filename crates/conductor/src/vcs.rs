//! Version-control subprocess helpers the merger shells out to: `gh` for the
//! merge itself, `git` for the rebase-and-retry escalation tier (§4.6).
//!
//! Grounded in the same argument-vector `tokio::process::Command` discipline
//! as `supervisor::TmuxSupervisor`: every input is validated against an
//! allow-list regex before it reaches a process argument, never interpolated
//! into a shell string.

use conductor_core::config::{branch_regex, pr_url_regex};

use crate::error::{Error, Result};

async fn run(program: &str, args: &[&str]) -> Result<std::process::Output> {
    tokio::process::Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| Error::config(format!("failed to execute {program}: {e}")))
}

fn check_output(program: &str, output: std::process::Output) -> Result<()> {
    if output.status.success() {
        Ok(())
    } else {
        Err(Error::Core(conductor_core::Error::transient_subprocess(format!(
            "{program} failed: {}",
            String::from_utf8_lossy(&output.stderr)
        ))))
    }
}

/// Merge a pull request and delete its source branch via `gh pr merge`.
/// `pr_url` and `branch` are both validated against their allow-lists first.
pub async fn merge_pr(pr_url: &str, branch: &str) -> Result<()> {
    if !pr_url_regex().is_match(pr_url) {
        return Err(Error::Core(conductor_core::Error::invalid_input("pr_url failed validation")));
    }
    if !branch_regex().is_match(branch) {
        return Err(Error::Core(conductor_core::Error::invalid_input("branch failed validation")));
    }

    let output = run("gh", &["pr", "merge", pr_url, "--merge", "--delete-branch"]).await?;
    check_output("gh pr merge", output)
}

/// Rebase `branch` onto the default branch's latest and force-push with
/// lease, the tier-2 conflict-resolution escalation step.
pub async fn rebase_and_push(branch: &str) -> Result<()> {
    if !branch_regex().is_match(branch) {
        return Err(Error::Core(conductor_core::Error::invalid_input("branch failed validation")));
    }

    check_output("git fetch", run("git", &["fetch", "origin"]).await?)?;
    check_output("git checkout", run("git", &["checkout", branch]).await?)?;
    check_output("git rebase", run("git", &["rebase", "origin/HEAD"]).await?)?;
    check_output(
        "git push",
        run("git", &["push", "--force-with-lease", "origin", branch]).await?,
    )
}
