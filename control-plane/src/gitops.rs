//! Async git plumbing for the integration plane.
//!
//! Every call runs `git` in a fixed working directory with a bounded
//! timeout, killing the whole process group on expiry. Transient
//! failures (index locks, concurrent git processes) retry with
//! exponential backoff.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ControlError, ControlResult};

/// Default number of retry attempts for transient failures
const DEFAULT_MAX_RETRIES: u32 = 3;

/// Base delay between retries in milliseconds
const RETRY_BASE_DELAY_MS: u64 = 100;

/// Default per-command timeout in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// Git command runner bound to one working directory.
#[derive(Debug, Clone)]
pub struct GitRunner {
    working_dir: PathBuf,
    max_retries: u32,
    timeout: Duration,
}

impl GitRunner {
    /// Create a runner for `working_dir`.
    pub fn new(working_dir: impl AsRef<Path>) -> Self {
        Self {
            working_dir: working_dir.as_ref().to_path_buf(),
            max_retries: DEFAULT_MAX_RETRIES,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    /// Override the per-command timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Override the retry count.
    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Directory the runner operates in.
    pub fn dir(&self) -> &Path {
        &self.working_dir
    }

    /// Run git and return trimmed stdout, erroring on non-zero exit.
    pub async fn run(&self, args: &[&str]) -> ControlResult<String> {
        let output = self.output(args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ControlError::git(args.join(" "), stderr.trim().to_string()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Run git and return the raw output regardless of exit status.
    pub async fn output(&self, args: &[&str]) -> ControlResult<std::process::Output> {
        let mut cmd = tokio::process::Command::new("git");
        cmd.args(args)
            .current_dir(&self.working_dir)
            .kill_on_drop(true);
        // Own process group so a timeout kill takes descendants with it.
        #[cfg(unix)]
        cmd.process_group(0);

        match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(ControlError::git("spawn", e.to_string())),
            Err(_) => Err(ControlError::Timeout {
                what: format!("git {}", args.first().copied().unwrap_or("")),
                seconds: self.timeout.as_secs(),
            }),
        }
    }

    /// Run git with automatic retry for transient failures.
    ///
    /// Backoff doubles per attempt: 100ms, 200ms, 400ms.
    pub async fn run_with_retry(&self, args: &[&str]) -> ControlResult<String> {
        let mut last_error = None;

        for attempt in 0..=self.max_retries {
            match self.run(args).await {
                Ok(output) => return Ok(output),
                Err(e) => {
                    if e.is_retryable() && attempt < self.max_retries {
                        let delay = RETRY_BASE_DELAY_MS * (1 << attempt);
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                        last_error = Some(e);
                    } else {
                        return Err(e);
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| ControlError::git("retry", "max retries exceeded")))
    }

    /// Resolve a ref to its full sha.
    pub async fn rev_parse(&self, reference: &str) -> ControlResult<String> {
        self.run(&["rev-parse", "--verify", reference]).await
    }

    /// Resolve a ref, returning `None` when it does not exist.
    pub async fn rev_parse_opt(&self, reference: &str) -> ControlResult<Option<String>> {
        let output = self
            .output(&["rev-parse", "--verify", "--quiet", reference])
            .await?;
        if output.status.success() {
            Ok(Some(
                String::from_utf8_lossy(&output.stdout).trim().to_string(),
            ))
        } else {
            Ok(None)
        }
    }

    /// Whether `ancestor` is an ancestor of (or equal to) `descendant`.
    pub async fn is_ancestor(&self, ancestor: &str, descendant: &str) -> ControlResult<bool> {
        let output = self
            .output(&["merge-base", "--is-ancestor", ancestor, descendant])
            .await?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(ControlError::git(
                "merge-base --is-ancestor",
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            )),
        }
    }

    /// Whether the working tree has uncommitted or untracked changes.
    pub async fn has_uncommitted_changes(&self) -> ControlResult<bool> {
        let status = self.run(&["status", "--porcelain"]).await?;
        Ok(!status.is_empty())
    }

    /// Hard-reset the working tree to `reference`.
    pub async fn reset_hard(&self, reference: &str) -> ControlResult<()> {
        self.run_with_retry(&["reset", "--hard", reference]).await?;
        Ok(())
    }

    /// Remove untracked files and directories.
    pub async fn clean_untracked(&self) -> ControlResult<()> {
        self.run_with_retry(&["clean", "-fd"]).await?;
        Ok(())
    }

    /// Point `reference` at `sha` without touching the working tree.
    pub async fn update_ref(&self, reference: &str, sha: &str) -> ControlResult<()> {
        self.run_with_retry(&["update-ref", reference, sha]).await?;
        Ok(())
    }

    /// Fetch `refspec` from `remote` (a remote name or a path).
    pub async fn fetch(&self, remote: &str, refspec: &str) -> ControlResult<()> {
        self.run_with_retry(&["fetch", "--quiet", remote, refspec])
            .await?;
        Ok(())
    }

    /// Added plus removed line count between two commits.
    pub async fn diff_lines(&self, from: &str, to: &str) -> ControlResult<usize> {
        let output = self.run(&["diff", "--numstat", from, to]).await?;
        Ok(output.lines().fold(0, |acc, line| {
            let mut parts = line.split('\t');
            let added: usize = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
            let removed: usize = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
            acc + added + removed
        }))
    }

    /// File paths changed between two commits.
    pub async fn changed_files(&self, from: &str, to: &str) -> ControlResult<Vec<String>> {
        let output = self.run(&["diff", "--name-only", from, to]).await?;
        Ok(output
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Full diff text between two commits.
    pub async fn diff_text(&self, from: &str, to: &str) -> ControlResult<String> {
        self.run(&["diff", from, to]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use tempfile::tempdir;

    fn setup_repo() -> (tempfile::TempDir, GitRunner) {
        let dir = tempdir().unwrap();
        for args in [
            vec!["init"],
            vec!["config", "user.email", "test@test.com"],
            vec!["config", "user.name", "Test"],
        ] {
            Command::new("git")
                .args(&args)
                .current_dir(dir.path())
                .output()
                .unwrap();
        }
        std::fs::write(dir.path().join("README.md"), "# test").unwrap();
        Command::new("git")
            .args(["add", "."])
            .current_dir(dir.path())
            .output()
            .unwrap();
        Command::new("git")
            .args(["commit", "-m", "initial"])
            .current_dir(dir.path())
            .output()
            .unwrap();

        let runner = GitRunner::new(dir.path());
        (dir, runner)
    }

    #[tokio::test]
    async fn test_rev_parse_head() {
        let (_dir, git) = setup_repo();
        let sha = git.rev_parse("HEAD").await.unwrap();
        assert_eq!(sha.len(), 40);
    }

    #[tokio::test]
    async fn test_rev_parse_opt_missing_ref() {
        let (_dir, git) = setup_repo();
        assert!(git
            .rev_parse_opt("refs/heads/nope")
            .await
            .unwrap()
            .is_none());
        assert!(git.rev_parse_opt("HEAD").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_is_ancestor() {
        let (dir, git) = setup_repo();
        let first = git.rev_parse("HEAD").await.unwrap();

        std::fs::write(dir.path().join("next.txt"), "more").unwrap();
        git.run(&["add", "."]).await.unwrap();
        git.run(&["commit", "-m", "second"]).await.unwrap();
        let second = git.rev_parse("HEAD").await.unwrap();

        assert!(git.is_ancestor(&first, &second).await.unwrap());
        assert!(!git.is_ancestor(&second, &first).await.unwrap());
    }

    #[tokio::test]
    async fn test_uncommitted_changes_and_clean() {
        let (dir, git) = setup_repo();
        assert!(!git.has_uncommitted_changes().await.unwrap());

        std::fs::write(dir.path().join("scratch.txt"), "dirty").unwrap();
        assert!(git.has_uncommitted_changes().await.unwrap());

        git.clean_untracked().await.unwrap();
        assert!(!git.has_uncommitted_changes().await.unwrap());
    }

    #[tokio::test]
    async fn test_reset_hard_restores_state() {
        let (dir, git) = setup_repo();
        let base = git.rev_parse("HEAD").await.unwrap();

        std::fs::write(dir.path().join("README.md"), "changed").unwrap();
        git.run(&["add", "."]).await.unwrap();
        git.run(&["commit", "-m", "edit"]).await.unwrap();
        assert_ne!(git.rev_parse("HEAD").await.unwrap(), base);

        git.reset_hard(&base).await.unwrap();
        assert_eq!(git.rev_parse("HEAD").await.unwrap(), base);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("README.md")).unwrap(),
            "# test"
        );
    }

    #[tokio::test]
    async fn test_diff_lines_and_changed_files() {
        let (dir, git) = setup_repo();
        let base = git.rev_parse("HEAD").await.unwrap();

        std::fs::write(dir.path().join("a.txt"), "one\ntwo\n").unwrap();
        git.run(&["add", "."]).await.unwrap();
        git.run(&["commit", "-m", "add a"]).await.unwrap();
        let head = git.rev_parse("HEAD").await.unwrap();

        assert_eq!(git.diff_lines(&base, &head).await.unwrap(), 2);
        assert_eq!(git.changed_files(&base, &head).await.unwrap(), vec!["a.txt"]);
    }

    #[tokio::test]
    async fn test_update_ref_creates_branch() {
        let (_dir, git) = setup_repo();
        let head = git.rev_parse("HEAD").await.unwrap();
        git.update_ref("refs/heads/mc/working", &head).await.unwrap();
        assert_eq!(
            git.rev_parse_opt("refs/heads/mc/working").await.unwrap(),
            Some(head)
        );
    }

    #[tokio::test]
    async fn test_failed_command_reports_operation() {
        let (_dir, git) = setup_repo();
        let err = git.run(&["merge", "no-such-branch"]).await.unwrap_err();
        match err {
            ControlError::Git { operation, .. } => assert!(operation.contains("merge")),
            other => panic!("expected git error, got {other:?}"),
        }
    }
}
