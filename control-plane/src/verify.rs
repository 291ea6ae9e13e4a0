//! Verification and acceptance-criteria execution.
//!
//! Both the mission verification command and per-unit acceptance
//! criteria are shell commands run inside the integration workspace with
//! a bounded timeout. Timeouts kill the whole process group and count as
//! failures.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{ControlError, ControlResult};

/// Truncate captured stderr to this many bytes.
const STDERR_MAX_BYTES: usize = 4096;

/// Result of one check command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub name: String,
    pub command: String,
    pub passed: bool,
    pub timed_out: bool,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub stderr_excerpt: Option<String>,
}

impl CheckOutcome {
    fn failure_detail(&self) -> String {
        if self.timed_out {
            format!("`{}` timed out", self.command)
        } else {
            format!(
                "`{}` exited {}: {}",
                self.command,
                self.exit_code.map_or("?".to_string(), |c| c.to_string()),
                self.stderr_excerpt.as_deref().unwrap_or("")
            )
        }
    }
}

/// Result of running a unit's acceptance criteria sequentially.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriteriaOutcome {
    pub outcomes: Vec<CheckOutcome>,
    pub all_passed: bool,
    /// Command of the first failing criterion, if any.
    pub first_failure: Option<String>,
}

/// Runs check commands in a fixed working directory.
#[derive(Debug, Clone)]
pub struct CheckRunner {
    working_dir: PathBuf,
}

impl CheckRunner {
    pub fn new(working_dir: impl AsRef<Path>) -> Self {
        Self {
            working_dir: working_dir.as_ref().to_path_buf(),
        }
    }

    /// Run one shell command with a timeout.
    ///
    /// Spawn failures come back as failed outcomes, not errors: a missing
    /// binary fails verification the same way a red test does.
    pub async fn run_check(
        &self,
        name: &str,
        command: &str,
        timeout: Duration,
    ) -> ControlResult<CheckOutcome> {
        let start = Instant::now();
        let argv = shlex::split(command)
            .ok_or_else(|| ControlError::config(format!("unparseable check command: {command}")))?;
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| ControlError::config(format!("empty check command for {name}")))?;

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .current_dir(&self.working_dir)
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let outcome = match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(Ok(output)) => {
                let passed = output.status.success();
                CheckOutcome {
                    name: name.to_string(),
                    command: command.to_string(),
                    passed,
                    timed_out: false,
                    exit_code: output.status.code(),
                    duration_ms: start.elapsed().as_millis() as u64,
                    stderr_excerpt: if passed {
                        None
                    } else {
                        Some(truncate_bytes(&output.stderr))
                    },
                }
            }
            Ok(Err(e)) => CheckOutcome {
                name: name.to_string(),
                command: command.to_string(),
                passed: false,
                timed_out: false,
                exit_code: None,
                duration_ms: start.elapsed().as_millis() as u64,
                stderr_excerpt: Some(format!("failed to execute: {e}")),
            },
            Err(_) => CheckOutcome {
                name: name.to_string(),
                command: command.to_string(),
                passed: false,
                timed_out: true,
                exit_code: None,
                duration_ms: start.elapsed().as_millis() as u64,
                stderr_excerpt: Some(format!("timed out after {}s", timeout.as_secs())),
            },
        };

        info!(
            check = name,
            passed = outcome.passed,
            duration_ms = outcome.duration_ms,
            "check finished"
        );
        Ok(outcome)
    }

    /// Run acceptance criteria in order, stopping at the first failure.
    pub async fn run_criteria(
        &self,
        criteria: &[String],
        timeout: Duration,
    ) -> ControlResult<CriteriaOutcome> {
        let mut outcomes = Vec::with_capacity(criteria.len());
        let mut first_failure = None;

        for (idx, criterion) in criteria.iter().enumerate() {
            let outcome = self
                .run_check(&format!("criterion-{idx}"), criterion, timeout)
                .await?;
            let failed = !outcome.passed;
            if failed && first_failure.is_none() {
                first_failure = Some(outcome.failure_detail());
            }
            outcomes.push(outcome);
            if failed {
                break;
            }
        }

        Ok(CriteriaOutcome {
            all_passed: first_failure.is_none(),
            first_failure,
            outcomes,
        })
    }
}

fn truncate_bytes(bytes: &[u8]) -> String {
    let s = String::from_utf8_lossy(bytes);
    if s.len() <= STDERR_MAX_BYTES {
        return s.to_string();
    }
    let mut end = STDERR_MAX_BYTES;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...[truncated at {} bytes]", &s[..end], s.len())
}
