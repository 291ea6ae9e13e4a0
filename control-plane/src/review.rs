//! Post-promotion diff review.
//!
//! Fire-and-forget: a promoted unit's diff goes to an external reviewer
//! command, the response is parsed into alignment/approach/tests scores,
//! and the record lands in the store. Nothing here ever blocks or fails
//! the merge pipeline; review scores only feed re-planning hints.
//!
//! The marker below is the contract between the prompt and the parser.
//! Both sides derive from the one constant; the prompt embeds it as a
//! literal and the parser compiles its matcher from it. Raw output is
//! logged whenever parsing fails.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use tracing::{info, warn};

use crate::store::{ReviewRecord, SharedStore};

/// The single source of the review block marker.
pub const REVIEW_MARKER: &str = "REVIEW_RESULT";

/// Matcher for the review block, compiled from [`REVIEW_MARKER`].
static REVIEW_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?ms)^{}\s*$\s*alignment:\s*(\d+)\s*$\s*approach:\s*(\d+)\s*$\s*tests:\s*(\d+)\s*$(?:\s*notes:\s*(.*))?",
        regex::escape(REVIEW_MARKER)
    ))
    .expect("review block regex")
});

/// Instructions handed to the reviewer ahead of the diff, built from the
/// same marker the parser matches.
pub fn review_prompt_header() -> String {
    format!(
        "Review the following diff for alignment with the unit's intent, soundness of \
         approach, and test quality. Respond with a block in exactly this form:\n\n\
         {REVIEW_MARKER}\nalignment: <1-10>\napproach: <1-10>\ntests: <1-10>\nnotes: <free text>\n\n"
    )
}

/// Parse a reviewer response into `(alignment, approach, tests, notes)`.
pub fn parse_review_block(output: &str) -> Option<(u8, u8, u8, String)> {
    let caps = REVIEW_BLOCK.captures(output)?;
    let score = |i: usize| -> Option<u8> {
        let n: u32 = caps.get(i)?.as_str().parse().ok()?;
        Some(n.clamp(1, 10) as u8)
    };
    Some((
        score(1)?,
        score(2)?,
        score(3)?,
        caps.get(4)
            .map(|m| m.as_str().trim().to_string())
            .unwrap_or_default(),
    ))
}

/// Invokes the external reviewer and records the result.
pub struct DiffReviewer {
    command: String,
    timeout: Duration,
    store: SharedStore,
}

impl DiffReviewer {
    pub fn new(command: impl Into<String>, timeout: Duration, store: SharedStore) -> Self {
        Self {
            command: command.into(),
            timeout,
            store,
        }
    }

    /// Whether a reviewer command is configured at all.
    pub fn enabled(&self) -> bool {
        !self.command.trim().is_empty()
    }

    /// Review one promoted unit's diff and persist the record.
    ///
    /// Every failure mode degrades: command failures and unparseable
    /// output produce an unparsed record with the raw output attached.
    pub async fn review_unit(&self, unit_id: &str, diff: &str) -> ReviewRecord {
        let raw = match self.invoke(diff).await {
            Ok(output) => output,
            Err(reason) => {
                warn!(unit_id, %reason, "reviewer command failed");
                let record = ReviewRecord::unparsed(unit_id, reason);
                self.persist(&record);
                return record;
            }
        };

        let record = match parse_review_block(&raw) {
            Some((alignment, approach, tests, notes)) => ReviewRecord {
                unit_id: unit_id.to_string(),
                alignment,
                approach,
                tests,
                notes,
                parsed: true,
                raw_output: None,
                created_at: chrono::Utc::now(),
            },
            None => {
                warn!(unit_id, raw = %raw, "review block missing or malformed");
                ReviewRecord::unparsed(unit_id, raw)
            }
        };

        if record.parsed {
            info!(
                unit_id,
                alignment = record.alignment,
                approach = record.approach,
                tests = record.tests,
                "unit reviewed"
            );
        }
        self.persist(&record);
        record
    }

    /// Fire-and-forget review of a promoted unit.
    pub fn spawn_review(self: &Arc<Self>, unit_id: String, diff: String) {
        if !self.enabled() {
            return;
        }
        let reviewer = Arc::clone(self);
        tokio::spawn(async move {
            reviewer.review_unit(&unit_id, &diff).await;
        });
    }

    async fn invoke(&self, diff: &str) -> Result<String, String> {
        use tokio::io::AsyncWriteExt;

        let argv = shlex::split(&self.command)
            .ok_or_else(|| format!("unparseable reviewer command: {}", self.command))?;
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| "empty reviewer command".to_string())?;

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| format!("spawn failed: {e}"))?;
        if let Some(mut stdin) = child.stdin.take() {
            let payload = format!("{}{}", review_prompt_header(), diff);
            stdin
                .write_all(payload.as_bytes())
                .await
                .map_err(|e| format!("write failed: {e}"))?;
            drop(stdin);
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| format!("reviewer timed out after {}s", self.timeout.as_secs()))?
            .map_err(|e| format!("wait failed: {e}"))?;

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn persist(&self, record: &ReviewRecord) {
        if let Err(e) = self.store.put_review(record) {
            warn!(unit_id = %record.unit_id, error = %e, "failed to persist review record");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MissionStore;

    #[test]
    fn test_prompt_and_parser_share_marker() {
        // The exact marker the prompt asks for must satisfy the parser.
        let header = review_prompt_header();
        assert!(header.contains(REVIEW_MARKER));

        let response = format!("{REVIEW_MARKER}\nalignment: 8\napproach: 7\ntests: 6\nnotes: fine");
        let (a, p, t, notes) = parse_review_block(&response).unwrap();
        assert_eq!((a, p, t), (8, 7, 6));
        assert_eq!(notes, "fine");
    }

    #[test]
    fn test_parse_with_surrounding_chatter() {
        let response = format!(
            "Here is my assessment.\n\n{REVIEW_MARKER}\nalignment: 10\napproach: 9\ntests: 4\nnotes: needs more coverage\nbye"
        );
        let (a, p, t, _) = parse_review_block(&response).unwrap();
        assert_eq!((a, p, t), (10, 9, 4));
    }

    #[test]
    fn test_parse_without_notes() {
        let response = format!("{REVIEW_MARKER}\nalignment: 5\napproach: 5\ntests: 5\n");
        let (a, p, t, notes) = parse_review_block(&response).unwrap();
        assert_eq!((a, p, t), (5, 5, 5));
        assert!(notes.is_empty());
    }

    #[test]
    fn test_scores_clamped_to_ten() {
        let response = format!("{REVIEW_MARKER}\nalignment: 99\napproach: 0\ntests: 10\n");
        let (a, p, t, _) = parse_review_block(&response).unwrap();
        assert_eq!((a, p, t), (10, 1, 10));
    }

    #[test]
    fn test_garbage_does_not_parse() {
        assert!(parse_review_block("no block here").is_none());
        assert!(parse_review_block(&format!("{REVIEW_MARKER}\nalignment: high")).is_none());
    }

    #[tokio::test]
    async fn test_review_unit_parses_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let store = MissionStore::open(dir.path().join("db")).unwrap().shared();

        let script = dir.path().join("reviewer.sh");
        std::fs::write(
            &script,
            format!(
                "cat > /dev/null\nprintf '{REVIEW_MARKER}\\nalignment: 9\\napproach: 8\\ntests: 7\\nnotes: solid\\n'\n"
            ),
        )
        .unwrap();

        let reviewer = DiffReviewer::new(
            format!("sh {}", script.display()),
            Duration::from_secs(10),
            store.clone(),
        );
        let record = reviewer.review_unit("u-1", "diff text").await;
        assert!(record.parsed);
        assert_eq!(record.alignment, 9);

        let stored = store.get_review("u-1").unwrap().unwrap();
        assert_eq!(stored.approach, 8);
    }

    #[tokio::test]
    async fn test_unparseable_reviewer_output_degrades() {
        let dir = tempfile::tempdir().unwrap();
        let store = MissionStore::open(dir.path().join("db")).unwrap().shared();

        let script = dir.path().join("reviewer.sh");
        std::fs::write(&script, "cat > /dev/null\necho 'I refuse to follow format'\n").unwrap();

        let reviewer = DiffReviewer::new(
            format!("sh {}", script.display()),
            Duration::from_secs(10),
            store.clone(),
        );
        let record = reviewer.review_unit("u-2", "diff").await;
        assert!(!record.parsed);
        assert!(record.raw_output.unwrap().contains("refuse"));

        let stored = store.get_review("u-2").unwrap().unwrap();
        assert!(!stored.parsed);
    }

    #[tokio::test]
    async fn test_disabled_reviewer() {
        let dir = tempfile::tempdir().unwrap();
        let store = MissionStore::open(dir.path().join("db")).unwrap().shared();
        let reviewer = DiffReviewer::new("", Duration::from_secs(1), store);
        assert!(!reviewer.enabled());
    }
}
