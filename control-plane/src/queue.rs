//! Merge queue between workers and the green-branch consumer.
//!
//! Multi-producer, single-consumer, strictly FIFO. Submissions are never
//! dropped: a drain that times out returns the partial batch and leaves
//! the remainder enqueued.

use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::{ControlError, ControlResult};
use crate::worker::ResultEnvelope;
use crate::workspace::WorkspaceHandle;

/// A worker branch waiting to be integrated.
///
/// Carries the workspace handle so the clone stays leased until the merge
/// finishes or the unit is abandoned.
#[derive(Debug)]
pub struct MergeSubmission {
    pub unit_id: String,
    pub branch_ref: String,
    pub envelope: ResultEnvelope,
    pub workspace: WorkspaceHandle,
    pub submitted_at: DateTime<Utc>,
}

impl MergeSubmission {
    pub fn new(branch_ref: impl Into<String>, envelope: ResultEnvelope, workspace: WorkspaceHandle) -> Self {
        Self {
            unit_id: envelope.unit_id.clone(),
            branch_ref: branch_ref.into(),
            envelope,
            workspace,
            submitted_at: Utc::now(),
        }
    }
}

/// Producer side of the merge queue. Cheap to clone; one per worker task.
#[derive(Debug, Clone)]
pub struct MergeQueue {
    tx: mpsc::UnboundedSender<MergeSubmission>,
}

/// Consumer side, owned by the green-branch manager's drain loop.
#[derive(Debug)]
pub struct MergeQueueConsumer {
    rx: mpsc::UnboundedReceiver<MergeSubmission>,
}

impl MergeQueue {
    /// Create a queue with its single consumer.
    pub fn channel() -> (Self, MergeQueueConsumer) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, MergeQueueConsumer { rx })
    }

    /// Enqueue a submission. Fails only if the consumer is gone, which
    /// means the mission is shutting down.
    pub fn submit(&self, submission: MergeSubmission) -> ControlResult<()> {
        self.tx
            .send(submission)
            .map_err(|e| ControlError::integrity(format!("merge queue closed: {e}")))
    }
}

impl MergeQueueConsumer {
    /// Receive up to `max_items` submissions in submit order.
    ///
    /// The overall wait is `per_item_timeout * max_items`, so draining a
    /// large epoch does not spuriously time out. Returns early once
    /// `max_items` arrive; on timeout the partial batch is returned and
    /// later submissions stay queued.
    pub async fn drain(
        &mut self,
        max_items: usize,
        per_item_timeout: Duration,
    ) -> Vec<MergeSubmission> {
        let total = per_item_timeout.saturating_mul(max_items.max(1) as u32);
        let deadline = tokio::time::Instant::now() + total;

        let mut batch = Vec::new();
        while batch.len() < max_items {
            match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Ok(Some(submission)) => batch.push(submission),
                // All producers dropped; nothing more will arrive.
                Ok(None) => break,
                Err(_) => break,
            }
        }
        batch
    }

    /// Receive everything already enqueued without waiting.
    pub fn drain_ready(&mut self) -> Vec<MergeSubmission> {
        let mut batch = Vec::new();
        while let Ok(submission) = self.rx.try_recv() {
            batch.push(submission);
        }
        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::WorkspacePool;
    use std::process::Command;
    use tempfile::tempdir;

    async fn test_pool(slots: usize) -> (tempfile::TempDir, tempfile::TempDir, WorkspacePool) {
        let source = tempdir().unwrap();
        for args in [
            vec!["init", "-b", "main"],
            vec!["config", "user.email", "t@t.com"],
            vec!["config", "user.name", "T"],
        ] {
            Command::new("git")
                .args(&args)
                .current_dir(source.path())
                .output()
                .unwrap();
        }
        std::fs::write(source.path().join("f.txt"), "x").unwrap();
        Command::new("git")
            .args(["add", "."])
            .current_dir(source.path())
            .output()
            .unwrap();
        Command::new("git")
            .args(["commit", "-m", "init"])
            .current_dir(source.path())
            .output()
            .unwrap();

        let pool_dir = tempdir().unwrap();
        let pool = WorkspacePool::provision(source.path(), pool_dir.path(), "main", slots)
            .await
            .unwrap();
        (source, pool_dir, pool)
    }

    fn submission_for(unit_id: &str, ws: WorkspaceHandle) -> MergeSubmission {
        let envelope = ResultEnvelope::failed(unit_id, "none", "test envelope");
        MergeSubmission::new(format!("mc/unit/{unit_id}"), envelope, ws)
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let (_src, _dir, pool) = test_pool(3).await;
        let (queue, mut consumer) = MergeQueue::channel();

        for unit in ["u-1", "u-2", "u-3"] {
            let ws = pool
                .acquire(Duration::from_secs(5))
                .await
                .unwrap()
                .unwrap();
            queue.submit(submission_for(unit, ws)).unwrap();
        }

        let batch = consumer.drain(3, Duration::from_millis(100)).await;
        let ids: Vec<&str> = batch.iter().map(|s| s.unit_id.as_str()).collect();
        assert_eq!(ids, vec!["u-1", "u-2", "u-3"]);
    }

    #[tokio::test]
    async fn test_drain_partial_batch_on_timeout() {
        let (_src, _dir, pool) = test_pool(1).await;
        let (queue, mut consumer) = MergeQueue::channel();

        let ws = pool
            .acquire(Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        queue.submit(submission_for("u-1", ws)).unwrap();

        // Expecting 3 but only 1 arrives: partial batch, no hang.
        let batch = consumer.drain(3, Duration::from_millis(30)).await;
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].unit_id, "u-1");
    }

    #[tokio::test]
    async fn test_late_submissions_stay_enqueued() {
        let (_src, _dir, pool) = test_pool(2).await;
        let (queue, mut consumer) = MergeQueue::channel();

        let ws1 = pool
            .acquire(Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        let ws2 = pool
            .acquire(Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        queue.submit(submission_for("u-1", ws1)).unwrap();
        queue.submit(submission_for("u-2", ws2)).unwrap();

        let first = consumer.drain(1, Duration::from_millis(100)).await;
        assert_eq!(first.len(), 1);

        // The second submission was not dropped by the bounded drain.
        let second = consumer.drain(1, Duration::from_millis(100)).await;
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].unit_id, "u-2");
    }

    #[tokio::test]
    async fn test_submission_holds_workspace_lease() {
        let (_src, _dir, pool) = test_pool(1).await;
        let (queue, mut consumer) = MergeQueue::channel();

        let ws = pool
            .acquire(Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        queue.submit(submission_for("u-1", ws)).unwrap();
        assert_eq!(pool.available_slots(), 0);

        let batch = consumer.drain(1, Duration::from_millis(100)).await;
        drop(batch);
        // Integration done (submission dropped): clone returns to the pool.
        assert_eq!(pool.available_slots(), 1);
    }
}
