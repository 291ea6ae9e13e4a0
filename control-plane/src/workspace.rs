//! Pre-warmed pool of isolated repository clones.
//!
//! Each slot is a `git clone --shared` of the target repository, handed
//! out exclusively to one worker at a time. Handles are RAII: dropping
//! one returns the clone to the pool marked dirty, and the next acquire
//! recycles it (fetch, detach at the base ref, hard reset, clean) before
//! reissue. Dirty clones are never handed out.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::error::{ControlError, ControlResult};
use crate::gitops::GitRunner;

/// Branch workers integrate toward; used as the recycle base when present.
const GREEN_REMOTE_REF: &str = "refs/remotes/origin/mc/green";

#[derive(Debug)]
struct CloneSlot {
    index: usize,
    path: PathBuf,
    dirty: bool,
}

#[derive(Debug)]
struct PoolInner {
    branch: String,
    free: Mutex<Vec<CloneSlot>>,
    notify: Notify,
    total: usize,
}

/// Pool of workspace clones.
#[derive(Debug, Clone)]
pub struct WorkspacePool {
    inner: Arc<PoolInner>,
}

impl WorkspacePool {
    /// Clone the source repository `max_clones` times under `pool_root`.
    ///
    /// Existing clone directories are reused and marked dirty so their
    /// first acquire recycles them.
    pub async fn provision(
        source: impl AsRef<Path>,
        pool_root: impl AsRef<Path>,
        branch: impl Into<String>,
        max_clones: usize,
    ) -> ControlResult<Self> {
        let source = source.as_ref().to_path_buf();
        let pool_root = pool_root.as_ref().to_path_buf();
        let branch = branch.into();
        std::fs::create_dir_all(&pool_root)?;

        let root_git = GitRunner::new(&pool_root);
        let mut slots = Vec::with_capacity(max_clones);
        for index in 0..max_clones {
            let path = pool_root.join(format!("clone-{index:02}"));
            if !path.join(".git").exists() {
                info!(clone = %path.display(), "provisioning workspace clone");
                root_git
                    .run_with_retry(&[
                        "clone",
                        "--shared",
                        "--quiet",
                        &source.display().to_string(),
                        &path.display().to_string(),
                    ])
                    .await?;
                ensure_commit_identity(&path).await?;
            }
            slots.push(CloneSlot {
                index,
                path,
                dirty: true,
            });
        }

        Ok(Self {
            inner: Arc::new(PoolInner {
                branch,
                free: Mutex::new(slots),
                notify: Notify::new(),
                total: max_clones,
            }),
        })
    }

    /// Number of clones currently in the free list.
    pub fn available_slots(&self) -> usize {
        self.inner.free.lock().expect("pool lock").len()
    }

    /// Total clones the pool owns.
    pub fn total_slots(&self) -> usize {
        self.inner.total
    }

    /// Acquire a clean clone, waiting up to `timeout`.
    ///
    /// Returns `None` when every clone stayed busy for the whole window.
    pub async fn acquire(&self, timeout: Duration) -> ControlResult<Option<WorkspaceHandle>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let slot = {
                let notified = self.inner.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                let popped = self.inner.free.lock().expect("pool lock").pop();
                match popped {
                    Some(slot) => slot,
                    None => {
                        if tokio::time::timeout_at(deadline, notified).await.is_err() {
                            return Ok(None);
                        }
                        continue;
                    }
                }
            };

            match self.ensure_clean(slot).await {
                Ok(slot) => {
                    debug!(clone = slot.index, "workspace acquired");
                    return Ok(Some(WorkspaceHandle {
                        slot: Some(slot),
                        pool: Arc::clone(&self.inner),
                    }));
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Reset a held clone back to the base ref in place.
    pub async fn recycle(&self, handle: &WorkspaceHandle) -> ControlResult<()> {
        recycle_clone(handle.path(), &self.inner.branch).await
    }

    async fn ensure_clean(&self, mut slot: CloneSlot) -> ControlResult<CloneSlot> {
        if slot.dirty {
            if let Err(e) = recycle_clone(&slot.path, &self.inner.branch).await {
                // Put the slot back so the pool does not shrink, then
                // surface the failure.
                warn!(clone = slot.index, error = %e, "failed to recycle clone");
                self.inner.free.lock().expect("pool lock").push(slot);
                self.inner.notify.notify_one();
                return Err(e);
            }
            slot.dirty = false;
        }
        Ok(slot)
    }
}

/// Give a clone a committer identity so workers can commit in it
/// regardless of the host's global git configuration.
pub(crate) async fn ensure_commit_identity(path: &Path) -> ControlResult<()> {
    let git = GitRunner::new(path);
    if git.run(&["config", "user.email"]).await.is_err() {
        git.run(&["config", "user.email", "worker@mission-control.local"])
            .await?;
        git.run(&["config", "user.name", "mission-control worker"])
            .await?;
    }
    Ok(())
}

/// Hard-reset a clone to the current base: `origin/mc/green` when it
/// exists, the configured branch otherwise. Stale local branches from
/// earlier attempts are deleted so branch names never collide.
async fn recycle_clone(path: &Path, branch: &str) -> ControlResult<()> {
    let git = GitRunner::new(path);
    git.reset_hard("HEAD").await?;
    git.run_with_retry(&["clean", "-fdx"]).await?;
    git.fetch("origin", "+refs/heads/*:refs/remotes/origin/*")
        .await?;

    let base = match git.rev_parse_opt(GREEN_REMOTE_REF).await? {
        Some(sha) => sha,
        None => git
            .rev_parse_opt(&format!("refs/remotes/origin/{branch}"))
            .await?
            .ok_or_else(|| ControlError::WorkspaceCorrupted {
                path: path.to_path_buf(),
                message: format!("neither mc/green nor {branch} exists on origin"),
            })?,
    };
    git.run_with_retry(&["checkout", "--quiet", "--detach", &base])
        .await?;

    let local_branches = git
        .run(&["for-each-ref", "--format=%(refname:short)", "refs/heads"])
        .await?;
    for stale in local_branches.lines().filter(|l| !l.trim().is_empty()) {
        let _ = git.output(&["branch", "-D", stale.trim()]).await;
    }
    Ok(())
}

/// Exclusive lease on one clone. Dropping it returns the clone to the
/// pool; recycling is deferred to the next acquire.
#[derive(Debug)]
pub struct WorkspaceHandle {
    slot: Option<CloneSlot>,
    pool: Arc<PoolInner>,
}

impl WorkspaceHandle {
    /// Path of the leased clone.
    pub fn path(&self) -> &Path {
        &self.slot.as_ref().expect("live handle").path
    }

    /// Pool index of the leased clone.
    pub fn index(&self) -> usize {
        self.slot.as_ref().expect("live handle").index
    }

    /// Git runner bound to this clone.
    pub fn git(&self) -> GitRunner {
        GitRunner::new(self.path())
    }
}

impl Drop for WorkspaceHandle {
    fn drop(&mut self) {
        if let Some(mut slot) = self.slot.take() {
            slot.dirty = true;
            self.pool.free.lock().expect("pool lock").push(slot);
            self.pool.notify.notify_one();
        }
    }
}
