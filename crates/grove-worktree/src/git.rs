use crate::{IsolatedCheckout, IsolationProvider};
use async_trait::async_trait;
use git2::{Repository, WorktreeAddOptions, WorktreePruneOptions};
use grove_core::{GroveError, GroveResult};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{info, warn};

/// Isolation provider backed by git worktrees.
///
/// Checkouts are created as worktrees of a single base repository, each on
/// its own branch, under `checkout_base`. All libgit2 calls run on the
/// blocking pool; the async surface never blocks the runtime.
pub struct GitWorktrees {
    base_repo: PathBuf,
    checkout_base: PathBuf,
}

impl GitWorktrees {
    /// Creates a provider for the repository at `base_repo`, placing
    /// checkouts under `checkout_base`. Fails if `base_repo` is not a git
    /// repository.
    pub fn new(base_repo: PathBuf, checkout_base: PathBuf) -> GroveResult<Self> {
        Repository::open(&base_repo)
            .map_err(|e| GroveError::Isolation(format!("{} is not a git repository: {e}", base_repo.display())))?;
        std::fs::create_dir_all(&checkout_base)?;
        Ok(Self {
            base_repo,
            checkout_base,
        })
    }

    /// Removes checkouts whose working copy has not been touched within
    /// `max_age`. Returns the names that were removed.
    pub async fn remove_stale(&self, max_age: Duration) -> GroveResult<Vec<String>> {
        let cutoff = SystemTime::now() - max_age;
        let mut removed = Vec::new();
        for checkout in self.list_isolated().await? {
            let touched = std::fs::metadata(&checkout.path)
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            if touched < cutoff {
                match self.remove_isolated(&checkout.name).await {
                    Ok(()) => removed.push(checkout.name),
                    Err(e) => warn!(name = %checkout.name, error = %e, "stale checkout removal failed"),
                }
            }
        }
        Ok(removed)
    }

    fn checkout_path(&self, name: &str) -> PathBuf {
        self.checkout_base.join(name)
    }
}

#[async_trait]
impl IsolationProvider for GitWorktrees {
    async fn create_isolated(&self, name: &str, branch_ref: &str) -> GroveResult<IsolatedCheckout> {
        let base = self.base_repo.clone();
        let path = self.checkout_path(name);
        let name = name.to_string();
        let branch_ref = branch_ref.to_string();

        let checkout = tokio::task::spawn_blocking(move || {
            create_worktree(&base, &name, &branch_ref, &path)
        })
        .await
        .map_err(|e| GroveError::Isolation(format!("worktree task panicked: {e}")))??;

        info!(name = %checkout.name, branch = %checkout.branch_ref, "created isolated checkout");
        Ok(checkout)
    }

    async fn remove_isolated(&self, name: &str) -> GroveResult<()> {
        let base = self.base_repo.clone();
        let name_owned = name.to_string();

        tokio::task::spawn_blocking(move || remove_worktree(&base, &name_owned))
            .await
            .map_err(|e| GroveError::Isolation(format!("worktree task panicked: {e}")))??;

        info!(name, "removed isolated checkout");
        Ok(())
    }

    async fn list_isolated(&self) -> GroveResult<Vec<IsolatedCheckout>> {
        let base = self.base_repo.clone();
        tokio::task::spawn_blocking(move || list_worktrees(&base))
            .await
            .map_err(|e| GroveError::Isolation(format!("worktree task panicked: {e}")))?
    }
}

fn create_worktree(
    base: &Path,
    name: &str,
    branch_ref: &str,
    path: &Path,
) -> GroveResult<IsolatedCheckout> {
    if path.exists() {
        return Err(GroveError::IsolationCreate(format!(
            "checkout path {} already exists",
            path.display()
        )));
    }

    let repo = Repository::open(base)
        .map_err(|e| GroveError::IsolationCreate(format!("open base repository: {e}")))?;

    // Reuse the branch when it exists, otherwise branch off the current head.
    let branch = match repo.find_branch(branch_ref, git2::BranchType::Local) {
        Ok(branch) => branch,
        Err(_) => {
            let head = repo
                .head()
                .and_then(|h| h.peel_to_commit())
                .map_err(|e| GroveError::IsolationCreate(format!("resolve head: {e}")))?;
            repo.branch(branch_ref, &head, false)
                .map_err(|e| GroveError::IsolationCreate(format!("create branch {branch_ref}: {e}")))?
        }
    };

    let reference = branch.into_reference();
    let mut opts = WorktreeAddOptions::new();
    opts.reference(Some(&reference));

    repo.worktree(name, path, Some(&opts))
        .map_err(|e| GroveError::IsolationCreate(format!("add worktree {name}: {e}")))?;

    Ok(IsolatedCheckout {
        name: name.to_string(),
        branch_ref: branch_ref.to_string(),
        path: path.to_path_buf(),
    })
}

fn remove_worktree(base: &Path, name: &str) -> GroveResult<()> {
    let repo = Repository::open(base)
        .map_err(|e| GroveError::Isolation(format!("open base repository: {e}")))?;
    let worktree = repo
        .find_worktree(name)
        .map_err(|e| GroveError::Isolation(format!("worktree {name} not found: {e}")))?;

    let wt_path = worktree.path().to_path_buf();
    let mut opts = WorktreePruneOptions::new();
    opts.valid(true).working_tree(true);
    worktree
        .prune(Some(&mut opts))
        .map_err(|e| GroveError::Isolation(format!("prune worktree {name}: {e}")))?;

    // Prune can leave the directory behind when files were added out of band.
    if wt_path.exists() {
        std::fs::remove_dir_all(&wt_path)?;
    }
    Ok(())
}

fn list_worktrees(base: &Path) -> GroveResult<Vec<IsolatedCheckout>> {
    let repo = Repository::open(base)
        .map_err(|e| GroveError::Isolation(format!("open base repository: {e}")))?;
    let names = repo
        .worktrees()
        .map_err(|e| GroveError::Isolation(format!("list worktrees: {e}")))?;

    let mut checkouts = Vec::new();
    for name in names.iter().flatten() {
        let worktree = match repo.find_worktree(name) {
            Ok(wt) => wt,
            Err(_) => continue,
        };
        let path = worktree.path().to_path_buf();
        let branch_ref = Repository::open(&path)
            .and_then(|wt_repo| {
                wt_repo
                    .head()
                    .map(|h| h.shorthand().unwrap_or("detached").to_string())
            })
            .unwrap_or_else(|_| "unknown".to_string());
        checkouts.push(IsolatedCheckout {
            name: name.to_string(),
            branch_ref,
            path,
        });
    }
    Ok(checkouts)
}
