//! Isolation capability for the Grove engine.
//!
//! Each agent works inside its own isolated checkout of the base repository,
//! so concurrent tasks can never corrupt each other's working files. The
//! engine consumes this purely through the [`IsolationProvider`] trait; the
//! default implementation maps checkouts onto git worktrees.
//!
//! # Main types
//!
//! - [`IsolationProvider`] — Capability trait (create/remove/list).
//! - [`GitWorktrees`] — git-worktree-backed implementation.
//! - [`InMemoryIsolation`] — path-only implementation for tests and dry runs.

/// git-worktree-backed provider.
pub mod git;
/// In-memory provider for tests and dry runs.
pub mod memory;

use async_trait::async_trait;
use grove_core::GroveResult;
use std::path::PathBuf;
use uuid::Uuid;

pub use git::GitWorktrees;
pub use memory::InMemoryIsolation;

/// A named isolated working copy bound to a branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsolatedCheckout {
    /// Unique checkout name.
    pub name: String,
    /// The branch the checkout is bound to.
    pub branch_ref: String,
    /// Filesystem location of the working copy.
    pub path: PathBuf,
}

/// External capability that manages isolated working copies.
///
/// The engine never reaches below this contract; version-control details
/// stay inside the implementation.
#[async_trait]
pub trait IsolationProvider: Send + Sync {
    /// Creates a named isolated working copy bound to `branch_ref`,
    /// creating the branch from the current head when it does not exist.
    async fn create_isolated(&self, name: &str, branch_ref: &str) -> GroveResult<IsolatedCheckout>;
    /// Removes the named working copy and its bookkeeping.
    async fn remove_isolated(&self, name: &str) -> GroveResult<()>;
    /// Lists every isolated working copy currently known.
    async fn list_isolated(&self) -> GroveResult<Vec<IsolatedCheckout>>;
}

/// Generates a fresh checkout name (`checkout-<hex8>`).
pub fn generated_checkout_name() -> String {
    format!("checkout-{}", short_hex())
}

/// Generates a fresh branch name (`grove/<hex8>`).
pub fn generated_branch_name() -> String {
    format!("grove/{}", short_hex())
}

fn short_hex() -> String {
    let id = Uuid::new_v4().simple().to_string();
    id[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_names_are_unique() {
        assert_ne!(generated_checkout_name(), generated_checkout_name());
        assert!(generated_branch_name().starts_with("grove/"));
    }
}
