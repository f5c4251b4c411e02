use crate::{IsolatedCheckout, IsolationProvider};
use async_trait::async_trait;
use grove_core::{GroveError, GroveResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;

/// Isolation provider that only tracks names and paths.
///
/// No working copies are materialized; useful for tests and dry runs where
/// the executing agent does not touch the filesystem.
#[derive(Default)]
pub struct InMemoryIsolation {
    root: PathBuf,
    checkouts: Mutex<HashMap<String, IsolatedCheckout>>,
}

impl InMemoryIsolation {
    /// Creates a provider whose checkout paths live under `root`.
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            checkouts: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl IsolationProvider for InMemoryIsolation {
    async fn create_isolated(&self, name: &str, branch_ref: &str) -> GroveResult<IsolatedCheckout> {
        let mut checkouts = self.checkouts.lock();
        if checkouts.contains_key(name) {
            return Err(GroveError::IsolationCreate(format!(
                "checkout {name} already exists"
            )));
        }
        let checkout = IsolatedCheckout {
            name: name.to_string(),
            branch_ref: branch_ref.to_string(),
            path: self.root.join(name),
        };
        checkouts.insert(name.to_string(), checkout.clone());
        Ok(checkout)
    }

    async fn remove_isolated(&self, name: &str) -> GroveResult<()> {
        self.checkouts
            .lock()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| GroveError::Isolation(format!("checkout {name} not found")))
    }

    async fn list_isolated(&self) -> GroveResult<Vec<IsolatedCheckout>> {
        let mut listed: Vec<IsolatedCheckout> =
            self.checkouts.lock().values().cloned().collect();
        listed.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(listed)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let provider = InMemoryIsolation::new(PathBuf::from("/tmp/grove"));
        provider.create_isolated("a", "grove/a").await.unwrap();
        let err = provider.create_isolated("a", "grove/b").await.unwrap_err();
        assert!(matches!(err, GroveError::IsolationCreate(_)));
    }

    #[tokio::test]
    async fn test_remove_and_list() {
        let provider = InMemoryIsolation::new(PathBuf::from("/tmp/grove"));
        provider.create_isolated("b", "grove/b").await.unwrap();
        provider.create_isolated("a", "grove/a").await.unwrap();

        let listed = provider.list_isolated().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].name, "a");

        provider.remove_isolated("a").await.unwrap();
        assert_eq!(provider.list_isolated().await.unwrap().len(), 1);
        assert!(provider.remove_isolated("a").await.is_err());
    }
}
