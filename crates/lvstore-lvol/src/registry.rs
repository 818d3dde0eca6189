//! Registry of live lvol stores
//!
//! A store is registered only once it is fully set up or recovered and is
//! removed only by a successful unload or destroy. Registries are plain
//! values handed to each `LvolManager`, so independent instances can coexist.

use crate::error::{LvolError, LvolResult};
use crate::lvs::LvolStore;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Set of live stores, keyed by identity
#[derive(Debug, Default)]
pub struct LvsRegistry {
    stores: RwLock<Vec<Arc<LvolStore>>>,
}

impl LvsRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a store; fails if a store with the same UUID is present
    pub fn register(&self, lvs: &Arc<LvolStore>) -> LvolResult<()> {
        let mut stores = self.stores.write();
        if stores.iter().any(|s| s.uuid() == lvs.uuid()) {
            return Err(LvolError::AlreadyExists(lvs.uuid()));
        }
        stores.push(Arc::clone(lvs));
        debug!("Registered lvol store {} ({} live)", lvs.uuid(), stores.len());
        Ok(())
    }

    /// Remove a store; returns whether it was registered
    pub fn deregister(&self, lvs: &LvolStore) -> bool {
        let mut stores = self.stores.write();
        let before = stores.len();
        stores.retain(|s| !std::ptr::eq(Arc::as_ptr(s), lvs));
        let removed = stores.len() != before;
        if removed {
            debug!("Deregistered lvol store {} ({} live)", lvs.uuid(), stores.len());
        }
        removed
    }

    /// Whether this exact store instance is registered
    #[must_use]
    pub fn contains(&self, lvs: &LvolStore) -> bool {
        self.stores
            .read()
            .iter()
            .any(|s| std::ptr::eq(Arc::as_ptr(s), lvs))
    }

    #[must_use]
    pub fn find_by_uuid(&self, uuid: &Uuid) -> Option<Arc<LvolStore>> {
        self.stores
            .read()
            .iter()
            .find(|s| s.uuid() == *uuid)
            .cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.stores.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stores.read().is_empty()
    }

    /// Snapshot of the live stores in registration order
    #[must_use]
    pub fn stores(&self) -> Vec<Arc<LvolStore>> {
        self.stores.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lvs::LvolStore;
    use lvstore_blob::{BlobStoreEngine, BsDev, BsOpts, DevEngine, MemDev};
    use lvstore_common::BlobId;

    async fn store(uuid: Uuid) -> Arc<LvolStore> {
        let dev: Arc<dyn BsDev> = Arc::new(MemDev::new("mem0", 1024, 4096));
        let opts = BsOpts {
            cluster_size: 64 * 1024,
            num_md_pages: 8,
            ..BsOpts::default()
        };
        let bs = DevEngine.init(Arc::clone(&dev), &opts).await.unwrap();
        LvolStore::new(uuid, bs, dev, BlobId::new(1), Vec::new(), Vec::new())
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let registry = LvsRegistry::new();
        assert!(registry.is_empty());

        let uuid = Uuid::new_v4();
        let lvs = store(uuid).await;
        registry.register(&lvs).unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(&lvs));
        assert!(Arc::ptr_eq(&registry.find_by_uuid(&uuid).unwrap(), &lvs));
        assert!(registry.find_by_uuid(&Uuid::new_v4()).is_none());

        assert!(registry.deregister(&lvs));
        assert!(!registry.deregister(&lvs));
        assert!(!registry.contains(&lvs));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_uuid_is_rejected() {
        let registry = LvsRegistry::new();
        let uuid = Uuid::new_v4();
        let first = store(uuid).await;
        let second = store(uuid).await;

        registry.register(&first).unwrap();
        assert_eq!(
            registry.register(&second).unwrap_err(),
            LvolError::AlreadyExists(uuid)
        );
        assert!(!registry.contains(&second));
        assert_eq!(registry.stores().len(), 1);
    }

    #[tokio::test]
    async fn test_registries_are_independent() {
        let a = LvsRegistry::new();
        let b = LvsRegistry::new();
        let lvs = store(Uuid::new_v4()).await;
        a.register(&lvs).unwrap();
        assert!(a.contains(&lvs));
        assert!(!b.contains(&lvs));
    }
}
