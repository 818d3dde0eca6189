//! Logical volumes
//!
//! An `Lvol` binds one blob to a UUID and a size. It refers back to its
//! store through a `Weak`, so dropping the store never leaks through its
//! volumes.

use crate::error::{LvolError, LvolResult, Step};
use crate::lvs::LvolStore;
use lvstore_blob::BlobHandle;
use lvstore_common::{BlobId, clusters_for};
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Outstanding opens of an lvol
///
/// The count can only be moved by whole opens and closes and never drops
/// below zero: releasing an unopened counter is refused.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OpenCount(u32);

impl OpenCount {
    /// Current number of opens
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Whether at least one open is outstanding
    #[must_use]
    pub const fn is_open(self) -> bool {
        self.0 > 0
    }

    fn acquire(&mut self) {
        self.0 += 1;
    }

    /// Drop one open; `None` if there was nothing to drop
    fn release(&mut self) -> Option<u32> {
        self.0 = self.0.checked_sub(1)?;
        Some(self.0)
    }
}

/// One open reference taken on an lvol while its open chain is in flight
///
/// The reference is given back on drop unless the chain commits it.
struct OpenGuard<'a> {
    lvol: &'a Lvol,
    first: bool,
    committed: bool,
}

impl<'a> OpenGuard<'a> {
    fn acquire(lvol: &'a Lvol) -> Self {
        let mut inner = lvol.inner.lock();
        let first = !inner.opens.is_open();
        inner.opens.acquire();
        Self {
            lvol,
            first,
            committed: false,
        }
    }

    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for OpenGuard<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.lvol.inner.lock().opens.release();
        }
    }
}

struct LvolInner {
    opens: OpenCount,
    handle: Option<BlobHandle>,
    num_clusters: u64,
}

/// Resize whose blob-side change is applied but not yet synced
pub(crate) struct PendingResize {
    lvs: Arc<LvolStore>,
    handle: BlobHandle,
    from: u64,
    to: u64,
}

/// A logical volume
pub struct Lvol {
    blob_id: BlobId,
    uuid: Uuid,
    owner: Weak<LvolStore>,
    inner: Mutex<LvolInner>,
    /// Held across a whole open or close so the two never interleave
    transition: tokio::sync::Mutex<()>,
}

impl Lvol {
    /// Freshly created lvol, held open by its creator
    pub(crate) fn created(
        blob_id: BlobId,
        uuid: Uuid,
        num_clusters: u64,
        handle: BlobHandle,
        owner: Weak<LvolStore>,
    ) -> Self {
        Self {
            blob_id,
            uuid,
            owner,
            inner: Mutex::new(LvolInner {
                opens: OpenCount(1),
                handle: Some(handle),
                num_clusters,
            }),
            transition: tokio::sync::Mutex::new(()),
        }
    }

    /// Lvol found on disk during load, not open
    pub(crate) fn discovered(
        blob_id: BlobId,
        uuid: Uuid,
        num_clusters: u64,
        owner: Weak<LvolStore>,
    ) -> Self {
        Self {
            blob_id,
            uuid,
            owner,
            inner: Mutex::new(LvolInner {
                opens: OpenCount::default(),
                handle: None,
                num_clusters,
            }),
            transition: tokio::sync::Mutex::new(()),
        }
    }

    /// Identifier of the backing blob
    #[must_use]
    pub const fn blob_id(&self) -> BlobId {
        self.blob_id
    }

    /// Volume identity
    #[must_use]
    pub const fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Number of outstanding opens
    #[must_use]
    pub fn ref_count(&self) -> u32 {
        self.inner.lock().opens.get()
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.inner.lock().opens.is_open()
    }

    /// Size in clusters
    #[must_use]
    pub fn num_clusters(&self) -> u64 {
        self.inner.lock().num_clusters
    }

    /// Size in bytes; zero once the store is gone
    #[must_use]
    pub fn size_bytes(&self) -> u64 {
        self.owner
            .upgrade()
            .map_or(0, |lvs| self.num_clusters() * lvs.cluster_size())
    }

    /// Owning store, if it is still alive
    #[must_use]
    pub fn store(&self) -> Option<Arc<LvolStore>> {
        self.owner.upgrade()
    }

    fn active_store(&self) -> LvolResult<Arc<LvolStore>> {
        let lvs = self.owner.upgrade().ok_or_else(|| {
            LvolError::invalid_argument(format!("lvol {} has no store", self.uuid))
        })?;
        lvs.check_active()?;
        Ok(lvs)
    }

    pub(crate) fn check_open(&self) -> LvolResult<()> {
        self.active_store().map(drop)
    }

    /// Open the lvol; only the first open reaches the blob store
    pub async fn open(&self) -> LvolResult<()> {
        let _transition = self.transition.lock().await;
        let lvs = self.active_store()?;
        let guard = OpenGuard::acquire(self);
        if guard.first {
            let handle = lvs
                .blob_store()
                .open_blob(self.blob_id)
                .await
                .map_err(LvolError::backend(Step::OpenBlob))?;
            self.inner.lock().handle = Some(handle);
            debug!("Opened lvol {} (blob {})", self.uuid, self.blob_id);
        }
        guard.commit();
        Ok(())
    }

    pub(crate) fn check_close(&self) -> LvolResult<Arc<LvolStore>> {
        if !self.is_open() {
            return Err(LvolError::invalid_argument(format!(
                "lvol {} is not open",
                self.uuid
            )));
        }
        self.owner.upgrade().ok_or_else(|| {
            LvolError::invalid_argument(format!("lvol {} has no store", self.uuid))
        })
    }

    /// Drop one open; the blob is closed when the last one goes
    pub async fn close(&self) -> LvolResult<()> {
        let _transition = self.transition.lock().await;
        let lvs = self.check_close()?;
        let handle = {
            let mut inner = self.inner.lock();
            let remaining = inner.opens.release().ok_or_else(|| {
                LvolError::invalid_argument(format!("lvol {} is not open", self.uuid))
            })?;
            if remaining > 0 {
                debug!("Lvol {} still open ({} refs)", self.uuid, remaining);
                return Ok(());
            }
            inner.handle.take()
        };

        if let Some(handle) = handle {
            lvs.blob_store()
                .close_blob(handle)
                .await
                .map_err(LvolError::backend(Step::CloseBlob))?;
        }
        debug!("Closed lvol {}", self.uuid);
        Ok(())
    }

    /// Validate a resize and return the store, the open handle and the new
    /// size in clusters
    pub(crate) fn check_resize(
        &self,
        size_bytes: u64,
    ) -> LvolResult<(Arc<LvolStore>, BlobHandle, u64)> {
        let lvs = self.active_store()?;
        let handle = self.inner.lock().handle.clone().ok_or_else(|| {
            LvolError::invalid_argument(format!("lvol {} is not open", self.uuid))
        })?;
        let clusters = clusters_for(size_bytes, lvs.cluster_size());
        lvs.check_capacity(clusters)?;
        Ok((lvs, handle, clusters))
    }

    /// Apply the blob-side part of a resize
    ///
    /// The blob's cluster count changes immediately; the lvol's recorded
    /// size only moves once `finish_resize` has synced it.
    pub(crate) fn begin_resize(&self, size_bytes: u64) -> LvolResult<PendingResize> {
        let (lvs, handle, to) = self.check_resize(size_bytes)?;
        let from = self.num_clusters();
        handle
            .resize(to)
            .map_err(LvolError::backend(Step::ResizeBlob))?;
        Ok(PendingResize {
            lvs,
            handle,
            from,
            to,
        })
    }

    /// Sync a resize and record it; a failed sync puts the blob back
    pub(crate) async fn finish_resize(&self, pending: PendingResize) -> LvolResult<()> {
        let PendingResize {
            lvs,
            handle,
            from,
            to,
        } = pending;

        if let Err(status) = lvs.blob_store().sync_blob(&handle).await {
            if let Err(undo) = handle.resize(from) {
                warn!(
                    "Failed to restore lvol {} to {} clusters after failed sync: {}",
                    self.uuid, from, undo
                );
            }
            self.inner.lock().num_clusters = handle.num_clusters();
            return Err(LvolError::backend(Step::SyncBlob)(status));
        }

        self.inner.lock().num_clusters = to;
        debug!("Resized lvol {} from {} to {} clusters", self.uuid, from, to);
        Ok(())
    }

    /// Resize to `size_bytes`, rounded up to whole clusters
    pub async fn resize(&self, size_bytes: u64) -> LvolResult<()> {
        let pending = self.begin_resize(size_bytes)?;
        self.finish_resize(pending).await
    }

    pub(crate) fn check_destroy(&self) -> LvolResult<Arc<LvolStore>> {
        let lvs = self.active_store()?;
        if self.is_open() {
            return Err(LvolError::busy(format!(
                "lvol {} is open ({} refs)",
                self.uuid,
                self.ref_count()
            )));
        }
        if !lvs.contains_lvol(self.blob_id) {
            return Err(LvolError::NotFound(format!(
                "lvol {} is not in store {}",
                self.uuid,
                lvs.uuid()
            )));
        }
        Ok(lvs)
    }

    /// Delete the backing blob and drop the lvol from its store
    pub async fn destroy(&self) -> LvolResult<()> {
        let lvs = self.check_destroy()?;
        lvs.blob_store()
            .delete_blob(self.blob_id)
            .await
            .map_err(LvolError::backend(Step::DeleteBlob))?;
        lvs.remove_lvol(self.blob_id);
        info!("Destroyed lvol {} in store {}", self.uuid, lvs.uuid());
        Ok(())
    }
}

impl fmt::Debug for Lvol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Lvol")
            .field("uuid", &self.uuid)
            .field("blob_id", &self.blob_id)
            .field("ref_count", &inner.opens.get())
            .field("num_clusters", &inner.num_clusters)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::LvolManager;
    use crate::registry::LvsRegistry;
    use crate::testutil::{FaultyEngine, Faults, LVS_TEST_OPTS, mem_dev};
    use lvstore_blob::{BsError, DevEngine};

    #[test]
    fn test_open_count_never_negative() {
        let mut count = OpenCount::default();
        assert!(!count.is_open());
        assert_eq!(count.release(), None);
        assert_eq!(count.get(), 0);

        count.acquire();
        count.acquire();
        assert_eq!(count.release(), Some(1));
        assert!(count.is_open());
        assert_eq!(count.release(), Some(0));
        assert_eq!(count.release(), None);
    }

    #[test]
    fn test_open_guard_rolls_back() {
        let lvol = Lvol::discovered(BlobId::new(7), Uuid::new_v4(), 3, Weak::new());

        let guard = OpenGuard::acquire(&lvol);
        assert!(guard.first);
        assert_eq!(lvol.ref_count(), 1);
        drop(guard);
        assert_eq!(lvol.ref_count(), 0);

        OpenGuard::acquire(&lvol).commit();
        let second = OpenGuard::acquire(&lvol);
        assert!(!second.first);
        second.commit();
        assert_eq!(lvol.ref_count(), 2);
    }

    #[tokio::test]
    async fn test_orphaned_lvol_rejects_operations() {
        let lvol = Lvol::discovered(BlobId::new(7), Uuid::new_v4(), 3, Weak::new());
        assert!(lvol.store().is_none());
        assert_eq!(lvol.size_bytes(), 0);
        assert!(matches!(
            lvol.open().await,
            Err(LvolError::InvalidArgument(_))
        ));
        assert_eq!(lvol.ref_count(), 0);
        assert!(matches!(
            lvol.close().await,
            Err(LvolError::InvalidArgument(_))
        ));
    }

    async fn store_with(
        engine: Arc<dyn lvstore_blob::BlobStoreEngine>,
    ) -> (LvolManager, Arc<LvolStore>) {
        let mgr = LvolManager::new(engine, Arc::new(LvsRegistry::new()));
        let lvs = mgr.init(mem_dev(), &LVS_TEST_OPTS).await.unwrap();
        (mgr, lvs)
    }

    async fn store() -> (LvolManager, Arc<LvolStore>) {
        store_with(Arc::new(DevEngine)).await
    }

    #[tokio::test]
    async fn test_create_destroy_success() {
        let (mgr, lvs) = store().await;
        let cluster = lvs.cluster_size();
        let lvol = lvs.create_lvol(10 * cluster).await.unwrap();

        assert_eq!(lvol.ref_count(), 1);
        assert_eq!(lvol.num_clusters(), 10);
        assert_eq!(lvs.free_clusters(), 53);
        assert_ne!(lvol.uuid(), lvs.uuid());
        assert!(Arc::ptr_eq(&lvol.store().unwrap(), &lvs));
        assert!(Arc::ptr_eq(&lvs.lvol_by_uuid(&lvol.uuid()).unwrap(), &lvol));

        lvol.close().await.unwrap();
        lvol.destroy().await.unwrap();
        assert_eq!(lvs.lvol_count(), 0);
        assert_eq!(lvs.free_clusters(), 63);
        assert!(matches!(
            lvol.destroy().await,
            Err(LvolError::NotFound(_))
        ));

        mgr.unload(&lvs).await.unwrap();
    }

    #[tokio::test]
    async fn test_p3_create_beyond_free_clusters() {
        let (_mgr, lvs) = store().await;
        let cluster = lvs.cluster_size();
        let free = lvs.free_clusters();

        let err = lvs.create_lvol((free + 1) * cluster).await.unwrap_err();
        assert_eq!(
            err,
            LvolError::CapacityExceeded {
                requested: free + 1,
                available: free
            }
        );
        assert_eq!(err.errno(), -libc::ENOMEM);
        assert_eq!(lvs.lvol_count(), 0);
        assert_eq!(lvs.free_clusters(), free);

        // Exactly the free clusters still fits
        let lvol = lvs.create_lvol(free * cluster).await.unwrap();
        assert_eq!(lvol.num_clusters(), free);
        assert_eq!(lvs.free_clusters(), 0);
    }

    #[tokio::test]
    async fn test_failed_create_leaves_no_lvol() {
        let faults = Arc::new(Faults::default());
        let (_mgr, lvs) = store_with(Arc::new(FaultyEngine::new(Arc::clone(&faults)))).await;

        faults.fail_resize(BsError::NO_SPACE);
        let err = lvs.create_lvol(10).await.unwrap_err();
        assert_eq!(
            err,
            LvolError::Backend {
                step: Step::ResizeBlob,
                status: BsError::NO_SPACE
            }
        );
        assert_eq!(lvs.lvol_count(), 0);
        assert_eq!(faults.deletes(), 1);
        assert_eq!(faults.open_handles(), 0);
        faults.clear();

        faults.fail_sync(BsError::IO);
        let err = lvs.create_lvol(10).await.unwrap_err();
        assert_eq!(err.errno(), BsError::IO.errno());
        assert_eq!(lvs.lvol_count(), 0);
        assert_eq!(faults.deletes(), 2);
        assert_eq!(lvs.free_clusters(), 63);
        faults.clear();

        let lvol = lvs.create_lvol(10).await.unwrap();
        assert_eq!(lvs.lvols().len(), 1);
        assert_eq!(lvol.ref_count(), 1);
    }

    #[tokio::test]
    async fn test_close_and_reopen() {
        let (_mgr, lvs) = store().await;
        let lvol = lvs.create_lvol(10).await.unwrap();

        lvol.close().await.unwrap();
        assert!(!lvol.is_open());
        assert_eq!(lvs.lvol_count(), 1);

        // Closing again would take the count below zero
        assert!(matches!(
            lvol.close().await,
            Err(LvolError::InvalidArgument(_))
        ));
        assert_eq!(lvol.ref_count(), 0);

        lvol.open().await.unwrap();
        lvol.open().await.unwrap();
        assert_eq!(lvol.ref_count(), 2);
        lvol.close().await.unwrap();
        assert!(lvol.is_open());
        lvol.close().await.unwrap();
        assert!(!lvol.is_open());
    }

    #[tokio::test]
    async fn test_failed_open_rolls_back_count() {
        let faults = Arc::new(Faults::default());
        let (_mgr, lvs) = store_with(Arc::new(FaultyEngine::new(Arc::clone(&faults)))).await;
        let lvol = lvs.create_lvol(10).await.unwrap();
        lvol.close().await.unwrap();

        faults.fail_open(lvol.blob_id(), BsError::IO);
        let err = lvol.open().await.unwrap_err();
        assert_eq!(
            err,
            LvolError::Backend {
                step: Step::OpenBlob,
                status: BsError::IO
            }
        );
        assert_eq!(lvol.ref_count(), 0);
    }

    #[tokio::test]
    async fn test_close_reports_backend_status() {
        let faults = Arc::new(Faults::default());
        let (_mgr, lvs) = store_with(Arc::new(FaultyEngine::new(Arc::clone(&faults)))).await;
        let lvol = lvs.create_lvol(10).await.unwrap();

        faults.fail_close(lvol.blob_id(), BsError::IO);
        let err = lvol.close().await.unwrap_err();
        assert_eq!(err.errno(), BsError::IO.errno());
        assert_eq!(lvol.ref_count(), 0);
        assert_eq!(lvs.lvol_count(), 1);
    }

    #[tokio::test]
    async fn test_destroy_open_lvol_is_busy() {
        let (_mgr, lvs) = store().await;
        let lvol = lvs.create_lvol(10).await.unwrap();

        let err = lvol.destroy().await.unwrap_err();
        assert_eq!(err.errno(), -libc::EBUSY);
        assert_eq!(lvs.lvol_count(), 1);
        assert_eq!(lvol.ref_count(), 1);
    }

    #[tokio::test]
    async fn test_p4_resize_up_to_free_clusters() {
        let (_mgr, lvs) = store().await;
        let cluster = lvs.cluster_size();
        let lvol = lvs.create_lvol(0).await.unwrap();
        let free = lvs.free_clusters();

        let err = lvol.resize((free + 1) * cluster).await.unwrap_err();
        assert!(matches!(err, LvolError::CapacityExceeded { .. }));
        assert_eq!(lvol.num_clusters(), 0);

        lvol.resize(free * cluster).await.unwrap();
        assert_eq!(lvol.num_clusters(), free);
        assert_eq!(lvs.free_clusters(), 0);
    }

    #[tokio::test]
    async fn test_p5_resize_same_size_and_zero() {
        let (_mgr, lvs) = store().await;
        let cluster = lvs.cluster_size();
        let lvol = lvs.create_lvol(10 * cluster).await.unwrap();

        lvol.resize(10 * cluster).await.unwrap();
        assert_eq!(lvol.num_clusters(), 10);

        lvol.resize(5 * cluster).await.unwrap();
        assert_eq!(lvol.num_clusters(), 5);

        lvol.resize(15 * cluster).await.unwrap();
        assert_eq!(lvol.num_clusters(), 15);
        assert_eq!(lvol.size_bytes(), 15 * cluster);

        lvol.resize(0).await.unwrap();
        assert_eq!(lvol.num_clusters(), 0);
        assert_eq!(lvs.free_clusters(), 63);

        assert!(matches!(
            lvol.resize(u64::from(u32::MAX)).await,
            Err(LvolError::CapacityExceeded { .. })
        ));
    }

    #[tokio::test]
    async fn test_resize_failures() {
        let faults = Arc::new(Faults::default());
        let (_mgr, lvs) = store_with(Arc::new(FaultyEngine::new(Arc::clone(&faults)))).await;
        let cluster = lvs.cluster_size();
        let lvol = lvs.create_lvol(10 * cluster).await.unwrap();

        faults.fail_resize(BsError::from_errno(-1));
        let err = lvol.resize(4 * cluster).await.unwrap_err();
        assert_eq!(err.errno(), -1);
        assert_eq!(lvol.num_clusters(), 10);
        faults.clear();

        faults.fail_sync(BsError::IO);
        assert!(matches!(
            lvol.resize(4 * cluster).await,
            Err(LvolError::Backend {
                step: Step::SyncBlob,
                ..
            })
        ));
        assert_eq!(lvol.num_clusters(), 10);
        faults.clear();

        lvol.close().await.unwrap();
        assert!(matches!(
            lvol.resize(cluster).await,
            Err(LvolError::InvalidArgument(_))
        ));
    }

    fn blob_clusters(lvol: &Lvol) -> u64 {
        lvol.inner.lock().handle.clone().unwrap().num_clusters()
    }

    #[tokio::test]
    async fn test_failed_sync_restores_blob_size() {
        let faults = Arc::new(Faults::default());
        let (_mgr, lvs) = store_with(Arc::new(FaultyEngine::new(Arc::clone(&faults)))).await;
        let cluster = lvs.cluster_size();
        let lvol = lvs.create_lvol(10 * cluster).await.unwrap();

        faults.fail_sync(BsError::IO);
        assert!(lvol.resize(4 * cluster).await.is_err());
        assert_eq!(lvol.num_clusters(), 10);
        assert_eq!(blob_clusters(&lvol), 10);
        assert_eq!(lvs.free_clusters(), 53);

        assert!(lvol.resize(12 * cluster).await.is_err());
        assert_eq!(blob_clusters(&lvol), lvol.num_clusters());
        assert_eq!(lvs.free_clusters(), 53);
        faults.clear();

        lvol.resize(4 * cluster).await.unwrap();
        assert_eq!(blob_clusters(&lvol), 4);
        assert_eq!(lvs.free_clusters(), 59);
    }

    #[tokio::test]
    async fn test_concurrent_open_and_close_keep_handle_consistent() {
        let faults = Arc::new(Faults::default());
        let (_mgr, lvs) = store_with(Arc::new(FaultyEngine::new(Arc::clone(&faults)))).await;
        let lvol = lvs.create_lvol(10).await.unwrap();
        lvol.close().await.unwrap();
        assert_eq!(faults.open_handles(), 0);

        faults.defer_completions();
        let (opened, closed) = tokio::join!(lvol.open(), lvol.close());
        opened.unwrap();

        // Whichever ran first, the count and the handle agree
        let has_handle = lvol.inner.lock().handle.is_some();
        assert_eq!(lvol.is_open(), has_handle);
        assert_eq!(faults.open_handles(), i64::from(lvol.ref_count()));
        if closed.is_err() {
            assert_eq!(lvol.ref_count(), 1);
            lvol.close().await.unwrap();
        }
        assert_eq!(lvol.ref_count(), 0);
        assert_eq!(faults.open_handles(), 0);

        lvol.destroy().await.unwrap();
        assert_eq!(lvs.lvol_count(), 0);
    }
}
