//! Fault-injecting blob store for lifecycle tests
//!
//! `FaultyEngine` wraps `DevEngine` and lets a test make individual calls
//! fail, hide attributes, or complete only after yielding to the runtime.

use crate::lvs::LVS_BSTYPE;
use async_trait::async_trait;
use lvstore_blob::{
    Blob, BlobHandle, BlobStore, BlobStoreEngine, BsDev, BsError, BsOpts, BsResult, DevEngine,
    MemDev,
};
use lvstore_common::{BlobId, BsType, LvsOpts};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};

/// Small clusters so tests can reason in single clusters
pub const LVS_TEST_OPTS: LvsOpts = LvsOpts {
    cluster_size: 64 * 1024,
    num_md_pages: 8,
    max_md_ops: 32,
    max_channel_ops: 512,
};

pub fn bs_test_opts() -> BsOpts {
    BsOpts::from_lvs_opts(&LVS_TEST_OPTS, LVS_BSTYPE)
}

/// 4 MiB device: 64 clusters, one of them metadata
pub fn mem_dev() -> Arc<dyn BsDev> {
    Arc::new(MemDev::new("mem0", 1024, 4096))
}

#[derive(Default)]
struct FaultSet {
    load: Option<BsError>,
    get_super: Option<BsError>,
    set_super: Option<BsError>,
    unload: Option<BsError>,
    iter_next: Option<BsError>,
    resize: Option<BsError>,
    sync: Option<BsError>,
    open: HashMap<BlobId, BsError>,
    close: HashMap<BlobId, BsError>,
    hidden_xattrs: HashSet<BlobId>,
}

/// Faults shared between a test and the stores its engine produces
#[derive(Default)]
pub struct Faults {
    set: Mutex<FaultSet>,
    deferred: AtomicBool,
    open_handles: AtomicI64,
    unloads: AtomicUsize,
    deletes: AtomicUsize,
}

impl Faults {
    pub fn fail_load(&self, status: BsError) {
        self.set.lock().load = Some(status);
    }

    pub fn fail_get_super(&self, status: BsError) {
        self.set.lock().get_super = Some(status);
    }

    pub fn fail_set_super(&self, status: BsError) {
        self.set.lock().set_super = Some(status);
    }

    pub fn fail_unload(&self, status: BsError) {
        self.set.lock().unload = Some(status);
    }

    pub fn fail_iter_next(&self, status: BsError) {
        self.set.lock().iter_next = Some(status);
    }

    pub fn fail_resize(&self, status: BsError) {
        self.set.lock().resize = Some(status);
    }

    pub fn fail_sync(&self, status: BsError) {
        self.set.lock().sync = Some(status);
    }

    pub fn fail_open(&self, id: BlobId, status: BsError) {
        self.set.lock().open.insert(id, status);
    }

    pub fn fail_close(&self, id: BlobId, status: BsError) {
        self.set.lock().close.insert(id, status);
    }

    /// Make every xattr of `id` read as absent
    pub fn hide_xattr(&self, id: BlobId) {
        self.set.lock().hidden_xattrs.insert(id);
    }

    /// Complete every call only after yielding to the runtime
    pub fn defer_completions(&self) {
        self.deferred.store(true, Ordering::SeqCst);
    }

    /// Remove every injected failure
    pub fn clear(&self) {
        *self.set.lock() = FaultSet::default();
    }

    /// Handles opened through the wrapper and not yet closed
    pub fn open_handles(&self) -> i64 {
        self.open_handles.load(Ordering::SeqCst)
    }

    /// Successful blob store unloads
    pub fn unloads(&self) -> usize {
        self.unloads.load(Ordering::SeqCst)
    }

    /// Successful blob deletes
    pub fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    async fn pause(&self) {
        if self.deferred.load(Ordering::SeqCst) {
            tokio::task::yield_now().await;
        }
    }
}

/// Engine producing fault-injecting stores over `DevEngine`
pub struct FaultyEngine {
    faults: Arc<Faults>,
}

impl FaultyEngine {
    pub const fn new(faults: Arc<Faults>) -> Self {
        Self { faults }
    }

    fn wrap(&self, inner: Arc<dyn BlobStore>) -> Arc<dyn BlobStore> {
        Arc::new(FaultyStore {
            inner,
            faults: Arc::clone(&self.faults),
            handles: Mutex::new(HashMap::new()),
        })
    }
}

#[async_trait]
impl BlobStoreEngine for FaultyEngine {
    async fn init(&self, dev: Arc<dyn BsDev>, opts: &BsOpts) -> BsResult<Arc<dyn BlobStore>> {
        self.faults.pause().await;
        let inner = DevEngine.init(dev, opts).await?;
        Ok(self.wrap(inner))
    }

    async fn load(&self, dev: Arc<dyn BsDev>, opts: &BsOpts) -> BsResult<Arc<dyn BlobStore>> {
        self.faults.pause().await;
        if let Some(status) = self.faults.set.lock().load {
            return Err(status);
        }
        let inner = DevEngine.load(dev, opts).await?;
        Ok(self.wrap(inner))
    }
}

struct FaultyStore {
    inner: Arc<dyn BlobStore>,
    faults: Arc<Faults>,
    /// Inner handles behind the wrappers given out, per blob
    handles: Mutex<HashMap<BlobId, Vec<BlobHandle>>>,
}

impl FaultyStore {
    fn wrap(&self, inner: BlobHandle) -> BlobHandle {
        let id = inner.id();
        self.handles
            .lock()
            .entry(id)
            .or_default()
            .push(Arc::clone(&inner));
        self.faults.open_handles.fetch_add(1, Ordering::SeqCst);
        Arc::new(FaultyBlob {
            inner,
            faults: Arc::clone(&self.faults),
        })
    }

    fn unwrap_handle(&self, id: BlobId) -> BsResult<BlobHandle> {
        self.handles
            .lock()
            .get_mut(&id)
            .and_then(Vec::pop)
            .ok_or(BsError::INVALID)
    }
}

#[async_trait]
impl BlobStore for FaultyStore {
    fn cluster_size(&self) -> u64 {
        self.inner.cluster_size()
    }

    fn page_size(&self) -> u64 {
        self.inner.page_size()
    }

    fn free_cluster_count(&self) -> u64 {
        self.inner.free_cluster_count()
    }

    fn total_cluster_count(&self) -> u64 {
        self.inner.total_cluster_count()
    }

    fn bstype(&self) -> BsType {
        self.inner.bstype()
    }

    async fn create_blob(&self) -> BsResult<BlobId> {
        self.faults.pause().await;
        self.inner.create_blob().await
    }

    async fn open_blob(&self, id: BlobId) -> BsResult<BlobHandle> {
        self.faults.pause().await;
        if let Some(status) = self.faults.set.lock().open.get(&id).copied() {
            return Err(status);
        }
        let inner = self.inner.open_blob(id).await?;
        Ok(self.wrap(inner))
    }

    async fn close_blob(&self, blob: BlobHandle) -> BsResult<()> {
        self.faults.pause().await;
        let id = blob.id();
        if let Some(status) = self.faults.set.lock().close.get(&id).copied() {
            return Err(status);
        }
        let inner = self.unwrap_handle(id)?;
        self.inner.close_blob(inner).await?;
        self.faults.open_handles.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    async fn sync_blob(&self, blob: &BlobHandle) -> BsResult<()> {
        self.faults.pause().await;
        if let Some(status) = self.faults.set.lock().sync {
            return Err(status);
        }
        let inner = self
            .handles
            .lock()
            .get(&blob.id())
            .and_then(|h| h.last().cloned())
            .ok_or(BsError::INVALID)?;
        self.inner.sync_blob(&inner).await
    }

    async fn delete_blob(&self, id: BlobId) -> BsResult<()> {
        self.faults.pause().await;
        self.inner.delete_blob(id).await?;
        self.faults.deletes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_super(&self) -> BsResult<BlobId> {
        self.faults.pause().await;
        if let Some(status) = self.faults.set.lock().get_super {
            return Err(status);
        }
        self.inner.get_super().await
    }

    async fn set_super(&self, id: BlobId) -> BsResult<()> {
        self.faults.pause().await;
        if let Some(status) = self.faults.set.lock().set_super {
            return Err(status);
        }
        self.inner.set_super(id).await
    }

    async fn iter_first(&self) -> BsResult<Option<BlobHandle>> {
        self.faults.pause().await;
        let first = self.inner.iter_first().await?;
        Ok(first.map(|h| self.wrap(h)))
    }

    async fn iter_next(&self, current: BlobHandle) -> BsResult<Option<BlobHandle>> {
        self.faults.pause().await;
        if let Some(status) = self.faults.set.lock().iter_next {
            return Err(status);
        }
        let inner = self.unwrap_handle(current.id())?;
        let next = self.inner.iter_next(inner).await?;
        self.faults.open_handles.fetch_sub(1, Ordering::SeqCst);
        Ok(next.map(|h| self.wrap(h)))
    }

    async fn unload(&self) -> BsResult<()> {
        self.faults.pause().await;
        if let Some(status) = self.faults.set.lock().unload {
            return Err(status);
        }
        self.inner.unload().await?;
        self.faults.unloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn destroy(&self, unmap_device: bool) -> BsResult<()> {
        self.faults.pause().await;
        self.inner.destroy(unmap_device).await
    }
}

struct FaultyBlob {
    inner: BlobHandle,
    faults: Arc<Faults>,
}

impl Blob for FaultyBlob {
    fn id(&self) -> BlobId {
        self.inner.id()
    }

    fn num_clusters(&self) -> u64 {
        self.inner.num_clusters()
    }

    fn resize(&self, num_clusters: u64) -> BsResult<()> {
        if let Some(status) = self.faults.set.lock().resize {
            return Err(status);
        }
        self.inner.resize(num_clusters)
    }

    fn set_xattr(&self, name: &str, value: &[u8]) -> BsResult<()> {
        self.inner.set_xattr(name, value)
    }

    fn get_xattr(&self, name: &str) -> BsResult<Vec<u8>> {
        if self.faults.set.lock().hidden_xattrs.contains(&self.id()) {
            return Err(BsError::NOT_FOUND);
        }
        self.inner.get_xattr(name)
    }
}
