//! Device-backed blob store engine
//!
//! `DevEngine` formats or recovers a `DevBlobStore` on any `BsDev`. All blob
//! metadata lives in memory behind one lock and is written back as a single
//! metadata image whenever it changes durably (create, sync, close of a
//! dirty blob, delete, set-super, unload).

use crate::bitmap::ClusterBitmap;
use crate::dev::BsDev;
use crate::error::{BsError, BsResult};
use crate::layout::{BlobMd, MdImage, PAGE_SIZE, Superblock};
use crate::traits::{Blob, BlobHandle, BlobStore, BlobStoreEngine, BsOpts};
use async_trait::async_trait;
use lvstore_common::{BlobId, BsType};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Engine formatting and loading `DevBlobStore`s
#[derive(Clone, Copy, Debug, Default)]
pub struct DevEngine;

#[async_trait]
impl BlobStoreEngine for DevEngine {
    async fn init(&self, dev: Arc<dyn BsDev>, opts: &BsOpts) -> BsResult<Arc<dyn BlobStore>> {
        let store = DevBlobStore::format(dev, opts)?;
        Ok(Arc::new(store))
    }

    async fn load(&self, dev: Arc<dyn BsDev>, opts: &BsOpts) -> BsResult<Arc<dyn BlobStore>> {
        let store = DevBlobStore::recover(dev, opts)?;
        Ok(Arc::new(store))
    }
}

#[derive(Debug, Default)]
struct BlobState {
    clusters: Vec<u64>,
    xattrs: BTreeMap<String, Vec<u8>>,
    open_refs: u32,
    dirty: bool,
}

struct State {
    sb: Superblock,
    blobs: BTreeMap<BlobId, BlobState>,
    super_blob: Option<BlobId>,
    next_id: u64,
    bitmap: ClusterBitmap,
    unloaded: bool,
}

impl State {
    fn live(&self) -> BsResult<()> {
        if self.unloaded {
            return Err(BsError::NO_DEVICE);
        }
        Ok(())
    }

    fn image(&self) -> MdImage {
        MdImage {
            super_blob: self.super_blob.map(BlobId::as_u64),
            next_id: self.next_id,
            blobs: self
                .blobs
                .iter()
                .map(|(id, blob)| BlobMd {
                    id: id.as_u64(),
                    clusters: blob.clusters.clone(),
                    xattrs: blob.xattrs.clone(),
                })
                .collect(),
        }
    }

    /// Write the metadata image and superblock back to the device
    fn persist(&mut self, dev: &dyn BsDev) -> BsResult<()> {
        let image = self.image().encode()?;
        if image.len() as u64 > self.sb.md_len {
            warn!(
                "Metadata image of {} bytes exceeds the {} reserved on {}",
                image.len(),
                self.sb.md_len,
                dev.name()
            );
            return Err(BsError::NO_SPACE);
        }

        dev.write_at(self.sb.md_start, &image)?;
        self.sb.md_used = image.len() as u64;
        self.sb.md_checksum = crc32c::crc32c(&image);
        self.sb.update_checksum();
        dev.write_at(0, &self.sb.to_bytes())?;
        dev.flush()?;

        for blob in self.blobs.values_mut() {
            blob.dirty = false;
        }
        Ok(())
    }

    fn blob_mut(&mut self, id: BlobId) -> BsResult<&mut BlobState> {
        self.blobs.get_mut(&id).ok_or(BsError::NOT_FOUND)
    }

    /// Blob that is currently held open by at least one handle
    fn open_blob_mut(&mut self, id: BlobId) -> BsResult<&mut BlobState> {
        let blob = self.blob_mut(id)?;
        if blob.open_refs == 0 {
            return Err(BsError::INVALID);
        }
        Ok(blob)
    }
}

struct Inner {
    dev: Arc<dyn BsDev>,
    cluster_size: u64,
    page_size: u64,
    data_clusters: u64,
    bstype: BsType,
    state: Mutex<State>,
}

impl Inner {
    fn open(self: &Arc<Self>, id: BlobId) -> BsResult<BlobHandle> {
        let mut state = self.state.lock();
        state.live()?;
        let blob = state.blob_mut(id)?;
        blob.open_refs += 1;
        debug!("Opened blob {} (refs={})", id, blob.open_refs);
        Ok(Arc::new(DevBlob {
            id,
            store: Arc::clone(self),
        }))
    }

    fn close(&self, id: BlobId) -> BsResult<()> {
        let mut state = self.state.lock();
        state.live()?;
        let blob = state.open_blob_mut(id)?;
        blob.open_refs -= 1;
        let dirty = blob.dirty;
        debug!("Closed blob {} (refs={})", id, blob.open_refs);
        if dirty {
            state.persist(self.dev.as_ref())?;
        }
        Ok(())
    }
}

/// Blob store keeping its metadata on a block device
pub struct DevBlobStore {
    inner: Arc<Inner>,
}

impl DevBlobStore {
    /// Write a fresh, empty store onto `dev`
    pub fn format(dev: Arc<dyn BsDev>, opts: &BsOpts) -> BsResult<Self> {
        if dev.block_count() == 0 || dev.block_len() == 0 {
            return Err(BsError::INVALID);
        }

        let sb = Superblock::new(dev.size_bytes(), dev.block_len(), opts)?;
        let mut bitmap = ClusterBitmap::new(sb.total_clusters);
        for cluster in 0..sb.md_clusters {
            bitmap.mark_used(cluster)?;
        }

        let mut state = State {
            sb,
            blobs: BTreeMap::new(),
            super_blob: None,
            next_id: 1,
            bitmap,
            unloaded: false,
        };
        state.persist(dev.as_ref())?;

        info!(
            "Formatted blob store on {}: type={}, cluster_size={}, clusters={}, md_clusters={}",
            dev.name(),
            opts.bstype,
            opts.cluster_size,
            state.sb.total_clusters,
            state.sb.md_clusters
        );
        Ok(Self::from_state(dev, state))
    }

    /// Recover the store previously written to `dev`
    pub fn recover(dev: Arc<dyn BsDev>, opts: &BsOpts) -> BsResult<Self> {
        if dev.size_bytes() < PAGE_SIZE {
            return Err(BsError::CORRUPT);
        }

        let mut page = vec![0u8; PAGE_SIZE as usize];
        dev.read_at(0, &mut page)?;
        let sb = Superblock::from_bytes(&page)?;

        if !sb.bstype.accepts(&opts.bstype) {
            debug!(
                "Store type {} on {} does not match requested {}",
                sb.bstype,
                dev.name(),
                opts.bstype
            );
            return Err(BsError::NO_SUCH_DEVICE);
        }

        let end = sb.total_clusters * u64::from(sb.cluster_size);
        if end > dev.size_bytes() || sb.md_used > sb.md_len || sb.md_clusters >= sb.total_clusters
        {
            return Err(BsError::CORRUPT);
        }

        let mut raw = vec![0u8; sb.md_used as usize];
        dev.read_at(sb.md_start, &mut raw)?;
        if crc32c::crc32c(&raw) != sb.md_checksum {
            return Err(BsError::CORRUPT);
        }
        let image = MdImage::decode(&raw)?;

        let mut bitmap = ClusterBitmap::new(sb.total_clusters);
        for cluster in 0..sb.md_clusters {
            bitmap.mark_used(cluster)?;
        }

        let mut blobs = BTreeMap::new();
        let mut max_id = 0;
        for md in image.blobs {
            for &cluster in &md.clusters {
                bitmap.mark_used(cluster)?;
            }
            max_id = max_id.max(md.id);
            blobs.insert(
                BlobId::new(md.id),
                BlobState {
                    clusters: md.clusters,
                    xattrs: md.xattrs,
                    ..BlobState::default()
                },
            );
        }

        let super_blob = image.super_blob.map(BlobId::new);
        if super_blob.is_some_and(|id| !blobs.contains_key(&id)) {
            return Err(BsError::CORRUPT);
        }

        info!(
            "Loaded blob store from {}: type={}, blobs={}, free_clusters={}",
            dev.name(),
            sb.bstype,
            blobs.len(),
            bitmap.free_count()
        );

        let state = State {
            sb,
            blobs,
            super_blob,
            next_id: image.next_id.max(max_id + 1),
            bitmap,
            unloaded: false,
        };
        Ok(Self::from_state(dev, state))
    }

    fn from_state(dev: Arc<dyn BsDev>, state: State) -> Self {
        Self {
            inner: Arc::new(Inner {
                dev,
                cluster_size: u64::from(state.sb.cluster_size),
                page_size: u64::from(state.sb.page_size),
                data_clusters: state.sb.data_clusters(),
                bstype: state.sb.bstype,
                state: Mutex::new(state),
            }),
        }
    }

    /// Number of blobs in the store
    #[must_use]
    pub fn blob_count(&self) -> usize {
        self.inner.state.lock().blobs.len()
    }

    /// Number of outstanding open handles across all blobs
    #[must_use]
    pub fn open_handle_count(&self) -> u64 {
        self.inner
            .state
            .lock()
            .blobs
            .values()
            .map(|b| u64::from(b.open_refs))
            .sum()
    }
}

#[async_trait]
impl BlobStore for DevBlobStore {
    fn cluster_size(&self) -> u64 {
        self.inner.cluster_size
    }

    fn page_size(&self) -> u64 {
        self.inner.page_size
    }

    fn free_cluster_count(&self) -> u64 {
        self.inner.state.lock().bitmap.free_count()
    }

    fn total_cluster_count(&self) -> u64 {
        self.inner.data_clusters
    }

    fn bstype(&self) -> BsType {
        self.inner.bstype
    }

    async fn create_blob(&self) -> BsResult<BlobId> {
        let mut state = self.inner.state.lock();
        state.live()?;
        let id = BlobId::new(state.next_id);
        state.next_id += 1;
        state.blobs.insert(id, BlobState::default());
        if let Err(e) = state.persist(self.inner.dev.as_ref()) {
            state.blobs.remove(&id);
            return Err(e);
        }
        debug!("Created blob {}", id);
        Ok(id)
    }

    async fn open_blob(&self, id: BlobId) -> BsResult<BlobHandle> {
        self.inner.open(id)
    }

    async fn close_blob(&self, blob: BlobHandle) -> BsResult<()> {
        self.inner.close(blob.id())
    }

    async fn sync_blob(&self, blob: &BlobHandle) -> BsResult<()> {
        let mut state = self.inner.state.lock();
        state.live()?;
        if state.open_blob_mut(blob.id())?.dirty {
            state.persist(self.inner.dev.as_ref())?;
        }
        Ok(())
    }

    async fn delete_blob(&self, id: BlobId) -> BsResult<()> {
        let mut state = self.inner.state.lock();
        state.live()?;
        if state.blob_mut(id)?.open_refs > 0 {
            return Err(BsError::BUSY);
        }

        let Some(blob) = state.blobs.remove(&id) else {
            return Err(BsError::NOT_FOUND);
        };
        for &cluster in &blob.clusters {
            state.bitmap.release(cluster)?;
        }
        if state.super_blob == Some(id) {
            state.super_blob = None;
        }
        state.persist(self.inner.dev.as_ref())?;
        debug!("Deleted blob {} ({} clusters)", id, blob.clusters.len());
        Ok(())
    }

    async fn get_super(&self) -> BsResult<BlobId> {
        let state = self.inner.state.lock();
        state.live()?;
        state.super_blob.ok_or(BsError::NOT_FOUND)
    }

    async fn set_super(&self, id: BlobId) -> BsResult<()> {
        let mut state = self.inner.state.lock();
        state.live()?;
        state.blob_mut(id)?;
        state.super_blob = Some(id);
        state.persist(self.inner.dev.as_ref())
    }

    async fn iter_first(&self) -> BsResult<Option<BlobHandle>> {
        let first = {
            let state = self.inner.state.lock();
            state.live()?;
            state.blobs.keys().next().copied()
        };
        first.map(|id| self.inner.open(id)).transpose()
    }

    async fn iter_next(&self, current: BlobHandle) -> BsResult<Option<BlobHandle>> {
        let id = current.id();
        self.inner.close(id)?;
        let next = {
            let state = self.inner.state.lock();
            state
                .blobs
                .range((Bound::Excluded(id), Bound::Unbounded))
                .next()
                .map(|(id, _)| *id)
        };
        next.map(|id| self.inner.open(id)).transpose()
    }

    async fn unload(&self) -> BsResult<()> {
        let mut state = self.inner.state.lock();
        state.live()?;
        let open = state.blobs.values().filter(|b| b.open_refs > 0).count();
        if open > 0 {
            warn!(
                "Unloading blob store on {} with {} blob(s) still open",
                self.inner.dev.name(),
                open
            );
        }
        state.persist(self.inner.dev.as_ref())?;
        state.unloaded = true;
        info!("Unloaded blob store on {}", self.inner.dev.name());
        Ok(())
    }

    async fn destroy(&self, unmap_device: bool) -> BsResult<()> {
        let mut state = self.inner.state.lock();
        state.live()?;
        let dev = self.inner.dev.as_ref();
        dev.write_at(0, &vec![0u8; PAGE_SIZE as usize])?;
        if unmap_device {
            dev.unmap(0, dev.size_bytes())?;
        }
        dev.flush()?;
        state.unloaded = true;
        info!(
            "Destroyed blob store on {} (unmap={})",
            dev.name(),
            unmap_device
        );
        Ok(())
    }
}

/// Handle to an open blob of a `DevBlobStore`
struct DevBlob {
    id: BlobId,
    store: Arc<Inner>,
}

impl Blob for DevBlob {
    fn id(&self) -> BlobId {
        self.id
    }

    fn num_clusters(&self) -> u64 {
        self.store
            .state
            .lock()
            .blobs
            .get(&self.id)
            .map_or(0, |b| b.clusters.len() as u64)
    }

    fn resize(&self, num_clusters: u64) -> BsResult<()> {
        let mut guard = self.store.state.lock();
        guard.live()?;
        guard.open_blob_mut(self.id)?;

        let State { blobs, bitmap, .. } = &mut *guard;
        let blob = blobs.get_mut(&self.id).ok_or(BsError::NOT_FOUND)?;
        let current = blob.clusters.len() as u64;

        if num_clusters > current {
            let added = bitmap
                .allocate_many(num_clusters - current)
                .ok_or(BsError::NO_SPACE)?;
            blob.clusters.extend(added);
        } else {
            for cluster in blob.clusters.drain(num_clusters as usize..) {
                bitmap.release(cluster)?;
            }
        }
        blob.dirty = true;
        debug!("Resized blob {} from {} to {} clusters", self.id, current, num_clusters);
        Ok(())
    }

    fn set_xattr(&self, name: &str, value: &[u8]) -> BsResult<()> {
        let mut state = self.store.state.lock();
        state.live()?;
        let blob = state.open_blob_mut(self.id)?;
        blob.xattrs.insert(name.to_string(), value.to_vec());
        blob.dirty = true;
        Ok(())
    }

    fn get_xattr(&self, name: &str) -> BsResult<Vec<u8>> {
        let mut state = self.store.state.lock();
        state.live()?;
        state
            .open_blob_mut(self.id)?
            .xattrs
            .get(name)
            .cloned()
            .ok_or(BsError::NOT_FOUND)
    }
}
