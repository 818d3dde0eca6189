//! Lvol stores
//!
//! An `LvolStore` owns one blob store instance and the lvols found in it.
//! Geometry is always read from the blob store, never cached.

use crate::error::{LvolError, LvolResult, Step};
use crate::identity;
use crate::lvol::Lvol;
use lvstore_blob::{BlobHandle, BlobStore, BsDev};
use lvstore_common::{BlobId, BsType, clusters_for};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Type tag of blob stores holding lvols
pub const LVS_BSTYPE: BsType = BsType::from_bytes(*b"LVOLSTORE\0\0\0\0\0\0\0");

/// Lifecycle of a store
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LvsState {
    /// Usable
    Active,
    /// Blob store unload in flight
    Unloading,
    /// Blob store destroy in flight
    Destroying,
    /// Torn down; every operation is refused
    Released,
}

/// Kind of store teardown
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Teardown {
    Unload,
    Destroy,
}

impl Teardown {
    const fn state(self) -> LvsState {
        match self {
            Self::Unload => LvsState::Unloading,
            Self::Destroy => LvsState::Destroying,
        }
    }

    const fn step(self) -> Step {
        match self {
            Self::Unload => Step::BsUnload,
            Self::Destroy => Step::BsDestroy,
        }
    }
}

/// Lvol found while scanning a loaded blob store
#[derive(Clone, Copy, Debug)]
pub(crate) struct Discovered {
    pub blob_id: BlobId,
    pub uuid: Uuid,
    pub num_clusters: u64,
}

/// A volume store
pub struct LvolStore {
    uuid: Uuid,
    bs: Arc<dyn BlobStore>,
    dev: Arc<dyn BsDev>,
    super_blob_id: BlobId,
    lvols: Mutex<Vec<Arc<Lvol>>>,
    state: Mutex<LvsState>,
    skipped_blobs: Vec<BlobId>,
}

impl LvolStore {
    pub(crate) fn new(
        uuid: Uuid,
        bs: Arc<dyn BlobStore>,
        dev: Arc<dyn BsDev>,
        super_blob_id: BlobId,
        found: Vec<Discovered>,
        skipped_blobs: Vec<BlobId>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|owner| Self {
            uuid,
            bs,
            dev,
            super_blob_id,
            lvols: Mutex::new(
                found
                    .into_iter()
                    .map(|d| {
                        Arc::new(Lvol::discovered(
                            d.blob_id,
                            d.uuid,
                            d.num_clusters,
                            owner.clone(),
                        ))
                    })
                    .collect(),
            ),
            state: Mutex::new(LvsState::Active),
            skipped_blobs,
        })
    }

    /// Store identity, as persisted on the super blob
    #[must_use]
    pub const fn uuid(&self) -> Uuid {
        self.uuid
    }

    #[must_use]
    pub const fn super_blob_id(&self) -> BlobId {
        self.super_blob_id
    }

    /// Backing blob store
    #[must_use]
    pub fn blob_store(&self) -> &Arc<dyn BlobStore> {
        &self.bs
    }

    /// Device the blob store lives on
    #[must_use]
    pub fn device(&self) -> &Arc<dyn BsDev> {
        &self.dev
    }

    /// Cluster size in bytes
    #[must_use]
    pub fn cluster_size(&self) -> u64 {
        self.bs.cluster_size()
    }

    /// Metadata page size in bytes
    #[must_use]
    pub fn page_size(&self) -> u64 {
        self.bs.page_size()
    }

    /// Clusters currently free for create and resize
    #[must_use]
    pub fn free_clusters(&self) -> u64 {
        self.bs.free_cluster_count()
    }

    /// Data clusters in total
    #[must_use]
    pub fn total_clusters(&self) -> u64 {
        self.bs.total_cluster_count()
    }

    #[must_use]
    pub fn state(&self) -> LvsState {
        *self.state.lock()
    }

    /// Lvols in creation and discovery order
    #[must_use]
    pub fn lvols(&self) -> Vec<Arc<Lvol>> {
        self.lvols.lock().clone()
    }

    #[must_use]
    pub fn lvol_count(&self) -> usize {
        self.lvols.lock().len()
    }

    /// Find an lvol by its identity
    #[must_use]
    pub fn lvol_by_uuid(&self, uuid: &Uuid) -> Option<Arc<Lvol>> {
        self.lvols
            .lock()
            .iter()
            .find(|lvol| lvol.uuid() == *uuid)
            .cloned()
    }

    /// Blobs passed over during load because they carry no valid identity
    #[must_use]
    pub fn skipped_blobs(&self) -> &[BlobId] {
        &self.skipped_blobs
    }

    pub(crate) fn contains_lvol(&self, blob_id: BlobId) -> bool {
        self.lvols.lock().iter().any(|l| l.blob_id() == blob_id)
    }

    pub(crate) fn remove_lvol(&self, blob_id: BlobId) {
        self.lvols.lock().retain(|l| l.blob_id() != blob_id);
    }

    pub(crate) fn check_active(&self) -> LvolResult<()> {
        match self.state() {
            LvsState::Active => Ok(()),
            state => Err(LvolError::invalid_argument(format!(
                "lvol store {} is {:?}",
                self.uuid, state
            ))),
        }
    }

    /// Fail unless `clusters` fit in the present free clusters
    pub(crate) fn check_capacity(&self, clusters: u64) -> LvolResult<()> {
        let available = self.free_clusters();
        if clusters > available {
            return Err(LvolError::CapacityExceeded {
                requested: clusters,
                available,
            });
        }
        Ok(())
    }

    /// Validate a create request and return its size in clusters
    pub(crate) fn check_create(&self, size_bytes: u64) -> LvolResult<u64> {
        self.check_active()?;
        let clusters = clusters_for(size_bytes, self.cluster_size());
        self.check_capacity(clusters)?;
        Ok(clusters)
    }

    fn check_teardown(&self, current: LvsState, kind: Teardown) -> LvolResult<()> {
        match current {
            LvsState::Active => {}
            LvsState::Released => {
                return Err(LvolError::NoDevice {
                    step: kind.step(),
                    status: None,
                });
            }
            LvsState::Unloading | LvsState::Destroying => {
                return Err(LvolError::busy(format!(
                    "lvol store {} is already {:?}",
                    self.uuid, current
                )));
            }
        }

        let lvols = self.lvols.lock();
        match kind {
            Teardown::Unload => {
                if let Some(open) = lvols.iter().find(|l| l.is_open()) {
                    return Err(LvolError::busy(format!(
                        "lvol {} in store {} is open",
                        open.uuid(),
                        self.uuid
                    )));
                }
            }
            Teardown::Destroy => {
                if !lvols.is_empty() {
                    return Err(LvolError::busy(format!(
                        "lvol store {} still holds {} lvol(s)",
                        self.uuid,
                        lvols.len()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Check whether a teardown may start, without changing state
    pub(crate) fn check_teardown_allowed(&self, kind: Teardown) -> LvolResult<()> {
        self.check_teardown(self.state(), kind)
    }

    /// Move to the teardown state if no lvol blocks it
    pub(crate) fn begin_teardown(&self, kind: Teardown) -> LvolResult<()> {
        let mut state = self.state.lock();
        self.check_teardown(*state, kind)?;
        *state = kind.state();
        Ok(())
    }

    /// Return to `Active` after a failed teardown
    pub(crate) fn abort_teardown(&self) {
        *self.state.lock() = LvsState::Active;
    }

    /// Drop every lvol and refuse further operations
    pub(crate) fn release(&self) {
        self.lvols.lock().clear();
        *self.state.lock() = LvsState::Released;
    }

    /// Create an lvol of `size_bytes`, rounded up to whole clusters
    ///
    /// The new lvol comes back open once. On failure the blob is closed and
    /// deleted and the store's lvol set is left as it was.
    pub async fn create_lvol(self: &Arc<Self>, size_bytes: u64) -> LvolResult<Arc<Lvol>> {
        let clusters = self.check_create(size_bytes)?;

        let blob_id = self
            .bs
            .create_blob()
            .await
            .map_err(LvolError::backend(Step::CreateBlob))?;

        let (handle, uuid) = match self.prepare_lvol_blob(blob_id, clusters).await {
            Ok(ready) => ready,
            Err(e) => {
                if let Err(status) = self.bs.delete_blob(blob_id).await {
                    warn!(
                        "Failed to delete blob {} after failed create: {}",
                        blob_id, status
                    );
                }
                return Err(e);
            }
        };

        let lvol = Arc::new(Lvol::created(
            blob_id,
            uuid,
            clusters,
            handle,
            Arc::downgrade(self),
        ));
        self.lvols.lock().push(Arc::clone(&lvol));
        info!(
            "Created lvol {} in store {} ({} clusters, blob {})",
            uuid, self.uuid, clusters, blob_id
        );
        Ok(lvol)
    }

    /// Open, size, tag and sync a new lvol blob
    async fn prepare_lvol_blob(
        &self,
        blob_id: BlobId,
        clusters: u64,
    ) -> LvolResult<(BlobHandle, Uuid)> {
        let handle = self
            .bs
            .open_blob(blob_id)
            .await
            .map_err(LvolError::backend(Step::OpenBlob))?;

        let uuid = Uuid::new_v4();
        let staged = async {
            handle
                .resize(clusters)
                .map_err(LvolError::backend(Step::ResizeBlob))?;
            identity::write_uuid(handle.as_ref(), &uuid)
                .map_err(LvolError::backend(Step::SetXattr))?;
            self.bs
                .sync_blob(&handle)
                .await
                .map_err(LvolError::backend(Step::SyncBlob))
        }
        .await;

        match staged {
            Ok(()) => {
                debug!("Prepared blob {} as lvol {}", blob_id, uuid);
                Ok((handle, uuid))
            }
            Err(e) => {
                if let Err(status) = self.bs.close_blob(handle).await {
                    warn!(
                        "Failed to close blob {} after failed create: {}",
                        blob_id, status
                    );
                }
                Err(e)
            }
        }
    }
}

impl fmt::Debug for LvolStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LvolStore")
            .field("uuid", &self.uuid)
            .field("device", &self.dev.name())
            .field("super_blob_id", &self.super_blob_id)
            .field("state", &self.state())
            .field("lvols", &self.lvol_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bstype_tag() {
        assert_eq!(LVS_BSTYPE, BsType::new("LVOLSTORE").unwrap());
        assert_eq!(LVS_BSTYPE.to_string(), "LVOLSTORE");
    }

    #[test]
    fn test_teardown_targets() {
        assert_eq!(Teardown::Unload.state(), LvsState::Unloading);
        assert_eq!(Teardown::Destroy.state(), LvsState::Destroying);
        assert_eq!(Teardown::Destroy.step(), Step::BsDestroy);
    }
}
