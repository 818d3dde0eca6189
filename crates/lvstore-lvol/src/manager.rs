//! Store lifecycle: init, load, unload and destroy
//!
//! Each operation is one async chain over the blob store. The first failing
//! step ends the chain; whatever was built so far is torn down best-effort
//! and the registry only ever sees fully formed stores.

use crate::error::{LvolError, LvolResult, Step};
use crate::identity;
use crate::lvs::{Discovered, LVS_BSTYPE, LvolStore, Teardown};
use crate::registry::LvsRegistry;
use lvstore_blob::{BlobHandle, BlobStore, BlobStoreEngine, BsDev, BsOpts};
use lvstore_common::{BlobId, LvsOpts};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Drives store lifecycles against one blob store engine
pub struct LvolManager {
    engine: Arc<dyn BlobStoreEngine>,
    registry: Arc<LvsRegistry>,
}

/// What a load scan found besides the super blob
struct Recovered {
    uuid: Uuid,
    super_blob_id: BlobId,
    found: Vec<Discovered>,
    skipped: Vec<BlobId>,
}

/// Reject devices with no usable geometry before touching the engine
pub(crate) fn check_device(dev: &dyn BsDev) -> LvolResult<()> {
    if dev.block_count() == 0 || dev.block_len() == 0 {
        return Err(LvolError::invalid_argument(format!(
            "device {} has no usable geometry ({} blocks of {} bytes)",
            dev.name(),
            dev.block_count(),
            dev.block_len()
        )));
    }
    Ok(())
}

impl LvolManager {
    pub fn new(engine: Arc<dyn BlobStoreEngine>, registry: Arc<LvsRegistry>) -> Self {
        Self { engine, registry }
    }

    /// Registry this manager publishes stores to
    #[must_use]
    pub const fn registry(&self) -> &Arc<LvsRegistry> {
        &self.registry
    }

    /// Format `dev` and create a new, empty store on it
    pub async fn init(&self, dev: Arc<dyn BsDev>, opts: &LvsOpts) -> LvolResult<Arc<LvolStore>> {
        check_device(dev.as_ref())?;

        let bs_opts = BsOpts::from_lvs_opts(opts, LVS_BSTYPE);
        let bs = self
            .engine
            .init(Arc::clone(&dev), &bs_opts)
            .await
            .map_err(LvolError::backend(Step::BsInit))?;

        let (super_blob_id, uuid) = match Self::write_super_blob(bs.as_ref()).await {
            Ok(ids) => ids,
            Err(e) => {
                Self::discard(bs.as_ref()).await;
                return Err(e);
            }
        };

        let lvs = LvolStore::new(uuid, bs, dev, super_blob_id, Vec::new(), Vec::new());
        if let Err(e) = self.registry.register(&lvs) {
            Self::discard(lvs.blob_store().as_ref()).await;
            return Err(e);
        }

        info!(
            "Initialized lvol store {} on {} (cluster_size={}, clusters={})",
            uuid,
            lvs.device().name(),
            lvs.cluster_size(),
            lvs.total_clusters()
        );
        Ok(lvs)
    }

    /// Create the super blob and record the store identity on it
    async fn write_super_blob(bs: &dyn BlobStore) -> LvolResult<(BlobId, Uuid)> {
        let super_blob_id = bs
            .create_blob()
            .await
            .map_err(LvolError::backend(Step::CreateBlob))?;
        let blob = bs
            .open_blob(super_blob_id)
            .await
            .map_err(LvolError::backend(Step::OpenBlob))?;

        let uuid = Uuid::new_v4();
        if let Err(status) = identity::write_uuid(blob.as_ref(), &uuid) {
            Self::close_quietly(bs, blob).await;
            return Err(LvolError::backend(Step::SetXattr)(status));
        }
        if let Err(status) = bs.set_super(super_blob_id).await {
            Self::close_quietly(bs, blob).await;
            return Err(LvolError::backend(Step::SetSuper)(status));
        }
        bs.close_blob(blob)
            .await
            .map_err(LvolError::backend(Step::CloseBlob))?;

        debug!("Wrote super blob {} for store {}", super_blob_id, uuid);
        Ok((super_blob_id, uuid))
    }

    /// Recover the store on `dev`, with every lvol it holds
    pub async fn load(&self, dev: Arc<dyn BsDev>) -> LvolResult<Arc<LvolStore>> {
        check_device(dev.as_ref())?;

        let bs_opts = BsOpts {
            bstype: LVS_BSTYPE,
            ..BsOpts::default()
        };
        let bs = self
            .engine
            .load(Arc::clone(&dev), &bs_opts)
            .await
            .map_err(LvolError::no_device(Step::BsLoad))?;

        let recovered = match self.recover(bs.as_ref()).await {
            Ok(recovered) => recovered,
            Err(e) => {
                Self::discard(bs.as_ref()).await;
                return Err(e);
            }
        };

        let lvs = LvolStore::new(
            recovered.uuid,
            bs,
            dev,
            recovered.super_blob_id,
            recovered.found,
            recovered.skipped,
        );
        if let Err(e) = self.registry.register(&lvs) {
            Self::discard(lvs.blob_store().as_ref()).await;
            return Err(e);
        }

        info!(
            "Loaded lvol store {} from {} ({} lvols, {} skipped)",
            lvs.uuid(),
            lvs.device().name(),
            lvs.lvol_count(),
            lvs.skipped_blobs().len()
        );
        Ok(lvs)
    }

    async fn recover(&self, bs: &dyn BlobStore) -> LvolResult<Recovered> {
        let super_blob_id = bs
            .get_super()
            .await
            .map_err(LvolError::no_device(Step::GetSuper))?;
        let blob = bs
            .open_blob(super_blob_id)
            .await
            .map_err(LvolError::no_device(Step::OpenBlob))?;

        let uuid = match identity::read_uuid(blob.as_ref()) {
            Ok(uuid) => uuid,
            Err(status) => {
                Self::close_quietly(bs, blob).await;
                return Err(LvolError::no_device(Step::GetXattr)(status));
            }
        };
        bs.close_blob(blob)
            .await
            .map_err(LvolError::no_device(Step::CloseBlob))?;

        if self.registry.find_by_uuid(&uuid).is_some() {
            return Err(LvolError::AlreadyExists(uuid));
        }

        let mut found = Vec::new();
        let mut skipped = Vec::new();
        let mut cursor = bs
            .iter_first()
            .await
            .map_err(LvolError::no_device(Step::Iterate))?;

        while let Some(blob) = cursor {
            let blob_id = blob.id();
            if blob_id != super_blob_id {
                match identity::read_uuid(blob.as_ref()) {
                    Ok(lvol_uuid) => {
                        debug!("Found lvol {} in blob {}", lvol_uuid, blob_id);
                        found.push(Discovered {
                            blob_id,
                            uuid: lvol_uuid,
                            num_clusters: blob.num_clusters(),
                        });
                    }
                    Err(status) => {
                        warn!(
                            "Skipping blob {} in store {}: no valid lvol identity ({})",
                            blob_id, uuid, status
                        );
                        skipped.push(blob_id);
                    }
                }
            }
            cursor = bs
                .iter_next(blob)
                .await
                .map_err(LvolError::no_device(Step::Iterate))?;
        }

        Ok(Recovered {
            uuid,
            super_blob_id,
            found,
            skipped,
        })
    }

    /// Unload a store whose lvols are all closed
    pub async fn unload(&self, lvs: &Arc<LvolStore>) -> LvolResult<()> {
        lvs.begin_teardown(Teardown::Unload)?;
        if let Err(status) = lvs.blob_store().unload().await {
            lvs.abort_teardown();
            return Err(LvolError::backend(Step::BsUnload)(status));
        }

        self.registry.deregister(lvs);
        lvs.release();
        info!("Unloaded lvol store {}", lvs.uuid());
        Ok(())
    }

    /// Destroy a store that holds no lvols
    pub async fn destroy(&self, lvs: &Arc<LvolStore>, unmap_device: bool) -> LvolResult<()> {
        lvs.begin_teardown(Teardown::Destroy)?;
        if let Err(status) = lvs.blob_store().destroy(unmap_device).await {
            lvs.abort_teardown();
            return Err(LvolError::backend(Step::BsDestroy)(status));
        }

        self.registry.deregister(lvs);
        lvs.release();
        info!(
            "Destroyed lvol store {} (unmap={})",
            lvs.uuid(),
            unmap_device
        );
        Ok(())
    }

    async fn close_quietly(bs: &dyn BlobStore, blob: BlobHandle) {
        let blob_id = blob.id();
        if let Err(status) = bs.close_blob(blob).await {
            warn!("Failed to close blob {} during cleanup: {}", blob_id, status);
        }
    }

    /// Best-effort unload of a blob store that will not become a store
    async fn discard(bs: &dyn BlobStore) {
        if let Err(status) = bs.unload().await {
            warn!("Failed to unload blob store during cleanup: {}", status);
        }
    }
}
