//! Blob store adapter interface
//!
//! The lvol layer talks to its backing store only through these traits.
//! Every asynchronous operation completes exactly once; an implementation is
//! free to complete immediately or after yielding.

use crate::dev::BsDev;
use crate::error::BsResult;
use async_trait::async_trait;
use lvstore_common::{BlobId, BsType, LvsOpts};
use std::sync::Arc;

/// Options passed to `BlobStoreEngine::init` and `BlobStoreEngine::load`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BsOpts {
    /// Cluster size in bytes
    pub cluster_size: u32,
    /// Metadata page budget; 0 means one page per cluster
    pub num_md_pages: u32,
    /// Maximum concurrent metadata operations
    pub max_md_ops: u32,
    /// Maximum concurrent operations per channel
    pub max_channel_ops: u32,
    /// Store type tag written on init and checked on load
    pub bstype: BsType,
}

impl BsOpts {
    /// Blob store options carrying the given lvstore options and tag
    #[must_use]
    pub fn from_lvs_opts(opts: &LvsOpts, bstype: BsType) -> Self {
        Self {
            cluster_size: opts.cluster_size,
            num_md_pages: opts.num_md_pages,
            max_md_ops: opts.max_md_ops,
            max_channel_ops: opts.max_channel_ops,
            bstype,
        }
    }
}

impl Default for BsOpts {
    fn default() -> Self {
        Self::from_lvs_opts(&LvsOpts::default(), BsType::default())
    }
}

/// An open blob
///
/// Handles are obtained from `BlobStore::open_blob` or the iterator and must
/// be given back through `BlobStore::close_blob`. Metadata changes made
/// through a handle become durable on sync or close.
pub trait Blob: Send + Sync {
    /// Identifier of the blob
    fn id(&self) -> BlobId;

    /// Current size in clusters
    fn num_clusters(&self) -> u64;

    /// Grow or shrink the blob to `num_clusters`
    fn resize(&self, num_clusters: u64) -> BsResult<()>;

    /// Set an extended attribute, replacing any previous value
    fn set_xattr(&self, name: &str, value: &[u8]) -> BsResult<()>;

    /// Read an extended attribute; `BsError::NOT_FOUND` if absent
    fn get_xattr(&self, name: &str) -> BsResult<Vec<u8>>;
}

/// Shared handle to an open blob
pub type BlobHandle = Arc<dyn Blob>;

/// A live blob store instance
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Cluster size in bytes
    fn cluster_size(&self) -> u64;

    /// Metadata page size in bytes
    fn page_size(&self) -> u64;

    /// Clusters not allocated to any blob or to metadata
    fn free_cluster_count(&self) -> u64;

    /// Clusters available for blob data in total
    fn total_cluster_count(&self) -> u64;

    /// Type tag the store was created with
    fn bstype(&self) -> BsType;

    /// Create an empty blob
    async fn create_blob(&self) -> BsResult<BlobId>;

    /// Open a blob; each open must be matched by a close
    async fn open_blob(&self, id: BlobId) -> BsResult<BlobHandle>;

    /// Close a handle, persisting any dirty metadata
    async fn close_blob(&self, blob: BlobHandle) -> BsResult<()>;

    /// Persist metadata changes made through `blob`
    async fn sync_blob(&self, blob: &BlobHandle) -> BsResult<()>;

    /// Delete a closed blob and release its clusters
    async fn delete_blob(&self, id: BlobId) -> BsResult<()>;

    /// Identifier stored in the super pointer
    async fn get_super(&self) -> BsResult<BlobId>;

    /// Store `id` in the super pointer
    async fn set_super(&self, id: BlobId) -> BsResult<()>;

    /// Open the first blob in iteration order; `None` when the store is empty
    async fn iter_first(&self) -> BsResult<Option<BlobHandle>>;

    /// Close `current` and open the blob after it; `None` at the end
    async fn iter_next(&self, current: BlobHandle) -> BsResult<Option<BlobHandle>>;

    /// Persist all metadata and release the store
    async fn unload(&self) -> BsResult<()>;

    /// Erase the store from its device, optionally unmapping the whole device
    async fn destroy(&self, unmap_device: bool) -> BsResult<()>;
}

/// Entry points that format or recover a blob store on a device
#[async_trait]
pub trait BlobStoreEngine: Send + Sync {
    /// Format `dev` with a new, empty store
    async fn init(&self, dev: Arc<dyn BsDev>, opts: &BsOpts) -> BsResult<Arc<dyn BlobStore>>;

    /// Recover the store previously written to `dev`
    async fn load(&self, dev: Arc<dyn BsDev>, opts: &BsOpts) -> BsResult<Arc<dyn BlobStore>>;
}
