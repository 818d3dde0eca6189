//! lvstore Blob - Blob store adapter and device-backed engine
//!
//! This crate provides:
//! - The asynchronous blob store interface consumed by the lvol layer
//! - Blob store status codes (`BsError`)
//! - Block devices (`MemDev`, `FileDev`)
//! - A concrete engine keeping cluster maps and xattrs on the device

pub mod bitmap;
pub mod dev;
pub mod error;
pub mod layout;
pub mod store;
pub mod traits;

// Re-exports
pub use bitmap::ClusterBitmap;
pub use dev::{BsDev, DevStats, FileDev, MemDev};
pub use error::{BsError, BsResult};
pub use layout::{FORMAT_VERSION, MAGIC, PAGE_SIZE, Superblock};
pub use store::{DevBlobStore, DevEngine};
pub use traits::{Blob, BlobHandle, BlobStore, BlobStoreEngine, BsOpts};
