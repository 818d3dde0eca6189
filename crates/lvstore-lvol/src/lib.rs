//! lvstore Lvol - Logical volume stores over a blob store
//!
//! This crate provides:
//! - `LvolStore` and `Lvol` lifecycles (init, load, unload, destroy, create,
//!   open, close, resize)
//! - An explicit `LvsRegistry` of live stores
//! - `LvolThread`, a serialized completion-callback front end
//! - The on-blob UUID attribute codec

pub mod error;
pub mod identity;
pub mod lvol;
pub mod lvs;
pub mod manager;
pub mod registry;
pub mod thread;

#[cfg(test)]
mod testutil;

// Re-exports
pub use error::{LvolError, LvolResult, Step};
pub use identity::{UUID_STRING_LEN, UUID_XATTR, decode_uuid, encode_uuid, read_uuid, write_uuid};
pub use lvol::{Lvol, OpenCount};
pub use lvs::{LVS_BSTYPE, LvolStore, LvsState};
pub use manager::LvolManager;
pub use registry::LvsRegistry;
pub use thread::LvolThread;
