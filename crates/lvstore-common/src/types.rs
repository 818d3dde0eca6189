//! Core type definitions for lvstore
//!
//! Identifiers and tags that cross the boundary between the blob store
//! adapter and the lvol layer.

use crate::error::{Error, Result};
use derive_more::{From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identifier of a blob inside one blob store
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, From, Into,
)]
pub struct BlobId(u64);

impl BlobId {
    /// Wrap a raw blob identifier
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw identifier
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlobId({:#x})", self.0)
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Length of the on-disk store type tag
pub const BSTYPE_LEN: usize = 16;

/// Store type tag
///
/// Written into the blob store superblock so that stores of different
/// formats sharing the same backend can tell each other apart. An empty tag
/// matches any store on load.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BsType([u8; BSTYPE_LEN]);

impl BsType {
    /// Build a tag from text (at most `BSTYPE_LEN` bytes)
    pub fn new(tag: &str) -> Result<Self> {
        let bytes = tag.as_bytes();
        if bytes.len() > BSTYPE_LEN {
            return Err(Error::invalid_argument(format!(
                "store type tag {tag:?} exceeds {BSTYPE_LEN} bytes"
            )));
        }
        let mut raw = [0u8; BSTYPE_LEN];
        raw[..bytes.len()].copy_from_slice(bytes);
        Ok(Self(raw))
    }

    /// Rebuild a tag from its raw on-disk bytes
    #[must_use]
    pub const fn from_bytes(raw: [u8; BSTYPE_LEN]) -> Self {
        Self(raw)
    }

    /// Raw on-disk bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; BSTYPE_LEN] {
        &self.0
    }

    /// Whether the tag is unset
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Whether a store written with `self` may be opened when `requested` is asked for
    #[must_use]
    pub fn accepts(&self, requested: &BsType) -> bool {
        requested.is_empty() || self == requested
    }

    fn text(&self) -> String {
        let end = self.0.iter().position(|b| *b == 0).unwrap_or(BSTYPE_LEN);
        String::from_utf8_lossy(&self.0[..end]).into_owned()
    }
}

impl fmt::Debug for BsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BsType({:?})", self.text())
    }
}

impl fmt::Display for BsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text())
    }
}

/// Number of clusters needed to hold `bytes`, rounding up
#[must_use]
pub const fn clusters_for(bytes: u64, cluster_size: u64) -> u64 {
    if cluster_size == 0 {
        return 0;
    }
    bytes.div_ceil(cluster_size)
}
