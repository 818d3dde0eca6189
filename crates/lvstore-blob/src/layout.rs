//! On-device layout of a blob store
//!
//! ```text
//! +------------------+  offset 0
//! |   Superblock     |  one page: magic, version, type tag, geometry, crc
//! +------------------+  offset PAGE_SIZE
//! |  Metadata image  |  md_len bytes reserved, md_used bytes of bincode
//! +------------------+  rounded up to a cluster boundary
//! |  Data clusters   |  allocated to blobs through the cluster bitmap
//! +------------------+
//! ```

use crate::error::{BsError, BsResult};
use crate::traits::BsOpts;
use bytes::{Buf, BufMut, BytesMut};
use lvstore_common::{BSTYPE_LEN, BsType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Magic number for the blob store format
pub const MAGIC: [u8; 8] = *b"LVSBLOBS";

/// Current format version
pub const FORMAT_VERSION: u32 = 1;

/// Metadata page size
pub const PAGE_SIZE: u64 = 4096;

/// Superblock at offset 0 of every formatted device
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Superblock {
    pub magic: [u8; 8],
    pub version: u32,
    pub bstype: BsType,
    pub cluster_size: u32,
    pub page_size: u32,
    /// Clusters on the device, metadata clusters included
    pub total_clusters: u64,
    /// Byte offset of the metadata image
    pub md_start: u64,
    /// Bytes reserved for the metadata image
    pub md_len: u64,
    /// Leading clusters holding the superblock and metadata
    pub md_clusters: u64,
    /// Bytes of the metadata image currently in use
    pub md_used: u64,
    /// CRC32C of the metadata image
    pub md_checksum: u32,
    /// CRC32C of every field above
    pub checksum: u32,
}

impl Superblock {
    /// magic(8) + version(4) + bstype(16) + cluster_size(4) + page_size(4) +
    /// total_clusters(8) + md_start(8) + md_len(8) + md_clusters(8) +
    /// md_used(8) + md_checksum(4) = 80
    const CHECKSUM_OFFSET: usize = 80;

    /// Compute the layout for a device of `dev_size` bytes
    pub fn new(dev_size: u64, block_len: u32, opts: &BsOpts) -> BsResult<Self> {
        let cluster_size = u64::from(opts.cluster_size);
        if !opts.cluster_size.is_power_of_two()
            || cluster_size < PAGE_SIZE
            || block_len == 0
            || opts.cluster_size % block_len != 0
        {
            return Err(BsError::INVALID);
        }

        let total_clusters = dev_size / cluster_size;
        let md_pages = if opts.num_md_pages == 0 {
            total_clusters.max(1)
        } else {
            u64::from(opts.num_md_pages)
        };
        let md_len = md_pages * PAGE_SIZE;
        let md_clusters = (PAGE_SIZE + md_len).div_ceil(cluster_size);
        if md_clusters >= total_clusters {
            return Err(BsError::NO_SPACE);
        }

        let mut sb = Self {
            magic: MAGIC,
            version: FORMAT_VERSION,
            bstype: opts.bstype,
            cluster_size: opts.cluster_size,
            page_size: PAGE_SIZE as u32,
            total_clusters,
            md_start: PAGE_SIZE,
            md_len,
            md_clusters,
            md_used: 0,
            md_checksum: 0,
            checksum: 0,
        };
        sb.update_checksum();
        Ok(sb)
    }

    /// Clusters usable for blob data
    #[must_use]
    pub const fn data_clusters(&self) -> u64 {
        self.total_clusters - self.md_clusters
    }

    /// Serialize to one page
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(PAGE_SIZE as usize);
        buf.put_slice(&self.magic);
        buf.put_u32_le(self.version);
        buf.put_slice(self.bstype.as_bytes());
        buf.put_u32_le(self.cluster_size);
        buf.put_u32_le(self.page_size);
        buf.put_u64_le(self.total_clusters);
        buf.put_u64_le(self.md_start);
        buf.put_u64_le(self.md_len);
        buf.put_u64_le(self.md_clusters);
        buf.put_u64_le(self.md_used);
        buf.put_u32_le(self.md_checksum);
        buf.put_u32_le(self.checksum);
        buf.resize(PAGE_SIZE as usize, 0);
        buf.to_vec()
    }

    /// Parse and verify a superblock page
    pub fn from_bytes(data: &[u8]) -> BsResult<Self> {
        if data.len() < Self::CHECKSUM_OFFSET + 4 {
            return Err(BsError::CORRUPT);
        }

        let mut buf = data;
        let mut magic = [0u8; 8];
        buf.copy_to_slice(&mut magic);
        if magic != MAGIC {
            return Err(BsError::CORRUPT);
        }

        let version = buf.get_u32_le();
        if version != FORMAT_VERSION {
            return Err(BsError::CORRUPT);
        }

        let mut tag = [0u8; BSTYPE_LEN];
        buf.copy_to_slice(&mut tag);

        let sb = Self {
            magic,
            version,
            bstype: BsType::from_bytes(tag),
            cluster_size: buf.get_u32_le(),
            page_size: buf.get_u32_le(),
            total_clusters: buf.get_u64_le(),
            md_start: buf.get_u64_le(),
            md_len: buf.get_u64_le(),
            md_clusters: buf.get_u64_le(),
            md_used: buf.get_u64_le(),
            md_checksum: buf.get_u32_le(),
            checksum: buf.get_u32_le(),
        };

        if sb.compute_checksum() != sb.checksum {
            return Err(BsError::CORRUPT);
        }
        Ok(sb)
    }

    fn compute_checksum(&self) -> u32 {
        let bytes = self.to_bytes();
        crc32c::crc32c(&bytes[..Self::CHECKSUM_OFFSET])
    }

    /// Update the checksum after modifying other fields
    pub fn update_checksum(&mut self) {
        self.checksum = self.compute_checksum();
    }
}

/// Persistent metadata of one blob
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobMd {
    pub id: u64,
    /// Cluster indices in blob order
    pub clusters: Vec<u64>,
    pub xattrs: BTreeMap<String, Vec<u8>>,
}

/// Metadata image written after the superblock
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MdImage {
    pub super_blob: Option<u64>,
    pub next_id: u64,
    pub blobs: Vec<BlobMd>,
}

impl MdImage {
    pub fn encode(&self) -> BsResult<Vec<u8>> {
        bincode::serialize(self).map_err(|_| BsError::IO)
    }

    pub fn decode(data: &[u8]) -> BsResult<Self> {
        bincode::deserialize(data).map_err(|_| BsError::CORRUPT)
    }
}
