//! Cluster allocation bitmap
//!
//! One bit per cluster: 0 = free, 1 = used. The bitmap is not persisted on
//! its own; on load it is rebuilt from the cluster lists in the metadata
//! image. Callers serialise access through the store's state lock.

use crate::error::{BsError, BsResult};

/// Bitmap tracking allocated clusters
#[derive(Debug, Clone)]
pub struct ClusterBitmap {
    data: Vec<u8>,
    total: u64,
    free: u64,
    /// Where the next search starts
    hint: u64,
}

impl ClusterBitmap {
    /// Create a bitmap with every cluster free
    #[must_use]
    pub fn new(total: u64) -> Self {
        Self {
            data: vec![0u8; total.div_ceil(8) as usize],
            total,
            free: total,
            hint: 0,
        }
    }

    /// Total number of clusters tracked
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.total
    }

    /// Number of free clusters
    #[must_use]
    pub const fn free_count(&self) -> u64 {
        self.free
    }

    /// Check if a cluster is allocated; out-of-range clusters count as used
    #[must_use]
    pub fn is_allocated(&self, cluster: u64) -> bool {
        cluster >= self.total || self.is_set(cluster)
    }

    fn is_set(&self, cluster: u64) -> bool {
        self.data[(cluster / 8) as usize] & (1 << (cluster % 8)) != 0
    }

    fn set(&mut self, cluster: u64) {
        self.data[(cluster / 8) as usize] |= 1 << (cluster % 8);
    }

    fn clear(&mut self, cluster: u64) {
        self.data[(cluster / 8) as usize] &= !(1 << (cluster % 8));
    }

    /// Mark a specific cluster as used (metadata region, recovery)
    pub fn mark_used(&mut self, cluster: u64) -> BsResult<()> {
        if self.is_allocated(cluster) {
            return Err(BsError::CORRUPT);
        }
        self.set(cluster);
        self.free -= 1;
        Ok(())
    }

    /// Allocate a single cluster
    pub fn allocate(&mut self) -> Option<u64> {
        let cluster = (self.hint..self.total)
            .chain(0..self.hint)
            .find(|&c| !self.is_set(c))?;
        self.set(cluster);
        self.free -= 1;
        self.hint = cluster + 1;
        Some(cluster)
    }

    /// Allocate `count` clusters, all or nothing
    pub fn allocate_many(&mut self, count: u64) -> Option<Vec<u64>> {
        if count > self.free {
            return None;
        }
        let mut clusters = Vec::with_capacity(count as usize);
        for _ in 0..count {
            match self.allocate() {
                Some(c) => clusters.push(c),
                None => {
                    for c in clusters {
                        self.clear(c);
                        self.free += 1;
                    }
                    return None;
                }
            }
        }
        Some(clusters)
    }

    /// Release a cluster
    pub fn release(&mut self, cluster: u64) -> BsResult<()> {
        if cluster >= self.total || !self.is_set(cluster) {
            return Err(BsError::INVALID);
        }
        self.clear(cluster);
        self.free += 1;
        if cluster < self.hint {
            self.hint = cluster;
        }
        Ok(())
    }
}
