//! Block devices underneath a blob store
//!
//! A `BsDev` is a flat array of `block_count * block_len` bytes with
//! positional read/write. Two implementations are provided:
//! - `MemDev`: sparse in-memory device for tests and embedding
//! - `FileDev`: regular file (or block special file) using positional I/O

use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

/// Raw block device consumed by the blob store
pub trait BsDev: Send + Sync {
    /// Human-readable device name
    fn name(&self) -> &str;

    /// Number of logical blocks
    fn block_count(&self) -> u64;

    /// Logical block length in bytes
    fn block_len(&self) -> u32;

    /// Total size in bytes
    fn size_bytes(&self) -> u64 {
        self.block_count() * u64::from(self.block_len())
    }

    /// Read `buf.len()` bytes at `offset`
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()>;

    /// Write `data` at `offset`
    fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<()>;

    /// Make previous writes durable
    fn flush(&self) -> io::Result<()>;

    /// Discard a byte range; subsequent reads return zeroes
    fn unmap(&self, offset: u64, len: u64) -> io::Result<()>;

    /// I/O counters
    fn stats(&self) -> &DevStats;
}

/// Device I/O counters
#[derive(Debug, Default)]
pub struct DevStats {
    pub reads: AtomicU64,
    pub writes: AtomicU64,
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
    pub unmaps: AtomicU64,
    pub flushes: AtomicU64,
}

impl DevStats {
    fn record_read(&self, len: usize) {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(len as u64, Ordering::Relaxed);
    }

    fn record_write(&self, len: usize) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(len as u64, Ordering::Relaxed);
    }
}

fn check_range(dev: &dyn BsDev, offset: u64, len: u64) -> io::Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= dev.size_bytes() => Ok(()),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "range {offset}+{len} exceeds device {} size {}",
                dev.name(),
                dev.size_bytes()
            ),
        )),
    }
}

/// Sparse in-memory block device
///
/// Storage grows only as far as the highest byte written; everything beyond
/// reads as zero.
pub struct MemDev {
    name: String,
    block_count: u64,
    block_len: u32,
    data: RwLock<Vec<u8>>,
    stats: DevStats,
}

impl MemDev {
    /// Create an empty device
    pub fn new(name: impl Into<String>, block_count: u64, block_len: u32) -> Self {
        Self {
            name: name.into(),
            block_count,
            block_len,
            data: RwLock::new(Vec::new()),
            stats: DevStats::default(),
        }
    }

    /// Bytes actually backed by memory
    pub fn resident_bytes(&self) -> usize {
        self.data.read().len()
    }
}

impl BsDev for MemDev {
    fn name(&self) -> &str {
        &self.name
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn block_len(&self) -> u32 {
        self.block_len
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        check_range(self, offset, buf.len() as u64)?;
        let data = self.data.read();
        let start = offset as usize;
        buf.fill(0);
        if start < data.len() {
            let end = (start + buf.len()).min(data.len());
            buf[..end - start].copy_from_slice(&data[start..end]);
        }
        self.stats.record_read(buf.len());
        Ok(())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        check_range(self, offset, buf.len() as u64)?;
        let mut data = self.data.write();
        let start = offset as usize;
        let end = start + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(buf);
        self.stats.record_write(buf.len());
        Ok(())
    }

    fn flush(&self) -> io::Result<()> {
        self.stats.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn unmap(&self, offset: u64, len: u64) -> io::Result<()> {
        check_range(self, offset, len)?;
        let mut data = self.data.write();
        let start = offset as usize;
        let end = (start + len as usize).min(data.len());
        if end == data.len() && start < end {
            data.truncate(start);
        } else if start < end {
            data[start..end].fill(0);
        }
        self.stats.unmaps.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn stats(&self) -> &DevStats {
        &self.stats
    }
}

/// Chunk used when zero-filling a partial unmap on a file
const ZERO_CHUNK: usize = 1024 * 1024;

/// File-backed block device
pub struct FileDev {
    name: String,
    file: File,
    block_count: u64,
    block_len: u32,
    stats: DevStats,
}

impl FileDev {
    /// Create (or truncate) a file of `size_bytes` and use it as a device
    pub fn create(path: impl AsRef<Path>, size_bytes: u64, block_len: u32) -> io::Result<Self> {
        if block_len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "block length must be positive",
            ));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len(size_bytes)?;
        Ok(Self {
            name: path.as_ref().to_string_lossy().into_owned(),
            file,
            block_count: size_bytes / u64::from(block_len),
            block_len,
            stats: DevStats::default(),
        })
    }

    /// Open an existing file as a device; its length defines the geometry
    pub fn open(path: impl AsRef<Path>, block_len: u32) -> io::Result<Self> {
        if block_len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "block length must be positive",
            ));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())?;
        let size = file.metadata()?.len();
        Ok(Self {
            name: path.as_ref().to_string_lossy().into_owned(),
            file,
            block_count: size / u64::from(block_len),
            block_len,
            stats: DevStats::default(),
        })
    }
}

impl BsDev for FileDev {
    fn name(&self) -> &str {
        &self.name
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn block_len(&self) -> u32 {
        self.block_len
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        check_range(self, offset, buf.len() as u64)?;
        self.file.read_exact_at(buf, offset)?;
        self.stats.record_read(buf.len());
        Ok(())
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<()> {
        check_range(self, offset, data.len() as u64)?;
        self.file.write_all_at(data, offset)?;
        self.stats.record_write(data.len());
        Ok(())
    }

    fn flush(&self) -> io::Result<()> {
        self.file.sync_data()?;
        self.stats.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn unmap(&self, offset: u64, len: u64) -> io::Result<()> {
        check_range(self, offset, len)?;
        let size = self.file.metadata()?.len();
        if offset == 0 && len >= size {
            // Truncating releases the backing extents of a sparse file
            self.file.set_len(0)?;
            self.file.set_len(size)?;
        } else {
            let zeroes = vec![0u8; ZERO_CHUNK];
            let mut pos = offset;
            let end = offset + len;
            while pos < end {
                let n = ((end - pos) as usize).min(ZERO_CHUNK);
                self.file.write_all_at(&zeroes[..n], pos)?;
                pos += n as u64;
            }
        }
        self.stats.unmaps.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn stats(&self) -> &DevStats {
        &self.stats
    }
}
