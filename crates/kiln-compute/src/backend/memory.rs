//! Host memory utilities.
//!
//! System memory/CPU detection for the host device, aligned staging storage
//! and the per-object table of live mappings.
//!
//! Every `map` allocates a fresh [`STAGING_ALIGNMENT`]-aligned staging
//! region and records it in the object's [`MappingTable`]; `unmap` must hand
//! the same [`Mapping`] back. A mapping unknown to the table is an error.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};

use kiln_core::{MapFlag, MemoryFlag};
use tracing::{error, trace, warn};

use crate::{ComputeError, ComputeResult};

/// Alignment of every host staging allocation.
pub const STAGING_ALIGNMENT: usize = 128;

static SYSTEM_MEMORY: OnceLock<u64> = OnceLock::new();
static SYSTEM_CPUS: OnceLock<u32> = OnceLock::new();
static SYSTEM_CPU_MHZ: OnceLock<u32> = OnceLock::new();

/// Installed RAM in bytes, 8 GiB when the OS won't say.
pub fn system_memory() -> u64 {
    *SYSTEM_MEMORY.get_or_init(|| sys_info::mem_info().map_or(8 << 30, |m| m.total << 10))
}

/// Logical CPU count.
pub fn system_cpus() -> u32 {
    *SYSTEM_CPUS.get_or_init(|| {
        sys_info::cpu_num()
            .ok()
            .filter(|&n| n > 0)
            .or_else(|| std::thread::available_parallelism().ok().map(|n| n.get() as u32))
            .unwrap_or(1)
    })
}

/// Nominal CPU clock in MHz (0 if unknown).
pub fn system_cpu_mhz() -> u32 {
    *SYSTEM_CPU_MHZ.get_or_init(|| sys_info::cpu_speed().map(|s| s as u32).unwrap_or(0))
}

// =============================================================================
// Aligned storage
// =============================================================================

/// Zero-initialized byte storage whose first byte is 128-byte aligned.
///
/// Over-allocates by `STAGING_ALIGNMENT - 1` bytes and slices from the first
/// aligned address. The backing `Vec` is never resized, so the address is
/// stable for the lifetime of the value (including moves).
pub struct AlignedBuffer {
    storage: Vec<u8>,
    start: usize,
    len: usize,
}

impl AlignedBuffer {
    /// Allocates `len` zero bytes.
    pub fn zeroed(len: usize) -> Self {
        let storage = vec![0u8; len + STAGING_ALIGNMENT - 1];
        let start = storage.as_ptr().align_offset(STAGING_ALIGNMENT).min(STAGING_ALIGNMENT - 1);
        Self { storage, start, len }
    }

    /// Allocates and copies `data` in.
    pub fn from_slice(data: &[u8]) -> Self {
        let mut buf = Self::zeroed(data.len());
        buf.copy_from_slice(data);
        buf
    }

    /// Length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Address of the first byte.
    #[inline]
    pub fn addr(&self) -> usize {
        self.as_ptr() as usize
    }
}

impl Deref for AlignedBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.storage[self.start..self.start + self.len]
    }
}

impl DerefMut for AlignedBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.storage[self.start..self.start + self.len]
    }
}

impl Clone for AlignedBuffer {
    fn clone(&self) -> Self {
        Self::from_slice(self)
    }
}

impl std::fmt::Debug for AlignedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedBuffer").field("addr", &self.addr()).field("len", &self.len).finish()
    }
}

// =============================================================================
// Mappings
// =============================================================================

type Entries = Mutex<HashMap<usize, MapEntry>>;

fn lock_entries(entries: &Entries) -> MutexGuard<'_, HashMap<usize, MapEntry>> {
    entries.lock().unwrap_or_else(|e| e.into_inner())
}

/// Host view of a mapped region of a buffer or image.
///
/// Dereferences to the staging bytes. Hand it back to the owning object's
/// `unmap` to finish the mapping; host writes reach the object only there.
/// Dropping a mapping without `unmap` deregisters it and discards its writes.
#[derive(Debug)]
pub struct Mapping {
    staging: AlignedBuffer,
    offset: u64,
    flags: MapFlag,
    /// Table the mapping is registered in, empty once unmapped.
    table: Weak<Entries>,
}

impl Mapping {
    /// Byte offset of the mapped region inside the object.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Flags the region was mapped with.
    pub fn flags(&self) -> MapFlag {
        self.flags
    }

    /// Staging address (the mapping table key).
    pub fn addr(&self) -> usize {
        self.staging.addr()
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        let Some(entries) = self.table.upgrade() else {
            return;
        };
        if lock_entries(&entries).remove(&self.addr()).is_some() {
            warn!(addr = self.addr(), offset = self.offset, "mapping dropped without unmap, host writes discarded");
        }
    }
}

impl Deref for Mapping {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.staging
    }
}

impl DerefMut for Mapping {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.staging
    }
}

/// A live mapping as recorded by its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapEntry {
    /// Byte offset inside the object.
    pub offset: u64,
    /// Mapped byte count.
    pub size: u64,
    /// Mapping flags.
    pub flags: MapFlag,
}

/// `staging address -> (region, flags)` for one buffer or image.
#[derive(Debug, Default)]
pub struct MappingTable {
    entries: Arc<Entries>,
}

impl MappingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a mapping of `size` bytes at `offset` of an object of `total` bytes.
    ///
    /// `size == 0` maps everything from `offset` to the end. When `flags`
    /// reads, `read(offset, staging)` fills the staging bytes from the device.
    pub fn begin(
        &self,
        total: u64,
        memory_flags: MemoryFlag,
        flags: MapFlag,
        offset: u64,
        size: u64,
        read: impl FnOnce(u64, &mut [u8]) -> ComputeResult<()>,
    ) -> ComputeResult<Mapping> {
        let fail = |msg: String| {
            error!(error = %msg, "map failed");
            Err(ComputeError::Mapping(msg))
        };

        if !flags.is_consistent() {
            return fail(format!("inconsistent map flags {flags:?}"));
        }
        if flags.reads() && !memory_flags.host_readable() {
            return fail(format!("memory is not host-readable ({memory_flags:?})"));
        }
        if flags.writes_back() && !memory_flags.host_writable() {
            return fail(format!("memory is not host-writable ({memory_flags:?})"));
        }
        let size = if size == 0 { total.saturating_sub(offset) } else { size };
        if size == 0 || offset.checked_add(size).is_none_or(|end| end > total) {
            return fail(format!("region {offset}+{size} outside object of {total} bytes"));
        }

        let mut staging = AlignedBuffer::zeroed(size as usize);
        if flags.reads() {
            read(offset, &mut staging)?;
        }

        let mapping = Mapping { staging, offset, flags, table: Arc::downgrade(&self.entries) };
        self.lock().insert(mapping.addr(), MapEntry { offset, size, flags });
        trace!(offset, size, ?flags, "mapped");
        Ok(mapping)
    }

    /// Finishes `mapping`, calling `write(offset, staging)` if it writes back.
    ///
    /// A mapping of another object is rejected; it is still deregistered from
    /// its own table when dropped here.
    pub fn end(&self, mut mapping: Mapping, write: impl FnOnce(u64, &[u8]) -> ComputeResult<()>) -> ComputeResult<MapEntry> {
        let Some(entry) = self.lock().remove(&mapping.addr()) else {
            error!(addr = mapping.addr(), "unmap of unknown mapping");
            return Err(ComputeError::Mapping("mapping does not belong to this object".into()));
        };
        mapping.table = Weak::new();
        if entry.flags.writes_back() {
            write(entry.offset, &mapping)?;
        }
        trace!(offset = entry.offset, size = entry.size, "unmapped");
        Ok(entry)
    }

    /// Number of live mappings.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// True if nothing is mapped.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<usize, MapEntry>> {
        lock_entries(&self.entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aligned_buffer() {
        for len in [0, 1, 127, 128, 4096] {
            let buf = AlignedBuffer::zeroed(len);
            assert_eq!(buf.len(), len);
            assert_eq!(buf.addr() % STAGING_ALIGNMENT, 0);
            assert!(buf.iter().all(|&b| b == 0));
        }
        let moved = { AlignedBuffer::from_slice(&[1, 2, 3]) };
        assert_eq!(&moved[..], &[1, 2, 3]);
        assert_eq!(moved.clone().addr() % STAGING_ALIGNMENT, 0);
    }

    #[test]
    fn test_mapping_round_trip() {
        let table = MappingTable::new();
        let device = Mutex::new(vec![5u8; 64]);

        let mut m = table
            .begin(64, MemoryFlag::default(), MapFlag::READ_WRITE, 16, 8, |off, dst| {
                dst.copy_from_slice(&device.lock().unwrap()[off as usize..off as usize + 8]);
                Ok(())
            })
            .unwrap();
        assert_eq!(&m[..], &[5; 8]);
        assert_eq!(table.len(), 1);
        m.fill(9);

        let entry = table
            .end(m, |off, src| {
                device.lock().unwrap()[off as usize..off as usize + src.len()].copy_from_slice(src);
                Ok(())
            })
            .unwrap();
        assert_eq!(entry.size, 8);
        assert!(table.is_empty());
        let device = device.into_inner().unwrap();
        assert_eq!(&device[16..24], &[9; 8]);
        assert_eq!(device[15], 5);
        assert_eq!(device[24], 5);
    }

    #[test]
    fn test_foreign_mapping_rejected() {
        let a = MappingTable::new();
        let b = MappingTable::new();
        let m = a.begin(16, MemoryFlag::default(), MapFlag::WRITE, 0, 0, |_, _| Ok(())).unwrap();
        assert_eq!(m.len(), 16);
        assert!(b.end(m, |_, _| Ok(())).is_err());
        assert!(a.is_empty());
    }

    #[test]
    fn test_dropped_mapping_deregisters() {
        let table = MappingTable::new();
        let written = Mutex::new(false);
        let m = table.begin(32, MemoryFlag::default(), MapFlag::WRITE, 0, 0, |_, _| Ok(())).unwrap();
        let kept = table.begin(32, MemoryFlag::default(), MapFlag::WRITE, 0, 8, |_, _| Ok(())).unwrap();
        assert_eq!(table.len(), 2);
        drop(m);
        assert_eq!(table.len(), 1);

        table
            .end(kept, |_, _| {
                *written.lock().unwrap() = true;
                Ok(())
            })
            .unwrap();
        assert!(table.is_empty());
        assert!(*written.lock().unwrap());
    }

    #[test]
    fn test_mapping_outliving_table() {
        let table = MappingTable::new();
        let m = table.begin(8, MemoryFlag::default(), MapFlag::READ, 0, 0, |_, dst| {
            dst.fill(7);
            Ok(())
        });
        drop(table);
        assert_eq!(&m.unwrap()[..], &[7; 8]);
    }

    #[test]
    fn test_map_flag_checks() {
        let t = MappingTable::new();
        let read_only = MemoryFlag::READ_WRITE | MemoryFlag::HOST_READ;
        assert!(t.begin(16, read_only, MapFlag::WRITE, 0, 0, |_, _| Ok(())).is_err());
        assert!(t.begin(16, MemoryFlag::default(), MapFlag::READ | MapFlag::WRITE_INVALIDATE, 0, 0, |_, _| Ok(())).is_err());
        assert!(t.begin(16, MemoryFlag::default(), MapFlag::READ, 8, 16, |_, _| Ok(())).is_err());
        assert!(t.is_empty());
    }
}
