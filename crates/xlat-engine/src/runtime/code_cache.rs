//! Executable code cache
//!
//! One contiguous region is reserved up front and handed out append-only.
//! The first page is kept back for host exception-handling metadata, so the
//! first unit lands at offset `page_size`. Units are never moved; `unmap`
//! forgets an entry without reclaiming its bytes.

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::backend::traits::{CompiledUnit, UnwindInfo};

/// Alignment of every unit's start offset
pub const CODE_ALIGNMENT: usize = 16;

/// Error while placing code in the cache
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("code cache exhausted: {requested} bytes requested, {available} available")]
    OutOfMemory { requested: usize, available: usize },
    #[error("executable memory is not supported on this platform")]
    Unsupported,
    #[error("memory protection change failed: {0}")]
    Protection(std::io::Error),
}

/// A unit placed in the cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Offset from the cache base
    pub offset: usize,
    pub size: usize,
    pub unwind_info: UnwindInfo,
}

/// Reserved address range
struct Region {
    base: *mut u8,
    capacity: usize,
}

// Safety: the region is only written under the cache mutex, and published
// bytes are immutable afterwards.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

/// Thread-safe append-only cache of host code
pub struct CodeCache {
    region: Region,
    page_size: usize,
    /// Next free offset; held for the whole of `map`
    next_offset: Mutex<usize>,
    /// Live entries sorted by offset
    entries: RwLock<Vec<CacheEntry>>,
}

impl CodeCache {
    /// Reserve `capacity` bytes (rounded up to whole pages, at least two)
    pub fn new(capacity: usize) -> Result<Self, CacheError> {
        let page_size = page_size();
        let capacity = align_up(capacity.max(page_size * 2), page_size);
        let base = reserve(capacity)?;

        debug!(capacity, page_size, "reserved code cache");
        Ok(CodeCache {
            region: Region { base, capacity },
            page_size,
            next_offset: Mutex::new(page_size),
            entries: RwLock::new(Vec::new()),
        })
    }

    /// Copy a compiled unit into the cache and make it executable
    pub fn map(&self, unit: &CompiledUnit) -> Result<CacheEntry, CacheError> {
        let mut next = self.next_offset.lock();

        let offset = align_up(*next, CODE_ALIGNMENT);
        let size = unit.code.len();
        let end = offset.checked_add(size).unwrap_or(usize::MAX);
        if end > self.region.capacity {
            let available = self.region.capacity.saturating_sub(offset);
            warn!(requested = size, available, "code cache exhausted");
            return Err(CacheError::OutOfMemory { requested: size, available });
        }

        if size > 0 {
            let page_start = align_down(offset, self.page_size);
            let page_end = align_up(end, self.page_size);
            // Neighbouring units on the same pages may be running, so the
            // window keeps execute permission while it is writable.
            protect(self.region.base, page_start, page_end - page_start, Protection::ReadWriteExecute)?;
            // Safety: [offset, end) lies inside the reservation and nobody
            // else writes while the mutex is held.
            unsafe {
                std::ptr::copy_nonoverlapping(unit.code.as_ptr(), self.region.base.add(offset), size);
            }
            protect(self.region.base, page_start, page_end - page_start, Protection::ReadExecute)?;
        }

        *next = end;

        let entry = CacheEntry { offset, size, unwind_info: unit.unwind_info.clone() };
        self.entries.write().push(entry.clone());
        Ok(entry)
    }

    /// Find the entry containing `offset`
    pub fn try_find(&self, offset: usize) -> Option<CacheEntry> {
        let entries = self.entries.read();
        let index = entries.partition_point(|entry| entry.offset <= offset);
        let entry = entries.get(index.checked_sub(1)?)?;
        (offset < entry.offset + entry.size).then(|| entry.clone())
    }

    /// Forget the entry starting at `offset`; its bytes stay reserved
    pub fn unmap(&self, offset: usize) -> bool {
        let mut entries = self.entries.write();
        match entries.binary_search_by_key(&offset, |entry| entry.offset) {
            Ok(index) => {
                entries.remove(index);
                true
            }
            Err(_) => false,
        }
    }

    /// Host address of an offset in the cache
    pub fn host_address(&self, offset: usize) -> usize {
        self.region.base as usize + offset
    }

    /// Offset of a host address, if it lies inside the cache
    pub fn offset_of(&self, host_address: usize) -> Option<usize> {
        let base = self.region.base as usize;
        (host_address >= base && host_address < base + self.region.capacity).then(|| host_address - base)
    }

    pub fn base(&self) -> *const u8 {
        self.region.base
    }

    /// Bytes handed out so far, including the reserved first page
    pub fn used(&self) -> usize {
        *self.next_offset.lock()
    }

    pub fn capacity(&self) -> usize {
        self.region.capacity
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Number of live entries
    pub fn entry_count(&self) -> usize {
        self.entries.read().len()
    }
}

impl Drop for CodeCache {
    fn drop(&mut self) {
        release(self.region.base, self.region.capacity);
    }
}

fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

fn align_down(value: usize, alignment: usize) -> usize {
    value & !(alignment - 1)
}

enum Protection {
    ReadWriteExecute,
    ReadExecute,
}

#[cfg(unix)]
fn page_size() -> usize {
    // Safety: sysconf has no preconditions
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

#[cfg(not(unix))]
fn page_size() -> usize {
    4096
}

#[cfg(unix)]
fn reserve(capacity: usize) -> Result<*mut u8, CacheError> {
    // Safety: anonymous private mapping with no fixed address
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            capacity,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANON,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        warn!(capacity, "code cache reservation failed");
        return Err(CacheError::OutOfMemory { requested: capacity, available: 0 });
    }
    Ok(ptr as *mut u8)
}

#[cfg(not(unix))]
fn reserve(_capacity: usize) -> Result<*mut u8, CacheError> {
    Err(CacheError::Unsupported)
}

#[cfg(unix)]
fn protect(base: *mut u8, offset: usize, len: usize, protection: Protection) -> Result<(), CacheError> {
    let prot = match protection {
        Protection::ReadWriteExecute => libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
        Protection::ReadExecute => libc::PROT_READ | libc::PROT_EXEC,
    };
    // Safety: the range is page aligned and inside our reservation
    let result = unsafe { libc::mprotect(base.add(offset) as *mut libc::c_void, len, prot) };
    if result != 0 {
        return Err(CacheError::Protection(std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(not(unix))]
fn protect(_base: *mut u8, _offset: usize, _len: usize, _protection: Protection) -> Result<(), CacheError> {
    Err(CacheError::Unsupported)
}

#[cfg(unix)]
fn release(base: *mut u8, capacity: usize) {
    // Safety: base/capacity came from our own mmap
    unsafe {
        libc::munmap(base as *mut libc::c_void, capacity);
    }
}

#[cfg(not(unix))]
fn release(_base: *mut u8, _capacity: usize) {}
