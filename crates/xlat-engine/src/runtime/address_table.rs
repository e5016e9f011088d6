//! Multi-level guest-address index used by the fast dispatch stub
//!
//! The guest address is split into bit fields, one per level. Inner levels
//! hold pointers to the next level's page; the last level holds host entry
//! addresses. A zero anywhere along the walk means "not translated" and the
//! stub falls back to the slow path.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// One level of the table: bits `[index, index + length)` of the address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressTableLevel {
    pub index: u32,
    pub length: u32,
}

impl AddressTableLevel {
    pub const fn new(index: u32, length: u32) -> Self {
        AddressTableLevel { index, length }
    }

    pub fn mask(&self) -> u64 {
        (1u64 << self.length) - 1
    }

    pub fn entry_count(&self) -> usize {
        1usize << self.length
    }

    pub fn slot_of(&self, address: u64) -> usize {
        ((address >> self.index) & self.mask()) as usize
    }
}

/// Levels for 64-bit guests with 4-byte aligned code (bits 2..48)
pub const LEVELS_64_BIT: &[AddressTableLevel] = &[
    AddressTableLevel::new(39, 9),
    AddressTableLevel::new(30, 9),
    AddressTableLevel::new(21, 9),
    AddressTableLevel::new(12, 9),
    AddressTableLevel::new(2, 10),
];

/// Levels for 32-bit guests with 2-byte aligned code (bits 1..32)
pub const LEVELS_32_BIT: &[AddressTableLevel] = &[
    AddressTableLevel::new(22, 10),
    AddressTableLevel::new(12, 10),
    AddressTableLevel::new(1, 11),
];

/// Error while updating the table
#[derive(Debug, thiserror::Error)]
pub enum AddressTableError {
    #[error("guest address {0:#x} is outside the table")]
    InvalidAddress(u64),
    #[error("address table needs at least one level")]
    NoLevels,
}

type Page = Box<[AtomicU64]>;

fn allocate_page(entries: usize) -> Page {
    (0..entries).map(|_| AtomicU64::new(0)).collect()
}

/// Lock-free-read, lazily allocated multi-level table
pub struct AddressTable {
    levels: Vec<AddressTableLevel>,
    mask: u64,
    root: Page,
    /// Owns every non-root page; boxes never move once pushed
    pages: Mutex<Vec<Page>>,
}

impl AddressTable {
    pub fn new(levels: &[AddressTableLevel]) -> Result<Self, AddressTableError> {
        let first = levels.first().ok_or(AddressTableError::NoLevels)?;
        let mask = levels.iter().fold(0u64, |mask, level| mask | (level.mask() << level.index));
        Ok(AddressTable {
            levels: levels.to_vec(),
            mask,
            root: allocate_page(first.entry_count()),
            pages: Mutex::new(Vec::new()),
        })
    }

    pub fn levels(&self) -> &[AddressTableLevel] {
        &self.levels
    }

    /// Bits of a guest address the table covers
    pub fn mask(&self) -> u64 {
        self.mask
    }

    /// Whether `address` can be stored in the table
    pub fn is_valid(&self, address: u64) -> bool {
        address & !self.mask == 0
    }

    /// Address of the root page, for generated code
    pub fn root_address(&self) -> usize {
        self.root.as_ptr() as usize
    }

    /// Host entry for `address`, if one has been set
    pub fn get(&self, address: u64) -> Option<u64> {
        if !self.is_valid(address) {
            return None;
        }
        let mut page: &[AtomicU64] = &self.root;
        let last = self.levels.len() - 1;
        for (depth, level) in self.levels.iter().enumerate() {
            let value = page[level.slot_of(address)].load(Ordering::Acquire);
            if value == 0 {
                return None;
            }
            if depth == last {
                return Some(value);
            }
            let next = &self.levels[depth + 1];
            // Safety: inner entries only ever hold pointers to pages owned by
            // `self.pages`, which live as long as the table.
            page = unsafe { std::slice::from_raw_parts(value as *const AtomicU64, next.entry_count()) };
        }
        None
    }

    /// Route `address` to `host`, allocating intermediate pages as needed
    pub fn set(&self, address: u64, host: u64) -> Result<(), AddressTableError> {
        if !self.is_valid(address) {
            return Err(AddressTableError::InvalidAddress(address));
        }

        let mut page: &[AtomicU64] = &self.root;
        let last = self.levels.len() - 1;
        for (depth, level) in self.levels.iter().enumerate() {
            let slot = &page[level.slot_of(address)];
            if depth == last {
                slot.store(host, Ordering::Release);
                return Ok(());
            }

            let next = &self.levels[depth + 1];
            let mut value = slot.load(Ordering::Acquire);
            if value == 0 {
                let mut pages = self.pages.lock();
                // Re-check under the lock; another writer may have filled it
                value = slot.load(Ordering::Acquire);
                if value == 0 {
                    let fresh = allocate_page(next.entry_count());
                    value = fresh.as_ptr() as u64;
                    pages.push(fresh);
                    slot.store(value, Ordering::Release);
                }
            }
            // Safety: see `get`
            page = unsafe { std::slice::from_raw_parts(value as *const AtomicU64, next.entry_count()) };
        }
        Ok(())
    }

    /// Number of pages allocated below the root
    pub fn page_count(&self) -> usize {
        self.pages.lock().len()
    }
}
