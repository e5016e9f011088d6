//! Guest-address to host-address jump tables
//!
//! Translated code never embeds another function's host address directly.
//! A direct jump loads the host address from a `JumpTable` slot reserved for
//! that call site; registering or re-registering the target patches every
//! dependent slot. Indirect jumps probe a small group of `DynamicTable` slots
//! keyed by the runtime guest address.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use dashmap::DashMap;
use tracing::{trace, warn};

/// Error while reserving a table slot
#[derive(Debug, thiserror::Error)]
pub enum JumpTableError {
    #[error("{table} table exhausted ({capacity} entries)")]
    Exhausted { table: &'static str, capacity: usize },
}

/// One table slot
///
/// Guest address 0 marks an unclaimed slot, so guest address 0 is never
/// cached through a dynamic table.
#[derive(Debug, Default)]
#[repr(C)]
pub struct JumpTableEntry {
    pub guest_address: AtomicU64,
    pub host_address: AtomicU64,
}

/// Byte offset of the host field inside an entry
pub const HOST_ADDRESS_OFFSET: usize = std::mem::offset_of!(JumpTableEntry, host_address);

fn allocate_entries(capacity: usize) -> Box<[JumpTableEntry]> {
    (0..capacity).map(|_| JumpTableEntry::default()).collect()
}

/// Table for jumps whose guest target is known at translation time
pub struct JumpTable {
    entries: Box<[JumpTableEntry]>,
    next: AtomicUsize,
    /// Host address stored in slots whose target is not translated yet
    default_host: AtomicU64,
    /// Registered guest function -> host entry
    targets: DashMap<u64, u64>,
    /// Guest target -> slots jumping to it
    dependents: DashMap<u64, Vec<usize>>,
    /// Owning guest function -> slots its code reads
    owners: DashMap<u64, Vec<usize>>,
}

impl JumpTable {
    pub fn new(capacity: usize) -> Self {
        JumpTable {
            entries: allocate_entries(capacity),
            next: AtomicUsize::new(0),
            default_host: AtomicU64::new(0),
            targets: DashMap::new(),
            dependents: DashMap::new(),
            owners: DashMap::new(),
        }
    }

    /// Host address new slots start with (normally the dispatch stub)
    pub fn set_default_host(&self, host: u64) {
        self.default_host.store(host, Ordering::Release);
    }

    /// Reserve a slot for a jump from `owner` to `target`
    ///
    /// If `target` is already registered the slot is pre-filled with its
    /// host address.
    pub fn reserve_entry(&self, owner: u64, target: u64) -> Result<usize, JumpTableError> {
        let slot = bump(&self.next, 1, self.entries.len()).ok_or_else(|| {
            warn!(capacity = self.entries.len(), "direct jump table exhausted");
            JumpTableError::Exhausted { table: "direct", capacity: self.entries.len() }
        })?;

        let entry = &self.entries[slot];
        entry.guest_address.store(target, Ordering::Release);
        {
            // The dependents shard stays locked while `targets` is read, so a
            // concurrent `register_function` either sees this slot or has
            // already published the host address read here.
            let mut deps = self.dependents.entry(target).or_default();
            deps.push(slot);
            let host = self
                .targets
                .get(&target)
                .map(|host| *host)
                .unwrap_or_else(|| self.default_host.load(Ordering::Acquire));
            entry.host_address.store(host, Ordering::Release);
        }
        self.owners.entry(owner).or_default().push(slot);

        trace!(owner = format_args!("{owner:#x}"), target = format_args!("{target:#x}"), slot, "reserved jump table entry");
        Ok(slot)
    }

    /// Publish the host entry of `target` and patch every slot jumping to it
    pub fn register_function(&self, target: u64, host: u64) {
        self.targets.insert(target, host);
        if let Some(deps) = self.dependents.get(&target) {
            for &slot in deps.iter() {
                self.entries[slot].host_address.store(host, Ordering::Release);
            }
            trace!(target = format_args!("{target:#x}"), patched = deps.len(), "patched jump table");
        }
    }

    /// Current host address in a slot
    pub fn host_address(&self, slot: usize) -> Option<u64> {
        self.entries.get(slot).map(|entry| entry.host_address.load(Ordering::Acquire))
    }

    /// Guest address a slot was reserved for
    pub fn guest_address(&self, slot: usize) -> Option<u64> {
        self.entries.get(slot).map(|entry| entry.guest_address.load(Ordering::Acquire))
    }

    /// Address of a slot's host field, for generated code
    pub fn entry_address(&self, slot: usize) -> usize {
        self.entries.as_ptr() as usize + slot * std::mem::size_of::<JumpTableEntry>() + HOST_ADDRESS_OFFSET
    }

    /// Slots that jump to `target`
    pub fn dependents(&self, target: u64) -> Vec<usize> {
        self.dependents.get(&target).map(|deps| deps.clone()).unwrap_or_default()
    }

    /// Slots reserved by `owner`'s code
    pub fn owned_by(&self, owner: u64) -> Vec<usize> {
        self.owners.get(&owner).map(|slots| slots.clone()).unwrap_or_default()
    }

    /// Registered host entry of a guest function
    pub fn registered(&self, target: u64) -> Option<u64> {
        self.targets.get(&target).map(|host| *host)
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn used(&self) -> usize {
        self.next.load(Ordering::Relaxed).min(self.entries.len())
    }
}

/// Outcome of probing a dynamic table group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DynamicProbe {
    /// A slot already holds this guest address; `host` is 0 until set
    Hit { slot: usize, host: u64 },
    /// An empty slot was claimed for this guest address
    Claimed { slot: usize },
    /// Every slot in the group holds another address
    Exhausted,
}

/// Table for jumps whose guest target is only known at run time
pub struct DynamicTable {
    entries: Box<[JumpTableEntry]>,
    probe_count: usize,
    next: AtomicUsize,
    owners: DashMap<u64, Vec<usize>>,
}

impl DynamicTable {
    /// `capacity` is rounded down to whole groups of `probe_count` slots
    pub fn new(capacity: usize, probe_count: usize) -> Self {
        let probe_count = probe_count.max(1);
        DynamicTable {
            entries: allocate_entries(capacity - capacity % probe_count),
            probe_count,
            next: AtomicUsize::new(0),
            owners: DashMap::new(),
        }
    }

    /// Reserve a group of slots for one indirect jump in `owner`; returns the first slot
    pub fn reserve_entry(&self, owner: u64) -> Result<usize, JumpTableError> {
        let base = bump(&self.next, self.probe_count, self.entries.len()).ok_or_else(|| {
            warn!(capacity = self.entries.len(), "dynamic jump table exhausted");
            JumpTableError::Exhausted { table: "dynamic", capacity: self.entries.len() }
        })?;
        self.owners.entry(owner).or_default().push(base);
        Ok(base)
    }

    /// Look up `guest` in the group starting at `base`, claiming a free slot on a miss
    pub fn probe(&self, base: usize, guest: u64) -> DynamicProbe {
        for slot in base..(base + self.probe_count).min(self.entries.len()) {
            let entry = &self.entries[slot];
            let current = entry.guest_address.load(Ordering::Acquire);
            if current == guest {
                return DynamicProbe::Hit { slot, host: entry.host_address.load(Ordering::Acquire) };
            }
            if current != 0 {
                continue;
            }
            match entry.guest_address.compare_exchange(0, guest, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return DynamicProbe::Claimed { slot },
                Err(actual) if actual == guest => {
                    return DynamicProbe::Hit { slot, host: entry.host_address.load(Ordering::Acquire) };
                }
                Err(_) => continue,
            }
        }
        DynamicProbe::Exhausted
    }

    pub fn set_host(&self, slot: usize, host: u64) {
        if let Some(entry) = self.entries.get(slot) {
            entry.host_address.store(host, Ordering::Release);
        }
    }

    pub fn host_address(&self, slot: usize) -> Option<u64> {
        self.entries.get(slot).map(|entry| entry.host_address.load(Ordering::Acquire))
    }

    /// Address of a slot's guest field, for generated code
    pub fn guest_entry_address(&self, slot: usize) -> usize {
        self.entries.as_ptr() as usize + slot * std::mem::size_of::<JumpTableEntry>()
    }

    /// Address of a slot's host field, for generated code
    pub fn host_entry_address(&self, slot: usize) -> usize {
        self.guest_entry_address(slot) + HOST_ADDRESS_OFFSET
    }

    pub fn probe_count(&self) -> usize {
        self.probe_count
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Groups reserved by `owner`'s code
    pub fn owned_by(&self, owner: u64) -> Vec<usize> {
        self.owners.get(&owner).map(|slots| slots.clone()).unwrap_or_default()
    }
}

/// Advance `counter` by `step` without passing `limit`; returns the old value
fn bump(counter: &AtomicUsize, step: usize, limit: usize) -> Option<usize> {
    counter
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
            let next = current.checked_add(step)?;
            (next <= limit).then_some(next)
        })
        .ok()
}
