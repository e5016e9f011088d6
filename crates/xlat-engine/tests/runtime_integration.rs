//! Runtime tables and the code cache under concurrent use

#![cfg(unix)]

use std::sync::{Arc, Barrier};
use std::thread;

use xlat_engine::backend::UnwindInfo;
use xlat_engine::runtime::{
    AddressTable, AddressTableError, CacheError, CodeCache, DynamicProbe, DynamicTable, JumpTable, CODE_ALIGNMENT,
    LEVELS_32_BIT, LEVELS_64_BIT,
};
use xlat_engine::CompiledUnit;

fn unit(byte: u8, size: usize) -> CompiledUnit {
    CompiledUnit { code: vec![byte; size], unwind_info: UnwindInfo::default() }
}

// ===== Code cache =====

#[test]
fn test_concurrent_mapping_keeps_units_disjoint() {
    const THREADS: usize = 8;
    const UNITS: usize = 32;
    let cache = Arc::new(CodeCache::new(1 << 20).unwrap());
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let cache = cache.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                (0..UNITS)
                    .map(|i| {
                        let byte = (t * UNITS + i) as u8;
                        let entry = cache.map(&unit(byte, 1 + (i * 37) % 200)).unwrap();
                        (byte, entry)
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut placed: Vec<_> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
    placed.sort_by_key(|(_, entry)| entry.offset);

    assert_eq!(cache.entry_count(), THREADS * UNITS);
    for pair in placed.windows(2) {
        let (_, a) = &pair[0];
        let (_, b) = &pair[1];
        assert!(a.offset + a.size <= b.offset, "units overlap");
    }
    for (byte, entry) in &placed {
        assert_eq!(entry.offset % CODE_ALIGNMENT, 0);
        // Safety: the entry lies inside the mapped, readable cache
        let bytes = unsafe { std::slice::from_raw_parts(cache.host_address(entry.offset) as *const u8, entry.size) };
        assert!(bytes.iter().all(|b| b == byte));
        assert_eq!(cache.try_find(entry.offset + entry.size - 1).as_ref(), Some(entry));
    }
}

#[test]
fn test_cache_reports_exhaustion() {
    let cache = CodeCache::new(0).unwrap();
    assert_eq!(cache.capacity(), cache.page_size() * 2);

    let err = cache.map(&unit(0xCC, cache.capacity())).unwrap_err();
    assert!(matches!(err, CacheError::OutOfMemory { .. }));
    assert_eq!(cache.entry_count(), 0);

    // The first page is never handed out, the second still is
    assert!(cache.map(&unit(0xCC, 64)).is_ok());
}

#[test]
fn test_unmap_forgets_entry_only() {
    let cache = CodeCache::new(1 << 16).unwrap();
    let a = cache.map(&unit(1, 10)).unwrap();
    let b = cache.map(&unit(2, 10)).unwrap();

    assert!(cache.unmap(a.offset));
    assert!(!cache.unmap(a.offset));
    assert!(cache.try_find(a.offset).is_none());
    assert_eq!(cache.try_find(b.offset), Some(b.clone()));

    let c = cache.map(&unit(3, 10)).unwrap();
    assert!(c.offset > b.offset);
}

// ===== Jump tables =====

#[test]
fn test_registration_races_with_reservation() {
    const TARGET: u64 = 0x8000;
    const HOST: u64 = 0x7f00_1000;
    let table = Arc::new(JumpTable::new(1024));
    table.set_default_host(0xdead);
    let barrier = Arc::new(Barrier::new(2));

    let reserver = {
        let table = table.clone();
        let barrier = barrier.clone();
        thread::spawn(move || {
            barrier.wait();
            for owner in 0..512u64 {
                table.reserve_entry(owner * 4, TARGET).unwrap();
            }
        })
    };
    let registrar = {
        let table = table.clone();
        let barrier = barrier.clone();
        thread::spawn(move || {
            barrier.wait();
            table.register_function(TARGET, HOST);
        })
    };
    reserver.join().unwrap();
    registrar.join().unwrap();

    let slots = table.dependents(TARGET);
    assert_eq!(slots.len(), 512);
    for slot in slots {
        assert_eq!(table.host_address(slot), Some(HOST));
    }
}

#[test]
fn test_direct_table_exhaustion() {
    let table = JumpTable::new(2);
    table.reserve_entry(0, 0x10).unwrap();
    table.reserve_entry(0, 0x20).unwrap();
    assert!(table.reserve_entry(0, 0x30).is_err());
    assert_eq!(table.used(), 2);
    assert_eq!(table.owned_by(0).len(), 2);
}

#[test]
fn test_dynamic_group_fills_then_exhausts() {
    let table = DynamicTable::new(16, 4);
    let base = table.reserve_entry(0x100).unwrap();

    let mut slots = Vec::new();
    for guest in 1..=4u64 {
        match table.probe(base, guest * 0x1000) {
            DynamicProbe::Claimed { slot } => slots.push(slot),
            other => panic!("expected a claim, got {other:?}"),
        }
    }
    assert_eq!(slots, vec![base, base + 1, base + 2, base + 3]);
    assert_eq!(table.probe(base, 0x9000), DynamicProbe::Exhausted);

    table.set_host(slots[2], 0xabc0);
    assert_eq!(table.probe(base, 0x3000), DynamicProbe::Hit { slot: slots[2], host: 0xabc0 });
}

#[test]
fn test_concurrent_probes_claim_once() {
    const THREADS: usize = 8;
    let table = Arc::new(DynamicTable::new(4, 4));
    let base = table.reserve_entry(0).unwrap();
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let table = table.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                table.probe(base, 0x4000)
            })
        })
        .collect();
    let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let claims = outcomes.iter().filter(|o| matches!(o, DynamicProbe::Claimed { .. })).count();
    assert_eq!(claims, 1);
    assert!(outcomes.iter().all(|o| matches!(
        o,
        DynamicProbe::Claimed { slot } | DynamicProbe::Hit { slot, .. } if *slot == base
    )));
}

// ===== Address table =====

#[test]
fn test_address_table_routes_and_shares_pages() {
    let table = AddressTable::new(LEVELS_64_BIT).unwrap();
    assert_eq!(table.get(0x1000), None);

    table.set(0x1000, 0xaaaa).unwrap();
    let pages = table.page_count();
    assert_eq!(pages, LEVELS_64_BIT.len() - 1);

    // Same leaf page
    table.set(0x1004, 0xbbbb).unwrap();
    assert_eq!(table.page_count(), pages);
    assert_eq!(table.get(0x1000), Some(0xaaaa));
    assert_eq!(table.get(0x1004), Some(0xbbbb));
    assert_eq!(table.get(0x1008), None);

    // Different root slot, so a whole new chain of pages
    table.set(0x80_0000_0000, 0xcccc).unwrap();
    assert_eq!(table.page_count(), pages * 2);
    assert_eq!(table.get(0x80_0000_0000), Some(0xcccc));
}

#[test]
fn test_address_table_rejects_uncovered_bits() {
    let table = AddressTable::new(LEVELS_32_BIT).unwrap();
    assert!(table.is_valid(0x8000_0002));
    assert!(!table.is_valid(0x1_0000_0000));
    assert!(!table.is_valid(0x1001));
    assert!(matches!(table.set(0x1_0000_0000, 1), Err(AddressTableError::InvalidAddress(_))));
    assert!(matches!(AddressTable::new(&[]), Err(AddressTableError::NoLevels)));
}
