//! Testing of the byte heap over real memory.

use std::ptr::NonNull;

use kmem::{
    OutOfMemory, PAGE_SIZE,
    config::HeapConfig,
    error::InvalidFreeKind,
    flags::HeapFlags,
    growth::NoGrowth,
    heap::{ALLOC_POISON, ByteHeap, FREE_POISON},
};

/// Leak `size` bytes of page aligned memory to use as an arena.
fn leak_arena(size: usize) -> usize {
    let buf = Box::leak(vec![0_u8; size + PAGE_SIZE].into_boxed_slice());
    buf.as_mut_ptr().expose_provenance().next_multiple_of(PAGE_SIZE)
}

fn heap_over(size: usize) -> (ByteHeap<NoGrowth, 64>, usize) {
    let start = leak_arena(size);
    let mut heap = ByteHeap::new("test bytes", NoGrowth, HeapConfig::DEFAULT);
    heap.init(start, size).expect("Arena is large enough");
    (heap, start)
}

fn addr(ptr: NonNull<u8>) -> usize {
    ptr.as_ptr().addr()
}

#[test]
fn test_4k_arena_scenario() {
    let (mut heap, start) = heap_over(4096);

    let first = heap.alloc(100).expect("Fits in a fresh arena");
    assert!((start..start + 4096).contains(&addr(first)));

    assert_eq!(heap.alloc(5000), Err(OutOfMemory));
    assert_eq!(heap.stats().live_allocations, 1);
    heap.check().expect("Failed allocation changes nothing");

    heap.free(first).expect("Pointer came from this heap");
    assert_eq!(heap.stats().free_blocks, 1);
    let big = heap.alloc(4000).expect("Freed space was merged back");
    assert_eq!(addr(big), start);
}

#[test]
fn test_round_trip_restores_free_list() {
    let (mut heap, _) = heap_over(4 * PAGE_SIZE);
    let keep = heap.alloc(200).expect("Fits");
    let before = heap.stats();
    for size in [0, 1, 31, 32, 33, 500, 4096] {
        let ptr = heap.alloc(size).expect("Fits");
        heap.free_sized(ptr, size).expect("Same size as allocated");
        let after = heap.stats();
        assert_eq!(after.free_bytes, before.free_bytes, "alloc({size})");
        assert_eq!(after.free_blocks, before.free_blocks, "alloc({size})");
    }
    heap.free(keep).expect("Pointer came from this heap");
}

#[test]
fn test_alignment() {
    let (mut heap, _) = heap_over(16 * PAGE_SIZE);
    // Knock the free list off any nice alignment.
    heap.alloc(40).expect("Fits");
    for align in [1, 2, 8, 16, 64, 256, 1024, PAGE_SIZE] {
        let ptr = heap.alloc_aligned(72, align).expect("Fits");
        assert_eq!(addr(ptr) % align, 0, "align {align}");
        let allocation = heap.arena().find(addr(ptr)).expect("Live allocation");
        assert!(allocation.block.end() - addr(ptr) >= 72);
    }
    heap.check().expect("Heap is consistent");
}

#[test]
fn test_merge_completeness() {
    let (mut heap, start) = heap_over(PAGE_SIZE);
    let ptrs: Vec<_> = (0..5).map(|_| heap.alloc(64).expect("Fits")).collect();
    // Free every other block, then the ones between them.
    for &ptr in ptrs.iter().step_by(2) {
        heap.free(ptr).expect("Live");
    }
    // The last one merged into the free tail.
    assert_eq!(heap.stats().free_blocks, 3);
    heap.free(ptrs[1]).expect("Live");
    assert_eq!(heap.stats().free_blocks, 2);
    heap.free(ptrs[3]).expect("Live");
    assert_eq!(heap.stats().free_blocks, 1);
    assert_eq!(heap.arena().free_list().blocks()[0].base(), start);
    heap.check().expect("Heap is consistent");
}

#[test]
fn test_random_workload_keeps_invariants() {
    let (mut heap, _) = heap_over(8 * PAGE_SIZE);
    let mut live: Vec<(NonNull<u8>, usize)> = Vec::new();
    let mut seed = 0x2545_f491_u32;
    let mut next = || {
        seed ^= seed << 13;
        seed ^= seed >> 17;
        seed ^= seed << 5;
        seed as usize
    };

    for _ in 0..2000 {
        if live.is_empty() || next() % 3 != 0 {
            let size = next() % 300;
            if let Ok(ptr) = heap.alloc_aligned(size, 1 << (next() % 7)) {
                live.push((ptr, size));
            }
        } else {
            let (ptr, size) = live.swap_remove(next() % live.len());
            heap.free_sized(ptr, size).expect("Live allocation");
        }
        heap.check().expect("Free and live blocks tile the arena");
    }

    let mut ranges: Vec<_> = heap.arena().live().iter().map(|a| a.block).collect();
    ranges.sort_by_key(|b| b.base());
    for pair in ranges.windows(2) {
        assert!(!pair[0].overlaps(pair[1]), "{pair:?}");
    }
    for (ptr, _) in live {
        heap.free(ptr).expect("Live allocation");
    }
    assert_eq!(heap.stats().free_blocks, 1);
}

#[test]
fn test_invalid_frees_are_rejected() {
    let (mut heap, start) = heap_over(PAGE_SIZE);
    let ptr = heap.alloc(48).expect("Fits");
    let before = heap.stats();

    let outside = NonNull::new(std::ptr::without_provenance_mut(start + 2 * PAGE_SIZE))
        .expect("Not null");
    let err = heap.free(outside).expect_err("Outside the arena");
    assert_eq!(err.kind, InvalidFreeKind::OutOfBounds);

    let inside = NonNull::new(ptr.as_ptr().wrapping_add(8)).expect("Not null");
    assert_eq!(
        heap.free(inside).map_err(|e| e.kind),
        Err(InvalidFreeKind::NotAllocated)
    );
    assert_eq!(
        heap.free_sized(ptr, 100).map_err(|e| e.kind),
        Err(InvalidFreeKind::SizeMismatch {
            expected: 48,
            given: 100
        })
    );
    assert_eq!(heap.stats(), before);

    heap.free(ptr).expect("Valid free");
    assert_eq!(
        heap.free(ptr).map_err(|e| e.kind),
        Err(InvalidFreeKind::NotAllocated)
    );
}

#[test]
fn test_zero_sized_allocations_are_distinct() {
    let (mut heap, _) = heap_over(PAGE_SIZE);
    let a = heap.alloc(0).expect("Fits");
    let b = heap.alloc(0).expect("Fits");
    assert_ne!(a, b);
    heap.free_sized(a, 0).expect("Valid free");
    heap.free(b).expect("Valid free");
}

#[test]
fn test_poisoning() {
    let start = leak_arena(PAGE_SIZE);
    let config = HeapConfig::DEFAULT.with_flags(HeapFlags::POISON);
    let mut heap = ByteHeap::<_, 8>::new("poisoned", NoGrowth, config);
    // SAFETY: The arena is leaked memory that nothing else uses.
    unsafe { heap.set_poisoning(true) };
    heap.init(start, PAGE_SIZE).expect("Arena is large enough");

    let ptr = heap.alloc(64).expect("Fits");
    // SAFETY: The allocation is 64 bytes of live memory.
    let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), 64) };
    assert!(bytes.iter().all(|&b| b == ALLOC_POISON));
    heap.free(ptr).expect("Valid free");
    // SAFETY: The arena is leaked, so the freed memory is still readable.
    let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), 64) };
    assert!(bytes.iter().all(|&b| b == FREE_POISON));
}
