//! Testing that the kernel and debugger instances share nothing.

use kmem::{
    DebugMemory, KernelMemory, PAGE_SIZE,
    config::{DEBUG, PRODUCTION},
    growth::NoGrowth,
    instance::Role,
};

/// Leak `pages` pages of page aligned memory.
fn leak_pages(pages: usize) -> usize {
    let buf = Box::leak(vec![0_u8; (pages + 1) * PAGE_SIZE].into_boxed_slice());
    buf.as_mut_ptr().expose_provenance().next_multiple_of(PAGE_SIZE)
}

fn instances() -> (Box<KernelMemory<NoGrowth>>, DebugMemory<NoGrowth>) {
    let kernel = Box::new(KernelMemory::new(
        Role::Production,
        NoGrowth,
        NoGrowth,
        &PRODUCTION,
    ));
    kernel
        .init_bytes(leak_pages(4), 4 * PAGE_SIZE)
        .expect("Arena is large enough");
    kernel
        .init_pages(leak_pages(8), 8 * PAGE_SIZE)
        .expect("Arena is large enough");
    let debug = DebugMemory::new(NoGrowth, NoGrowth, &DEBUG);
    debug
        .init_bytes(leak_pages(2), 2 * PAGE_SIZE)
        .expect("Arena is large enough");
    debug
        .init_pages(leak_pages(4), 4 * PAGE_SIZE)
        .expect("Arena is large enough");
    (kernel, debug)
}

#[test]
fn test_debug_allocates_while_kernel_heap_is_locked() {
    let (kernel, debug) = instances();
    kernel.with_bytes(|_held| {
        assert!(kernel.try_alloc(16).is_none());
        let ptr = debug.alloc(128).expect("Debug heap has its own lock");
        debug.free(ptr).expect("Live allocation");
        let page = debug.alloc_page().expect("Debug pages have their own lock");
        debug.free_page(page).expect("Live allocation");
    });
    kernel.with_pages(|_held| {
        let ptr = debug.alloc_pages(2).expect("Debug pages have their own lock");
        debug.free_pages(ptr, 2).expect("Live allocation");
    });
}

#[test]
fn test_kernel_allocates_while_debug_heap_is_locked() {
    let (kernel, debug) = instances();
    debug.with_bytes(|_held| {
        let ptr = kernel.alloc(64).expect("Kernel heap has its own lock");
        kernel.free(ptr).expect("Live allocation");
    });
}

#[test]
fn test_debug_traffic_leaves_kernel_state_alone() {
    let (kernel, debug) = instances();
    let kept = kernel.alloc(300).expect("Fits");
    let before = kernel.stats();

    let mut ptrs = Vec::new();
    while let Ok(ptr) = debug.alloc(256) {
        ptrs.push(ptr);
    }
    assert!(!ptrs.is_empty());
    assert!(debug.stats().bytes.failed_allocs > 0);
    for ptr in ptrs {
        debug.free(ptr).expect("Live allocation");
    }

    assert_eq!(kernel.stats(), before);
    // Debug pointers mean nothing to the kernel heap.
    let foreign = debug.alloc(32).expect("Fits");
    assert!(kernel.free(foreign).is_err());
    assert_eq!(kernel.stats(), before);
    kernel.free(kept).expect("Live allocation");
    kernel.check().expect("Kernel heap is consistent");
    debug.check().expect("Debug heap is consistent");
}

#[test]
fn test_bootstrap_maps_both_heaps() {
    let bytes = leak_pages(4);
    let pages = leak_pages(8);
    let mut config = DEBUG;
    config.bytes.base = bytes;
    config.bytes.window_len = 4 * PAGE_SIZE;
    config.pages.base = pages;
    config.pages.window_len = 8 * PAGE_SIZE;

    let debug = DebugMemory::new(config.bytes.window(), config.pages.window(), &config);
    debug.bootstrap(&config).expect("Windows have room");
    let stats = debug.stats();
    assert_eq!(stats.role, Role::Debug);
    assert_eq!(stats.bytes.bounds.base(), bytes);
    assert_eq!(stats.bytes.bounds.size(), config.bytes.initial_size);
    assert_eq!(stats.pages.bounds.base(), pages);

    // Grows into the rest of the window on demand.
    let big = debug.alloc(3 * PAGE_SIZE).expect("Window has room");
    assert_eq!(debug.stats().bytes.growths, 1);
    debug.free(big).expect("Live allocation");
    assert!(debug.bootstrap(&config).is_err());
}
