//! Heap bootstrap.
//!
//! The allocator's own state lives inside the memory it manages, so it is
//! built in place before any allocation exists. [`HeapInit`] does the
//! layout arithmetic once: the heap structure, the page descriptor table,
//! the built-in cache descriptors, and the zone slots are stacked from
//! `first_zone_start` upward, and everything past `alloc_end` is
//! eventually released to the zones.
//!
//! Creation runs in two phases: [`create`] first writes the heap shell
//! with empty registries, then constructs each built-in cache and
//! registers it against the installed shell, so no constructor ever
//! reaches for a half-built heap.

use crate::constants::memory::{
    CACHE_ALIGN, ORDER_COUNT, PAGE_SHIFT, PAGE_SIZE, SIZE_CLASSES, SIZE_CLASS_COUNT,
};
use crate::memory::cache::{Cache, CacheFlags, Slab, PRIORITY_HEAP, PRIORITY_SLAB};
use crate::memory::heap::Heap;
use crate::memory::page::Page;
use crate::memory::zone::{Requirements, Zone};
use crate::memory::{round_down, round_up};
use core::cmp;
use core::mem;
use core::ptr::NonNull;

/// Descriptors carved for the built-in caches: the cache-cache, the slab
/// descriptor cache, and one cache per size class.
pub const BUILTIN_CACHE_COUNT: usize = 2 + SIZE_CLASS_COUNT;

const SIZE_CLASS_NAMES: [&str; SIZE_CLASS_COUNT] = [
    "heap-32B",
    "heap-64B",
    "heap-128B",
    "heap-192B",
    "heap-256B",
    "heap-512B",
    "heap-1KiB",
    "heap-2KiB",
    "heap-4KiB",
    "heap-8KiB",
    "heap-16KiB",
    "heap-32KiB",
    "heap-64KiB",
    "heap-128KiB",
    "heap-256KiB",
    "heap-512KiB",
    "heap-1MiB",
    "heap-2MiB",
    "heap-4MiB",
];

/// Bootstrap layout of the heap metadata.
///
/// The window base is rounded down to the largest buddy block so block
/// addresses stay order-aligned; the window end is rounded up to a page.
pub struct HeapInit {
    window_base: usize,
    window_end: usize,
    page_count: usize,
    heap_addr: usize,
    pages_addr: usize,
    caches_addr: usize,
    zones_addr: usize,
    alloc_end: usize,
    max_zones: usize,
    zone_count: usize,
}

impl HeapInit {
    pub fn new(
        window_base: usize,
        window_end: usize,
        first_zone_start: usize,
        max_zones: usize,
    ) -> HeapInit {
        let window_base = round_down(window_base, PAGE_SIZE << (ORDER_COUNT - 1));
        let window_end = round_up(window_end, PAGE_SIZE);
        let page_count = (window_end - window_base) >> PAGE_SHIFT;

        let heap_addr = round_up(first_zone_start, CACHE_ALIGN);
        let pages_addr = round_up(heap_addr + mem::size_of::<Heap>(), CACHE_ALIGN);
        let caches_addr = round_up(pages_addr + page_count * mem::size_of::<Page>(), CACHE_ALIGN);
        let zones_addr = round_up(
            caches_addr + BUILTIN_CACHE_COUNT * mem::size_of::<Cache>(),
            CACHE_ALIGN,
        );
        let alloc_end = zones_addr + max_zones * mem::size_of::<Zone>();

        HeapInit {
            window_base,
            window_end,
            page_count,
            heap_addr,
            pages_addr,
            caches_addr,
            zones_addr,
            alloc_end,
            max_zones,
            zone_count: 0,
        }
    }

    pub fn window_base(&self) -> usize {
        self.window_base
    }

    pub fn window_end(&self) -> usize {
        self.window_end
    }

    pub fn page_count(&self) -> usize {
        self.page_count
    }

    /// First byte past the bootstrap metadata; nothing below this address
    /// is ever released to a zone.
    pub fn alloc_end(&self) -> usize {
        self.alloc_end
    }

    /// PFN of the page containing `address`.
    pub fn pfn(&self, address: usize) -> usize {
        debug_assert!(address >= self.window_base && address <= self.window_end);
        (address - self.window_base) >> PAGE_SHIFT
    }
}

/// Builds the heap in place per the [`HeapInit`] layout and returns it.
///
/// # Safety
///
/// The byte range `[init.heap_addr, init.alloc_end)` must be ordinary
/// writable memory, unused by anything else, and must stay valid for the
/// heap's whole lifetime.
pub unsafe fn create(init: &HeapInit) -> NonNull<Heap> {
    let pages = NonNull::new(init.pages_addr as *mut Page).expect("page table at null");
    let caches = init.caches_addr as *mut Cache;
    let cache_cache = NonNull::new_unchecked(caches);
    let slab_cache = NonNull::new_unchecked(caches.add(1));
    let mut size_classes = [cache_cache; SIZE_CLASS_COUNT];
    for (index, slot) in size_classes.iter_mut().enumerate() {
        *slot = NonNull::new_unchecked(caches.add(2 + index));
    }

    // phase one: the shell, with every registry empty
    let heap_ptr = init.heap_addr as *mut Heap;
    heap_ptr.write(Heap::shell(
        init.window_base,
        init.page_count,
        pages,
        cache_cache,
        slab_cache,
        size_classes,
    ));

    for index in 0..init.page_count {
        pages.as_ptr().add(index).write(Page::new());
    }

    // phase two: the built-in caches register against the installed shell
    let heap = &mut *heap_ptr;
    cache_cache.as_ptr().write(Cache::new(
        "cache-cache",
        PRIORITY_SLAB,
        mem::size_of::<Cache>(),
        CACHE_ALIGN,
        CacheFlags::empty(),
        Requirements::ANY,
    ));
    heap.register_cache(cache_cache);
    slab_cache.as_ptr().write(Cache::new(
        "slab-cache",
        PRIORITY_SLAB,
        Slab::descriptor_capacity(),
        CACHE_ALIGN,
        CacheFlags::empty(),
        Requirements::ANY,
    ));
    heap.register_cache(slab_cache);
    for (index, slot) in size_classes.iter().enumerate() {
        let class = SIZE_CLASSES[index];
        slot.as_ptr().write(Cache::new(
            SIZE_CLASS_NAMES[index],
            PRIORITY_HEAP,
            class,
            cmp::min(class, CACHE_ALIGN),
            CacheFlags::empty(),
            Requirements::ANY,
        ));
        heap.register_cache(*slot);
    }

    log::info!(
        "heap at {:p}: {} pages managed, metadata [{:#x}, {:#x})",
        heap_ptr,
        init.page_count,
        init.heap_addr,
        init.alloc_end,
    );
    NonNull::new_unchecked(heap_ptr)
}

/// Constructs a zone in the next bootstrap slot and registers it at its
/// priority.
///
/// # Safety
///
/// Same memory contract as [`create`]; at most `max_zones` zones may be
/// added.
pub unsafe fn add_zone(
    heap: &mut Heap,
    init: &mut HeapInit,
    name: &'static str,
    priority: i32,
    begin: usize,
    end: usize,
    requirements: Requirements,
) -> NonNull<Zone> {
    assert!(init.zone_count < init.max_zones, "zone slots exhausted");
    let slot = (init.zones_addr + init.zone_count * mem::size_of::<Zone>()) as *mut Zone;
    init.zone_count += 1;
    slot.write(Zone::new(name, priority, begin, end, requirements));
    let zone = NonNull::new_unchecked(slot);
    heap.enqueue_zone(zone);
    log::debug!(
        "zone {}: PFNs [{}, {}) priority {}",
        name,
        begin,
        end,
        priority
    );
    zone
}

/// Releases the usable part of one RAM handover record to the zones.
///
/// Both page-aligned halves around the reserved metadata span are freed,
/// so RAM in front of the heap structures is not lost. Returns the number
/// of pages released.
pub fn release_boot_region(heap: &mut Heap, init: &HeapInit, base: u64, length: u64) -> usize {
    let begin = cmp::max(base as usize, init.window_base);
    let end = cmp::min(base.saturating_add(length) as usize, init.window_end);
    if begin >= end {
        return 0;
    }

    let reserved_begin = round_down(init.heap_addr, PAGE_SIZE);
    let reserved_end = round_up(init.alloc_end, PAGE_SIZE);

    let mut released = 0;
    let halves = [
        (begin, cmp::min(end, reserved_begin)),
        (cmp::max(begin, reserved_end), end),
    ];
    for (lo, hi) in halves {
        let lo = round_up(lo, PAGE_SIZE);
        let hi = round_down(hi, PAGE_SIZE);
        if lo < hi {
            released += heap.release_range(init.pfn(lo), init.pfn(hi));
        }
    }
    released
}
