//! The heap: zone registry and byte dispatcher.
//!
//! One [`Heap`] owns everything the allocator knows: the priority-ordered
//! zone queue, the page descriptor table, the cache registry, and the
//! built-in caches. Block requests walk the zones in priority order; byte
//! requests are routed to the size-class cache that fits.

use crate::constants::memory::{ORDER_COUNT, PAGE_SHIFT, SIZE_CLASSES, SIZE_CLASS_COUNT};
use crate::diag::{Sink, SinkWriter};
use crate::memory::cache::{Cache, CacheFlags, CacheHandle};
use crate::memory::list::{DescList, Prioritized};
use crate::memory::page::Page;
use crate::memory::zone::{Block, Requirements, Zone};
use core::cmp;
use core::fmt;
use core::mem;
use core::ptr::NonNull;
use core::slice;

/// The allocator singleton. Placed inside the memory it manages by
/// bootstrap; every operation takes it as an explicit handle.
pub struct Heap {
    pub(super) zones: DescList<Zone>,
    pub(super) caches: DescList<Cache>,
    window_base: usize,
    page_count: usize,
    pages: NonNull<Page>,
    cache_cache: NonNull<Cache>,
    slab_cache: NonNull<Cache>,
    size_classes: [NonNull<Cache>; SIZE_CLASS_COUNT],
}

impl Heap {
    /// The phase-one shell: empty registries and the descriptor addresses
    /// computed by bootstrap. The built-in caches register themselves in
    /// phase two.
    pub(super) fn shell(
        window_base: usize,
        page_count: usize,
        pages: NonNull<Page>,
        cache_cache: NonNull<Cache>,
        slab_cache: NonNull<Cache>,
        size_classes: [NonNull<Cache>; SIZE_CLASS_COUNT],
    ) -> Heap {
        Heap {
            zones: DescList::new(),
            caches: DescList::new(),
            window_base,
            page_count,
            pages,
            cache_cache,
            slab_cache,
            size_classes,
        }
    }

    /// Base address of the managed window (PFN 0).
    pub fn window_base(&self) -> usize {
        self.window_base
    }

    /// Number of page frames in the managed window.
    pub fn page_count(&self) -> usize {
        self.page_count
    }

    pub(super) fn pages(&self) -> &[Page] {
        // SAFETY: the table was laid out by bootstrap and lives as long as
        // the heap itself
        unsafe { slice::from_raw_parts(self.pages.as_ptr(), self.page_count) }
    }

    pub(super) fn pages_mut(&mut self) -> &mut [Page] {
        // SAFETY: as above; &mut self gives exclusive access
        unsafe { slice::from_raw_parts_mut(self.pages.as_ptr(), self.page_count) }
    }

    pub(super) fn cache_cache(&self) -> NonNull<Cache> {
        self.cache_cache
    }

    pub(super) fn slab_cache(&self) -> NonNull<Cache> {
        self.slab_cache
    }

    /// PFN of the page containing `address`.
    pub fn address_to_pfn(&self, address: usize) -> usize {
        debug_assert!(
            address >= self.window_base
                && address < self.window_base + (self.page_count << PAGE_SHIFT),
            "address {:#x} outside the managed window",
            address
        );
        (address - self.window_base) >> PAGE_SHIFT
    }

    /// Address of the first byte of `block`.
    pub fn block_to_address(&self, block: Block) -> *mut u8 {
        debug_assert!(block.pfn < self.page_count);
        (self.window_base + (block.pfn << PAGE_SHIFT)) as *mut u8
    }

    /// Registers a zone in priority order.
    ///
    /// # Safety
    ///
    /// `zone` must stay valid for the heap's lifetime and be registered
    /// only once.
    pub(super) unsafe fn enqueue_zone(&mut self, zone: NonNull<Zone>) {
        self.zones.enqueue(zone);
    }

    /// # Safety
    ///
    /// As [`Heap::enqueue_zone`], for cache descriptors.
    pub(super) unsafe fn register_cache(&mut self, cache: NonNull<Cache>) {
        self.caches.enqueue(cache);
    }

    /// # Safety
    ///
    /// `cache` must be registered on this heap.
    pub(super) unsafe fn unregister_cache(&mut self, cache: NonNull<Cache>) {
        self.caches.remove(cache);
    }

    /// Reserves a block of `2^order` pages from the highest-priority zone
    /// whose requirements cover the request. Returns the sentinel when
    /// every eligible zone is exhausted.
    pub fn allocate_block(&mut self, order: usize, requirements: Requirements) -> Block {
        let mut zones = self.zones.iter();
        while let Some(mut zone_ptr) = zones.next() {
            // SAFETY: zone descriptors live in the bootstrap region for
            // the heap's whole lifetime
            let zone = unsafe { zone_ptr.as_mut() };
            if !zone.requirements().contains(requirements) {
                continue;
            }
            let block = zone.allocate(self.pages_mut(), order);
            if !block.is_sentinel() {
                debug_assert!(zone.contains(block.pfn));
                return block;
            }
        }
        Block::sentinel()
    }

    /// Returns a block to the zone containing it. A block in no zone is a
    /// programming error and fatal.
    pub fn free_block(&mut self, block: Block) {
        let mut zones = self.zones.iter();
        while let Some(mut zone_ptr) = zones.next() {
            let zone = unsafe { zone_ptr.as_mut() };
            if zone.contains(block.pfn) {
                zone.release(self.pages_mut(), block);
                return;
            }
        }
        panic!(
            "free of block ({}, {}) outside every zone",
            block.pfn, block.order
        );
    }

    /// Releases `[pfn_begin, pfn_end)`, intersected with every zone, so a
    /// bootstrap range spanning zones frees the right sub-ranges. Returns
    /// the number of pages released.
    pub fn release_range(&mut self, pfn_begin: usize, pfn_end: usize) -> usize {
        let mut released = 0;
        let mut zones = self.zones.iter();
        while let Some(mut zone_ptr) = zones.next() {
            let zone = unsafe { zone_ptr.as_mut() };
            let begin = cmp::max(zone.begin(), pfn_begin);
            let end = cmp::min(zone.end(), pfn_end);
            if begin < end {
                zone.release_range(self.pages_mut(), begin, end);
                released += end - begin;
            }
        }
        released
    }

    /// Serves a byte request from the size-class ladder. A zero-byte
    /// request is valid and yields a minimum-size allocation; a request
    /// beyond the largest class yields `None`.
    pub fn allocate_bytes(&mut self, size: usize) -> Option<NonNull<u8>> {
        let index = SIZE_CLASSES.iter().position(|&class| size <= class)?;
        let mut cache = self.size_classes[index];
        // SAFETY: built-in cache descriptors are disjoint from the heap
        // structure and live for its whole lifetime
        unsafe { cache.as_mut() }.allocate(self)
    }

    /// Returns a byte allocation to its owning cache; a null pointer is a
    /// no-op.
    pub fn free_bytes(&mut self, allocation: *mut u8) {
        let Some(allocation) = NonNull::new(allocation) else {
            return;
        };
        let pfn = self.address_to_pfn(allocation.as_ptr() as usize);
        let slab = self.pages()[pfn]
            .slab()
            .expect("free of a pointer outside any slab");
        // SAFETY: the back-pointer names a live slab of a live cache
        let mut cache = unsafe { slab.as_ref() }.cache;
        unsafe { cache.as_mut() }.release(self, allocation);
    }

    /// Like [`Heap::allocate_block`], returning the block's address.
    pub fn allocate_pages(
        &mut self,
        order: usize,
        requirements: Requirements,
    ) -> Option<NonNull<u8>> {
        let block = self.allocate_block(order, requirements);
        if block.is_sentinel() {
            return None;
        }
        NonNull::new(self.block_to_address(block))
    }

    pub fn free_pages(&mut self, allocation: NonNull<u8>, order: usize) {
        let pfn = self.address_to_pfn(allocation.as_ptr() as usize);
        self.free_block(Block::new(pfn, order));
    }

    pub fn allocate_page(&mut self, requirements: Requirements) -> Option<NonNull<u8>> {
        self.allocate_pages(0, requirements)
    }

    pub fn free_page(&mut self, allocation: NonNull<u8>) {
        self.free_pages(allocation, 0);
    }

    /// Creates a reference-counted cache whose descriptor comes from the
    /// cache-cache. Returns `None` when the descriptor allocation fails.
    pub fn create_cache(
        &mut self,
        name: &'static str,
        priority: i32,
        size: usize,
        alignment: usize,
        flags: CacheFlags,
        requirements: Requirements,
    ) -> Option<CacheHandle> {
        let mut cache_cache = self.cache_cache;
        let memory = unsafe { cache_cache.as_mut() }.allocate(self)?;
        let descriptor = memory.cast::<Cache>();
        unsafe {
            descriptor.as_ptr().write(Cache::new(
                name,
                priority,
                size,
                alignment,
                flags,
                requirements,
            ));
            self.register_cache(descriptor);
        }
        Some(CacheHandle::new(descriptor))
    }

    /// Total pages currently on the free lists of all zones.
    pub fn free_page_total(&self) -> usize {
        let pages = self.pages();
        self.zones
            .iter()
            .map(|zone| unsafe { zone.as_ref() }.free_page_count(pages))
            .sum()
    }

    pub(super) fn cache_count(&self) -> usize {
        self.caches.iter().count()
    }

    /// Writes a human-readable snapshot of the zones, their per-order free
    /// counts, and every cache with its slab lists.
    pub fn dump<S: Sink + ?Sized>(&self, sink: &mut S) {
        let mut writer = SinkWriter::new(sink);
        let _ = self.write_dump(&mut writer);
    }

    fn write_dump(&self, w: &mut dyn fmt::Write) -> fmt::Result {
        writeln!(w, "Heap at {:p}:", self)?;
        writeln!(
            w,
            "  Page table at [{:p}, {:p}), {} entries ({} bytes each)",
            self.pages.as_ptr(),
            self.pages().as_ptr_range().end,
            self.page_count,
            mem::size_of::<Page>(),
        )?;
        writeln!(
            w,
            "  Manages [{:#x}, {:#x}) ({} pages, {} bytes)",
            self.window_base,
            self.window_base + (self.page_count << PAGE_SHIFT),
            self.page_count,
            self.page_count << PAGE_SHIFT,
        )?;

        let pages = self.pages();
        for zone_ptr in self.zones.iter() {
            let zone = unsafe { zone_ptr.as_ref() };
            writeln!(
                w,
                "  Zone \"{}\" priority {}, PFNs [{}, {}), requirements {:#x}:",
                zone.name(),
                zone.priority(),
                zone.begin(),
                zone.end(),
                zone.requirements().bits(),
            )?;
            write!(w, "    free:")?;
            let mut free = 0;
            for order in 0..ORDER_COUNT {
                let count = zone.free_block_count(pages, order);
                write!(w, " {}<<{}", count, order)?;
                free += count << order;
            }
            writeln!(w, " = {} pages ({} bytes)", free, free << PAGE_SHIFT)?;
        }

        writeln!(w, "  Caches:")?;
        writeln!(
            w,
            "    pri\tref\tsize\talign\tflags\tcount\toffset\tcolours\tnext\tcalign\torder\treq\tname",
        )?;
        for cache_ptr in self.caches.iter() {
            let cache = unsafe { cache_ptr.as_ref() };
            cache.write_dump(w)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::cache::PRIORITY_DEFAULT;
    use crate::memory::testing::{BufferSink, TestHeap};

    #[test]
    fn byte_requests_hit_the_right_size_class() {
        let mut arena = TestHeap::new(1024);
        let heap = arena.heap();

        let owning_cache = |heap: &Heap, p: NonNull<u8>| {
            let pfn = heap.address_to_pfn(p.as_ptr() as usize);
            let slab = heap.pages()[pfn].slab().unwrap();
            unsafe { slab.as_ref() }.cache
        };

        let tiny = heap.allocate_bytes(1).unwrap();
        assert_eq!(unsafe { owning_cache(heap, tiny).as_ref() }.object_size(), 32);
        assert_eq!(unsafe { owning_cache(heap, tiny).as_ref() }.name(), "heap-32B");

        let zero = heap.allocate_bytes(0).unwrap();
        assert_eq!(unsafe { owning_cache(heap, zero).as_ref() }.object_size(), 32);

        let small = heap.allocate_bytes(33).unwrap();
        assert_eq!(unsafe { owning_cache(heap, small).as_ref() }.object_size(), 64);

        let exact = heap.allocate_bytes(192).unwrap();
        assert_eq!(unsafe { owning_cache(heap, exact).as_ref() }.object_size(), 192);

        assert!(heap.allocate_bytes(5_000_000).is_none());

        for p in [tiny, zero, small, exact] {
            heap.free_bytes(p.as_ptr());
        }
    }

    #[test]
    fn free_bytes_accepts_null() {
        let mut arena = TestHeap::new(64);
        arena.heap().free_bytes(core::ptr::null_mut());
    }

    #[test]
    fn page_facade_round_trips() {
        let mut arena = TestHeap::new(256);
        let heap = arena.heap();
        let free = heap.free_page_total();

        let page = heap.allocate_page(Requirements::ANY).unwrap();
        assert_eq!(heap.free_page_total(), free - 1);
        heap.free_page(page);

        let pages = heap.allocate_pages(2, Requirements::ANY).unwrap();
        assert_eq!(heap.free_page_total(), free - 4);
        assert_eq!(heap.address_to_pfn(pages.as_ptr() as usize) % 4, 0);
        heap.free_pages(pages, 2);
        assert_eq!(heap.free_page_total(), free);
    }

    #[test]
    fn matched_pairs_restore_slab_lists() {
        let mut arena = TestHeap::new(1024);
        let heap = arena.heap();
        let cache = heap
            .create_cache(
                "pairs",
                PRIORITY_DEFAULT,
                64,
                8,
                CacheFlags::empty(),
                Requirements::ANY,
            )
            .unwrap();

        // prime the cache so the first slab exists
        let primer = cache.allocate(heap).unwrap();
        let occupancy = |cache: &CacheHandle| {
            let inner = unsafe { cache.cache.as_ref() };
            (
                inner.full.iter().count(),
                inner.partial.iter().count(),
                inner.empty.iter().count(),
            )
        };
        let before = occupancy(&cache);

        let held: Vec<NonNull<u8>> = (0..10).map(|_| cache.allocate(heap).unwrap()).collect();
        for p in held.into_iter().rev() {
            cache.release(heap, p);
        }
        assert_eq!(occupancy(&cache), before);

        cache.release(heap, primer);
        cache.shrink(heap);
        cache.destroy(heap);
    }

    #[test]
    fn exhaustion_yields_sentinel_not_panic() {
        let mut arena = TestHeap::new(64);
        let heap = arena.heap();
        // drain the whole zone
        let mut held = Vec::new();
        loop {
            let block = heap.allocate_block(0, Requirements::ANY);
            if block.is_sentinel() {
                break;
            }
            held.push(block);
        }
        assert!(!held.is_empty());
        assert!(heap.allocate_pages(0, Requirements::ANY).is_none());
        for block in held {
            heap.free_block(block);
        }
    }

    #[test]
    #[should_panic(expected = "outside every zone")]
    fn freeing_an_unmanaged_block_is_fatal() {
        let mut arena = TestHeap::new(64);
        let heap = arena.heap();
        let beyond = heap.page_count() + 8;
        heap.free_block(Block::new(beyond, 0));
    }

    #[test]
    fn dump_reports_zones_and_caches() {
        let mut arena = TestHeap::new(256);
        let heap = arena.heap();
        let held = heap.allocate_bytes(100).unwrap();

        let mut sink = BufferSink::new();
        heap.dump(&mut sink);
        let text = sink.into_string();
        assert!(text.contains("Zone \"RAM\""));
        assert!(text.contains("cache-cache"));
        assert!(text.contains("slab-cache"));
        assert!(text.contains("heap-128B"));
        assert!(text.contains("partial slabs:"));
        assert!(text.contains("free:"));

        heap.free_bytes(held.as_ptr());
    }
}
