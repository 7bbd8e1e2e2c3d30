//! Slab caches: pools of same-size objects carved from buddy blocks.
//!
//! A [`Cache`] owns slabs — buddy-allocated blocks cut into equal slots —
//! kept on three lists by occupancy (full, partial, empty). Each slab is
//! described by a [`Slab`] header followed in memory by a compact free
//! list of one-byte object indices. The header either sits at the front of
//! the slab's own block (on-slab) or is drawn from the heap's dedicated
//! descriptor cache (off-slab), decided once at cache construction.
//!
//! Consecutive slabs of one cache shift their first object by one colour
//! step, so objects of different slabs land in different cache lines.

use crate::constants::memory::{CACHE_ALIGN, ORDER_COUNT, PAGE_SIZE};
use crate::memory::heap::Heap;
use crate::memory::list::{DescList, Linked, Links, Prioritized};
use crate::memory::round_up;
use crate::memory::zone::{Block, Requirements, Zone};
use bitflags::bitflags;
use core::cmp;
use core::fmt;
use core::mem;
use core::ptr::NonNull;

/// Priority of ordinary caches.
pub const PRIORITY_DEFAULT: i32 = 0;
/// Priority of the built-in size-class caches.
pub const PRIORITY_HEAP: i32 = -10;
/// Priority of the cache and slab descriptor caches.
pub const PRIORITY_SLAB: i32 = -20;

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct CacheFlags: u32 {
        /// Keep the slab descriptor out of the slab's own block.
        const OFF_SLAB = 1;
    }
}

/// Descriptor of one slab.
///
/// The free list trails the header: `count` bytes, one per object slot,
/// chained through small indices. `first_free` heads the chain.
#[repr(C)]
pub struct Slab {
    links: Links<Slab>,
    pub(super) cache: NonNull<Cache>,
    pub(super) first_object: NonNull<u8>,
    pub(super) active_count: u8,
    pub(super) first_free: u8,
}

impl Linked for Slab {
    fn links(&self) -> &Links<Slab> {
        &self.links
    }
    fn links_mut(&mut self) -> &mut Links<Slab> {
        &mut self.links
    }
}

impl Slab {
    /// Largest number of objects a slab can hold.
    pub(super) const MAX_INDEX: usize = 253;
    /// Free-list terminator.
    const END_OF_LIST: u8 = 254;
    /// Free-list entry of an allocated slot.
    const ALLOCATED: u8 = 255;

    /// Bytes occupied by a descriptor for `count` objects, padded to
    /// `alignment`.
    pub(super) fn descriptor_size(alignment: usize, count: usize) -> usize {
        round_up(mem::size_of::<Slab>() + count, alignment)
    }

    /// Bytes a slab for `count` objects occupies inside its block,
    /// including the descriptor when it is on-slab.
    pub(super) fn slab_size(
        size: usize,
        alignment: usize,
        flags: CacheFlags,
        count: usize,
    ) -> usize {
        let mut bytes = round_up(size, alignment) * count;
        if !flags.contains(CacheFlags::OFF_SLAB) {
            bytes += Self::descriptor_size(alignment, count);
        }
        bytes
    }

    /// Object size of the dedicated off-slab descriptor cache: room for a
    /// descriptor with the maximum object count.
    pub(super) fn descriptor_capacity() -> usize {
        Self::descriptor_size(CACHE_ALIGN, Self::MAX_INDEX)
    }

    /// # Safety
    ///
    /// `slab` must point at a descriptor with its free list allocated
    /// behind it.
    unsafe fn free_list(slab: NonNull<Slab>) -> *mut u8 {
        slab.as_ptr().cast::<u8>().add(mem::size_of::<Slab>())
    }

    /// Writes a fresh descriptor at `descriptor` and chains the free list
    /// 0 → 1 → … → count−1 → end.
    ///
    /// # Safety
    ///
    /// `descriptor` must be writable for `descriptor_size` bytes and
    /// suitably aligned for `Slab`.
    unsafe fn initialize(
        descriptor: NonNull<u8>,
        cache: NonNull<Cache>,
        first_object: NonNull<u8>,
        count: usize,
    ) -> NonNull<Slab> {
        debug_assert!(count >= 1 && count <= Self::MAX_INDEX);
        let slab = descriptor.cast::<Slab>();
        slab.as_ptr().write(Slab {
            links: Links::new(),
            cache,
            first_object,
            active_count: 0,
            first_free: 0,
        });
        let list = Self::free_list(slab);
        for index in 0..count - 1 {
            list.add(index).write(index as u8 + 1);
        }
        list.add(count - 1).write(Self::END_OF_LIST);
        slab
    }
}

/// A pool of equally sized objects backed by buddy blocks.
///
/// Built-in descriptors are carved during bootstrap; user caches are
/// allocated from the heap's cache-cache and handed out as reference
/// counted [`CacheHandle`]s.
pub struct Cache {
    links: Links<Cache>,
    pub(super) name: &'static str,
    pub(super) priority: i32,
    pub(super) refcount: usize,
    pub(super) size: usize,
    pub(super) alignment: usize,
    pub(super) flags: CacheFlags,
    pub(super) count: usize,
    pub(super) full: DescList<Slab>,
    pub(super) partial: DescList<Slab>,
    pub(super) empty: DescList<Slab>,
    pub(super) start_offset: usize,
    pub(super) colours: usize,
    pub(super) colour_next: usize,
    pub(super) colour_alignment: usize,
    pub(super) alloc_order: usize,
    pub(super) requirements: Requirements,
}

impl Linked for Cache {
    fn links(&self) -> &Links<Cache> {
        &self.links
    }
    fn links_mut(&mut self) -> &mut Links<Cache> {
        &mut self.links
    }
}

impl Prioritized for Cache {
    fn priority(&self) -> i32 {
        self.priority
    }
}

impl Cache {
    /// Computes the slab parameters for a cache of `size`-byte objects.
    ///
    /// `size` is rounded up to `alignment`. Objects of a page-eighth or
    /// more force the descriptor off-slab; if the descriptor turns out to
    /// fit on-slab anyway at the final object count, the decision is
    /// reverted (unless the caller asked for off-slab explicitly). The
    /// slack left in the block determines how many colours the cache
    /// rotates through.
    pub(super) fn new(
        name: &'static str,
        priority: i32,
        size: usize,
        alignment: usize,
        flags: CacheFlags,
        requirements: Requirements,
    ) -> Cache {
        assert!(alignment.is_power_of_two(), "alignment must be a power of two");
        let user_off_slab = flags.contains(CacheFlags::OFF_SLAB);
        let size = round_up(size, alignment);

        let mut flags = flags;
        if size >= PAGE_SIZE / 8 {
            flags |= CacheFlags::OFF_SLAB;
        }

        let alloc_order = Zone::bytes_to_order(size);
        assert!(
            alloc_order < ORDER_COUNT,
            "cache {} objects exceed the largest block",
            name
        );
        let alloc_size = PAGE_SIZE << alloc_order;

        // fit as many objects as possible into one block
        let mut count = 1;
        let mut required = Slab::slab_size(size, alignment, flags, count);
        while count < Slab::MAX_INDEX {
            let test = Slab::slab_size(size, alignment, flags, count + 1);
            if test > alloc_size {
                break;
            }
            required = test;
            count += 1;
        }

        // squeeze the descriptor back in if it fits after all
        if flags.contains(CacheFlags::OFF_SLAB) && !user_off_slab {
            let on_slab = Slab::slab_size(
                size,
                alignment,
                flags.difference(CacheFlags::OFF_SLAB),
                count,
            );
            if on_slab <= alloc_size {
                required = on_slab;
                flags.remove(CacheFlags::OFF_SLAB);
            }
        }

        debug_assert!(required <= alloc_size);
        let slack = alloc_size - required;
        let colour_alignment = cmp::max(CACHE_ALIGN, alignment);
        let colours = slack / colour_alignment + 1;
        let start_offset = if flags.contains(CacheFlags::OFF_SLAB) {
            0
        } else {
            Slab::descriptor_size(alignment, count)
        };

        Cache {
            links: Links::new(),
            name,
            priority,
            refcount: 1,
            size,
            alignment,
            flags,
            count,
            full: DescList::new(),
            partial: DescList::new(),
            empty: DescList::new(),
            start_offset,
            colours,
            colour_next: 0,
            colour_alignment,
            alloc_order,
            requirements,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn object_size(&self) -> usize {
        self.size
    }

    /// Hands out one object, growing the cache by a slab if necessary.
    /// Returns `None` when no zone can supply a new slab.
    pub fn allocate(&mut self, heap: &mut Heap) -> Option<NonNull<u8>> {
        let slab_ptr = self.allocatable_slab(heap)?;
        // SAFETY: slabs on this cache's lists stay valid until shrink
        let slab = unsafe { &mut *slab_ptr.as_ptr() };
        debug_assert!((slab.active_count as usize) < self.count);

        let allocated = slab.first_free as usize;
        debug_assert!(allocated < self.count);
        unsafe {
            let list = Slab::free_list(slab_ptr);
            slab.first_free = list.add(allocated).read();
            list.add(allocated).write(Slab::ALLOCATED);
        }
        slab.active_count += 1;
        if slab.active_count as usize == self.count {
            unsafe {
                self.partial.remove(slab_ptr);
                self.full.push(slab_ptr);
            }
        }

        // SAFETY: index < count, so the offset stays inside the slab
        let object = unsafe { slab.first_object.as_ptr().add(allocated * self.size) };
        Some(unsafe { NonNull::new_unchecked(object) })
    }

    /// Returns an object to its slab. Fatal if the pointer is not inside
    /// a slab of this cache or the slot is already free.
    pub fn release(&mut self, heap: &mut Heap, allocation: NonNull<u8>) {
        let pfn = heap.address_to_pfn(allocation.as_ptr() as usize);
        let slab_ptr = heap.pages()[pfn]
            .slab()
            .expect("release of a pointer outside any slab");
        // SAFETY: the back-pointer only names live slabs
        let slab = unsafe { &mut *slab_ptr.as_ptr() };
        debug_assert!(core::ptr::eq(slab.cache.as_ptr(), self));

        if slab.active_count as usize == self.count {
            unsafe {
                self.full.remove(slab_ptr);
                self.partial.push(slab_ptr);
            }
        }
        assert!(
            slab.active_count > 0,
            "double free into an empty slab of cache {}",
            self.name
        );

        let offset = (allocation.as_ptr() as usize).wrapping_sub(slab.first_object.as_ptr() as usize);
        let index = offset / self.size;
        assert!(index < self.count, "pointer off the end of its slab");
        unsafe {
            let list = Slab::free_list(slab_ptr);
            assert!(
                list.add(index).read() == Slab::ALLOCATED,
                "double free of object {:p} in cache {}",
                allocation.as_ptr(),
                self.name
            );
            list.add(index).write(slab.first_free);
        }
        slab.first_free = index as u8;
        slab.active_count -= 1;
        if slab.active_count == 0 {
            unsafe {
                self.partial.remove(slab_ptr);
                self.empty.push(slab_ptr);
            }
        }
    }

    /// Returns every empty slab's block to the buddy allocator, freeing
    /// off-slab descriptors too. Returns the number of slabs reclaimed.
    pub fn shrink(&mut self, heap: &mut Heap) -> usize {
        let mut reclaimed = 0;
        while let Some(slab_ptr) = unsafe { self.empty.pop() } {
            reclaimed += 1;
            let (first_object, active) = {
                let slab = unsafe { slab_ptr.as_ref() };
                (slab.first_object.as_ptr() as usize, slab.active_count)
            };
            assert_eq!(active, 0, "occupied slab on the empty list");

            // blocks are order-aligned, so rounding the first object's PFN
            // down recovers the block head despite the colouring shift
            let pfn = heap.address_to_pfn(first_object) & !((1 << self.alloc_order) - 1);
            let block = Block::new(pfn, self.alloc_order);

            let pages = heap.pages_mut();
            for page in pages[pfn..pfn + (1 << self.alloc_order)].iter_mut() {
                page.clear_slab();
            }
            if self.flags.contains(CacheFlags::OFF_SLAB) {
                let mut slab_cache = heap.slab_cache();
                // SAFETY: the slab cache descriptor is disjoint from self
                unsafe { slab_cache.as_mut() }.release(heap, slab_ptr.cast());
            }
            heap.free_block(block);
        }
        reclaimed
    }

    /// Finds a slab with a free slot: the first partial slab, else an
    /// empty slab promoted to partial, else a freshly carved one.
    fn allocatable_slab(&mut self, heap: &mut Heap) -> Option<NonNull<Slab>> {
        if let Some(slab) = self.partial.first() {
            return Some(slab);
        }
        if let Some(slab) = unsafe { self.empty.pop() } {
            unsafe { self.partial.push(slab) };
            return Some(slab);
        }
        self.grow(heap)
    }

    /// Carves a new slab out of a fresh buddy block.
    fn grow(&mut self, heap: &mut Heap) -> Option<NonNull<Slab>> {
        let block = heap.allocate_block(self.alloc_order, self.requirements);
        if block.is_sentinel() {
            return None;
        }
        let memory = heap.block_to_address(block);

        let descriptor = if self.flags.contains(CacheFlags::OFF_SLAB) {
            let mut slab_cache = heap.slab_cache();
            // SAFETY: the slab cache descriptor is disjoint from self; it
            // is never itself off-slab, so this does not recurse
            match unsafe { slab_cache.as_mut() }.allocate(heap) {
                Some(descriptor) => descriptor,
                None => {
                    heap.free_block(block);
                    return None;
                }
            }
        } else {
            NonNull::new(memory).expect("slab block at the null address")
        };

        let colour_shift = self.colour_next * self.colour_alignment;
        self.colour_next = (self.colour_next + 1) % self.colours;
        // SAFETY: start_offset and the colour shift both fit in the slack
        // accounted for at construction
        let first_object = unsafe {
            NonNull::new_unchecked(memory.add(self.start_offset + colour_shift))
        };

        let cache = NonNull::from(&mut *self);
        let slab = unsafe { Slab::initialize(descriptor, cache, first_object, self.count) };
        unsafe { self.partial.push(slab) };

        // let free_bytes resolve interior pointers back to this slab
        let pages = heap.pages_mut();
        for page in pages[block.pfn..block.pfn + (1 << self.alloc_order)].iter_mut() {
            page.set_slab(slab);
        }

        log::debug!(
            "cache {}: new slab at {:p}, {} objects of {} bytes",
            self.name,
            descriptor.as_ptr(),
            self.count,
            self.size
        );
        Some(slab)
    }

    pub(super) fn write_dump(&self, w: &mut dyn fmt::Write) -> fmt::Result {
        writeln!(
            w,
            "    {}\t{}\t{}\t{}\t{:#x}\t{}\t{}\t{}\t{}\t{}\t{}\t{:#x}\t{}",
            self.priority,
            self.refcount,
            self.size,
            self.alignment,
            self.flags.bits(),
            self.count,
            self.start_offset,
            self.colours,
            self.colour_next,
            self.colour_alignment,
            self.alloc_order,
            self.requirements.bits(),
            self.name,
        )?;
        for (label, list) in [
            ("full", &self.full),
            ("partial", &self.partial),
            ("empty", &self.empty),
        ] {
            if list.is_empty() {
                continue;
            }
            writeln!(w, "      {} slabs:", label)?;
            for slab_ptr in list.iter() {
                let slab = unsafe { slab_ptr.as_ref() };
                writeln!(
                    w,
                    "        at {:p}: first_object={:p}, active_count={}, first_free={}",
                    slab_ptr.as_ptr(),
                    slab.first_object.as_ptr(),
                    slab.active_count,
                    slab.first_free,
                )?;
            }
        }
        Ok(())
    }
}

/// Reference-counted handle on a [`Cache`].
///
/// Cloning bumps the descriptor's count; destroying the last handle
/// returns the descriptor to the heap's cache-cache. The built-in caches
/// keep a permanent reference and are never destroyed.
pub struct CacheHandle {
    pub(super) cache: NonNull<Cache>,
}

impl CacheHandle {
    pub(super) fn new(cache: NonNull<Cache>) -> Self {
        Self { cache }
    }

    pub fn name(&self) -> &'static str {
        unsafe { self.cache.as_ref() }.name
    }

    pub fn object_size(&self) -> usize {
        unsafe { self.cache.as_ref() }.size
    }

    pub fn allocate(&self, heap: &mut Heap) -> Option<NonNull<u8>> {
        let mut cache = self.cache;
        // SAFETY: the handle keeps the descriptor alive; it is disjoint
        // from the heap structure
        unsafe { cache.as_mut() }.allocate(heap)
    }

    pub fn release(&self, heap: &mut Heap, allocation: NonNull<u8>) {
        let mut cache = self.cache;
        unsafe { cache.as_mut() }.release(heap, allocation)
    }

    pub fn shrink(&self, heap: &mut Heap) -> usize {
        let mut cache = self.cache;
        unsafe { cache.as_mut() }.shrink(heap)
    }

    /// Drops this reference. The last reference reclaims the cache's empty
    /// slabs and returns the descriptor to the cache-cache; destroying a
    /// cache that still has live objects is fatal.
    pub fn destroy(self, heap: &mut Heap) {
        let mut ptr = self.cache;
        let cache = unsafe { ptr.as_mut() };
        cache.refcount -= 1;
        if cache.refcount > 0 {
            return;
        }
        cache.shrink(heap);
        assert!(
            cache.full.is_empty() && cache.partial.is_empty(),
            "destroying cache {} with live objects",
            cache.name
        );
        unsafe { heap.unregister_cache(ptr) };
        let mut cache_cache = heap.cache_cache();
        unsafe { cache_cache.as_mut() }.release(heap, ptr.cast());
    }
}

impl Clone for CacheHandle {
    fn clone(&self) -> Self {
        let mut cache = self.cache;
        unsafe { cache.as_mut() }.refcount += 1;
        Self { cache: self.cache }
    }
}
