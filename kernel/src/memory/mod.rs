//! Physical memory management.
//!
//! The allocator has two layers. The lower layer is a buddy allocator per
//! [`Zone`]: memory with uniform hardware visibility, split into
//! power-of-two page blocks that split on allocation and re-merge with
//! their buddy on release. Zones sit on a priority queue so scarce memory
//! (ISA DMA, say) is only tapped as a last resort or on explicit request.
//!
//! The upper layer is the slab allocator: a [`Cache`] takes blocks from
//! the buddy layer and carves them into equal objects, tracking slabs on
//! full/partial/empty lists. Byte-sized requests go through a ladder of
//! built-in size-class caches; everything larger comes straight from the
//! buddy layer as page blocks.
//!
//! All state hangs off one [`Heap`] that bootstrap places inside the very
//! memory it manages. Operations take the heap as an explicit handle; the
//! kernel boot path installs it once and uses the module-level functions.
//!
//! [`Cache`]: cache::Cache

pub mod bootstrap;
pub mod cache;
pub mod handover;
pub mod heap;
pub mod list;
pub mod page;
pub mod zone;

#[cfg(test)]
pub(crate) mod testing;

pub use cache::{CacheFlags, CacheHandle, PRIORITY_DEFAULT, PRIORITY_HEAP, PRIORITY_SLAB};
pub use handover::{MemoryRegion, RegionKind};
pub use heap::Heap;
pub use page::Page;
pub use zone::{Block, Requirements, Zone};

use crate::diag::Sink;
use core::ptr::NonNull;
use spin::Mutex;

pub(crate) const fn round_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

pub(crate) const fn round_down(value: usize, alignment: usize) -> usize {
    value & !(alignment - 1)
}

struct InstalledHeap(NonNull<Heap>);

// SAFETY: the allocator is single-threaded by design; the pointer is only
// dereferenced under the lock
unsafe impl Send for InstalledHeap {}

static HEAP: Mutex<Option<InstalledHeap>> = Mutex::new(None);

/// Installs the bootstrapped heap as the process-wide singleton.
///
/// # Safety
///
/// `heap` must come from [`bootstrap::create`] and stay valid forever.
pub unsafe fn install(heap: NonNull<Heap>) {
    let mut guard = HEAP.lock();
    assert!(guard.is_none(), "heap is already installed");
    *guard = Some(InstalledHeap(heap));
}

/// Runs `f` against the installed heap. Must not be re-entered from
/// within `f`.
pub fn with_heap<R>(f: impl FnOnce(&mut Heap) -> R) -> R {
    let guard = HEAP.lock();
    let heap = guard.as_ref().expect("heap is not installed");
    // SAFETY: install() vouched for the pointer; the lock serializes use
    f(unsafe { &mut *heap.0.as_ptr() })
}

/// Allocates `size` bytes from the size-class caches.
pub fn allocate_bytes(size: usize) -> Option<NonNull<u8>> {
    with_heap(|heap| heap.allocate_bytes(size))
}

/// Frees a byte allocation; null is accepted and ignored.
pub fn free_bytes(allocation: *mut u8) {
    with_heap(|heap| heap.free_bytes(allocation))
}

/// Allocates a block of `2^order` pages.
pub fn allocate_block(order: usize, requirements: Requirements) -> Block {
    with_heap(|heap| heap.allocate_block(order, requirements))
}

/// Frees a block obtained from [`allocate_block`].
pub fn free_block(block: Block) {
    with_heap(|heap| heap.free_block(block))
}

/// Allocates a single page and returns its address.
pub fn allocate_page(requirements: Requirements) -> Option<NonNull<u8>> {
    with_heap(|heap| heap.allocate_page(requirements))
}

/// Frees a single page by address.
pub fn free_page(allocation: NonNull<u8>) {
    with_heap(|heap| heap.free_page(allocation))
}

/// Writes a snapshot of the heap to `sink`.
pub fn dump<S: Sink>(sink: &mut S) {
    with_heap(|heap| heap.dump(sink))
}
