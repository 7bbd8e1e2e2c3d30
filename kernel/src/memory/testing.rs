//! Hosted-test support: real memory behind the allocator.
//!
//! The allocator writes its metadata, slab descriptors, and free lists
//! into the window it manages, so tests back the window with an actual
//! allocation, aligned to the largest buddy block so the bootstrap
//! rounding leaves the base where the test put it.

use crate::constants::memory::{ORDER_COUNT, PAGE_SHIFT, PAGE_SIZE};
use crate::diag::Sink;
use crate::memory::bootstrap::{self, HeapInit};
use crate::memory::heap::Heap;
use crate::memory::zone::Requirements;
use core::ptr::NonNull;
use std::alloc::{alloc_zeroed, dealloc, Layout};

/// A block of host memory aligned to the largest buddy block size.
pub(crate) struct TestWindow {
    base: *mut u8,
    layout: Layout,
}

impl TestWindow {
    pub fn new(bytes: usize) -> TestWindow {
        let layout = Layout::from_size_align(bytes, PAGE_SIZE << (ORDER_COUNT - 1))
            .expect("bad test window layout");
        // SAFETY: layout has a non-zero size
        let base = unsafe { alloc_zeroed(layout) };
        assert!(!base.is_null(), "test window allocation failed");
        TestWindow { base, layout }
    }

    pub fn base(&self) -> usize {
        self.base as usize
    }
}

impl Drop for TestWindow {
    fn drop(&mut self) {
        // SAFETY: allocated in new() with the stored layout
        unsafe { dealloc(self.base, self.layout) };
    }
}

/// A fully bootstrapped heap over one zone covering a backed window, with
/// the bootstrap metadata at the front.
pub(crate) struct TestHeap {
    _window: TestWindow,
    heap: NonNull<Heap>,
}

impl TestHeap {
    pub fn new(pages: usize) -> TestHeap {
        let bytes = pages << PAGE_SHIFT;
        let window = TestWindow::new(bytes);
        let base = window.base();
        let mut init = HeapInit::new(base, base + bytes, base, 4);
        assert!(
            init.alloc_end() < base + bytes,
            "test window too small for the bootstrap metadata"
        );

        // SAFETY: the window is exclusively owned, writable host memory
        let heap_ptr = unsafe { bootstrap::create(&init) };
        let heap = unsafe { &mut *heap_ptr.as_ptr() };
        unsafe {
            bootstrap::add_zone(heap, &mut init, "RAM", 0, 0, pages, Requirements::ANY);
        }
        bootstrap::release_boot_region(heap, &init, base as u64, bytes as u64);

        TestHeap {
            _window: window,
            heap: heap_ptr,
        }
    }

    pub fn heap(&mut self) -> &mut Heap {
        // SAFETY: the heap lives inside the owned window
        unsafe { &mut *self.heap.as_ptr() }
    }
}

/// Collects diagnostic output in a string.
pub(crate) struct BufferSink(String);

impl BufferSink {
    pub fn new() -> BufferSink {
        BufferSink(String::new())
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl Sink for BufferSink {
    fn write_span(&mut self, span: &[u8]) {
        self.0.push_str(core::str::from_utf8(span).expect("non-utf8 diagnostics"));
    }
}
