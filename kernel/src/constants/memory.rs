//! Compile-time parameters of the physical memory manager.

/// Log2 of the page size.
pub const PAGE_SHIFT: usize = 12;

/// Size of a single page frame in bytes.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Number of buddy orders. A block of order `k` spans `2^k` contiguous
/// pages, so the largest block is `PAGE_SIZE << (ORDER_COUNT - 1)` bytes
/// (64 MiB with 4 KiB pages).
pub const ORDER_COUNT: usize = 15;

/// Data cache line size; descriptors and slab colouring align to it.
pub const CACHE_ALIGN: usize = 64;

/// Number of built-in size classes.
pub const SIZE_CLASS_COUNT: usize = 19;

/// Object sizes of the built-in byte-dispatch caches, ascending. A byte
/// request is served by the first class that holds it; requests beyond the
/// last class fail.
pub const SIZE_CLASSES: [usize; SIZE_CLASS_COUNT] = [
    32,
    64,
    128,
    192,
    256,
    512,
    1 << 10,
    2 << 10,
    4 << 10,
    8 << 10,
    16 << 10,
    32 << 10,
    64 << 10,
    128 << 10,
    256 << 10,
    512 << 10,
    1 << 20,
    2 << 20,
    4 << 20,
];
