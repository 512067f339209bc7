//! Kernel heap. A fixed identity-mapped range is handed to
//! `linked_list_allocator`; after `init` the kernel is free to use `alloc`
//! collections.

use linked_list_allocator::LockedHeap;

#[cfg_attr(not(test), global_allocator)]
#[cfg_attr(test, allow(dead_code))]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// Hand `[heap_start, heap_start + heap_size)` to the allocator.
///
/// The range must be identity mapped, unused, and never handed out as
/// free physical pages.
pub unsafe fn init(heap_start: usize, heap_size: usize) {
    ALLOCATOR.lock().init(heap_start as *mut u8, heap_size);
}

#[cfg(not(test))]
#[alloc_error_handler]
fn alloc_error(layout: core::alloc::Layout) -> ! {
    panic!("kernel heap exhausted: {:?}", layout);
}
