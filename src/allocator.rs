//! A simple heap allocator using the `linked_list_allocator` crate.

use linked_list_allocator::LockedHeap;
use x86_64::{
    structures::paging::{
        mapper::MapToError, FrameAllocator, Mapper, Page, PageTableFlags, Size4KiB,
    },
    VirtAddr,
};

use crate::memory;

/// Start address of the heap.
pub const HEAP_START: usize = 0x_4444_4444_0000;
/// Size of the heap in bytes.
pub const HEAP_SIZE: usize = 1000 * 1024; // 1 MiB

/// Map the kernel heap and hand it to the global allocator.
///
/// Must run after [`memory::init`]; the RAM file system, the frame free list
/// and the process loader all allocate from this heap.
///
/// # Errors
/// Might fail if the physical memory frame allocator runs out of memory.
pub fn init_heap() -> Result<(), MapToError<Size4KiB>> {
    let mut mapper = memory::mapper().lock();
    let mut frames = memory::frames().lock();

    let page_range = {
        let heap_start = VirtAddr::new(HEAP_START as u64);
        let heap_end = heap_start + HEAP_SIZE - 1_u64;
        let heap_start_page = Page::containing_address(heap_start);
        let heap_end_page = Page::containing_address(heap_end);
        Page::range_inclusive(heap_start_page, heap_end_page)
    };

    for page in page_range {
        let frame = frames
            .allocate_frame()
            .ok_or(MapToError::FrameAllocationFailed)?;
        let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
        // SAFETY:
        //
        // The heap pages are not mapped by anyone else and the frame was just
        // allocated, so it is unused. init_heap only runs once.
        unsafe {
            mapper
                .map_to(page, frame, flags, &mut *frames)?
                .flush();
        }
    }

    // SAFETY:
    //
    // Init the allocator is unsafe because the caller must guarantee that the
    // heap memory is not used for other purposes.
    unsafe {
        ALLOCATOR.lock().init(HEAP_START, HEAP_SIZE);
    }

    Ok(())
}

#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();
