//! Memory management module for setting up paging and frame allocation.
//!
//! The paging core treats this module as two collaborators: the page-table
//! manipulator (an [`OffsetPageTable`] over the active level 4 table) and the
//! physical-frame allocator ([`PhysFrameManager`]), which recycles frames
//! freed by eviction and can cap the number of user frames outstanding so
//! tests can create memory pressure on demand.

use alloc::vec::Vec;

use bootloader::bootinfo::{MemoryMap, MemoryRegionType};
use bootloader::BootInfo;
use conquer_once::spin::OnceCell;
use spin::Mutex;
use x86_64::{
    registers::control::Cr3,
    structures::paging::{FrameAllocator, OffsetPageTable, PageTable, PhysFrame, Size4KiB},
    PhysAddr, VirtAddr,
};

/// The MMU page size in bytes.
pub const PGSIZE: u64 = 4096;

static PHYSICAL_MEMORY_OFFSET: OnceCell<VirtAddr> = OnceCell::uninit();
static MAPPER: OnceCell<Mutex<OffsetPageTable<'static>>> = OnceCell::uninit();
static FRAMES: OnceCell<Mutex<PhysFrameManager>> = OnceCell::uninit();

/// Initialize the global mapper and frame manager from the boot information.
///
/// # Safety
/// The caller must guarantee that the complete physical memory is mapped to
/// virtual memory at `boot_info.physical_memory_offset` and that the memory
/// map is valid. This function must be only called once to avoid aliasing
/// `&mut` references to the level 4 table.
pub unsafe fn init(boot_info: &'static BootInfo) {
    let physical_memory_offset = VirtAddr::new(boot_info.physical_memory_offset);
    PHYSICAL_MEMORY_OFFSET.init_once(|| physical_memory_offset);

    // SAFETY:
    // Guaranteed by the caller contract of `init`.
    let level_4_table = unsafe { active_level_4_table(physical_memory_offset) };
    MAPPER.init_once(|| {
        // SAFETY:
        // Guaranteed by the caller contract of `init`.
        Mutex::new(unsafe { OffsetPageTable::new(level_4_table, physical_memory_offset) })
    });

    // SAFETY:
    // The memory map comes from the bootloader and is valid.
    let boot_allocator = unsafe { BootInfoFrameAllocator::new(&boot_info.memory_map) };
    FRAMES.init_once(|| Mutex::new(PhysFrameManager::new(boot_allocator)));
}

/// Returns the global page-table manipulator.
///
/// # Panics
/// Panics if [`init`] has not run yet.
#[expect(
    clippy::expect_used,
    reason = "Accessing the mapper before memory::init is a kernel bug."
)]
pub fn mapper() -> &'static Mutex<OffsetPageTable<'static>> {
    MAPPER.try_get().expect("memory::init has not been called.")
}

/// Returns the global physical-frame manager.
///
/// # Panics
/// Panics if [`init`] has not run yet.
#[expect(
    clippy::expect_used,
    reason = "Accessing the frame manager before memory::init is a kernel bug."
)]
pub fn frames() -> &'static Mutex<PhysFrameManager> {
    FRAMES.try_get().expect("memory::init has not been called.")
}

/// Returns the offset at which all physical memory is mapped.
///
/// # Panics
/// Panics if [`init`] has not run yet.
#[expect(
    clippy::expect_used,
    reason = "Accessing the offset before memory::init is a kernel bug."
)]
pub fn physical_memory_offset() -> VirtAddr {
    *PHYSICAL_MEMORY_OFFSET
        .try_get()
        .expect("memory::init has not been called.")
}

/// Returns a mutable reference to the active level 4 table.
///
/// # Safety
/// Unsafe because the caller must guarantee that the physical memory is mapped
/// to virtual memory at the passed `physical_memory_offset`.
/// This function must be only called once to avoid aliasing `&mut` references.
#[must_use]
unsafe fn active_level_4_table(physical_memory_offset: VirtAddr) -> &'static mut PageTable {
    // Cr3 register holds the physical address of the level 4 page table.
    let (level_4_table_frame, _) = Cr3::read();

    let phys = level_4_table_frame.start_address();
    let virt = physical_memory_offset + phys.as_u64();
    let page_table_ptr: *mut PageTable = virt.as_mut_ptr();

    // SAFETY:
    // Guaranteed by the caller contract.
    unsafe { &mut *page_table_ptr }
}

/// Returns the kernel-visible bytes of a physical frame, through the
/// boot-time mapping of all physical memory.
///
/// # Safety
/// The caller must own the frame and must not hold any other reference to
/// its bytes while the returned slice is alive.
#[must_use]
pub unsafe fn frame_bytes_mut(frame: PhysFrame) -> &'static mut [u8] {
    let virt = physical_memory_offset() + frame.start_address().as_u64();

    // SAFETY:
    // The frame is owned by the caller and physical memory is fully mapped.
    unsafe { core::slice::from_raw_parts_mut(virt.as_mut_ptr::<u8>(), PGSIZE as usize) }
}

/// Fill a physical frame with zeroes.
///
/// # Safety
/// The caller must own the frame.
pub unsafe fn zero_frame(frame: PhysFrame) {
    let virt = physical_memory_offset() + frame.start_address().as_u64();

    // SAFETY:
    // The frame is owned by the caller and physical memory is fully mapped.
    unsafe { core::ptr::write_bytes(virt.as_mut_ptr::<u8>(), 0, PGSIZE as usize) }
}

/// A frame allocator that returns usable frames from the bootloader's memory map.
pub struct BootInfoFrameAllocator {
    memory_map: &'static MemoryMap,
    next: usize,
}

impl BootInfoFrameAllocator {
    /// Create a `BootInfoFrameAllocator` from the passed memory map.
    ///
    /// # Safety
    ///
    /// The caller must guarantee that the passed memory map is valid.
    #[must_use]
    pub const unsafe fn new(memory_map: &'static MemoryMap) -> Self {
        Self {
            memory_map,
            next: 0,
        }
    }

    fn usable_frames(&self) -> impl Iterator<Item = PhysFrame> {
        let regions = self.memory_map.iter();
        let usable_regions = regions.filter(|r| r.region_type == MemoryRegionType::Usable);
        let addr_ranges = usable_regions.map(|r| r.range.start_addr()..r.range.end_addr());
        let frame_addresses = addr_ranges.flat_map(|r| r.step_by(4096));
        frame_addresses.map(|addr| PhysFrame::containing_address(PhysAddr::new(addr)))
    }
}

/// Implement the `FrameAllocator` trait for `BootInfoFrameAllocator`.
///
/// SAFETY:
///
/// Unsafe because the caller must guarantee that the memory map is valid.
unsafe impl FrameAllocator<Size4KiB> for BootInfoFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        let frame = self.usable_frames().nth(self.next);
        self.next += 1;
        frame
    }
}

/// Physical-frame manager backing the paging core.
///
/// Frames freed by eviction or process teardown go on a free list and are
/// handed out again before new frames are taken from the bootloader map.
/// User frames (the ones backing resident pages) are counted and can be
/// capped, which is how the tests force the replacement policy to run.
pub struct PhysFrameManager {
    boot: BootInfoFrameAllocator,
    free_frames: Vec<PhysFrame>,
    user_frame_cap: Option<usize>,
    user_frames_in_use: usize,
}

impl PhysFrameManager {
    /// Create a frame manager over the bootloader allocator.
    #[must_use]
    pub const fn new(boot: BootInfoFrameAllocator) -> Self {
        Self {
            boot,
            free_frames: Vec::new(),
            user_frame_cap: None,
            user_frames_in_use: 0,
        }
    }

    /// Cap (or uncap, with `None`) the number of user frames outstanding.
    pub fn set_user_frame_cap(&mut self, cap: Option<usize>) {
        self.user_frame_cap = cap;
    }

    /// Number of frames currently backing resident user pages.
    #[must_use]
    pub const fn user_frames_in_use(&self) -> usize {
        self.user_frames_in_use
    }

    /// Hand out one frame for a user page, or `None` under memory pressure.
    pub fn alloc_user_frame(&mut self) -> Option<PhysFrame> {
        if let Some(cap) = self.user_frame_cap {
            if self.user_frames_in_use >= cap {
                return None;
            }
        }

        let frame = self
            .free_frames
            .pop()
            .or_else(|| self.boot.allocate_frame())?;
        self.user_frames_in_use += 1;
        Some(frame)
    }

    /// Reclaim a frame previously returned by [`Self::alloc_user_frame`].
    pub fn free_user_frame(&mut self, frame: PhysFrame) {
        self.user_frames_in_use = self.user_frames_in_use.saturating_sub(1);
        self.free_frames.push(frame);
    }
}

/// Frames requested through the `FrameAllocator` trait back page tables and
/// the kernel heap; they are not counted against the user frame cap.
///
/// SAFETY:
///
/// Frames come from the bootloader map or from the free list of frames the
/// kernel owns, so they are unused.
unsafe impl FrameAllocator<Size4KiB> for PhysFrameManager {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        self.free_frames.pop().or_else(|| self.boot.allocate_frame())
    }
}
