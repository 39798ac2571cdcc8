//! Integration tests for lazy residency and the page-fault handler.
//!
//! Each test spawns a process from an executable image stored in the RAM
//! file system and drives the fault handler the way the MMU would: a
//! not-present access goes through `handle_page_fault`, the first store to
//! a resident page goes through `handle_write_fault`.

#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(paged_rust_os::test_runner)]
#![reexport_test_harness_main = "test_main"]
#![allow(missing_docs)]
#![allow(clippy::missing_panics_doc)]

extern crate alloc;

use alloc::format;
use alloc::vec::Vec;
use core::panic::PanicInfo;

use bootloader::{entry_point, BootInfo};
use paged_rust_os::paging::{self, Access, KillReason, PageState, MAX_PROC_PAGES, PGSIZE};
use paged_rust_os::userspace::image::ImageBuilder;
use paged_rust_os::userspace::process::{GrowMode, Process};
use paged_rust_os::{allocator, fs, memory};
use x86_64::structures::paging::{Mapper, Page, Size4KiB};
use x86_64::VirtAddr;

entry_point!(main);

#[expect(clippy::expect_used, reason = "Test setup must not fail silently.")]
fn main(boot_info: &'static BootInfo) -> ! {
    paged_rust_os::init();

    // SAFETY:
    // Physical memory offset and memory map are valid, as guaranteed by the
    // bootloader; init runs once.
    unsafe { memory::init(boot_info) };
    allocator::init_heap().expect("Heap initialization failed.");

    test_main();

    paged_rust_os::hlt_loop();
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    paged_rust_os::test_panic_handler(info)
}

/// Distance between the address spaces of two test processes. All tests
/// share one page table, so every process gets its own window.
const SLOT_SPACING: u64 = 0x10_0000;
const TEXT_PAGES: u64 = 2;
const DATA_FILE_BYTES: usize = 0x200;

const fn base_for(slot: u64) -> u64 {
    // Well above the kernel image, so user mappings never collide with it.
    0x800_0000 + slot * SLOT_SPACING
}

/// Deterministic image contents, so reloads can be checked byte for byte.
const fn text_byte(i: usize) -> u8 {
    (i % 251) as u8
}

/// Spawn a process with text `[base+0x1000, base+0x3000)`, data
/// `[base+0x3000, base+0x4000)` (0x200 initialised bytes, rest BSS) and the
/// stack just below `base + stack_top_offset`.
#[expect(clippy::expect_used, reason = "Test setup must not fail silently.")]
fn spawn_with_stack(slot: u64, stack_top_offset: u64) -> Process {
    let base = base_for(slot);
    let text_va = base + 0x1000;
    let data_va = text_va + TEXT_PAGES * PGSIZE;

    let text: Vec<u8> = (0..(TEXT_PAGES * PGSIZE) as usize).map(text_byte).collect();
    let data: Vec<u8> = (0..DATA_FILE_BYTES).map(|i| text_byte(i + 7)).collect();

    let bytes = ImageBuilder::new(text_va, base + stack_top_offset)
        .segment(text_va, TEXT_PAGES * PGSIZE, true, &text)
        .segment(data_va, PGSIZE, false, &data)
        .build();

    let path = format!("/exe{slot:02}");
    let inode = fs::create(&path).expect("image creation should succeed");
    assert_eq!(inode.write_at(0, &bytes), bytes.len(), "image write");

    Process::spawn(&path).expect("spawn should succeed")
}

fn spawn(slot: u64) -> Process {
    spawn_with_stack(slot, 0x10000)
}

fn fault(p: &mut Process, va: u64, access: Access) -> Result<(), KillReason> {
    let mut mapper = memory::mapper().lock();
    let mut frames = memory::frames().lock();
    paging::handle_page_fault(
        &mut p.paging,
        VirtAddr::new(va),
        access,
        &mut *mapper,
        &mut *frames,
    )
}

fn write_fault(p: &mut Process, va: u64) -> Result<(), KillReason> {
    let mut mapper = memory::mapper().lock();
    let mut frames = memory::frames().lock();
    paging::handle_write_fault(&mut p.paging, VirtAddr::new(va), &mut *mapper, &mut *frames)
}

fn is_resident(p: &Process, va: u64) -> bool {
    p.paging
        .lookup(VirtAddr::new(va))
        .is_some_and(|idx| p.paging.page(idx).state == PageState::Resident)
}

/// Read one byte the way a user load would: fault if not resident, then
/// access the mapping directly.
#[expect(clippy::expect_used, reason = "The access is expected to be legal.")]
fn load(p: &mut Process, va: u64) -> u8 {
    if !is_resident(p, va) {
        fault(p, va, Access::Read).expect("load fault should be serviced");
    }

    // SAFETY:
    // The page was just made resident in the shared address space.
    unsafe { core::ptr::read_volatile(va as *const u8) }
}

/// Write one byte the way a user store would: not-present fault first if
/// needed, then the protection fault that upgrades the read-only mapping.
#[expect(clippy::expect_used, reason = "The access is expected to be legal.")]
fn store(p: &mut Process, va: u64, value: u8) {
    if !is_resident(p, va) {
        fault(p, va, Access::Write).expect("store fault should be serviced");
    }
    write_fault(p, va).expect("write fault should be serviced");

    // SAFETY:
    // The page is resident and its mapping was just upgraded to writable.
    unsafe { core::ptr::write_volatile(va as *mut u8, value) };
}

fn is_mapped(va: u64) -> bool {
    let mapper = memory::mapper().lock();
    let page: Page<Size4KiB> = Page::containing_address(VirtAddr::new(va));
    mapper.translate_page(page).is_ok()
}

fn teardown(p: &mut Process) {
    let mut mapper = memory::mapper().lock();
    let mut frames = memory::frames().lock();
    p.paging.teardown(&mut *mapper, &mut *frames);
}

#[test_case]
fn test_pure_lazy_map_has_no_resident_pages() {
    let mut p = spawn(0);
    let base = base_for(0);

    assert_eq!(p.paging.sz.as_u64(), base + 0x4000, "break sits past the image");

    let stat = p.paging.snapshot();
    assert_eq!(stat.num_resident, 0, "nothing is resident before any access");
    assert_eq!(stat.num_swapped, 0, "nothing is swapped before any access");
    assert_eq!(
        u64::from(stat.num_pages_total),
        (base + 0x4000) / PGSIZE,
        "total pages derive from the break"
    );
    assert_eq!(stat.next_fifo_seq, 0, "no page ever became resident");
    assert!(!is_mapped(base + 0x1000), "text is not mapped eagerly");

    teardown(&mut p);
}

#[test_case]
fn test_first_text_fetch_loads_the_image() {
    let mut p = spawn(1);
    let text_va = base_for(1) + 0x1000;

    let first = load(&mut p, text_va);
    assert_eq!(first, text_byte(0), "first text byte matches the image");

    for i in [1_usize, 0x7F, 0xFFF] {
        // SAFETY:
        // The page is resident after the fault above.
        let byte = unsafe { core::ptr::read_volatile((text_va + i as u64) as *const u8) };
        assert_eq!(byte, text_byte(i), "text contents match the image");
    }

    let idx = p.paging.lookup(VirtAddr::new(text_va)).expect("descriptor exists");
    assert_eq!(p.paging.page(idx).state, PageState::Resident, "page is resident");
    assert_eq!(p.paging.page(idx).seq, Some(0), "first residency gets seq 0");
    assert!(!p.paging.page(idx).is_dirty, "freshly loaded pages are clean");
    assert!(is_mapped(text_va), "a further access needs no fault");

    let stat = p.paging.snapshot();
    assert_eq!(stat.num_resident, 1, "exactly one page is resident");

    teardown(&mut p);
}

#[test_case]
fn test_heap_zero_fill_after_lazy_growth() {
    let mut p = spawn(2);
    let heap_va = p.paging.heap_start.as_u64();

    {
        let mut mapper = memory::mapper().lock();
        let mut frames = memory::frames().lock();
        let old = p
            .sbrk(PGSIZE as i64, GrowMode::Lazy, &mut *mapper, &mut *frames)
            .expect("lazy growth should succeed");
        assert_eq!(old.as_u64(), heap_va, "sbrk returns the previous break");
    }
    assert!(!is_mapped(heap_va), "lazy growth maps nothing");

    store(&mut p, heap_va, 0x5A);

    // SAFETY:
    // The page is resident after the store above.
    let first = unsafe { core::ptr::read_volatile(heap_va as *const u8) };
    assert_eq!(first, 0x5A, "the stored byte reads back");

    for i in 1..64_u64 {
        // SAFETY:
        // The page is resident after the store above.
        let byte = unsafe { core::ptr::read_volatile((heap_va + i) as *const u8) };
        assert_eq!(byte, 0, "the rest of a fresh heap page is zero");
    }

    let idx = p.paging.lookup(VirtAddr::new(heap_va)).expect("descriptor exists");
    assert!(p.paging.page(idx).is_dirty, "the store dirtied the page");

    teardown(&mut p);
}

#[test_case]
fn test_region_boundaries_are_exact() {
    let mut p = spawn(3);
    let base = base_for(3);

    // Last byte of the data range faults in as an image page.
    let data_last = base + 0x4000 - 1;
    let _byte = load(&mut p, data_last);
    assert!(is_resident(&p, data_last), "data_end - 1 is legal");

    // Last byte below the stack top faults in as a stack page.
    let stack_last = base + 0x10000 - 1;
    store(&mut p, stack_last, 0x42);
    assert!(is_resident(&p, stack_last), "stack_top - 1 is legal");

    teardown(&mut p);
}

#[test_case]
fn test_load_past_the_break_is_invalid() {
    let mut p = spawn(4);
    let past_break = p.paging.sz.as_u64();

    let result = fault(&mut p, past_break, Access::Read);
    assert_eq!(
        result,
        Err(KillReason::InvalidAccess {
            va: past_break,
            access: Access::Read,
        }),
        "an access one past the break is terminal"
    );
    assert!(p.paging.killed, "the process is marked killed");
    assert!(!is_mapped(past_break), "nothing was mapped");

    teardown(&mut p);
}

#[test_case]
fn test_store_below_the_stack_region_is_invalid() {
    let mut p = spawn(5);
    let below_stack = p.paging.stack_bottom().as_u64() - 1;

    let result = fault(&mut p, below_stack, Access::Write);
    assert!(
        matches!(result, Err(KillReason::InvalidAccess { .. })),
        "an access below the stack region is terminal"
    );
    assert!(p.paging.killed, "the process is marked killed");

    teardown(&mut p);
}

#[test_case]
fn test_store_to_text_traps_and_marks_dirty() {
    let mut p = spawn(6);
    let text_va = base_for(6) + 0x1000;

    let _byte = load(&mut p, text_va);
    let idx = p.paging.lookup(VirtAddr::new(text_va)).expect("descriptor exists");
    assert!(
        !p.paging.page(idx).is_dirty,
        "text is installed read-only and clean, so a store must trap"
    );

    // The protection fault a store raises lands here.
    write_fault(&mut p, text_va).expect("write fault should be serviced");
    assert!(
        p.paging.page(idx).is_dirty,
        "the write fault records the first store"
    );

    teardown(&mut p);
}

#[test_case]
fn test_descriptor_table_is_a_hard_limit() {
    let mut p = spawn_with_stack(7, 0xF0000);
    let heap_va = p.paging.heap_start.as_u64();

    {
        let mut mapper = memory::mapper().lock();
        let mut frames = memory::frames().lock();
        let grow = (p.paging.stack_bottom() - p.paging.sz) as i64;
        let _old = p
            .sbrk(grow, GrowMode::Lazy, &mut *mapper, &mut *frames)
            .expect("lazy growth should succeed");
    }

    // The image already owns TEXT_PAGES + 1 descriptors.
    let available = MAX_PROC_PAGES - (TEXT_PAGES as usize + 1);
    for i in 0..available {
        let va = heap_va + (i as u64) * PGSIZE;
        fault(&mut p, va, Access::Read).expect("faults below the cap succeed");
    }

    let over = heap_va + (available as u64) * PGSIZE;
    let result = fault(&mut p, over, Access::Read);
    assert_eq!(
        result,
        Err(KillReason::DescriptorsExhausted),
        "the descriptor table is bounded"
    );
    assert!(p.paging.killed, "capacity exhaustion is terminal");

    teardown(&mut p);
}

#[test_case]
fn test_eager_growth_materialises_and_shrink_tears_down() {
    let mut p = spawn(8);
    let heap_va = p.paging.heap_start.as_u64();
    let frames_before = memory::frames().lock().user_frames_in_use();

    {
        let mut mapper = memory::mapper().lock();
        let mut frames = memory::frames().lock();
        let _old = p
            .sbrk(2 * PGSIZE as i64, GrowMode::Eager, &mut *mapper, &mut *frames)
            .expect("eager growth should succeed");
    }

    assert!(is_mapped(heap_va), "eager pages are mapped immediately");
    assert!(is_mapped(heap_va + PGSIZE), "both eager pages are mapped");

    let stat = p.paging.snapshot();
    assert_eq!(stat.num_resident, 2, "both pages are resident");
    assert_eq!(stat.next_fifo_seq, 2, "eager pages consume FIFO sequences");
    assert_eq!(
        memory::frames().lock().user_frames_in_use(),
        frames_before + 2,
        "two user frames are outstanding"
    );

    // Eager pages follow the same read-only-first policy.
    store(&mut p, heap_va, 0x77);
    assert_eq!(load(&mut p, heap_va), 0x77, "eager pages are writable after the trap");

    {
        let mut mapper = memory::mapper().lock();
        let mut frames = memory::frames().lock();
        let _old = p
            .sbrk(-2 * PGSIZE as i64, GrowMode::Eager, &mut *mapper, &mut *frames)
            .expect("shrink should succeed");
    }

    assert!(!is_mapped(heap_va), "shrink unmaps the abandoned range");
    assert!(
        p.paging.lookup(VirtAddr::new(heap_va)).is_none(),
        "shrink drops the descriptors"
    );
    assert_eq!(
        memory::frames().lock().user_frames_in_use(),
        frames_before,
        "shrink returns the frames"
    );

    teardown(&mut p);
}

#[test_case]
fn test_unaligned_fault_rounds_to_the_page() {
    let mut p = spawn(9);
    let text_va = base_for(9) + 0x1000;

    let byte = load(&mut p, text_va + 0x123);
    assert_eq!(byte, text_byte(0x123), "the unaligned byte reads correctly");

    let idx = p
        .paging
        .lookup(VirtAddr::new(text_va + 0x456))
        .expect("any address in the page finds the descriptor");
    assert_eq!(
        p.paging.page(idx).va,
        VirtAddr::new(text_va),
        "the descriptor address is page-rounded"
    );

    teardown(&mut p);
}
