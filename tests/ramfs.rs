//! Tests for the RAM file system and the executable image format.

#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(paged_rust_os::test_runner)]
#![reexport_test_harness_main = "test_main"]
#![allow(missing_docs)]
#![allow(clippy::missing_panics_doc)]

extern crate alloc;

use core::panic::PanicInfo;

use bootloader::{entry_point, BootInfo};
use paged_rust_os::userspace::image::{self, ImageBuilder};
use paged_rust_os::{allocator, fs, memory};

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

#[test_case]
fn test_write_then_read_round_trips() {
    let inode = fs::create("/rt").expect("creation should succeed");
    assert_eq!(inode.write_at(0, b"demand paging"), 13, "full write");

    let mut buf = [0_u8; 13];
    assert_eq!(inode.read_at(0, &mut buf), 13, "full read");
    assert_eq!(&buf, b"demand paging", "contents round-trip");
}

#[test_case]
fn test_reads_past_the_end_are_short() {
    let inode = fs::create("/short").expect("creation should succeed");
    let _written = inode.write_at(0, b"abc");

    let mut buf = [0_u8; 8];
    assert_eq!(inode.read_at(1, &mut buf), 2, "read crossing EOF is short");
    assert_eq!(inode.read_at(3, &mut buf), 0, "read at EOF transfers nothing");
    assert_eq!(inode.read_at(100, &mut buf), 0, "read past EOF transfers nothing");
}

#[test_case]
fn test_sparse_writes_zero_fill_the_gap() {
    let inode = fs::create("/sparse").expect("creation should succeed");
    let _written = inode.write_at(8, b"xy");

    let mut buf = [0xFF_u8; 10];
    assert_eq!(inode.read_at(0, &mut buf), 10, "file grew to cover the gap");
    assert_eq!(&buf[..8], &[0; 8], "the gap reads as zeroes");
    assert_eq!(&buf[8..], b"xy", "the written tail is intact");
}

#[test_case]
fn test_create_is_idempotent_and_paths_are_validated() {
    let first = fs::create("/same").expect("creation should succeed");
    let second = fs::create("/same").expect("re-creation should succeed");
    let _written = first.write_at(0, b"shared");

    let mut buf = [0_u8; 6];
    assert_eq!(second.read_at(0, &mut buf), 6, "handles alias the same file");

    assert!(fs::create("relative").is_err(), "paths must be absolute");
    assert!(fs::create("/").is_err(), "the bare root is not a file");
}

#[test_case]
fn test_unlink_removes_the_name_but_not_open_handles() {
    let inode = fs::create("/gone").expect("creation should succeed");
    let _written = inode.write_at(0, b"still here");

    assert!(fs::unlink("/gone").is_ok(), "unlink succeeds");
    assert!(fs::lookup("/gone").is_none(), "the name is gone");
    assert!(
        fs::unlink("/gone").is_err(),
        "a second unlink reports not-found"
    );

    let mut buf = [0_u8; 10];
    assert_eq!(inode.read_at(0, &mut buf), 10, "open handles keep working");
}

#[test_case]
fn test_image_builder_round_trips_through_parse() {
    let bytes = ImageBuilder::new(0x40_1000, 0x41_0000)
        .segment(0x40_1000, 0x2000, true, b"code bytes")
        .segment(0x40_3000, 0x1000, false, b"data")
        .build();

    let inode = fs::create("/img").expect("creation should succeed");
    assert_eq!(inode.write_at(0, &bytes), bytes.len(), "image stored");

    let parsed = image::parse(&inode).expect("image should parse");
    assert_eq!(parsed.entry, 0x40_1000, "entry point survives");
    assert_eq!(parsed.stack_top, 0x41_0000, "stack top survives");
    assert_eq!(parsed.segments.len(), 2, "both segments survive");

    let text = &parsed.segments[0];
    assert!(text.is_exec(), "text segment keeps its flag");
    assert_eq!(text.filesz, 10, "text file size matches the contents");

    let mut contents = [0_u8; 10];
    let read = inode.read_at(text.offset as usize, &mut contents);
    assert_eq!(read, 10, "payload is reachable at the recorded offset");
    assert_eq!(&contents, b"code bytes", "payload round-trips");
}

#[test_case]
fn test_parse_rejects_garbage() {
    let inode = fs::create("/garbage").expect("creation should succeed");
    let _written = inode.write_at(0, b"not an executable image at all..");

    assert!(image::parse(&inode).is_err(), "bad magic must be rejected");

    let empty = fs::create("/empty").expect("creation should succeed");
    assert!(image::parse(&empty).is_err(), "short files must be rejected");
}
