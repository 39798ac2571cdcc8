//! Main for the little demand-paging OS.
//!
//! Boots, initializes the kernel subsystems, assembles a tiny user program
//! into the RAM file system and runs it in Ring 3. The program starts with
//! zero resident pages: its first instruction fetch demand-loads the text
//! page, `sys_write` pulls the data page in, and the reported statistics
//! show what ended up resident.

#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(paged_rust_os::test_runner)]
#![reexport_test_harness_main = "test_main"]

extern crate alloc;

use alloc::vec::Vec;
use core::panic::PanicInfo;

use bootloader::{entry_point, BootInfo};
use paged_rust_os::userspace::{image::ImageBuilder, process, syscall, USER_IMAGE_BASE, USER_STACK_TOP};
use paged_rust_os::{allocator, fs, hlt_loop, memory, println, serial_println, vga_buffer};

entry_point!(kernel_main);

fn kernel_main(boot_info: &'static BootInfo) -> ! {
    vga_buffer::clear();
    println!("paged_rust_os: booting...");
    paged_rust_os::init();

    // SAFETY:
    // The boot information comes from the bootloader: physical memory is
    // fully mapped and the memory map is valid. init runs exactly once.
    unsafe { memory::init(boot_info) };
    allocator::init_heap().expect("Heap initialization failed.");

    #[cfg(test)]
    test_main();

    run_demo();

    hlt_loop();
}

/// Assemble the demo program, run it demand-paged in Ring 3, and report the
/// paging statistics it accumulated.
fn run_demo() {
    const MSG: &[u8] = b"hello from user space\n";

    let text_va = USER_IMAGE_BASE;
    let data_va = USER_IMAGE_BASE + 0x1000;
    let stack_top = USER_STACK_TOP;

    let code = demo_user_code(data_va, MSG.len() as u64);
    let image_bytes = ImageBuilder::new(text_va, stack_top)
        .segment(text_va, 0x1000, true, &code)
        .segment(data_va, 0x1000, false, MSG)
        .build();

    let inode = fs::create("/demo").expect("Failed to create the demo executable.");
    let written = inode.write_at(0, &image_bytes);
    assert_eq!(written, image_bytes.len(), "Short write of the demo image.");

    let demo = process::Process::spawn("/demo").expect("Failed to spawn the demo process.");
    *process::CURRENT.lock() = Some(demo);

    match process::run_current() {
        Ok(code) => println!("[kernel] demo exited with code {}", code),
        Err(reason) => println!("[kernel] demo failed: {}", reason),
    }

    let mut current = process::CURRENT.lock();
    if let Some(proc_ref) = current.as_mut() {
        let stat = proc_ref.paging.snapshot();
        serial_println!(
            "[kernel] demo stats: total={} resident={} swapped={} next_seq={}",
            stat.num_pages_total,
            stat.num_resident,
            stat.num_swapped,
            stat.next_fifo_seq
        );

        let mut mapper = memory::mapper().lock();
        let mut frames = memory::frames().lock();
        proc_ref.paging.teardown(&mut *mapper, &mut *frames);
    }
    *current = None;
}

/// Hand-assembled x86_64 user program:
///
/// ```text
/// mov  rax, SYS_WRITE
/// mov  rdi, msg_va
/// mov  rsi, msg_len
/// int  0x80
/// mov  rax, SYS_EXIT
/// mov  rdi, 0
/// int  0x80
/// jmp  $            ; never reached
/// ```
fn demo_user_code(msg_va: u64, msg_len: u64) -> Vec<u8> {
    let mut code = Vec::new();

    // mov rax, imm32 (SYS_WRITE)
    code.extend_from_slice(&[0x48, 0xC7, 0xC0]);
    code.extend_from_slice(&(syscall::SYS_WRITE as u32).to_le_bytes());
    // movabs rdi, imm64 (message address)
    code.extend_from_slice(&[0x48, 0xBF]);
    code.extend_from_slice(&msg_va.to_le_bytes());
    // movabs rsi, imm64 (message length)
    code.extend_from_slice(&[0x48, 0xBE]);
    code.extend_from_slice(&msg_len.to_le_bytes());
    // int 0x80
    code.extend_from_slice(&[0xCD, 0x80]);

    // mov rax, imm32 (SYS_EXIT)
    code.extend_from_slice(&[0x48, 0xC7, 0xC0]);
    code.extend_from_slice(&(syscall::SYS_EXIT as u32).to_le_bytes());
    // mov rdi, imm32 (exit code 0)
    code.extend_from_slice(&[0x48, 0xC7, 0xC7, 0x00, 0x00, 0x00, 0x00]);
    // int 0x80
    code.extend_from_slice(&[0xCD, 0x80]);

    // jmp $ in case the exit ever returns
    code.extend_from_slice(&[0xEB, 0xFE]);

    code
}

/// This function is called on panic.
#[cfg(not(test))]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    println!("{}", info);
    serial_println!("{}", info);
    hlt_loop();
}

#[cfg(test)]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    paged_rust_os::test_panic_handler(info)
}

/// Custom test try.
/// # Panics
/// May panic if the test fail
#[expect(clippy::assertions_on_constants)]
#[test_case]
fn trivial_assertion() {
    assert!(true, "Make this test pass.");
}
