//! Syscall handler module.
//!
//! Provides the interrupt-based syscall interface for user-mode programs.
//! User programs invoke syscalls via `int 0x80` with the following register
//! convention:
//!
//! - `rax`: syscall number
//! - `rdi`: first argument
//! - `rsi`: second argument
//! - `rdx`: third argument
//!
//! The return value is placed in `rax`. Failures return `-1` (as `u64`),
//! matching what the C library shims expect.

use core::arch::naked_asm;
use core::mem::size_of;

use x86_64::{structures::idt::InterruptStackFrame, VirtAddr};

use crate::memory::{self, PGSIZE};
use crate::paging::{self, Access, PageState, ProcMemStat};
use crate::{print, println, serial_println};

use super::process::{self, GrowMode, Process};
use super::SYSCALL_INTERRUPT_INDEX;

/// Syscall number for `sys_exit`: terminates the current user process.
pub const SYS_EXIT: u64 = 0;

/// Syscall number for `sys_write`: writes a buffer to the VGA text display.
pub const SYS_WRITE: u64 = 1;

/// Syscall number for `sys_sbrk`: grows or shrinks the program break.
pub const SYS_SBRK: u64 = 2;

/// Syscall number for `sys_memstat`: copies the paging snapshot to user
/// space.
pub const SYS_MEMSTAT: u64 = 3;

/// `sys_sbrk` mode argument: allocate and map frames immediately.
pub const SBRK_EAGER: u64 = 0;

/// `sys_sbrk` mode argument: grow the break only; frames arrive on fault.
pub const SBRK_LAZY: u64 = 1;

/// Error value returned to the user program when a syscall fails (`-1`).
const SYSCALL_ERROR: u64 = u64::MAX;

/// Sentinel returned by [`syscall_dispatch`] to signal that the current
/// process has called `sys_exit` and execution should not return to user
/// mode. Distinct from every legitimate return value, including
/// [`SYSCALL_ERROR`].
const PROCESS_EXIT_SENTINEL: u64 = u64::MAX - 1;

/// Naked entry point for the `int 0x80` syscall interrupt.
///
/// Only the caller-saved half of the register file is spilled here: the
/// dispatcher is an `extern "C"` function, so the callee-saved registers
/// survive the call on their own. The user's `rax`/`rdi`/`rsi`/`rdx` are
/// shuffled straight into the System V argument registers, the dispatch
/// result replaces the user's `rax`, and `iretq` resumes the trapped
/// program.
///
/// When the dispatcher reports `sys_exit` through the sentinel there is no
/// user context worth resuming. The stub abandons the interrupt frame,
/// rewinds to the kernel stack position recorded by
/// `switch_to_user_mode`, restores the kernel data segments and returns
/// into `process::run_current`.
#[unsafe(naked)]
pub(crate) extern "x86-interrupt" fn syscall_entry(_frame: InterruptStackFrame) {
    // On entry the CPU has pushed SS, RSP, RFLAGS, CS, RIP onto the RSP0
    // stack, leaving rsp 8 modulo 16.
    naked_asm!(
        // Caller-saved registers. rax is the return slot and is
        // deliberately not preserved.
        "push rcx",
        "push rdx",
        "push rsi",
        "push rdi",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        // Eight slots keep rsp at 8 modulo 16, as the CPU frame left it;
        // the call below wants 16-byte alignment.
        "sub rsp, 8",

        // Dispatcher arguments: rdi = number, rsi/rdx/rcx = arg1..arg3.
        // The shuffle order matters; rdx feeds rcx before being replaced.
        "mov rcx, rdx",
        "mov rdx, rsi",
        "mov rsi, rdi",
        "mov rdi, rax",
        "call {dispatch}",

        "add rsp, 8",

        // sys_exit never returns to user mode.
        "mov r11, {sentinel}",
        "cmp rax, r11",
        "je 1f",

        // rax carries the syscall result back to the user program.
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rdi",
        "pop rsi",
        "pop rdx",
        "pop rcx",
        "iretq",

        // Exit path: the RSP0 stack is abandoned wholesale. Unwind to the
        // kernel RSP parked by switch_to_user_mode, restore its
        // callee-saved registers and kernel data segments, and let the
        // `ret` land in run_current.
        "1:",
        "mov rsp, [{kernel_rsp}]",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbp",
        "pop rbx",

        "xor eax, eax",
        "mov ds, ax",
        "mov es, ax",
        "mov fs, ax",
        "mov gs, ax",
        "ret",

        dispatch = sym syscall_dispatch,
        kernel_rsp = sym super::process::KERNEL_RSP,
        sentinel = const PROCESS_EXIT_SENTINEL,
    );
}

/// Dispatches a syscall to the appropriate handler based on the syscall
/// number.
///
/// This function is called from the naked [`syscall_entry`] with the System
/// V AMD64 calling convention.
extern "C" fn syscall_dispatch(num: u64, arg1: u64, arg2: u64, _arg3: u64) -> u64 {
    match num {
        SYS_EXIT => sys_exit(arg1),
        SYS_WRITE => sys_write(arg1, arg2),
        SYS_SBRK => sys_sbrk(arg1, arg2),
        SYS_MEMSTAT => sys_memstat(arg1),
        _ => {
            serial_println!("[kernel] unknown syscall number: {}", num);
            SYSCALL_ERROR
        }
    }
}

/// Record the exit code and signal the entry stub to unwind to the kernel.
fn sys_exit(code: u64) -> u64 {
    serial_println!("[kernel] user process exited with code: {}", code);
    println!("[kernel] user process exited with code: {}", code);

    if let Some(process) = process::CURRENT.lock().as_mut() {
        process.exit_code = Some(code);
    }
    PROCESS_EXIT_SENTINEL
}

/// Writes a buffer from user memory to the VGA text display.
///
/// The buffer must lie in legal regions of the current process; pages that
/// are not resident (lazily grown heap, swapped-out data) are faulted in
/// first, exactly as a hardware access would.
fn sys_write(buf_ptr: u64, len: u64) -> u64 {
    if len == 0 {
        return 0;
    }
    let Some(buf_end) = buf_ptr.checked_add(len) else {
        return SYSCALL_ERROR;
    };

    let mut current = process::CURRENT.lock();
    let Some(proc_ref) = current.as_mut() else {
        println!("[kernel] sys_write: no current process");
        return SYSCALL_ERROR;
    };

    if !ensure_user_range(proc_ref, buf_ptr, buf_end, Access::Read) {
        println!("[kernel] sys_write: invalid buffer range");
        return SYSCALL_ERROR;
    }

    // SAFETY:
    //
    // Every page of the range was just classified as legal for this process
    // and made resident, so the kernel can read it through the shared
    // address space.
    let buf = unsafe { core::slice::from_raw_parts(buf_ptr as *const u8, len as usize) };

    match core::str::from_utf8(buf) {
        Ok(s) => {
            serial_println!("[kernel] sys_write: \"{}\"", s);
            print!("{}", s);
            len
        }
        Err(_) => {
            // Fall back to printing byte-by-byte for non-UTF-8 data.
            for &byte in buf {
                if byte.is_ascii_graphic() || byte == b' ' || byte == b'\n' {
                    print!("{}", byte as char);
                } else {
                    print!(".");
                }
            }
            len
        }
    }
}

/// Grow or shrink the program break; returns the previous break.
fn sys_sbrk(n: u64, mode: u64) -> u64 {
    let grow_mode = match mode {
        SBRK_EAGER => GrowMode::Eager,
        SBRK_LAZY => GrowMode::Lazy,
        _ => return SYSCALL_ERROR,
    };

    let mut current = process::CURRENT.lock();
    let Some(proc_ref) = current.as_mut() else {
        return SYSCALL_ERROR;
    };

    let mut mapper = memory::mapper().lock();
    let mut frames = memory::frames().lock();
    match proc_ref.sbrk(n as i64, grow_mode, &mut *mapper, &mut *frames) {
        Ok(old_break) => old_break.as_u64(),
        Err(reason) => {
            serial_println!("[kernel] sys_sbrk failed: {}", reason);
            SYSCALL_ERROR
        }
    }
}

/// Copy the paging snapshot of the current process into the user buffer at
/// `addr`. Returns `0` on success and `-1` when the copy-out fails.
fn sys_memstat(addr: u64) -> u64 {
    let size = size_of::<ProcMemStat>() as u64;
    let Some(end) = addr.checked_add(size) else {
        return SYSCALL_ERROR;
    };

    let mut current = process::CURRENT.lock();
    let Some(proc_ref) = current.as_mut() else {
        return SYSCALL_ERROR;
    };

    let stat = proc_ref.paging.snapshot();

    if !ensure_user_range(proc_ref, addr, end, Access::Write) {
        return SYSCALL_ERROR;
    }

    // SAFETY:
    //
    // The destination range was classified as legal, faulted in and made
    // writable; the source is a local snapshot. The ranges cannot overlap
    // because the snapshot lives on the kernel stack.
    unsafe {
        core::ptr::copy_nonoverlapping(
            core::ptr::addr_of!(stat).cast::<u8>(),
            addr as *mut u8,
            size as usize,
        );
    }
    0
}

/// Make `[start, end)` of the current process resident (and writable when
/// `access` is a write), faulting pages in as needed. Returns `false` when
/// any page of the range is illegal or servicing fails.
fn ensure_user_range(proc_ref: &mut Process, start: u64, end: u64, access: Access) -> bool {
    let mut mapper = memory::mapper().lock();
    let mut frames = memory::frames().lock();

    let mut va = VirtAddr::new(start).align_down(PGSIZE);
    let end = VirtAddr::new(end);
    while va < end {
        let paging_state = &mut proc_ref.paging;
        let idx = paging_state.lookup(va);
        if paging_state.classify(idx, va).is_none() {
            return false;
        }

        let resident =
            idx.is_some_and(|i| paging_state.page(i).state == PageState::Resident);
        if !resident
            && paging::handle_page_fault(paging_state, va, access, &mut *mapper, &mut *frames)
                .is_err()
        {
            return false;
        }

        if access == Access::Write
            && paging::handle_write_fault(paging_state, va, &mut *mapper, &mut *frames).is_err()
        {
            return false;
        }

        va += PGSIZE;
    }
    true
}

/// Registers the syscall interrupt handler in the IDT.
///
/// The entry at index `0x80` is configured with DPL Ring 3 so that
/// user-mode code can trigger it via `int 0x80`.
pub fn register_syscall_handler(idt: &mut x86_64::structures::idt::InterruptDescriptorTable) {
    let entry = &mut idt[SYSCALL_INTERRUPT_INDEX as usize];

    // SAFETY:
    //
    // We set the handler address to our naked function which correctly
    // manages the full register save/restore and `iretq` return sequence.
    unsafe {
        let handler_addr = VirtAddr::new(syscall_entry as *const () as u64);
        entry
            .set_handler_addr(handler_addr)
            .set_privilege_level(x86_64::PrivilegeLevel::Ring3);
    }
}
