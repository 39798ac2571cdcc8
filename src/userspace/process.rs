//! Process loading and user mode execution.
//!
//! The loader registers the memory layout of an executable image with the
//! paging core but maps (almost) nothing: text, data, heap and stack pages
//! all arrive on first access through the page-fault handler. Only the top
//! stack page can be materialised eagerly, so it can receive the initial
//! argument area before the first user instruction runs.
//!
//! Ring 3 entry works as in the classic design: an `iretq` with user
//! segments, and a saved kernel RSP that the `sys_exit` handler restores to
//! "return" from [`run_current`].

use alloc::string::String;
use core::arch::naked_asm;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use spin::Mutex;
use x86_64::structures::paging::{Mapper, Size4KiB};
use x86_64::VirtAddr;

use crate::memory::{self, PhysFrameManager, PGSIZE};
use crate::paging::{fault, KillReason, ProcPaging, SegmentDesc};
use crate::{diag, fs, gdt, println, serial_println};

use super::image;

/// The process currently occupying the CPU's user mode, if any.
///
/// Lock ordering: `CURRENT` first, then the mapper, then the frame manager.
pub static CURRENT: Mutex<Option<Process>> = Mutex::new(None);

/// Saved kernel RSP before entering user mode.
///
/// When [`switch_to_user_mode`] executes `iretq`, the original kernel stack
/// is abandoned. This static stores the kernel RSP so that the `sys_exit`
/// syscall handler can restore it and effectively "return" from
/// `switch_to_user_mode` back to [`run_current`].
pub(crate) static KERNEL_RSP: AtomicU64 = AtomicU64::new(0);

static NEXT_PID: AtomicU32 = AtomicU32::new(1);

/// Heap growth flavor selected per `sbrk` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrowMode {
    /// Allocate and map frames immediately.
    Eager,
    /// Only move the program break; frames arrive on fault.
    Lazy,
}

/// A user process: its name, entry point and demand-paging state.
pub struct Process {
    /// Program name, the last component of the executable path.
    pub name: String,
    /// Virtual address of the first instruction.
    pub entry: VirtAddr,
    /// Demand-paging state, owning the descriptors and the file handles.
    pub paging: ProcPaging,
    /// Exit code, once the process has called `exit`.
    pub exit_code: Option<u64>,
}

impl Process {
    /// Load the executable at `path` and build a process whose logical
    /// address space is fully described but almost entirely non-resident.
    ///
    /// # Errors
    /// Fails when the path does not exist or the image is malformed.
    pub fn spawn(path: &str) -> Result<Self, &'static str> {
        let inode = fs::lookup(path).ok_or("executable not found")?;
        let parsed = image::parse(&inode)?;

        let pid = NEXT_PID.fetch_add(1, Ordering::Relaxed);
        let mut paging = ProcPaging::new(pid);

        for segment in &parsed.segments {
            paging.register_segment(&SegmentDesc {
                va: VirtAddr::new(segment.va),
                memsz: segment.memsz,
                filesz: segment.filesz,
                file_offset: segment.offset,
                is_exec: segment.is_exec(),
            })?;
        }
        paging.finish_layout(VirtAddr::new(parsed.stack_top));

        // The executable handle backs text/data faults for the whole life
        // of the process; it is released last during teardown.
        paging.exec_file = Some(inode);

        diag!(
            pid,
            "INIT-LAZYMAP text=[{:#x},{:#x}) data=[{:#x},{:#x}) heap_start={:#x} stack_top={:#x}",
            paging.text.start.as_u64(),
            paging.text.end.as_u64(),
            paging.data.start.as_u64(),
            paging.data.end.as_u64(),
            paging.heap_start.as_u64(),
            paging.stack_top.as_u64()
        );

        let name = path.rsplit('/').next().unwrap_or(path);
        Ok(Self {
            name: String::from(name),
            entry: VirtAddr::new(parsed.entry),
            paging,
            exit_code: None,
        })
    }

    /// Materialise the top stack page eagerly (it receives the initial
    /// argument area) and return the initial user stack pointer.
    ///
    /// # Errors
    /// Terminal paging errors kill the process.
    pub fn map_initial_stack(
        &mut self,
        mapper: &mut impl Mapper<Size4KiB>,
        frames: &mut PhysFrameManager,
    ) -> Result<VirtAddr, KillReason> {
        let top_page = self.paging.stack_top - PGSIZE;
        fault::install_zero_page(&mut self.paging, top_page, mapper, frames)?;
        Ok(self.paging.stack_top)
    }

    /// Grow or shrink the program break by `n` bytes, returning its
    /// previous value.
    ///
    /// Eager growth materialises every new page immediately through the
    /// same machinery as the fault path, so FIFO stamps and dirty tracking
    /// behave identically. Lazy growth only moves the break. Negative `n`
    /// shrinks: mappings, descriptors and swap slots in the abandoned range
    /// are torn down.
    ///
    /// # Errors
    /// Fails when the new break would wrap, run into the stack region, or
    /// fall below the heap start; eager growth also fails when the process
    /// was killed by memory exhaustion half way.
    pub fn sbrk(
        &mut self,
        n: i64,
        mode: GrowMode,
        mapper: &mut impl Mapper<Size4KiB>,
        frames: &mut PhysFrameManager,
    ) -> Result<VirtAddr, &'static str> {
        let old = self.paging.sz;

        if n >= 0 {
            let grown = old
                .as_u64()
                .checked_add(n.unsigned_abs())
                .ok_or("program break would wrap")?;
            let new = VirtAddr::new(grown);
            if new > self.paging.stack_bottom() {
                return Err("program break would run into the stack");
            }

            self.paging.sz = new;
            if mode == GrowMode::Eager {
                let mut va = old.align_up(PGSIZE);
                while va < new {
                    fault::install_zero_page(&mut self.paging, va, mapper, frames)
                        .map_err(|_| "out of memory during eager growth")?;
                    va += PGSIZE;
                }
            }
        } else {
            let shrunk = old
                .as_u64()
                .checked_sub(n.unsigned_abs())
                .ok_or("program break would wrap")?;
            if shrunk < self.paging.heap_start.as_u64() {
                return Err("program break cannot shrink below the heap start");
            }

            let new = VirtAddr::new(shrunk);
            self.paging
                .release_range(new.align_up(PGSIZE), old.align_up(PGSIZE), mapper, frames);
            self.paging.sz = new;
        }

        Ok(old)
    }

    /// Tear the process down, returning every frame, destroying the swap
    /// file and releasing the executable handle. Safe to call twice.
    pub fn exit(
        &mut self,
        code: u64,
        mapper: &mut impl Mapper<Size4KiB>,
        frames: &mut PhysFrameManager,
    ) {
        if self.exit_code.is_none() {
            self.exit_code = Some(code);
        }
        self.paging.teardown(mapper, frames);
    }
}

/// Run the process in [`CURRENT`] in Ring 3 until it calls `sys_exit`, and
/// return its exit code.
///
/// # Errors
/// Fails when no process is loaded or its initial stack cannot be mapped.
pub fn run_current() -> Result<u64, &'static str> {
    let (entry, user_sp) = {
        let mut current = CURRENT.lock();
        let process = current.as_mut().ok_or("no current process")?;
        let mut mapper = memory::mapper().lock();
        let mut frames = memory::frames().lock();
        let sp = process
            .map_initial_stack(&mut *mapper, &mut *frames)
            .map_err(|_| "failed to map the initial stack page")?;
        (process.entry, sp)
    };

    serial_println!("[kernel] switching to user mode...");
    println!("[kernel] switching to user mode...");

    let user_cs = gdt::user_code_selector();
    let user_ds = gdt::user_data_selector();

    // SAFETY:
    //
    // The process layout is registered with the paging core, so the first
    // instruction fetch and every later access fault into the demand-paging
    // handler. The GDT contains valid Ring 3 code and data segments and the
    // TSS has a valid RSP0 for kernel re-entry on interrupts.
    //
    // This call does not return until the user process invokes `sys_exit`,
    // at which point the syscall handler restores the kernel RSP saved by
    // `switch_to_user_mode` and execution resumes here.
    unsafe {
        switch_to_user_mode(
            entry.as_u64(),
            user_sp.as_u64(),
            u64::from(user_cs.0),
            u64::from(user_ds.0),
        );
    }

    serial_println!("[kernel] user process exited, returning to kernel");
    println!("[kernel] user process exited, returning to kernel");

    let exit_code = CURRENT.lock().as_ref().and_then(|p| p.exit_code);
    Ok(exit_code.unwrap_or(0))
}

/// Initial RFLAGS for Ring 3 entry: the always-one reserved bit plus IF,
/// so the timer keeps ticking while user code runs.
const USER_RFLAGS: u64 = 0x202;

/// Drop from Ring 0 into Ring 3 via `iretq`.
///
/// Arguments per the System V AMD64 convention: `rdi` the user entry
/// point, `rsi` the initial user stack pointer, `rdx` the user code
/// selector, `rcx` the user data selector (both RPL=3).
///
/// The callee-saved registers and the kernel RSP are parked first, so the
/// exit half of the syscall stub can rewind to [`KERNEL_RSP`] and `ret`
/// as if this function had returned normally; see `syscall_entry`.
///
/// # Safety
///
/// The caller must guarantee that:
/// - `entry_point` is registered as text with the paging core.
/// - `user_stack` points into the registered user stack region.
/// - `user_cs` and `user_ds` are valid Ring 3 segment selectors in the GDT.
/// - The TSS `RSP0` is set to a valid kernel stack for interrupt re-entry.
///
/// This function blocks until the user process calls `sys_exit`.
#[unsafe(naked)]
unsafe extern "C" fn switch_to_user_mode(
    _entry_point: u64,
    _user_stack: u64,
    _user_cs: u64,
    _user_ds: u64,
) {
    naked_asm!(
        // Callee-saved registers, so the exit path can hand control back
        // to run_current as if this call had returned.
        "push rbx",
        "push rbp",
        "push r12",
        "push r13",
        "push r14",
        "push r15",

        // Everything on the kernel stack below this point is dead once
        // the CPU is in Ring 3; sys_exit rewinds to exactly here.
        "mov [{kernel_rsp}], rsp",

        // The data segment registers take the user data selector directly.
        "mov ds, cx",
        "mov es, cx",
        "mov fs, cx",
        "mov gs, cx",

        // Interrupt return frame, top down: SS, RSP, RFLAGS, CS, RIP.
        // RFLAGS is a known constant here, no need to read and patch it.
        "push rcx",
        "push rsi",
        "push {rflags}",
        "push rdx",
        "push rdi",
        "iretq",

        kernel_rsp = sym KERNEL_RSP,
        rflags = const USER_RFLAGS,
    );
}
