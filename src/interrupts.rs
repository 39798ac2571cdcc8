//! Interrupt handling module.
//! This module provides the implementation of the Interrupt Descriptor Table
//! (IDT) and the handlers for the interrupts. The page-fault vector is the
//! front door of the demand-paging core: not-present faults materialise
//! pages, protection-violation writes feed the dirty tracking.

use lazy_static::lazy_static;
use pic8259::ChainedPics;
use x86_64::{
    registers::control::Cr2,
    structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode},
};

use crate::paging::{self, Access};
use crate::userspace::{process, syscall};
use crate::{gdt, memory, println, serial_println};

/// The offset for the Programmable Interrupt Controller (PIC) 1 (starting
/// after interrupt table max offset).
pub const PIC_1_OFFSET: u8 = 32;
/// The offset for the Programmable Interrupt Controller (PIC) 2.
pub const PIC_2_OFFSET: u8 = PIC_1_OFFSET + 8;

/// The Programmable Interrupt Controller (PIC) used for handling hardware
/// interrupts.
pub static PICS: spin::Mutex<ChainedPics> =
    spin::Mutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

#[derive(Debug, Clone, Copy)]
#[repr(u8)]
/// Enum for the interrupt indices.
pub enum InterruptIndex {
    /// Timer interrupt index.
    Timer = PIC_1_OFFSET,
}

impl InterruptIndex {
    /// Returns the index as a `u8`.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Returns the index as a `usize`.
    #[must_use]
    pub fn as_usize(self) -> usize {
        usize::from(self.as_u8())
    }
}

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        idt.page_fault.set_handler_fn(page_fault_handler);

        // SAFETY:
        // The double fault handler is safe to set as the index is valid.
        unsafe {
            idt.double_fault
                .set_handler_fn(double_fault_handler)
                .set_stack_index(gdt::DOUBLE_FAULT_IST_INDEX);
        }
        idt[InterruptIndex::Timer.as_usize()]
            .set_handler_fn(timer_interrupt_handler);
        syscall::register_syscall_handler(&mut idt);
        idt
    };
}

/// Initialize the Interrupt Descriptor Table (IDT).
pub fn init_idt() {
    IDT.load();
}

extern "x86-interrupt" fn breakpoint_handler(stack_frame: InterruptStackFrame) {
    println!("EXCEPTION: BREAKPOINT\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn double_fault_handler(
    stack_frame: InterruptStackFrame,
    _error_code: u64,
) -> ! {
    println!("EXCEPTION: DOUBLE FAULT\n{:#?}", stack_frame);
    panic!("EXCEPTION: DOUBLE FAULT\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn timer_interrupt_handler(_stack_frame: InterruptStackFrame) {
    // Notify the PICs that the interrupt has been handled.
    //
    // SAFETY:
    // We are notifying the PIC that the interrupt has been handled.
    // Can fail if the PIC is not initialized.
    unsafe {
        PICS.lock()
            .notify_end_of_interrupt(InterruptIndex::Timer.as_u8());
    }
}

/// Page-fault front door.
///
/// Faults on behalf of the current user process are serviced by the
/// demand-paging core; anything else (a fault with no process loaded, or a
/// protection violation the core cannot explain) is a kernel bug and
/// panics with the full stack frame.
extern "x86-interrupt" fn page_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    let va = Cr2::read();

    if !service_user_fault(va, error_code) {
        panic!(
            "EXCEPTION: PAGE FAULT\nAccessed Address: {:?}\nError Code: {:?}\n{:#?}",
            va, error_code, stack_frame
        );
    }
}

/// Route the fault into the paging core. Returns `false` when the fault is
/// not serviceable by it.
///
/// Lock order is `CURRENT`, then the mapper, then the frame manager -- the
/// same order the syscall layer uses.
fn service_user_fault(va: x86_64::VirtAddr, error_code: PageFaultErrorCode) -> bool {
    let mut current = process::CURRENT.lock();
    let Some(proc_ref) = current.as_mut() else {
        return false;
    };

    let mut mapper = memory::mapper().lock();
    let mut frames = memory::frames().lock();

    let is_write = error_code.contains(PageFaultErrorCode::CAUSED_BY_WRITE);
    let result = if error_code.contains(PageFaultErrorCode::PROTECTION_VIOLATION) {
        if !is_write {
            // A read permission violation on a mapped user page is not
            // something the paging core produces.
            return false;
        }
        paging::handle_write_fault(&mut proc_ref.paging, va, &mut *mapper, &mut *frames)
    } else {
        let access = if is_write { Access::Write } else { Access::Read };
        paging::handle_page_fault(&mut proc_ref.paging, va, access, &mut *mapper, &mut *frames)
    };

    match result {
        Ok(()) => true,
        Err(reason) => {
            // The faulting instruction cannot be restarted; with a single
            // user process there is nothing left to schedule.
            serial_println!("[kernel] pid {} terminated: {}", proc_ref.paging.pid, reason);
            println!("[kernel] pid {} terminated: {}", proc_ref.paging.pid, reason);
            proc_ref.paging.teardown(&mut *mapper, &mut *frames);

            drop(frames);
            drop(mapper);
            drop(current);
            crate::hlt_loop();
        }
    }
}
