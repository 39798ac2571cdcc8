//! GDT and TSS initialization.
//!
//! Besides the usual kernel code segment this table carries Ring 3 code
//! and data segments (demand-paged programs run in user mode) and two
//! statically allocated trap stacks: the RSP0 stack every user-mode page
//! fault and syscall lands on, and a separate IST stack so a double fault
//! survives a corrupted kernel stack.

use lazy_static::lazy_static;
use x86_64::{
    instructions::tables::load_tss,
    registers::segmentation::{Segment, CS},
    structures::{
        gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector},
        tss::TaskStateSegment,
    },
    PrivilegeLevel, VirtAddr,
};

use crate::memory::PGSIZE;

/// The index of the IST entry for the double fault handler.
pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

/// Pages in each trap stack. Page-fault servicing runs whole eviction and
/// swap-file I/O call chains on the RSP0 stack, so it gets headroom beyond
/// a single page.
const TRAP_STACK_PAGES: usize = 5;
const TRAP_STACK_SIZE: usize = TRAP_STACK_PAGES * PGSIZE as usize;

/// The loaded descriptor table and the selectors the rest of the kernel
/// needs from it.
struct KernelTables {
    gdt: GlobalDescriptorTable,
    kernel_code: SegmentSelector,
    tss: SegmentSelector,
    user_code: SegmentSelector,
    user_data: SegmentSelector,
}

lazy_static! {
    static ref TSS: TaskStateSegment = {
        let mut tss = TaskStateSegment::new();

        tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] = {
            static mut DOUBLE_FAULT_STACK: [u8; TRAP_STACK_SIZE] = [0; TRAP_STACK_SIZE];

            // SAFETY:
            // Only the address range of the stack is taken here.
            VirtAddr::from_ptr(&raw const DOUBLE_FAULT_STACK) + TRAP_STACK_SIZE as u64
        };

        // RSP0: where the CPU lands when Ring 3 traps into the kernel.
        tss.privilege_stack_table[0] = {
            static mut RING0_STACK: [u8; TRAP_STACK_SIZE] = [0; TRAP_STACK_SIZE];

            // SAFETY:
            // Only the address range of the stack is taken here.
            VirtAddr::from_ptr(&raw const RING0_STACK) + TRAP_STACK_SIZE as u64
        };

        tss
    };

    static ref TABLES: KernelTables = {
        let mut gdt = GlobalDescriptorTable::new();
        let kernel_code = gdt.add_entry(Descriptor::kernel_code_segment());
        let tss = gdt.add_entry(Descriptor::tss_segment(&TSS));

        // `add_entry` hands back RPL=0 selectors; the user segments must be
        // requested with RPL=3 or the privilege checks reject them.
        let mut user_data = gdt.add_entry(Descriptor::user_data_segment());
        let mut user_code = gdt.add_entry(Descriptor::user_code_segment());
        user_data.set_rpl(PrivilegeLevel::Ring3);
        user_code.set_rpl(PrivilegeLevel::Ring3);

        KernelTables {
            gdt,
            kernel_code,
            tss,
            user_code,
            user_data,
        }
    };
}

/// Load the GDT, the kernel code segment and the TSS.
pub fn init() {
    TABLES.gdt.load();

    // SAFETY:
    // The selectors point into the table that was just loaded.
    unsafe {
        CS::set_reg(TABLES.kernel_code);
        load_tss(TABLES.tss);
    }
}

/// Returns the user code segment selector with Ring 3 privilege level.
#[must_use]
pub fn user_code_selector() -> SegmentSelector {
    TABLES.user_code
}

/// Returns the user data segment selector with Ring 3 privilege level.
#[must_use]
pub fn user_data_selector() -> SegmentSelector {
    TABLES.user_data
}
