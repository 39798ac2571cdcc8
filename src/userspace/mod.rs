//! User space support module.
//!
//! This module provides the infrastructure to load and execute user-mode
//! binaries in Ring 3:
//! - A segment-table executable format and its loader, which registers the
//!   memory layout with the paging core without mapping anything: pages
//!   arrive on first access through the page-fault handler.
//! - A syscall interface via `int 0x80` (`exit`, `write`, `sbrk`,
//!   `memstat`).
//! - A mechanism to switch from kernel mode (Ring 0) to user mode (Ring 3).

pub mod image;
pub mod process;
pub mod syscall;

/// Base virtual address where user program images are usually laid out.
pub const USER_IMAGE_BASE: u64 = 0x40_0000;

/// Default top of the user stack region (stack grows downward).
pub const USER_STACK_TOP: u64 = 0x80_0000;

/// Interrupt vector number used for syscalls (`int 0x80`).
pub const SYSCALL_INTERRUPT_INDEX: u8 = 0x80;
