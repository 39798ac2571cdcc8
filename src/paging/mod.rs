//! Demand paging and FIFO page replacement.
//!
//! The core of this kernel: user pages materialise on first access through
//! [`fault::handle_page_fault`], text and initialised data load lazily from
//! the executable image, and memory pressure is resolved by evicting the
//! resident page whose residency began earliest ([`replace`]). Dirty or
//! non-reloadable victims go to a private per-process swap file ([`swap`]);
//! clean text pages are simply discarded and re-read from the image later.
//!
//! All per-process bookkeeping lives in [`state::ProcPaging`]. The page
//! table and the physical-frame manager are collaborators owned elsewhere
//! and are passed in per call.

use core::fmt;

pub mod fault;
pub mod replace;
pub mod state;
pub mod swap;

pub use crate::memory::PGSIZE;
pub use fault::{handle_page_fault, handle_write_fault};
pub use state::{PageInfo, PageStat, ProcMemStat, ProcPaging, SegmentDesc};
pub use swap::SwapMap;

use crate::diag;

/// Hard cap on the number of page descriptors a process may ever hold.
pub const MAX_PROC_PAGES: usize = 128;

/// Number of page-sized slots in a per-process swap file (4 MiB).
pub const MAX_SWAP_SLOTS: usize = 1024;

/// Maximum page records exported per `memstat` call.
pub const MAX_PAGES_INFO: usize = 128;

/// Number of pages in the user stack region below `stack_top`.
pub const USER_STACK_PAGES: u64 = 4;

/// Residency state of one logical page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PageState {
    /// No frame and no swap slot back this page.
    Unmapped = 0,
    /// A physical frame backs this page and a page-table entry maps it.
    Resident = 1,
    /// The page contents live in a slot of the process's swap file.
    Swapped = 2,
}

/// How the faulting instruction touched memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// A load (or instruction fetch).
    Read,
    /// A store.
    Write,
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Read => f.write_str("read"),
            Self::Write => f.write_str("write"),
        }
    }
}

/// Why a page fault is legal, and therefore how to materialise the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultCause {
    /// The page was swapped out and must be read back.
    Swap,
    /// The page belongs to the text/data image and loads from the executable.
    Exec,
    /// The page is heap below the program break; zero-filled.
    Heap,
    /// The page is in the user stack region; zero-filled.
    Stack,
}

impl fmt::Display for FaultCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Swap => f.write_str("swap"),
            Self::Exec => f.write_str("exec"),
            Self::Heap => f.write_str("heap"),
            Self::Stack => f.write_str("stack"),
        }
    }
}

/// Terminal conditions of the paging core. Each one kills the process: the
/// faulting instruction cannot be restarted meaningfully, so none of these
/// is ever surfaced to user code as an error return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillReason {
    /// The address falls in no legal region of the address space.
    InvalidAccess {
        /// Page-rounded faulting address.
        va: u64,
        /// Load or store.
        access: Access,
    },
    /// The descriptor table is full.
    DescriptorsExhausted,
    /// Frame allocation failed even after evicting a victim.
    MemFull,
    /// No swap slot (or no swap file) was available for a dirty victim.
    SwapExhausted,
    /// A transfer against the swap file failed or came up short.
    SwapIo,
    /// A transfer against the executable image failed or came up short.
    ExecIo,
    /// The process was already marked killed when servicing began.
    AlreadyKilled,
}

impl fmt::Display for KillReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::InvalidAccess { va, access } => {
                write!(f, "invalid-access va={va:#x} access={access}")
            }
            Self::DescriptorsExhausted => f.write_str("descriptors-exhausted"),
            Self::MemFull => f.write_str("mem-full"),
            Self::SwapExhausted => f.write_str("swap-exhausted"),
            Self::SwapIo => f.write_str("swap-io"),
            Self::ExecIo => f.write_str("exec-io"),
            Self::AlreadyKilled => f.write_str("killed"),
        }
    }
}

/// Mark the process killed and emit the `KILL` diagnostic.
///
/// Returns the reason so call sites can `return Err(kill(p, ...))`.
pub(crate) fn kill(p: &mut ProcPaging, reason: KillReason) -> KillReason {
    p.killed = true;
    diag!(p.pid, "KILL {}", reason);
    reason
}
