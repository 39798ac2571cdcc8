//! Swap-slot bitmap and per-process swap file I/O.
//!
//! Each process owns at most one swap file, created lazily on its first
//! dirty eviction at a path deterministic in the pid (`/pgswp00042`). The
//! file has no header: byte offset `slot * PGSIZE` is the body of `slot`,
//! and the in-memory bitmap is authoritative for which slots are live.

use alloc::format;
use alloc::string::String;

use x86_64::structures::paging::PhysFrame;

use crate::{diag, fs, memory};

use super::{state::ProcPaging, KillReason, MAX_SWAP_SLOTS, PGSIZE};

const BITS_PER_WORD: usize = 64;

/// Bitmap over the page-sized slots of a swap file.
///
/// Allocation scans for the lowest clear bit; no ordering or fairness is
/// guaranteed beyond that. The capacity can be lowered at construction so
/// tests can model a nearly-full swap device.
#[derive(Debug, Clone)]
pub struct SwapMap {
    words: [u64; MAX_SWAP_SLOTS / BITS_PER_WORD],
    capacity: usize,
}

impl SwapMap {
    /// A bitmap over the full [`MAX_SWAP_SLOTS`] slots.
    #[must_use]
    pub const fn new() -> Self {
        Self::with_capacity(MAX_SWAP_SLOTS)
    }

    /// A bitmap limited to `capacity` slots (at most [`MAX_SWAP_SLOTS`]).
    #[must_use]
    pub const fn with_capacity(capacity: usize) -> Self {
        let capacity = if capacity > MAX_SWAP_SLOTS {
            MAX_SWAP_SLOTS
        } else {
            capacity
        };
        Self {
            words: [0; MAX_SWAP_SLOTS / BITS_PER_WORD],
            capacity,
        }
    }

    /// Allocate the lowest free slot, or `None` when every slot is taken.
    pub fn alloc(&mut self) -> Option<usize> {
        for slot in 0..self.capacity {
            let word = slot / BITS_PER_WORD;
            let bit = slot % BITS_PER_WORD;
            if self.words[word] & (1 << bit) == 0 {
                self.words[word] |= 1 << bit;
                return Some(slot);
            }
        }
        None
    }

    /// Free a slot. Out-of-range slots are a silent no-op.
    pub fn free(&mut self, slot: usize) {
        if slot >= MAX_SWAP_SLOTS {
            return;
        }
        self.words[slot / BITS_PER_WORD] &= !(1 << (slot % BITS_PER_WORD));
    }

    /// Whether `slot` is currently allocated.
    #[must_use]
    pub fn is_allocated(&self, slot: usize) -> bool {
        if slot >= MAX_SWAP_SLOTS {
            return false;
        }
        self.words[slot / BITS_PER_WORD] & (1 << (slot % BITS_PER_WORD)) != 0
    }

    /// Number of allocated slots.
    #[must_use]
    pub fn allocated(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Free every slot.
    pub fn clear(&mut self) {
        self.words = [0; MAX_SWAP_SLOTS / BITS_PER_WORD];
    }
}

impl Default for SwapMap {
    fn default() -> Self {
        Self::new()
    }
}

/// Deterministic swap file path for process `pid`.
fn swap_path(pid: u32) -> String {
    format!("/pgswp{pid:05}")
}

/// Lazily create the process's swap file. At most one exists per process;
/// calling this again once it exists is a no-op.
///
/// # Errors
/// Fails with [`KillReason::SwapExhausted`] when the file cannot be
/// created: swap is then unavailable and a dirty eviction is fatal.
pub fn open_swap(p: &mut ProcPaging) -> Result<(), KillReason> {
    if p.swap_file.is_some() {
        return Ok(());
    }

    fs::begin_op();
    let created = fs::create(&swap_path(p.pid));
    fs::end_op();

    match created {
        Ok(inode) => {
            p.swap_file = Some(inode);
            Ok(())
        }
        Err(_) => Err(KillReason::SwapExhausted),
    }
}

/// Write one page from `frame` into `slot` of the swap file.
///
/// The write completes (with the inode lock held across the transfer)
/// before the caller invalidates the victim's mapping.
///
/// # Errors
/// Fails with [`KillReason::SwapIo`] on a short transfer; the slot remains
/// allocated and the caller must propagate.
pub fn write_page(p: &ProcPaging, slot: usize, frame: PhysFrame) -> Result<(), KillReason> {
    let inode = p.swap_file.as_ref().ok_or(KillReason::SwapIo)?;

    // SAFETY:
    // The frame backs a page owned by this process; no other reference to
    // its bytes exists while the fault path runs.
    let bytes = unsafe { memory::frame_bytes_mut(frame) };

    fs::begin_op();
    let written = inode.write_at(slot * PGSIZE as usize, bytes);
    fs::end_op();

    if written != PGSIZE as usize {
        return Err(KillReason::SwapIo);
    }
    Ok(())
}

/// Read one page from `slot` of the swap file into `frame`.
///
/// # Errors
/// Fails with [`KillReason::SwapIo`] on a short transfer; the slot remains
/// allocated and the caller must propagate.
pub fn read_page(p: &ProcPaging, slot: usize, frame: PhysFrame) -> Result<(), KillReason> {
    let inode = p.swap_file.as_ref().ok_or(KillReason::SwapIo)?;

    // SAFETY:
    // The frame was just allocated for this swap-in and is not yet mapped.
    let bytes = unsafe { memory::frame_bytes_mut(frame) };

    fs::begin_op();
    let read = inode.read_at(slot * PGSIZE as usize, bytes);
    fs::end_op();

    if read != PGSIZE as usize {
        return Err(KillReason::SwapIo);
    }
    Ok(())
}

/// Unlink the swap file and release the handle, reporting how many slots
/// were still live. Safe to call on a never-opened or already-destroyed
/// swap file.
pub fn destroy_swap(p: &mut ProcPaging) {
    let Some(inode) = p.swap_file.take() else {
        return;
    };

    diag!(p.pid, "SWAPCLEANUP freed_slots={}", p.swap_slots.allocated());

    fs::begin_op();
    let _removed = fs::unlink(&swap_path(p.pid));
    fs::end_op();

    p.swap_slots.clear();
    drop(inode);
}
