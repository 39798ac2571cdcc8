//! The page-fault path: classification, materialisation and dirty tracking.
//!
//! Pages are always installed read-only first (text additionally stays
//! executable). The first store to a page traps again as a protection
//! fault, which [`handle_write_fault`] turns into a dirty bit and a
//! writable mapping. Precise dirty accounting is what lets eviction discard
//! clean text pages instead of swapping them.

use x86_64::structures::paging::{Mapper, Page, PageTableFlags, PhysFrame, Size4KiB};
use x86_64::VirtAddr;

use crate::memory::{self, PhysFrameManager};
use crate::{diag, fs};

use super::state::ProcPaging;
use super::{kill, replace, swap, Access, FaultCause, KillReason, PageState, PGSIZE};

/// Service a page fault of process `p` at `va_raw`.
///
/// Classifies the fault (swap-in, executable load, heap or stack zero-fill),
/// acquires a frame (evicting one victim and retrying under memory
/// pressure), fills it, installs a read-only user mapping and stamps the
/// FIFO sequence. On success the trapped instruction re-executes
/// transparently.
///
/// # Errors
/// Every error is terminal: the process is marked killed, a `KILL`
/// diagnostic names the reason, and the caller must not return to user mode.
pub fn handle_page_fault(
    p: &mut ProcPaging,
    va_raw: VirtAddr,
    access: Access,
    mapper: &mut impl Mapper<Size4KiB>,
    frames: &mut PhysFrameManager,
) -> Result<(), KillReason> {
    if p.killed {
        return Err(KillReason::AlreadyKilled);
    }

    let va = va_raw.align_down(PGSIZE);
    let idx = p.lookup_or_create(va);
    let cause = p.classify(idx, va);

    // Loads in the text range are instruction fetches as far as the
    // diagnostics are concerned.
    let shown_access = match access {
        Access::Write => "write",
        Access::Read if p.in_text(va) => "exec",
        Access::Read => "read",
    };

    let Some(cause) = cause else {
        diag!(
            p.pid,
            "PAGEFAULT va={:#x} access={} cause=unknown",
            va.as_u64(),
            shown_access
        );
        return Err(kill(
            p,
            KillReason::InvalidAccess {
                va: va.as_u64(),
                access,
            },
        ));
    };

    diag!(
        p.pid,
        "PAGEFAULT va={:#x} access={} cause={}",
        va.as_u64(),
        shown_access,
        cause
    );

    let Some(idx) = idx else {
        return Err(kill(p, KillReason::DescriptorsExhausted));
    };

    let frame = acquire_frame(p, mapper, frames)?;

    // SAFETY:
    // The frame was just acquired and is not mapped anywhere.
    unsafe { memory::zero_frame(frame) };

    match cause {
        FaultCause::Swap => {
            let Some(slot) = p.page(idx).swap_slot else {
                frames.free_user_frame(frame);
                return Err(kill(p, KillReason::SwapIo));
            };

            if let Err(reason) = swap::read_page(p, slot, frame) {
                frames.free_user_frame(frame);
                return Err(kill(p, reason));
            }

            p.swap_slots.free(slot);
            let descriptor = p.page_mut(idx);
            descriptor.swap_slot = None;
            descriptor.is_dirty = false;
            diag!(p.pid, "SWAPIN va={:#x} slot={}", va.as_u64(), slot);
        }
        FaultCause::Exec => {
            if let Err(reason) = load_from_image(p, idx, frame) {
                frames.free_user_frame(frame);
                return Err(kill(p, reason));
            }
            diag!(p.pid, "LOADEXEC va={:#x}", va.as_u64());
        }
        FaultCause::Heap | FaultCause::Stack => {
            diag!(p.pid, "ALLOC va={:#x}", va.as_u64());
        }
    }

    if let Err(reason) = map_read_only(va, frame, mapper, frames) {
        frames.free_user_frame(frame);
        return Err(kill(p, reason));
    }

    finalise_resident(p, idx);
    Ok(())
}

/// Service a protection fault caused by a store to a read-only page.
///
/// For a resident page this is the first write since it became resident:
/// the page is marked dirty and the mapping upgraded to writable. Anything
/// else escalates to the main fault path.
///
/// # Errors
/// Terminal errors kill the process, as in [`handle_page_fault`].
pub fn handle_write_fault(
    p: &mut ProcPaging,
    va_raw: VirtAddr,
    mapper: &mut impl Mapper<Size4KiB>,
    frames: &mut PhysFrameManager,
) -> Result<(), KillReason> {
    if p.killed {
        return Err(KillReason::AlreadyKilled);
    }

    let va = va_raw.align_down(PGSIZE);
    let resident = p
        .lookup(va)
        .is_some_and(|idx| p.page(idx).state == PageState::Resident);
    if !resident {
        return handle_page_fault(p, va_raw, Access::Write, mapper, frames);
    }

    if let Some(idx) = p.lookup(va) {
        p.page_mut(idx).is_dirty = true;
    }

    let page: Page<Size4KiB> = Page::containing_address(va);
    let flags =
        PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE;

    // SAFETY:
    // The page is mapped (the descriptor is resident); we only widen its
    // permissions.
    let updated = unsafe { mapper.update_flags(page, flags) };
    match updated {
        Ok(flush) => {
            flush.flush();
            Ok(())
        }
        Err(_) => Err(kill(p, KillReason::MemFull)),
    }
}

/// Materialise one zero-filled page immediately, outside a fault.
///
/// Used by eager heap growth; goes through the same frame acquisition,
/// mapping and FIFO stamping as the fault path so every invariant holds.
///
/// # Errors
/// Terminal errors kill the process, as in [`handle_page_fault`].
pub(crate) fn install_zero_page(
    p: &mut ProcPaging,
    va: VirtAddr,
    mapper: &mut impl Mapper<Size4KiB>,
    frames: &mut PhysFrameManager,
) -> Result<(), KillReason> {
    let va = va.align_down(PGSIZE);
    let Some(idx) = p.lookup_or_create(va) else {
        return Err(kill(p, KillReason::DescriptorsExhausted));
    };
    if p.page(idx).state == PageState::Resident {
        return Ok(());
    }

    let frame = acquire_frame(p, mapper, frames)?;

    // SAFETY:
    // The frame was just acquired and is not mapped anywhere.
    unsafe { memory::zero_frame(frame) };

    diag!(p.pid, "ALLOC va={:#x}", va.as_u64());

    if let Err(reason) = map_read_only(va, frame, mapper, frames) {
        frames.free_user_frame(frame);
        return Err(kill(p, reason));
    }

    finalise_resident(p, idx);
    Ok(())
}

/// Acquire a user frame, evicting one victim and retrying under pressure.
fn acquire_frame(
    p: &mut ProcPaging,
    mapper: &mut impl Mapper<Size4KiB>,
    frames: &mut PhysFrameManager,
) -> Result<PhysFrame, KillReason> {
    if let Some(frame) = frames.alloc_user_frame() {
        return Ok(frame);
    }

    replace::evict_one(p, mapper, frames)?;

    if let Some(frame) = frames.alloc_user_frame() {
        return Ok(frame);
    }

    diag!(p.pid, "MEMFULL");
    Err(kill(p, KillReason::MemFull))
}

/// Read the initial contents of page `idx` from the executable image.
///
/// Pages with `exec_len == 0` are pure BSS and stay zero; otherwise exactly
/// `exec_len` bytes are read at `exec_off` and the tail of the frame keeps
/// the zero fill.
fn load_from_image(p: &ProcPaging, idx: usize, frame: PhysFrame) -> Result<(), KillReason> {
    let exec_off = p.page(idx).exec_off;
    let exec_len = p.page(idx).exec_len;
    if exec_len == 0 {
        return Ok(());
    }

    let image = p.exec_file.as_ref().ok_or(KillReason::ExecIo)?;

    // SAFETY:
    // The frame was just acquired for this page and is not mapped yet.
    let bytes = unsafe { memory::frame_bytes_mut(frame) };

    fs::begin_op();
    let read = image.read_at(exec_off as usize, &mut bytes[..exec_len as usize]);
    fs::end_op();

    if read != exec_len as usize {
        return Err(KillReason::ExecIo);
    }
    Ok(())
}

/// Install a read-only user mapping for `va`.
///
/// Text pages stay executable and everything starts non-writable; the
/// write-fault handler upgrades the mapping on the first store.
fn map_read_only(
    va: VirtAddr,
    frame: PhysFrame,
    mapper: &mut impl Mapper<Size4KiB>,
    frames: &mut PhysFrameManager,
) -> Result<(), KillReason> {
    let page: Page<Size4KiB> = Page::containing_address(va);
    let flags = PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE;

    // SAFETY:
    // The frame is owned by this page and the slot in the page table is
    // empty: any previous victim was unmapped before its frame was reused.
    let mapped = unsafe { mapper.map_to(page, frame, flags, frames) };
    match mapped {
        Ok(flush) => {
            flush.flush();
            Ok(())
        }
        Err(_) => Err(KillReason::MemFull),
    }
}

/// Mark page `idx` resident and stamp the next FIFO sequence number.
fn finalise_resident(p: &mut ProcPaging, idx: usize) {
    let seq = p.next_fifo_seq;
    p.next_fifo_seq += 1;

    let va = p.page(idx).va;
    let descriptor = p.page_mut(idx);
    descriptor.state = PageState::Resident;
    descriptor.seq = Some(seq);

    diag!(p.pid, "RESIDENT va={:#x} seq={}", va.as_u64(), seq);
}
