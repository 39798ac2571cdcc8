//! FIFO page replacement.
//!
//! The victim is the resident page whose residency began earliest, i.e. the
//! one with the smallest FIFO sequence number. Clean pages in the text range
//! are identical to the executable image on disk, so they are discarded and
//! re-read on the next fault; everything else is written to the process's
//! swap file first.

use x86_64::structures::paging::{Mapper, Page, Size4KiB};

use crate::diag;
use crate::memory::PhysFrameManager;

use super::state::ProcPaging;
use super::{kill, swap, KillReason, PageState};

/// Index of the resident descriptor with the smallest FIFO sequence, or
/// `None` when no page is resident.
#[must_use]
pub fn find_fifo_victim(p: &ProcPaging) -> Option<usize> {
    p.descriptors()
        .iter()
        .enumerate()
        .filter(|(_, d)| d.state == PageState::Resident)
        .min_by_key(|(_, d)| d.seq)
        .map(|(idx, _)| idx)
}

/// Evict one page chosen by FIFO, freeing its frame.
///
/// Dirty pages and pages outside the text range are written to the swap
/// file (created lazily); clean text pages are discarded. The swap write
/// completes before the victim's mapping is invalidated, and the mapping is
/// invalidated before the frame is released.
///
/// # Errors
/// Kills the process when no victim exists (memory exhaustion), when no
/// swap slot is available for a page that must be saved, or when the swap
/// write fails.
pub fn evict_one(
    p: &mut ProcPaging,
    mapper: &mut impl Mapper<Size4KiB>,
    frames: &mut PhysFrameManager,
) -> Result<(), KillReason> {
    let Some(victim) = find_fifo_victim(p) else {
        diag!(p.pid, "MEMFULL");
        return Err(kill(p, KillReason::MemFull));
    };

    let va = p.page(victim).va;
    let seq = p.page(victim).seq.unwrap_or(0);
    let was_dirty = p.page(victim).is_dirty;
    let page: Page<Size4KiB> = Page::containing_address(va);

    diag!(p.pid, "VICTIM va={:#x} seq={}", va.as_u64(), seq);

    if was_dirty || !p.in_text(va) {
        // The page cannot be recovered from the read-only image: save it.
        if let Err(reason) = swap::open_swap(p) {
            return Err(kill(p, reason));
        }

        let Some(slot) = p.swap_slots.alloc() else {
            diag!(p.pid, "SWAPFULL");
            return Err(kill(p, KillReason::SwapExhausted));
        };

        let frame = mapper
            .translate_page(page)
            .map_err(|_| kill(p, KillReason::SwapIo))?;
        if let Err(reason) = swap::write_page(p, slot, frame) {
            // The slot stays allocated; the bitmap only forgets it at
            // teardown.
            return Err(kill(p, reason));
        }

        let descriptor = p.page_mut(victim);
        descriptor.state = PageState::Swapped;
        descriptor.swap_slot = Some(slot);
        diag!(p.pid, "SWAPOUT va={:#x} slot={}", va.as_u64(), slot);
    } else {
        let descriptor = p.page_mut(victim);
        descriptor.state = PageState::Unmapped;
        descriptor.swap_slot = None;
        diag!(p.pid, "DISCARD va={:#x}", va.as_u64());
    }

    // The contents are safe (in swap or recoverable from the image):
    // invalidate the mapping, then give the frame back.
    let (frame, flush) = mapper
        .unmap(page)
        .map_err(|_| kill(p, KillReason::MemFull))?;
    flush.flush();
    frames.free_user_frame(frame);

    diag!(
        p.pid,
        "EVICT va={:#x} state={}",
        va.as_u64(),
        if was_dirty { "dirty" } else { "clean" }
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use x86_64::VirtAddr;

    use super::super::{PageState, ProcPaging};
    use super::find_fifo_victim;

    fn resident(p: &mut ProcPaging, va: u64, seq: u64) -> usize {
        let idx = p
            .lookup_or_create(VirtAddr::new(va))
            .expect("descriptor creation should succeed");
        let page = p.page_mut(idx);
        page.state = PageState::Resident;
        page.seq = Some(seq);
        idx
    }

    #[test_case]
    fn test_victim_is_oldest_resident_page() {
        let mut p = ProcPaging::new(1);
        resident(&mut p, 0x40_3000, 2);
        let oldest = resident(&mut p, 0x40_1000, 0);
        resident(&mut p, 0x40_2000, 1);
        p.next_fifo_seq = 3;

        assert_eq!(
            find_fifo_victim(&p),
            Some(oldest),
            "FIFO must pick the smallest sequence number.",
        );
    }

    #[test_case]
    fn test_swapped_and_unmapped_pages_are_never_victims() {
        let mut p = ProcPaging::new(1);
        let idx = resident(&mut p, 0x40_1000, 0);
        p.page_mut(idx).state = PageState::Swapped;
        let _unmapped = p.lookup_or_create(VirtAddr::new(0x40_2000));

        assert_eq!(
            find_fifo_victim(&p),
            None,
            "Only resident pages are candidates.",
        );
    }
}
