//! Per-process paging state: layout ranges, the page descriptor table, the
//! FIFO counter and the swap bookkeeping.
//!
//! Descriptors live in a bounded array owned by the process and are handed
//! out as indices into it, never as references, so snapshotting the table
//! for the `memstat` syscall is a plain copy. Lookup is content-addressed:
//! a linear scan for the page-rounded virtual address.

use alloc::sync::Arc;

use x86_64::{
    structures::paging::{Mapper, Page, Size4KiB},
    VirtAddr,
};

use crate::fs::Inode;
use crate::memory::PhysFrameManager;

use super::{
    swap, FaultCause, PageState, MAX_PAGES_INFO, MAX_PROC_PAGES, PGSIZE, USER_STACK_PAGES,
};

/// Descriptor for one logical page the process has touched or been told it
/// owns.
#[derive(Debug, Clone, Copy)]
pub struct PageInfo {
    /// Page-aligned virtual address.
    pub va: VirtAddr,
    /// Residency state.
    pub state: PageState,
    /// FIFO sequence stamped when the page most recently became resident.
    pub seq: Option<u64>,
    /// Whether the page was written since it most recently became resident.
    pub is_dirty: bool,
    /// Slot in the swap file while the page is swapped out.
    pub swap_slot: Option<usize>,
    /// Byte offset in the executable image backing this page.
    pub exec_off: u64,
    /// Bytes to read from the executable; zero for BSS/heap/stack pages.
    pub exec_len: u64,
}

impl PageInfo {
    const fn unused() -> Self {
        Self {
            va: VirtAddr::zero(),
            state: PageState::Unmapped,
            seq: None,
            is_dirty: false,
            swap_slot: None,
            exec_off: 0,
            exec_len: 0,
        }
    }
}

/// Half-open range of virtual addresses, page-aligned at the start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    /// First address of the range.
    pub start: VirtAddr,
    /// First address past the range.
    pub end: VirtAddr,
}

impl Region {
    /// The empty range.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            start: VirtAddr::zero(),
            end: VirtAddr::zero(),
        }
    }

    /// Whether `va` falls inside the range.
    #[must_use]
    pub fn contains(&self, va: VirtAddr) -> bool {
        self.start <= va && va < self.end
    }

    /// Whether the range covers no address.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// Grow the range to cover `[start, end)`.
    fn extend_to_cover(&mut self, start: VirtAddr, end: VirtAddr) {
        if self.is_empty() {
            self.start = start;
            self.end = end;
        } else {
            self.start = self.start.min(start);
            self.end = self.end.max(end);
        }
    }
}

/// One loadable segment, as registered by the executable loader.
#[derive(Debug, Clone, Copy)]
pub struct SegmentDesc {
    /// Page-aligned virtual address the segment starts at.
    pub va: VirtAddr,
    /// Bytes the segment occupies in memory.
    pub memsz: u64,
    /// Bytes of initial contents present in the image file.
    pub filesz: u64,
    /// Offset of those contents in the image file.
    pub file_offset: u64,
    /// Whether the segment is executable (text rather than data).
    pub is_exec: bool,
}

/// Per-process demand-paging state.
///
/// Owned by exactly one process; the page table and the frame manager are
/// collaborators referenced per call.
pub struct ProcPaging {
    /// Process identifier, used for diagnostics and the swap file name.
    pub pid: u32,
    /// Set when a terminal paging error killed the process.
    pub killed: bool,
    /// Text (executable image) range.
    pub text: Region,
    /// Initialised data / BSS range.
    pub data: Region,
    /// First heap address.
    pub heap_start: VirtAddr,
    /// Current program break; the heap is `[heap_start, sz)`.
    pub sz: VirtAddr,
    /// First address past the user stack; the stack region is
    /// `[stack_top - USER_STACK_PAGES * PGSIZE, stack_top)`.
    pub stack_top: VirtAddr,
    /// Next FIFO sequence number to stamp on a page becoming resident.
    pub next_fifo_seq: u64,
    /// Bitmap over the slots of the swap file.
    pub swap_slots: swap::SwapMap,
    /// Lazily created per-process swap file.
    pub swap_file: Option<Arc<Inode>>,
    /// Executable image the process was launched from; backs text/data
    /// faults for the lifetime of the process.
    pub exec_file: Option<Arc<Inode>>,
    pages: [PageInfo; MAX_PROC_PAGES],
    num_pages: usize,
}

impl ProcPaging {
    /// Fresh, empty paging state for process `pid`.
    #[must_use]
    pub const fn new(pid: u32) -> Self {
        Self {
            pid,
            killed: false,
            text: Region::empty(),
            data: Region::empty(),
            heap_start: VirtAddr::zero(),
            sz: VirtAddr::zero(),
            stack_top: VirtAddr::zero(),
            next_fifo_seq: 0,
            swap_slots: swap::SwapMap::new(),
            swap_file: None,
            exec_file: None,
            pages: [PageInfo::unused(); MAX_PROC_PAGES],
            num_pages: 0,
        }
    }

    /// The descriptors created so far.
    #[must_use]
    pub fn descriptors(&self) -> &[PageInfo] {
        &self.pages[..self.num_pages]
    }

    /// Shared access to descriptor `idx`.
    #[must_use]
    pub fn page(&self, idx: usize) -> &PageInfo {
        &self.pages[idx]
    }

    /// Exclusive access to descriptor `idx`.
    #[must_use]
    pub fn page_mut(&mut self, idx: usize) -> &mut PageInfo {
        &mut self.pages[idx]
    }

    /// Index of the descriptor for `va` (page-rounded), if one exists.
    #[must_use]
    pub fn lookup(&self, va: VirtAddr) -> Option<usize> {
        let va = va.align_down(PGSIZE);
        (0..self.num_pages).find(|&i| self.pages[i].va == va)
    }

    /// Index of the descriptor for `va`, creating one if capacity remains.
    ///
    /// Returns `None` when the table already holds [`MAX_PROC_PAGES`]
    /// descriptors; the caller must treat that as fatal for the process.
    pub fn lookup_or_create(&mut self, va: VirtAddr) -> Option<usize> {
        let va = va.align_down(PGSIZE);
        if let Some(idx) = self.lookup(va) {
            return Some(idx);
        }

        if self.num_pages >= MAX_PROC_PAGES {
            return None;
        }

        let idx = self.num_pages;
        self.num_pages += 1;
        self.pages[idx] = PageInfo {
            va,
            ..PageInfo::unused()
        };
        Some(idx)
    }

    /// Register one loadable segment from the executable image.
    ///
    /// Extends the text or data range and creates a descriptor for every
    /// page of the segment, recording the image offset and length its
    /// initial contents must be read from (zero length for pure BSS pages).
    ///
    /// # Errors
    /// Fails when the segment is malformed or the descriptor table is full.
    pub fn register_segment(&mut self, seg: &SegmentDesc) -> Result<(), &'static str> {
        if !seg.va.is_aligned(PGSIZE) {
            return Err("segment start is not page-aligned");
        }
        if seg.filesz > seg.memsz {
            return Err("segment file size exceeds memory size");
        }
        let end = seg
            .va
            .as_u64()
            .checked_add(seg.memsz)
            .ok_or("segment wraps the address space")?;
        let end = VirtAddr::new(end);

        if seg.is_exec {
            self.text.extend_to_cover(seg.va, end);
        } else {
            self.data.extend_to_cover(seg.va, end);
        }

        let mut va = seg.va;
        while va < end {
            let idx = self
                .lookup_or_create(va)
                .ok_or("out of page descriptors while registering segments")?;
            let page_off = va - seg.va;
            let page = self.page_mut(idx);
            if page_off < seg.filesz {
                page.exec_off = seg.file_offset + page_off;
                page.exec_len = (seg.filesz - page_off).min(PGSIZE);
            } else {
                page.exec_off = 0;
                page.exec_len = 0;
            }
            va += PGSIZE;
        }

        Ok(())
    }

    /// Finish the loader handshake: fix the heap start just past the image,
    /// set the initial program break there, and record the stack top.
    pub fn finish_layout(&mut self, stack_top: VirtAddr) {
        let image_end = self.text.end.max(self.data.end);
        self.heap_start = image_end.align_up(PGSIZE);
        self.sz = self.heap_start;
        self.stack_top = stack_top;
    }

    /// Lowest address of the user stack region.
    #[must_use]
    pub fn stack_bottom(&self) -> VirtAddr {
        self.stack_top - USER_STACK_PAGES * PGSIZE
    }

    /// Whether `va` lies in the text range.
    #[must_use]
    pub fn in_text(&self, va: VirtAddr) -> bool {
        self.text.contains(va)
    }

    /// Whether `va` is backed by the executable image (text or data).
    #[must_use]
    pub fn in_exec_image(&self, va: VirtAddr) -> bool {
        self.text.contains(va) || self.data.contains(va)
    }

    /// Whether `va` lies in the heap, below the current program break.
    #[must_use]
    pub fn in_heap(&self, va: VirtAddr) -> bool {
        self.heap_start <= va && va < self.sz
    }

    /// Whether `va` lies in the user stack region.
    #[must_use]
    pub fn in_stack(&self, va: VirtAddr) -> bool {
        self.stack_bottom() <= va && va < self.stack_top
    }

    /// Classify a fault at page-rounded `va`, or `None` for an illegal
    /// access. `idx` is the descriptor index when one already exists.
    #[must_use]
    pub fn classify(&self, idx: Option<usize>, va: VirtAddr) -> Option<FaultCause> {
        if let Some(i) = idx {
            if self.pages[i].state == PageState::Swapped {
                return Some(FaultCause::Swap);
            }
        }

        if self.in_exec_image(va) {
            Some(FaultCause::Exec)
        } else if self.in_heap(va) {
            Some(FaultCause::Heap)
        } else if self.in_stack(va) {
            Some(FaultCause::Stack)
        } else {
            None
        }
    }

    /// Drop the descriptor at `idx`, compacting the table.
    pub fn remove_descriptor(&mut self, idx: usize) {
        debug_assert!(idx < self.num_pages, "descriptor index out of bounds.");
        self.num_pages -= 1;
        self.pages[idx] = self.pages[self.num_pages];
        self.pages[self.num_pages] = PageInfo::unused();
    }

    /// Release every page whose address falls in `[start, end)`: resident
    /// pages are unmapped and their frames returned, swapped pages give
    /// their slot back, and the descriptors are dropped.
    pub fn release_range(
        &mut self,
        start: VirtAddr,
        end: VirtAddr,
        mapper: &mut impl Mapper<Size4KiB>,
        frames: &mut PhysFrameManager,
    ) {
        let mut i = 0;
        while i < self.num_pages {
            let page = self.pages[i];
            if page.va < start || page.va >= end {
                i += 1;
                continue;
            }

            match page.state {
                PageState::Resident => {
                    let virt_page: Page<Size4KiB> = Page::containing_address(page.va);
                    if let Ok((frame, flush)) = mapper.unmap(virt_page) {
                        flush.flush();
                        frames.free_user_frame(frame);
                    }
                }
                PageState::Swapped => {
                    if let Some(slot) = page.swap_slot {
                        self.swap_slots.free(slot);
                    }
                }
                PageState::Unmapped => {}
            }
            self.remove_descriptor(i);
        }
    }

    /// Tear the whole paging state down: release every page, destroy the
    /// swap file and drop the executable handle (last, since text faults
    /// could need it up to this point). Safe to call more than once.
    pub fn teardown(
        &mut self,
        mapper: &mut impl Mapper<Size4KiB>,
        frames: &mut PhysFrameManager,
    ) {
        let mut i = 0;
        while i < self.num_pages {
            let page = self.pages[i];
            match page.state {
                PageState::Resident => {
                    let virt_page: Page<Size4KiB> = Page::containing_address(page.va);
                    if let Ok((frame, flush)) = mapper.unmap(virt_page) {
                        flush.flush();
                        frames.free_user_frame(frame);
                    }
                }
                PageState::Swapped | PageState::Unmapped => {}
            }
            i += 1;
        }
        self.num_pages = 0;

        swap::destroy_swap(self);
        self.exec_file = None;
    }

    /// Read-only snapshot of the paging state for user tooling.
    #[must_use]
    pub fn snapshot(&self) -> ProcMemStat {
        let mut stat = ProcMemStat::zeroed();
        stat.pid = self.pid;
        stat.next_fifo_seq = self.next_fifo_seq;
        stat.num_pages_total = u32::try_from(self.sz.as_u64().div_ceil(PGSIZE)).unwrap_or(u32::MAX);

        for (i, page) in self.descriptors().iter().enumerate() {
            match page.state {
                PageState::Resident => stat.num_resident += 1,
                PageState::Swapped => stat.num_swapped += 1,
                PageState::Unmapped => {}
            }

            if i < MAX_PAGES_INFO {
                stat.pages[i] = PageStat {
                    va: page.va.as_u64(),
                    state: page.state as u32,
                    is_dirty: u32::from(page.is_dirty),
                    seq: page.seq.map_or(-1, |s| i64::try_from(s).unwrap_or(i64::MAX)),
                    swap_slot: page
                        .swap_slot
                        .map_or(-1, |s| i64::try_from(s).unwrap_or(i64::MAX)),
                };
            }
        }

        stat
    }
}

/// One page record of the `memstat` snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct PageStat {
    /// Page-aligned virtual address.
    pub va: u64,
    /// 0 = unmapped, 1 = resident, 2 = swapped.
    pub state: u32,
    /// 1 when the page was written since it became resident.
    pub is_dirty: u32,
    /// FIFO sequence number, `-1` when never resident.
    pub seq: i64,
    /// Swap slot index, `-1` when not swapped.
    pub swap_slot: i64,
}

impl PageStat {
    const fn zeroed() -> Self {
        Self {
            va: 0,
            state: 0,
            is_dirty: 0,
            seq: -1,
            swap_slot: -1,
        }
    }
}

/// Aggregate memory statistics copied out by the `memstat` syscall.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct ProcMemStat {
    /// Process identifier.
    pub pid: u32,
    /// Virtual pages below the program break, rounded up.
    pub num_pages_total: u32,
    /// Pages currently backed by a physical frame.
    pub num_resident: u32,
    /// Pages currently in the swap file.
    pub num_swapped: u32,
    /// Next FIFO sequence number to be assigned.
    pub next_fifo_seq: u64,
    /// Per-page records for the first [`MAX_PAGES_INFO`] descriptors.
    pub pages: [PageStat; MAX_PAGES_INFO],
}

impl ProcMemStat {
    /// An all-zero snapshot.
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            pid: 0,
            num_pages_total: 0,
            num_resident: 0,
            num_swapped: 0,
            next_fifo_seq: 0,
            pages: [PageStat::zeroed(); MAX_PAGES_INFO],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        FaultCause, PageState, ProcPaging, SegmentDesc, VirtAddr, MAX_PROC_PAGES, PGSIZE,
    };

    fn layout() -> ProcPaging {
        let mut p = ProcPaging::new(7);
        p.register_segment(&SegmentDesc {
            va: VirtAddr::new(0x40_1000),
            memsz: 0x2000,
            filesz: 0x2000,
            file_offset: 64,
            is_exec: true,
        })
        .expect("text segment should register");
        p.register_segment(&SegmentDesc {
            va: VirtAddr::new(0x40_3000),
            memsz: 0x1000,
            filesz: 0x200,
            file_offset: 64 + 0x2000,
            is_exec: false,
        })
        .expect("data segment should register");
        p.finish_layout(VirtAddr::new(0x41_0000));
        p
    }

    #[test_case]
    fn test_lookup_or_create_rounds_to_page_boundary() {
        let mut p = ProcPaging::new(1);
        let idx = p
            .lookup_or_create(VirtAddr::new(0x40_1234))
            .expect("creation should succeed");
        assert_eq!(
            p.page(idx).va,
            VirtAddr::new(0x40_1000),
            "Descriptor address must be page-rounded.",
        );

        let again = p.lookup_or_create(VirtAddr::new(0x40_1FFF));
        assert_eq!(
            again,
            Some(idx),
            "Same page must resolve to the same descriptor.",
        );
    }

    #[test_case]
    fn test_descriptor_table_is_bounded() {
        let mut p = ProcPaging::new(1);
        for i in 0..MAX_PROC_PAGES {
            let va = VirtAddr::new(0x40_0000 + (i as u64) * PGSIZE);
            assert!(
                p.lookup_or_create(va).is_some(),
                "Creation below the cap must succeed.",
            );
        }

        let overflow = p.lookup_or_create(VirtAddr::new(0x60_0000));
        assert_eq!(overflow, None, "The descriptor table must be bounded.");
    }

    #[test_case]
    fn test_register_segment_records_image_offsets() {
        let p = layout();

        assert_eq!(p.text.start, VirtAddr::new(0x40_1000), "text start");
        assert_eq!(p.text.end, VirtAddr::new(0x40_3000), "text end");
        assert_eq!(p.heap_start, VirtAddr::new(0x40_4000), "heap start");
        assert_eq!(p.sz, p.heap_start, "initial break equals heap start");

        let text_page = p.lookup(VirtAddr::new(0x40_2000)).expect("text descriptor");
        assert_eq!(p.page(text_page).exec_off, 64 + 0x1000, "text page offset");
        assert_eq!(p.page(text_page).exec_len, PGSIZE, "full text page length");

        let data_page = p.lookup(VirtAddr::new(0x40_3000)).expect("data descriptor");
        assert_eq!(p.page(data_page).exec_len, 0x200, "partial data page length");
    }

    #[test_case]
    fn test_classify_covers_region_boundaries() {
        let mut p = layout();
        p.sz += PGSIZE; // one lazily grown heap page

        let classify_at = |p: &ProcPaging, va: u64| p.classify(None, VirtAddr::new(va));

        assert_eq!(
            classify_at(&p, 0x40_2FFF_u64 & !0xFFF),
            Some(FaultCause::Exec),
            "last text page is exec",
        );
        assert_eq!(
            classify_at(&p, 0x40_4000),
            Some(FaultCause::Heap),
            "heap start faults as heap",
        );
        assert_eq!(
            classify_at(&p, 0x40_5000),
            None,
            "one page past the break is invalid",
        );
        assert_eq!(
            classify_at(&p, 0x40_F000),
            Some(FaultCause::Stack),
            "last stack page is stack",
        );
        assert_eq!(
            classify_at(&p, 0x40_B000),
            None,
            "below the stack region is invalid",
        );
    }

    #[test_case]
    fn test_snapshot_counts_states() {
        let mut p = layout();
        let idx = p
            .lookup_or_create(VirtAddr::new(0x40_1000))
            .expect("descriptor");
        p.page_mut(idx).state = PageState::Resident;
        p.page_mut(idx).seq = Some(0);
        p.next_fifo_seq = 1;

        let idx = p
            .lookup_or_create(VirtAddr::new(0x40_3000))
            .expect("descriptor");
        p.page_mut(idx).state = PageState::Swapped;
        p.page_mut(idx).swap_slot = Some(3);

        let stat = p.snapshot();
        assert_eq!(stat.num_resident, 1, "one resident page");
        assert_eq!(stat.num_swapped, 1, "one swapped page");
        assert_eq!(stat.next_fifo_seq, 1, "sequence counter is exported");

        let swapped = stat
            .pages
            .iter()
            .find(|s| s.va == 0x40_3000)
            .expect("swapped record");
        assert_eq!(swapped.swap_slot, 3, "slot index is exported");
        assert_eq!(swapped.seq, -1, "never-resident pages export seq -1");
    }
}
