//! Fixed-size allocator. One instance serves exactly one block size out of
//! 4 KiB pages. Each page is a region with a small header at its base and
//! an array of equal-sized slots behind it:
//!
//! ```text
//! pages ->  +-------------------+      +-------------------+
//!           | next ------------------> | next -> (null)    |
//!           | free_head = 2     |      | free_head = -1    |
//!           +-------------------+      +-------------------+
//!           | slot 0 (engaged)  |      | slot 0 (engaged)  |
//!           | slot 1 (engaged)  |      | slot 1 (engaged)  |
//!           | slot 2 -> 5       |      | slot 2 (engaged)  |
//!           |        ...        |      |        ...        |
//!           | slot 5 -> -1      |      |   never issued    |
//!           +-------------------+      +-------------------+
//! ```
//!
//! Slots that were never handed out are consumed through a bump cursor that
//! belongs to the newest page. Recycled slots are threaded through an
//! intrusive free-list: the first four bytes of a freed slot store the index
//! of the next freed slot, `-1` terminates. Both paths make `alloc` and
//! `free` O(1) with zero per-slot metadata while a slot is engaged.

use std::{mem, ptr::NonNull};

use log::trace;
use static_assertions::const_assert;

use crate::{
    region::{map_region, unmap_region},
    state::State,
    Pointer,
};

/// Total size of one page, header included.
pub(crate) const CHUNK_SIZE: usize = 4096;

/// Free-list terminator. Doubles as "this page has no recycled slots".
const NO_SLOT: i32 = -1;

/// Lives at the base of every page. The payload starts right after it.
#[repr(C)]
struct PageHeader {
    /// Next page of the same instance, older pages further down the chain.
    next: Pointer<PageHeader>,
    /// Index of the first recycled slot, [`NO_SLOT`] when there is none.
    free_head: i32,
}

const PAGE_HEADER_SIZE: usize = mem::size_of::<PageHeader>();

// Slot addresses are computed as payload + index * block_size, so the
// payload itself has to start on an 8 byte boundary for the roster classes
// to stay naturally aligned.
const_assert!(PAGE_HEADER_SIZE % 8 == 0);

/// An allocator vending blocks of one fixed size.
///
/// `init` picks the block size and maps the first page; every `alloc`
/// returns one slot of exactly that size and `free` recycles it. `destroy`
/// returns all pages to the OS at once.
pub struct FixedSizeAllocator {
    /// Newest page first.
    pages: Pointer<PageHeader>,
    /// Slot size in bytes, fixed at `init`.
    block_size: usize,
    /// Bump cursor into the never-issued tail of the newest page. Resets
    /// when a page is pushed, so older pages only serve recycled slots.
    blocks_inited: usize,
    state: State,
}

impl FixedSizeAllocator {
    pub const fn new() -> Self {
        Self {
            pages: None,
            block_size: 0,
            blocks_inited: 0,
            state: State::NotInitialized,
        }
    }

    /// Fixes the block size and maps the first page. `block_size` must be
    /// at least one index word; anything below 8 breaks slot alignment for
    /// multi-word blocks, so the dispatcher only uses multiples of 8.
    pub fn init(&mut self, block_size: usize) {
        debug_assert!(block_size >= mem::size_of::<i32>());
        debug_assert!(block_size <= CHUNK_SIZE - PAGE_HEADER_SIZE);

        self.state.enter_init();
        self.block_size = block_size;
        self.blocks_inited = 0;
        self.pages = Some(unsafe { Self::map_page(None) });
    }

    /// Returns one unused slot of `block_size` bytes. Recycled slots are
    /// preferred over never-issued ones; a new page is mapped only when
    /// every page is exhausted.
    ///
    /// # Safety
    ///
    /// The instance must be initialized.
    pub unsafe fn alloc(&mut self) -> NonNull<u8> {
        self.state.expect_initialized();

        let page = match self.find_usable_page() {
            Some(page) => page,
            None => self.grow(),
        };

        self.pop_slot(page)
    }

    /// Recycles a slot previously returned by [`Self::alloc`] on this same
    /// instance. An address outside every page is a caller error; the call
    /// keeps the damage contained by doing nothing.
    ///
    /// # Safety
    ///
    /// The instance must be initialized and `address` must not be freed
    /// twice or used after this call.
    pub unsafe fn free(&mut self, address: NonNull<u8>) {
        self.state.expect_initialized();

        let Some(mut page) = self.page_containing(address) else {
            return;
        };

        let payload = Self::payload_of(page);
        let index = (address.as_ptr() as usize - payload.as_ptr() as usize) / self.block_size;

        // The freed slot stores the old list head in its first word and
        // becomes the new head.
        let header = page.as_mut();
        address.as_ptr().cast::<i32>().write(header.free_head);
        header.free_head = index as i32;
    }

    /// Returns every page to the OS. Outstanding slots become invalid.
    pub fn destroy(&mut self) {
        self.state.enter_destroy();

        let mut current = self.pages.take();
        while let Some(page) = current {
            unsafe {
                current = page.as_ref().next;
                unmap_region(page.cast(), CHUNK_SIZE);
            }
        }

        self.blocks_inited = 0;
    }

    fn slots_per_page(&self) -> usize {
        (CHUNK_SIZE - PAGE_HEADER_SIZE) / self.block_size
    }

    /// Address of the slot array of `page`.
    unsafe fn payload_of(page: NonNull<PageHeader>) -> NonNull<u8> {
        NonNull::new_unchecked(page.as_ptr().cast::<u8>().add(PAGE_HEADER_SIZE))
    }

    /// Writes a fresh page header into a newly mapped region.
    unsafe fn map_page(next: Pointer<PageHeader>) -> NonNull<PageHeader> {
        let page = map_region(CHUNK_SIZE).cast::<PageHeader>();

        page.as_ptr().write(PageHeader {
            next,
            free_head: NO_SLOT,
        });

        page
    }

    /// The newest page can serve from its bump tail or its recycled list;
    /// older pages only from their recycled lists.
    unsafe fn find_usable_page(&self) -> Pointer<PageHeader> {
        let head = self.pages?;

        if self.blocks_inited < self.slots_per_page() || head.as_ref().free_head != NO_SLOT {
            return Some(head);
        }

        let mut current = head.as_ref().next;
        while let Some(page) = current {
            if page.as_ref().free_head != NO_SLOT {
                return Some(page);
            }
            current = page.as_ref().next;
        }

        None
    }

    /// Maps a page and pushes it in front of the list. The bump cursor
    /// starts over; whatever never-issued slots the old head had left are
    /// stranded until their siblings get freed.
    unsafe fn grow(&mut self) -> NonNull<PageHeader> {
        let page = Self::map_page(self.pages);

        trace!("FSA {}: mapped page at {:p}", self.block_size, page);

        self.pages = Some(page);
        self.blocks_inited = 0;

        page
    }

    /// Takes one slot out of `page`. Recycled slots win over the bump path
    /// so the most recently freed address is reused first.
    unsafe fn pop_slot(&mut self, mut page: NonNull<PageHeader>) -> NonNull<u8> {
        let payload = Self::payload_of(page);
        let header = page.as_mut();

        if header.free_head != NO_SLOT {
            let slot = payload
                .as_ptr()
                .add(header.free_head as usize * self.block_size);
            header.free_head = slot.cast::<i32>().read();
            return NonNull::new_unchecked(slot);
        }

        let slot = payload.as_ptr().add(self.blocks_inited * self.block_size);
        self.blocks_inited += 1;
        NonNull::new_unchecked(slot)
    }

    /// Finds the page whose slot range contains `address`.
    unsafe fn page_containing(&self, address: NonNull<u8>) -> Pointer<PageHeader> {
        let addr = address.as_ptr() as usize;

        let mut current = self.pages;
        while let Some(page) = current {
            let payload = Self::payload_of(page).as_ptr() as usize;
            let end = payload + self.slots_per_page() * self.block_size;

            if addr >= payload && addr < end {
                return Some(page);
            }

            current = page.as_ref().next;
        }

        None
    }

    /// Free slots are the newest page's never-issued tail plus every page's
    /// recycled list; everything else counts as engaged, including slots
    /// stranded when the bump cursor moved on to a newer page.
    #[cfg(debug_assertions)]
    fn count_slots(&self) -> (usize, usize) {
        let mut pages = 0;
        let mut free = 0;

        if self.pages.is_some() {
            free += self.slots_per_page() - self.blocks_inited;
        }

        unsafe {
            let mut current = self.pages;
            while let Some(page) = current {
                pages += 1;

                let payload = Self::payload_of(page);
                let mut index = page.as_ref().free_head;
                while index != NO_SLOT {
                    free += 1;
                    index = payload
                        .as_ptr()
                        .add(index as usize * self.block_size)
                        .cast::<i32>()
                        .read();
                }

                current = page.as_ref().next;
            }
        }

        (free, pages * self.slots_per_page() - free)
    }

    /// Writes the per-class diagnostic summary.
    #[cfg(debug_assertions)]
    pub fn dump_stat(&self, out: &mut dyn std::fmt::Write) -> std::fmt::Result {
        let (free, engaged) = self.count_slots();
        write!(
            out,
            "FSA {} bytes:\n\tFree: {}\n\tEngaged: {}\n",
            self.block_size, free, engaged
        )
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, address: NonNull<u8>) -> bool {
        unsafe { self.page_containing(address).is_some() }
    }

    #[cfg(test)]
    pub(crate) fn num_pages(&self) -> usize {
        let mut count = 0;
        let mut current = self.pages;
        while let Some(page) = current {
            count += 1;
            current = unsafe { page.as_ref().next };
        }
        count
    }
}

impl Drop for FixedSizeAllocator {
    fn drop(&mut self) {
        if self.state == State::Initialized {
            self.destroy();
        }
    }
}
