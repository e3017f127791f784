//! Dispatcher bookkeeping. One record per outstanding user allocation,
//! kept in a dedicated region so the records never touch memory the user
//! owns. Record slots are bump-allocated from the region and recycled
//! through an intrusive slot list once their allocation is freed:
//!
//! ```text
//!  base                                              bump cursor
//!   |                                                     |
//!   v                                                     v
//!   +--------+--------+--------+--------+--------+--------+- - - - -
//!   | live   | free   | live   | live   | free   | live   |  never
//!   | record | slot   | record | record | slot   | record |  used
//!   +--------+---|----+--------+--------+---^----+--------+- - - - -
//!                +---------------------------+
//!                         recycled list
//! ```

use std::{mem, ptr::NonNull};

use log::error;
use static_assertions::const_assert;

use crate::{
    region::{map_region, unmap_region},
    Pointer,
};

/// Size of the record region. Enough for several million outstanding
/// allocations; running past it is treated like OS exhaustion.
pub(crate) const LEDGER_SIZE: usize = 100 * 1024 * 1024;

/// One outstanding allocation.
#[repr(C)]
pub(crate) struct Record {
    /// The pointer handed to the user.
    pub chunk: NonNull<u8>,
    /// The exact byte count the user requested. `free` re-runs the
    /// dispatcher's classifier on this value.
    pub size: usize,
    /// Next live record, or next recycled slot once this one is retired.
    next: Pointer<Record>,
}

const RECORD_SIZE: usize = mem::size_of::<Record>();

// Slots are laid out back to back from the region base.
const_assert!(RECORD_SIZE % 8 == 0);

/// The record store. Owns one region; individual records are never
/// returned to the OS, only recycled, and the whole region goes away on
/// `destroy`.
pub(crate) struct Ledger {
    /// Region base. `None` until `init`.
    base: Pointer<u8>,
    /// Live records, newest first.
    live: Pointer<Record>,
    /// Retired slots awaiting reuse.
    recycled: Pointer<Record>,
    /// Bump cursor: number of slots ever carved from the region.
    slots_used: usize,
}

impl Ledger {
    pub const fn new() -> Self {
        Self {
            base: None,
            live: None,
            recycled: None,
            slots_used: 0,
        }
    }

    pub fn init(&mut self) {
        self.base = Some(map_region(LEDGER_SIZE));
        self.live = None;
        self.recycled = None;
        self.slots_used = 0;
    }

    pub fn destroy(&mut self) {
        if let Some(base) = self.base.take() {
            unsafe { unmap_region(base, LEDGER_SIZE) };
        }
        self.live = None;
        self.recycled = None;
        self.slots_used = 0;
    }

    /// Files a record for a fresh allocation. Recycled slots are reused
    /// before the bump cursor moves.
    ///
    /// # Safety
    ///
    /// The ledger must be initialized.
    pub unsafe fn record(&mut self, chunk: NonNull<u8>, size: usize) {
        let slot = match self.recycled {
            Some(slot) => {
                self.recycled = slot.as_ref().next;
                slot
            }
            None => self.carve_slot(),
        };

        slot.as_ptr().write(Record {
            chunk,
            size,
            next: self.live,
        });
        self.live = Some(slot);
    }

    /// Retires the record whose `chunk` matches and returns its recorded
    /// size, or `None` for a pointer this ledger never saw.
    ///
    /// # Safety
    ///
    /// The ledger must be initialized.
    pub unsafe fn remove(&mut self, chunk: NonNull<u8>) -> Option<usize> {
        let mut prev: Pointer<Record> = None;
        let mut current = self.live;

        while let Some(mut record) = current {
            if record.as_ref().chunk == chunk {
                match prev {
                    Some(mut prev) => prev.as_mut().next = record.as_ref().next,
                    None => self.live = record.as_ref().next,
                }

                let size = record.as_ref().size;
                record.as_mut().next = self.recycled;
                self.recycled = Some(record);

                return Some(size);
            }

            prev = current;
            current = record.as_ref().next;
        }

        None
    }

    /// Advances the bump cursor by one slot.
    unsafe fn carve_slot(&mut self) -> NonNull<Record> {
        if (self.slots_used + 1) * RECORD_SIZE > LEDGER_SIZE {
            error!("bookkeeping region exhausted after {} records", self.slots_used);
            std::process::abort();
        }

        // init ran, or the caller broke the dispatcher's state machine.
        let base = self.base.unwrap_unchecked();

        let slot = base.as_ptr().add(self.slots_used * RECORD_SIZE).cast::<Record>();
        self.slots_used += 1;

        NonNull::new_unchecked(slot)
    }

    /// Live records in list order (newest first).
    #[cfg(debug_assertions)]
    pub fn records(&self) -> Records<'_> {
        Records {
            current: self.live,
            _ledger: std::marker::PhantomData,
        }
    }

    #[cfg(test)]
    pub(crate) fn live_len(&self) -> usize {
        let mut count = 0;
        let mut current = self.live;
        while let Some(record) = current {
            count += 1;
            current = unsafe { record.as_ref().next };
        }
        count
    }

    #[cfg(test)]
    pub(crate) fn slots_used(&self) -> usize {
        self.slots_used
    }
}

/// Iterator over live records. Borrows the ledger so records cannot be
/// filed or retired while it is out.
#[cfg(debug_assertions)]
pub(crate) struct Records<'a> {
    current: Pointer<Record>,
    _ledger: std::marker::PhantomData<&'a Ledger>,
}

#[cfg(debug_assertions)]
impl Iterator for Records<'_> {
    type Item = (NonNull<u8>, usize);

    fn next(&mut self) -> Option<Self::Item> {
        let record = self.current?;
        unsafe {
            self.current = record.as_ref().next;
            Some((record.as_ref().chunk, record.as_ref().size))
        }
    }
}
