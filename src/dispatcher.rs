//! The top-level allocator. Classifies every request by size and delegates
//! to one of a closed set of engines: six fixed-size classes, one
//! coalescing allocator, or a dedicated OS mapping. The classifier is the
//! single source of truth; `free` runs the exact same routing on the size
//! recorded at allocation time, so a pointer always returns to the engine
//! that produced it.

use std::ptr::NonNull;

use crate::{
    coalesce::CoalescingAllocator,
    fsa::FixedSizeAllocator,
    ledger::Ledger,
    region::{map_region, unmap_region},
    state::State,
};

/// FSA class roster. A request lands in the smallest class strictly above
/// its size.
pub(crate) const SIZE_CLASSES: [usize; 6] = [16, 32, 64, 128, 256, 512];

/// Requests at or above this go straight to the OS.
pub(crate) const OS_THRESHOLD: usize = 10 * 1024 * 1024;

/// Where a request of a given size is served.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Route {
    /// `SIZE_CLASSES[i]` slot.
    Class(usize),
    Coalesce,
    Os,
}

/// Routing used by both `alloc` and `free`.
fn route_for(size: usize) -> Route {
    if size >= OS_THRESHOLD {
        return Route::Os;
    }
    if size >= SIZE_CLASSES[SIZE_CLASSES.len() - 1] {
        return Route::Coalesce;
    }

    // size < 512, so some class always matches.
    let mut class = 0;
    while size >= SIZE_CLASSES[class] {
        class += 1;
    }
    Route::Class(class)
}

/// The tiered allocator: one coalescing engine, one fixed-size engine per
/// class, a direct OS path, and a ledger remembering which engine owns
/// every outstanding pointer.
pub struct MemoryAllocator {
    fsas: [FixedSizeAllocator; SIZE_CLASSES.len()],
    ca: CoalescingAllocator,
    ledger: Ledger,
    state: State,
}

impl MemoryAllocator {
    pub const fn new() -> Self {
        const FSA: FixedSizeAllocator = FixedSizeAllocator::new();
        Self {
            fsas: [FSA; SIZE_CLASSES.len()],
            ca: CoalescingAllocator::new(),
            ledger: Ledger::new(),
            state: State::NotInitialized,
        }
    }

    /// Brings up the ledger and every engine. May be called again after
    /// [`Self::destroy`]; the instance then behaves like a fresh one.
    pub fn init(&mut self) {
        self.state.enter_init();

        self.ledger.init();
        for (fsa, class) in self.fsas.iter_mut().zip(SIZE_CLASSES) {
            fsa.init(class);
        }
        self.ca.init();
    }

    /// Returns an address where `size` bytes can be written, 8-byte
    /// aligned. The OS path additionally returns page-aligned bases.
    ///
    /// # Safety
    ///
    /// The allocator must be initialized.
    pub unsafe fn alloc(&mut self, size: usize) -> NonNull<u8> {
        self.state.expect_initialized();

        let chunk = match route_for(size) {
            Route::Os => map_region(size),
            Route::Coalesce => self.ca.alloc(size),
            Route::Class(class) => self.fsas[class].alloc(),
        };

        self.ledger.record(chunk, size);
        chunk
    }

    /// Releases an address previously returned by [`Self::alloc`]. The
    /// recorded request size picks the engine; OS-path regions are
    /// unmapped on the spot.
    ///
    /// # Safety
    ///
    /// The allocator must be initialized and `address` must not be freed
    /// twice or used after this call.
    pub unsafe fn free(&mut self, address: NonNull<u8>) {
        self.state.expect_initialized();

        let Some(size) = self.ledger.remove(address) else {
            debug_assert!(false, "free of a pointer this allocator never produced");
            return;
        };

        match route_for(size) {
            Route::Os => unmap_region(address, size),
            Route::Coalesce => self.ca.free(address),
            Route::Class(class) => self.fsas[class].free(address),
        }
    }

    /// Tears down every engine and the ledger. Outstanding OS-path regions
    /// are deliberately not swept; callers free those before destroying.
    pub fn destroy(&mut self) {
        self.state.enter_destroy();

        for fsa in &mut self.fsas {
            fsa.destroy();
        }
        self.ca.destroy();
        self.ledger.destroy();
    }

    /// Writes a per-engine summary: one section per FSA class, one for the
    /// coalescing engine, one line pair per outstanding OS block.
    #[cfg(debug_assertions)]
    pub fn dump_stat(&self, out: &mut dyn std::fmt::Write) -> std::fmt::Result {
        for fsa in &self.fsas {
            fsa.dump_stat(out)?;
        }
        self.ca.dump_stat(out)?;

        for (_, size) in self.ledger.records() {
            if size >= OS_THRESHOLD {
                write!(out, "OC  block:\n\tEngaged: {size}\n")?;
            }
        }

        Ok(())
    }

    /// Enumerates every outstanding record.
    #[cfg(debug_assertions)]
    pub fn dump_blocks(&self, out: &mut dyn std::fmt::Write) -> std::fmt::Result {
        out.write_str("Dump Blocks:\n")?;
        for (chunk, size) in self.ledger.records() {
            write!(out, "\tBlock: {:p}, size {size}\n", chunk.as_ptr())?;
        }
        Ok(())
    }
}

impl Default for MemoryAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MemoryAllocator {
    fn drop(&mut self) {
        if self.state == State::Initialized {
            self.destroy();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_thresholds() {
        assert_eq!(route_for(0), Route::Class(0));
        assert_eq!(route_for(15), Route::Class(0));
        assert_eq!(route_for(16), Route::Class(1));
        assert_eq!(route_for(31), Route::Class(1));
        assert_eq!(route_for(32), Route::Class(2));
        assert_eq!(route_for(64), Route::Class(3));
        assert_eq!(route_for(128), Route::Class(4));
        assert_eq!(route_for(255), Route::Class(4));
        assert_eq!(route_for(256), Route::Class(5));
        assert_eq!(route_for(511), Route::Class(5));
        assert_eq!(route_for(512), Route::Coalesce);
        assert_eq!(route_for(OS_THRESHOLD - 1), Route::Coalesce);
        assert_eq!(route_for(OS_THRESHOLD), Route::Os);
    }

    #[test]
    fn requests_land_in_their_engine() {
        let mut allocator = MemoryAllocator::new();
        allocator.init();

        unsafe {
            let tiny = allocator.alloc(4);
            let small = allocator.alloc(40);
            let medium = allocator.alloc(4096);
            let large = allocator.alloc(OS_THRESHOLD + 1024);

            // 4 < 16: the 16 byte class.
            assert!(allocator.fsas[0].contains(tiny));
            // 32 <= 40 < 64: the 64 byte class.
            assert!(allocator.fsas[2].contains(small));
            assert!(!allocator.fsas[0].contains(small));

            assert!(allocator.ca.contains(medium));

            // The OS path maps a region of its own.
            assert!(!allocator.ca.contains(large));
            assert!(allocator.fsas.iter().all(|fsa| !fsa.contains(large)));

            allocator.free(large);
            allocator.free(medium);
            allocator.free(small);
            allocator.free(tiny);

            assert_eq!(allocator.ca.engaged_blocks(), 0);
            assert_eq!(allocator.ledger.live_len(), 0);
        }

        allocator.destroy();
    }

    #[test]
    fn boundary_sizes() {
        let mut allocator = MemoryAllocator::new();
        allocator.init();

        unsafe {
            // 512 is the first size the coalescing engine serves.
            let edge = allocator.alloc(512);
            assert!(allocator.ca.contains(edge));

            let below = allocator.alloc(511);
            assert!(allocator.fsas[5].contains(below));

            allocator.free(below);
            allocator.free(edge);
        }

        allocator.destroy();
    }

    #[test]
    fn free_routes_by_recorded_size() {
        let mut allocator = MemoryAllocator::new();
        allocator.init();

        unsafe {
            // Same byte pattern as the classifier table, exercised through
            // a round trip: each free must reach the engine that allocated,
            // otherwise slot recycling would not return the same address.
            for size in [4, 16, 40, 100, 200, 400, 511] {
                let p = allocator.alloc(size);
                allocator.free(p);
                let q = allocator.alloc(size);
                assert_eq!(q, p);
                allocator.free(q);
            }
        }

        allocator.destroy();
    }

    #[cfg(debug_assertions)]
    #[test]
    fn dump_formats() {
        let mut allocator = MemoryAllocator::new();
        allocator.init();

        unsafe {
            let p = allocator.alloc(4);
            let big = allocator.alloc(11 * 1024 * 1024);

            let mut stat = String::new();
            allocator.dump_stat(&mut stat).unwrap();

            assert!(stat.contains("FSA 16 bytes:\n\tFree: 254\n\tEngaged: 1\n"));
            assert!(stat.contains("FSA 512 bytes:\n\tFree: 7\n\tEngaged: 0\n"));
            assert!(stat.contains("CA 10485760 bytes:\n\tEngaged size: 0\n\tEngaged: 0\n"));
            assert!(stat.contains("OC  block:\n\tEngaged: 11534336\n"));

            let mut blocks = String::new();
            allocator.dump_blocks(&mut blocks).unwrap();
            assert!(blocks.starts_with("Dump Blocks:\n"));
            assert!(blocks.contains(&format!("\tBlock: {:p}, size 4\n", p.as_ptr())));
            assert!(blocks.contains(", size 11534336\n"));

            allocator.free(big);
            allocator.free(p);

            let mut drained = String::new();
            allocator.dump_stat(&mut drained).unwrap();
            assert!(!drained.contains("OC  block:"));

            let mut empty = String::new();
            allocator.dump_blocks(&mut empty).unwrap();
            assert_eq!(empty, "Dump Blocks:\n");
        }

        allocator.destroy();
    }

    #[test]
    fn identical_after_reinit() {
        let mut allocator = MemoryAllocator::new();

        let round = |allocator: &mut MemoryAllocator| -> Vec<usize> {
            allocator.init();
            unsafe {
                let p = allocator.alloc(7);
                let q = allocator.alloc(128);
                let r = allocator.alloc(550);

                let offsets = vec![
                    p.as_ptr() as usize % 4096,
                    q.as_ptr() as usize % 4096,
                    r.as_ptr() as usize % 8,
                ];

                allocator.free(r);
                allocator.free(q);
                allocator.free(p);

                allocator.destroy();
                offsets
            }
        };

        // The same program against a destroyed-and-reinitialized instance
        // produces structurally identical placements.
        let first = round(&mut allocator);
        let second = round(&mut allocator);
        assert_eq!(first, second);
    }
}
