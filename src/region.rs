//! The audited seam between the engines and the OS. Every page, buffer and
//! large block in this crate is one region obtained here, identified by its
//! base address and length, and released as a whole.

use std::ptr::NonNull;

use log::{error, trace};

use crate::platform;

/// Maps a region of `length` readable and writable bytes at an address of
/// the OS's choosing. The base is page-aligned.
///
/// There is no error path: the allocator's contract is to never return a
/// bad pointer, so when the kernel is out of address space the process is
/// aborted on the spot, before any engine state is touched.
pub(crate) fn map_region(length: usize) -> NonNull<u8> {
    match unsafe { platform::request_memory(length) } {
        Some(base) => {
            trace!("mapped {length} byte region at {:p}", base);
            base
        }
        None => {
            error!("virtual memory exhausted mapping a {length} byte region");
            std::process::abort();
        }
    }
}

/// Releases the region starting at `base`. `length` must be the exact value
/// passed to [`map_region`].
///
/// # Safety
///
/// `base` must come from [`map_region`] and the region must not be unmapped
/// twice. No pointer into the region may be used afterwards.
pub(crate) unsafe fn unmap_region(base: NonNull<u8>, length: usize) {
    trace!("unmapping {length} byte region at {:p}", base);
    platform::return_memory(base, length);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_and_unmap() {
        let length = 4096;
        let base = map_region(length);

        unsafe {
            // The whole region must be writable and hold what we store.
            for offset in 0..length {
                *base.as_ptr().add(offset) = (offset % 251) as u8;
            }
            for offset in 0..length {
                assert_eq!(*base.as_ptr().add(offset), (offset % 251) as u8);
            }

            unmap_region(base, length);
        }
    }

    #[test]
    fn distinct_regions() {
        let first = map_region(4096);
        let second = map_region(4096);

        assert_ne!(first, second);

        unsafe {
            unmap_region(first, 4096);
            unmap_region(second, 4096);
        }
    }
}
