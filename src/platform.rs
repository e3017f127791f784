use std::ptr::NonNull;

use crate::Pointer;

/// Abstraction over the virtual memory primitive of the underlying kernel.
/// The allocator only ever reserves and commits whole regions of readable
/// and writable memory at an address of the OS's choosing, and later
/// releases each region as a whole. No partial unmaps, no protection
/// changes.
trait PlatformSpecificMemory {
    /// Maps a region where `length` bytes can be written safely. Returns
    /// `None` when the kernel refuses, which callers treat as fatal.
    unsafe fn request_memory(length: usize) -> Pointer<u8>;

    /// Returns the region starting at `address` to the kernel. `length`
    /// must be the exact value the region was requested with.
    unsafe fn return_memory(address: NonNull<u8>, length: usize);
}

/// Zero sized type that implements [`PlatformSpecificMemory`] for each OS.
pub(crate) struct Platform;

/// See [`PlatformSpecificMemory::request_memory`].
#[inline]
pub(crate) unsafe fn request_memory(length: usize) -> Pointer<u8> {
    Platform::request_memory(length)
}

/// See [`PlatformSpecificMemory::return_memory`].
#[inline]
pub(crate) unsafe fn return_memory(address: NonNull<u8>, length: usize) {
    Platform::return_memory(address, length)
}

#[cfg(unix)]
#[cfg(not(miri))]
mod unix {
    use std::ptr::{self, NonNull};

    use super::{Platform, PlatformSpecificMemory};
    use crate::Pointer;

    impl PlatformSpecificMemory for Platform {
        unsafe fn request_memory(length: usize) -> Pointer<u8> {
            // Read-write memory, private to this process, not backed by any
            // file. See https://man7.org/linux/man-pages/man2/mmap.2.html
            let protection = libc::PROT_READ | libc::PROT_WRITE;
            let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

            match libc::mmap(ptr::null_mut(), length, protection, flags, -1, 0) {
                libc::MAP_FAILED => None,
                address => Some(NonNull::new_unchecked(address).cast()),
            }
        }

        unsafe fn return_memory(address: NonNull<u8>, length: usize) {
            if libc::munmap(address.cast().as_ptr(), length) != 0 {
                // The region is still mapped at this point. There's no
                // sensible recovery, but the allocator no longer references
                // it either, so keep going.
                log::error!("munmap({:p}, {length}) failed", address);
            }
        }
    }
}

#[cfg(windows)]
#[cfg(not(miri))]
mod windows {
    use std::ptr::NonNull;

    use windows::Win32::System::Memory;

    use super::{Platform, PlatformSpecificMemory};
    use crate::Pointer;

    impl PlatformSpecificMemory for Platform {
        unsafe fn request_memory(length: usize) -> Pointer<u8> {
            // Unlike mmap, memory has to be reserved first and committed
            // afterwards to become usable. One call can do both. See
            // https://learn.microsoft.com/en-us/windows/win32/api/memoryapi/nf-memoryapi-virtualalloc
            let protection = Memory::PAGE_READWRITE;
            let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT;

            let address = Memory::VirtualAlloc(None, length, flags, protection);

            NonNull::new(address.cast())
        }

        unsafe fn return_memory(address: NonNull<u8>, length: usize) {
            // Length 0 with MEM_RELEASE decommits and releases the whole
            // region in one call.
            let flags = Memory::MEM_RELEASE;

            if !Memory::VirtualFree(address.cast().as_ptr(), 0, flags).as_bool() {
                log::error!("VirtualFree({:p}, {length}) failed", address);
            }
        }
    }
}

#[cfg(miri)]
mod miri {
    //! Miri has no FFI support, so syscalls like `mmap` are out. Mock the
    //! kernel with the global allocator instead; as a bonus, Miri will then
    //! report any region this crate maps and never returns.

    use std::{alloc, ptr::NonNull};

    use super::{Platform, PlatformSpecificMemory};
    use crate::Pointer;

    /// Regions behave as if they were page-aligned.
    const PAGE_ALIGN: usize = 4096;

    fn to_layout(length: usize) -> alloc::Layout {
        alloc::Layout::from_size_align(length, PAGE_ALIGN).unwrap()
    }

    impl PlatformSpecificMemory for Platform {
        unsafe fn request_memory(length: usize) -> Pointer<u8> {
            NonNull::new(alloc::alloc(to_layout(length)))
        }

        unsafe fn return_memory(address: NonNull<u8>, length: usize) {
            alloc::dealloc(address.as_ptr(), to_layout(length));
        }
    }
}
