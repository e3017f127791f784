//! A tiered general-purpose memory allocator. Requests are classified by
//! size and served by one of three engines, each of which owns the regions
//! it maps and recycles memory in place:
//!
//! ```text
//!                     +------------------------+
//!  alloc(n) --------> |    MemoryAllocator     | ----> bookkeeping record
//!                     |      (dispatcher)      |       {chunk, size}
//!                     +------------------------+
//!                       |          |         |
//!            n < 512    |          |         |   n >= 10 MiB
//!                       v          |         v
//!             +-----------------+  |  +-------------+
//!             | FixedSizeAlloc  |  |  |   OS path   |
//!             | 16 .. 512 byte  |  |  | one region  |
//!             | slot pages      |  |  | per request |
//!             +-----------------+  |  +-------------+
//!                                  |
//!                    512 <= n < 10 MiB
//!                                  v
//!                     +----------------------+
//!                     | CoalescingAllocator  |
//!                     | first fit free list, |
//!                     | boundary merging     |
//!                     +----------------------+
//! ```
//!
//! The fixed-size engine keeps one instance per size class and hands out
//! equal-sized slots from 4 KiB pages, threading recycled slots through an
//! intrusive index list. The coalescing engine carves variable-sized blocks
//! out of 10 MiB buffers and merges address-adjacent free blocks on release.
//! Requests of 10 MiB and above bypass both and get a dedicated mapping.
//!
//! `free` never guesses which engine produced a pointer: the dispatcher
//! records every outstanding allocation in a ledger and routes the release
//! through the exact same classifier that served it.
//!
//! All three engines follow the same life cycle, `init` -> `alloc`/`free` ->
//! `destroy`, and may be re-`init`ed after `destroy`. None of them is thread
//! safe; callers synchronize externally.

use std::ptr::NonNull;

mod coalesce;
mod dispatcher;
mod fsa;
mod ledger;
mod platform;
mod region;
mod state;

/// Non-null pointer to `T`. Used instead of `*mut T` wherever null is a
/// meaningful list terminator, so the compiler forces us to handle the
/// `None` case.
pub(crate) type Pointer<T> = Option<NonNull<T>>;

pub use coalesce::CoalescingAllocator;
pub use dispatcher::MemoryAllocator;
pub use fsa::FixedSizeAllocator;
