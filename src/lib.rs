//! A small, policy-pluggable memory allocator built directly on raw
//! page-granularity mappings.
//!
//! The crate exists to make heap mechanics observable: blocks, splitting,
//! coalescing, fit policies, and fragmentation are all first-class and
//! inspectable, below the level the standard allocation interfaces expose.
//!
//! ## The pieces
//!
//! - [`BlockDirectory`](blocklist::BlockDirectory) threads a header through
//!   every block of every region ever mapped, used and free alike, and owns
//!   splitting, merging, and pointer validation.
//! - [`FitPolicy`](policy::FitPolicy) picks among qualifying free blocks:
//!   first-fit, best-fit, or worst-fit, all as a single forward scan.
//! - [`RegionSource`](allocators::RegionSource) abstracts the OS: real
//!   anonymous mappings ([`MmapRegionSource`](allocators::MmapRegionSource))
//!   or a deterministic in-process arena
//!   ([`FixedRegion`](allocators::FixedRegion)) for tests.
//! - [`Allocator`](allocators::Allocator) composes those into the four
//!   public operations: allocate, free, zero-allocate, resize.
//! - [`Journal`](journal::Journal) and the usage/statistics reports observe
//!   every call without influencing any of them.
//!
//! ## Example
//!
//! ```
//! use fitalloc::{Allocator, FitPolicy, FixedRegion};
//!
//! let mut heap = Allocator::with_policy(FixedRegion::default(), FitPolicy::BestFit);
//!
//! let ptr = heap.allocate(64)?;
//! unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0xAB, 64) };
//! heap.free(ptr);
//!
//! assert_eq!(heap.counters().allocate, 1);
//! println!("{}", heap.stats());
//! # Ok::<(), fitalloc::AllocError>(())
//! ```
//!
//! ## Limitations
//!
//! - **Single-threaded**: every mutating operation takes `&mut self`;
//!   there is no internal locking, and a multithreaded port must wrap the
//!   whole engine in its own mutual exclusion.
//! - **Memory is never returned to the OS**: freed blocks are recycled
//!   through the free list, and regions stay mapped until the process
//!   exits.
//! - **Metadata is trusted**: headers live in the managed memory itself,
//!   and nothing defends against a caller scribbling over them.

pub mod allocators;
pub mod blocklist;
pub mod journal;
pub mod policy;

pub use allocators::{align_up, AllocError, Allocator, FixedRegion, RegionSource};
#[cfg(unix)]
pub use allocators::{MmapAllocator, MmapRegionSource};
pub use blocklist::{
    BlockCheck, BlockDirectory, BlockRef, HeapUsage, Validity, ALIGNMENT, HEADER_SIZE,
};
pub use journal::{HeapStats, Journal, JournalEntry, OpCounters, OpKind};
pub use policy::{FitPolicy, UnknownPolicy};
