//! Region sources and the allocation engine.
//!
//! ## Basic Types
//!
//! ### [`RegionSource`](trait.RegionSource.html)
//!
//! `RegionSource` is a simple trait interface meant to abstract over the
//! calls to the OS that obtain fresh page-backed memory. Regions are only
//! ever requested, never returned; recycling freed blocks is the block
//! directory's job.
//!
//! ### [`MmapRegionSource`](struct.MmapRegionSource.html)
//!
//! A `MmapRegionSource` requests anonymous virtual-memory pages from the
//! Unix OS. This is the source a real heap runs on.
//!
//! ### [`FixedRegion`](struct.FixedRegion.html)
//!
//! A `FixedRegion` carves regions out of one owned buffer and can pretend
//! to be the OS. Successive regions are contiguous and placement is
//! deterministic, which makes it the source the tests run on.
//!
//! ### [`Allocator`](struct.Allocator.html)
//!
//! An `Allocator` is the engine: the four public operations (allocate,
//! free, zero-allocate, resize) composed from block-directory primitives
//! and the active fit policy, with counters and an operation journal
//! observing every call. It is single-threaded by design; every mutating
//! operation takes `&mut self`, and a multithreaded port would have to
//! wrap the whole engine in its own mutual exclusion.

use std::fmt;
use std::ptr::{self, NonNull};

use errno::Errno;
use log::{debug, warn};
use thiserror::Error;

use crate::blocklist::{
    BlockCheck, BlockDirectory, BlockRef, HeapUsage, Validity, ALIGNMENT, HEADER_SIZE,
};
use crate::journal::{HeapStats, Journal, OpCounters, OpKind};
use crate::policy::FitPolicy;

/// Round `value` up to the nearest multiple of the alignment quantum.
/// Zero rounds up to one quantum, so no useful block is ever zero bytes.
pub fn align_up(value: usize) -> usize {
    if value == 0 {
        return ALIGNMENT;
    }
    ALIGNMENT * ((value - 1) / ALIGNMENT + 1)
}

pub trait RegionSource {
    type Err: fmt::Display;

    /// Obtain a fresh region of at least `size` bytes.
    ///
    /// # Safety
    ///
    /// For this to function properly with the other types in this module:
    ///
    /// - the returned region must be readable, writable, at least `size`
    ///   bytes, and aligned to [`ALIGNMENT`];
    /// - the memory must be untracked by any other Rust code, including
    ///   the allocator itself, until a block header is written into it;
    /// - the region must stay mapped for the life of the source.
    unsafe fn request(&mut self, size: usize) -> Result<NonNull<u8>, Self::Err>;

    /// How many regions have been handed out so far.
    fn regions(&self) -> usize;
}

/// Requests anonymous pages from the operating system via `mmap`.
///
/// Mappings are never released: freed blocks are recycled by the
/// directory instead of being returned to the OS, so dropping this source
/// leaks its regions on purpose.
#[cfg(unix)]
#[derive(Default)]
pub struct MmapRegionSource {
    regions: usize,
    pages: usize,
}

/// The mapping call failed, e.g. on address-space exhaustion.
#[cfg(unix)]
#[derive(Debug, Error)]
#[error("mmap failed: {0}")]
pub struct MmapError(Errno);

#[cfg(unix)]
impl MmapRegionSource {
    /// Whole pages mapped so far, for accounting.
    pub fn pages(&self) -> usize {
        self.pages
    }
}

#[cfg(unix)]
impl RegionSource for MmapRegionSource {
    type Err = MmapError;

    unsafe fn request(&mut self, size: usize) -> Result<NonNull<u8>, MmapError> {
        let ptr = libc::mmap(
            // Address we want the memory at. We don't care, so null it is.
            ptr::null_mut(),
            // Amount of memory to allocate.
            size,
            // We want read/write access to this memory.
            libc::PROT_WRITE | libc::PROT_READ,
            // MAP_ANON: no file descriptor, we're just going to use the
            // memory. MAP_PRIVATE: not shared with any other process.
            libc::MAP_ANON | libc::MAP_PRIVATE,
            // The file descriptor for a mapped file; none here.
            -1,
            0,
        );

        if ptr == libc::MAP_FAILED {
            return Err(MmapError(errno::errno()));
        }

        let pagesize = sysconf::page::pagesize();
        self.pages += (size + pagesize - 1) / pagesize;
        self.regions += 1;

        Ok(NonNull::new_unchecked(ptr as *mut u8))
    }

    fn regions(&self) -> usize {
        self.regions
    }
}

/// A fixed-capacity arena pretending to be the operating system.
///
/// The backing buffer is boxed (and `u64`-based, so every carved region is
/// 8-aligned); the source itself can move freely without disturbing blocks
/// already handed out.
pub struct FixedRegion {
    buf: Box<[u64]>,
    offset: usize,
    regions: usize,
}

/// The arena has no room left for the requested region.
#[derive(Debug, Error)]
#[error("fixed region exhausted: {requested} bytes requested, {available} available")]
pub struct RegionExhausted {
    requested: usize,
    available: usize,
}

impl FixedRegion {
    pub fn with_capacity(bytes: usize) -> FixedRegion {
        FixedRegion {
            buf: vec![0u64; align_up(bytes) / ALIGNMENT].into_boxed_slice(),
            offset: 0,
            regions: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len() * ALIGNMENT
    }

    /// Bytes handed out so far.
    pub fn used(&self) -> usize {
        self.offset
    }
}

impl Default for FixedRegion {
    fn default() -> Self {
        FixedRegion::with_capacity(256 * 1024)
    }
}

impl RegionSource for FixedRegion {
    type Err = RegionExhausted;

    unsafe fn request(&mut self, size: usize) -> Result<NonNull<u8>, RegionExhausted> {
        let size = align_up(size);
        if self.offset + size > self.capacity() {
            return Err(RegionExhausted {
                requested: size,
                available: self.capacity() - self.offset,
            });
        }

        let region = (self.buf.as_mut_ptr() as *mut u8).add(self.offset);
        self.offset += size;
        self.regions += 1;
        Ok(NonNull::new_unchecked(region))
    }

    fn regions(&self) -> usize {
        self.regions
    }
}

/// Errors surfaced at the allocation-engine boundary.
///
/// Every failure resolves to an ordinary value here; nothing in the engine
/// aborts the process.
#[derive(Copy, Clone, Debug, Error, PartialEq, Eq)]
pub enum AllocError {
    /// The region source could not obtain a new region.
    #[error("out of memory: the region source could not obtain a new region")]
    OutOfMemory,
    /// `zero_allocate` was asked for more bytes than `usize` can express.
    #[error("allocation size overflow: {count} items of {element_size} bytes")]
    SizeOverflow { count: usize, element_size: usize },
}

/// The allocation engine.
///
/// All allocator state lives on this context object: the block directory,
/// the active fit policy, the per-operation call counters, and the
/// operation journal. Several engines with different policies can run side
/// by side, each over its own source.
pub struct Allocator<S> {
    /// The region source; public so callers and tests can inspect its
    /// accounting directly.
    pub source: S,
    directory: BlockDirectory,
    policy: FitPolicy,
    counters: OpCounters,
    journal: Journal,
}

/// The allocator over real OS page mappings.
#[cfg(unix)]
pub type MmapAllocator = Allocator<MmapRegionSource>;

impl<S: RegionSource + Default> Default for Allocator<S> {
    fn default() -> Self {
        Allocator::new(S::default())
    }
}

impl<S: RegionSource> Allocator<S> {
    pub fn new(source: S) -> Allocator<S> {
        Allocator::with_policy(source, FitPolicy::default())
    }

    pub fn with_policy(source: S, policy: FitPolicy) -> Allocator<S> {
        Allocator {
            source,
            directory: BlockDirectory::default(),
            policy,
            counters: OpCounters::default(),
            journal: Journal::default(),
        }
    }

    pub fn policy(&self) -> FitPolicy {
        self.policy
    }

    pub fn set_policy(&mut self, policy: FitPolicy) {
        self.policy = policy;
    }

    pub fn directory(&self) -> &BlockDirectory {
        &self.directory
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    /// Release every journal entry at once.
    pub fn clear_journal(&mut self) {
        self.journal.clear();
    }

    pub fn counters(&self) -> OpCounters {
        self.counters
    }

    /// One directory walk summing used and free bytes.
    pub fn usage(&self) -> HeapUsage {
        self.directory.usage()
    }

    /// The four call counters plus a usage walk.
    pub fn stats(&self) -> HeapStats {
        HeapStats {
            counters: self.counters,
            usage: self.directory.usage(),
        }
    }

    /// Check the directory's structural invariants.
    pub fn verify(&self) -> Validity {
        self.directory.verify()
    }

    /// Diagnostic dump of one block's header fields, by payload address.
    pub fn check_block(&self, ptr: NonNull<u8>) -> Option<BlockCheck> {
        self.directory.check_block(ptr)
    }

    /// Map a new region sized for a `size`-byte payload and adopt it as a
    /// block linked after `after`.
    fn extend(&mut self, after: Option<BlockRef>, size: usize) -> Result<BlockRef, AllocError> {
        let len = HEADER_SIZE + size;
        let region = match unsafe { self.source.request(len) } {
            Ok(region) => region,
            Err(err) => {
                warn!("region request for {} bytes failed: {}", len, err);
                return Err(AllocError::OutOfMemory);
            }
        };
        Ok(unsafe { self.directory.append_raw(region, size, after) })
    }

    /// Allocate `size` bytes and return the payload address.
    ///
    /// A request for 0 bytes is normalized to one alignment quantum; all
    /// sizes round up to 8-byte multiples. The journal entry and counter
    /// bump happen before the attempt, so they record intent.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        self.counters.allocate += 1;
        let size = align_up(size);
        self.journal.record(OpKind::Allocate, size, self.counters.allocate);
        debug!("allocate: {} bytes ({})", size, self.policy);

        let block = match self.directory.head() {
            None => self.extend(None, size)?,
            Some(_) => {
                let selection = self.policy.select(&self.directory, size);
                match selection.hit {
                    Some(mut block) => {
                        self.directory.split(block, size);
                        block.set_free(false);
                        block
                    }
                    None => self.extend(selection.last, size)?,
                }
            }
        };

        Ok(block.payload())
    }

    /// Release the block starting at `ptr`.
    ///
    /// A pointer that is not the exact start of a live block is ignored
    /// (with a warning); the counter and journal still record the call.
    pub fn free(&mut self, ptr: NonNull<u8>) {
        self.counters.free += 1;
        self.journal.record(OpKind::Free, 0, self.counters.free);

        let mut block = match self.directory.find_payload(ptr) {
            Some(block) => block,
            None => {
                warn!("free: {:p} is not the start of a live block, ignoring", ptr);
                return;
            }
        };

        block.set_free(true);
        let merged = self.directory.coalesce(block);
        debug!("free: {:p} now part of a {}-byte free block", ptr, merged.size());
    }

    /// Allocate room for `count` items of `element_size` bytes each and
    /// zero the whole payload.
    ///
    /// The multiplication is checked: overflow is an explicit error, never
    /// a silently wrapped tiny allocation.
    pub fn zero_allocate(
        &mut self,
        count: usize,
        element_size: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        self.counters.zero_allocate += 1;

        let total = match count.checked_mul(element_size) {
            Some(total) => total,
            None => {
                self.journal
                    .record(OpKind::ZeroAllocate, usize::MAX, self.counters.zero_allocate);
                warn!(
                    "zero_allocate: {} x {} bytes overflows the address space",
                    count, element_size,
                );
                return Err(AllocError::SizeOverflow {
                    count,
                    element_size,
                });
            }
        };
        self.journal
            .record(OpKind::ZeroAllocate, total, self.counters.zero_allocate);

        let payload = self.allocate(total)?;
        unsafe {
            ptr::write_bytes(payload.as_ptr(), 0, align_up(total));
        }
        Ok(payload)
    }

    /// Resize the block at `ptr` to `new_size` bytes.
    ///
    /// `None` behaves as a plain allocation; `new_size == 0` behaves as a
    /// free and yields `Ok(None)`. A block that already satisfies the
    /// request is returned unchanged (no shrink-split). When the immediate
    /// successor is free, physically adjacent, and together large enough,
    /// it is absorbed in place, avoiding a copy. Otherwise the contents
    /// move to a fresh block through the public allocate and free, which
    /// count and journal as themselves.
    pub fn resize(
        &mut self,
        ptr: Option<NonNull<u8>>,
        new_size: usize,
    ) -> Result<Option<NonNull<u8>>, AllocError> {
        self.counters.resize += 1;
        self.journal.record(OpKind::Resize, new_size, self.counters.resize);

        let ptr = match ptr {
            None => return self.allocate(new_size).map(Some),
            Some(ptr) => ptr,
        };
        if new_size == 0 {
            self.free(ptr);
            return Ok(None);
        }

        let block = match self.directory.find_payload(ptr) {
            Some(block) => block,
            None => {
                warn!("resize: {:p} is not the start of a live block, ignoring", ptr);
                return Ok(None);
            }
        };

        if block.size() >= new_size {
            return Ok(Some(ptr));
        }

        if self.directory.try_absorb_next(block, new_size) {
            debug!("resize: {:p} grew in place to {} bytes", ptr, block.size());
            return Ok(Some(ptr));
        }

        let old_size = block.size();
        let fresh = self.allocate(new_size)?;
        unsafe {
            ptr::copy_nonoverlapping(ptr.as_ptr(), fresh.as_ptr(), old_size);
        }
        self.free(ptr);
        Ok(Some(fresh))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_env_log::test;

    fn arena(bytes: usize) -> Allocator<FixedRegion> {
        Allocator::new(FixedRegion::with_capacity(bytes))
    }

    #[test]
    fn align_up_rounds_to_the_quantum() {
        assert_eq!(align_up(0), 8);
        assert_eq!(align_up(1), 8);
        assert_eq!(align_up(8), 8);
        assert_eq!(align_up(9), 16);
        assert_eq!(align_up(129), 136);
    }

    #[test]
    fn first_allocation_roots_the_heap() {
        let mut heap = arena(4096);
        let ptr = heap.allocate(64).unwrap();

        let root = heap.directory().head().expect("heap has a root");
        assert_eq!(root.payload(), ptr);
        assert_eq!(root.size(), 64);
        assert!(!root.is_free());
        assert_eq!(heap.source.regions(), 1);
    }

    #[test]
    fn a_miss_extends_after_the_last_block() {
        let mut heap = arena(4096);
        let first = heap.allocate(64).unwrap();
        let second = heap.allocate(64).unwrap();

        assert_ne!(first, second);
        assert_eq!(heap.source.regions(), 2);
        assert_eq!(heap.directory().len(), 2);
        assert!(heap.verify().is_valid());
    }

    #[test]
    fn a_hit_splits_when_the_slack_is_usable() {
        let mut heap = arena(4096);
        let big = heap.allocate(256).unwrap();
        heap.free(big);

        let small = heap.allocate(64).unwrap();
        assert_eq!(small, big, "the freed block is recycled");

        // 256 - 64 leaves room for a header plus a viable payload.
        let usage = heap.usage();
        assert_eq!(usage.used_bytes, 64);
        assert_eq!(usage.free_bytes, 256 - 64 - HEADER_SIZE);
        assert_eq!(heap.source.regions(), 1);
    }

    #[test]
    fn a_hit_keeps_unusable_slack_attached() {
        let mut heap = arena(4096);
        let big = heap.allocate(96).unwrap();
        heap.free(big);

        // Slack of 32 bytes cannot host a header, so the whole block is
        // handed back.
        let reused = heap.allocate(64).unwrap();
        assert_eq!(reused, big);
        assert_eq!(heap.usage().used_bytes, 96);
        assert_eq!(heap.directory().len(), 1);
    }

    #[test]
    fn exhaustion_is_an_ordinary_error() {
        let mut heap = arena(128);
        assert_eq!(heap.allocate(4096), Err(AllocError::OutOfMemory));

        // The attempt was still counted and journaled.
        assert_eq!(heap.counters().allocate, 1);
        assert_eq!(heap.journal().len(), 1);
    }

    #[test]
    fn free_of_an_interior_pointer_is_ignored() {
        let mut heap = arena(4096);
        let ptr = heap.allocate(64).unwrap();
        let interior = NonNull::new(unsafe { ptr.as_ptr().add(8) }).unwrap();

        heap.free(interior);

        assert_eq!(heap.usage().used_bytes, 64);
        assert_eq!(heap.counters().free, 1);
        assert_eq!(heap.journal().len(), 2);
    }

    #[test]
    fn double_free_is_a_noop() {
        let mut heap = arena(4096);
        let ptr = heap.allocate(64).unwrap();
        heap.free(ptr);
        let usage = heap.usage();

        heap.free(ptr);

        assert_eq!(heap.usage(), usage);
        assert_eq!(heap.counters().free, 2);
        assert!(heap.verify().is_valid());
    }

    #[test]
    fn zero_allocate_overflow_fails_explicitly() {
        let mut heap = arena(4096);
        let result = heap.zero_allocate(usize::MAX, 2);

        assert_eq!(
            result,
            Err(AllocError::SizeOverflow {
                count: usize::MAX,
                element_size: 2,
            })
        );
        // No region was ever requested.
        assert_eq!(heap.source.regions(), 0);
        assert_eq!(heap.counters().zero_allocate, 1);
        assert_eq!(heap.counters().allocate, 0);
    }

    #[test]
    fn resize_of_an_unknown_pointer_is_ignored() {
        let mut heap = arena(4096);
        let ptr = heap.allocate(64).unwrap();
        let interior = NonNull::new(unsafe { ptr.as_ptr().add(16) }).unwrap();

        assert_eq!(heap.resize(Some(interior), 128), Ok(None));
        assert_eq!(heap.usage().used_bytes, 64);
    }

    #[test]
    fn resize_absorbs_an_adjacent_free_successor() {
        let mut heap = arena(4096);
        let first = heap.allocate(64).unwrap();
        let second = heap.allocate(64).unwrap();
        let _guard = heap.allocate(8).unwrap();
        heap.free(second);

        let resized = heap.resize(Some(first), 100).unwrap();

        assert_eq!(resized, Some(first), "grown in place, no copy");
        let check = heap.check_block(first).unwrap();
        assert_eq!(check.size, 64 + HEADER_SIZE + 64);
        // Only the original three regions were ever mapped.
        assert_eq!(heap.source.regions(), 3);
    }

    #[test]
    fn set_policy_changes_selection() {
        let mut heap = arena(8192);
        assert_eq!(heap.policy(), FitPolicy::FirstFit);
        heap.set_policy(FitPolicy::WorstFit);
        assert_eq!(heap.policy(), FitPolicy::WorstFit);
    }

    #[cfg(unix)]
    #[test]
    fn mmap_source_backs_a_real_heap() {
        let mut heap = MmapAllocator::default();
        let ptr = heap.allocate(128).unwrap();

        unsafe {
            ptr::write_bytes(ptr.as_ptr(), 0x5A, 128);
            assert_eq!(*ptr.as_ptr().add(127), 0x5A);
        }

        heap.free(ptr);
        assert_eq!(heap.source.regions(), 1);
        assert!(heap.source.pages() >= 1);
        assert!(heap.verify().is_valid());
    }
}
