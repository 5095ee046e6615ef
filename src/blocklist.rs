//! The block directory: every block of heap memory, used or free, threaded
//! through the mapped regions themselves.
//!
//! Each block is a fixed-size [`BlockHeader`] written directly into raw
//! memory, immediately followed by its payload. Headers link to their
//! neighbors in address order, forming one doubly linked list across every
//! region the allocator has ever obtained. The directory owns all header
//! memory; callers own payload contents between allocation and free.
//!
//! All raw-pointer manipulation in the crate is confined to this module:
//! [`BlockRef`] is the handle the rest of the crate uses, and its methods
//! (plus [`BlockDirectory::append_raw`]) are the only places a header is
//! read or written in place.

use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::ptr::NonNull;

use log::trace;
use static_assertions::const_assert;

/// Alignment quantum for payload sizes and payload addresses.
pub const ALIGNMENT: usize = 8;

/// Smallest leftover payload worth carving into a block of its own when
/// splitting; a remainder smaller than this (plus a header) stays attached
/// to the allocated block.
pub const MIN_SPLIT_PAYLOAD: usize = 4;

/// The header prefixed to every block.
///
/// We use C representation so the layout is the same fixed shape everywhere
/// a header is written into raw memory. The payload pointer is stored
/// redundantly (it always equals the address just past the header); pointer
/// validation compares it against caller-supplied addresses exactly, so a
/// pointer into the middle of a payload can never pass for a block start.
#[repr(C)]
pub struct BlockHeader {
    size: usize,
    prev: Option<NonNull<BlockHeader>>,
    next: Option<NonNull<BlockHeader>>,
    payload: NonNull<u8>,
    free: bool,
}

/// The fixed metadata overhead prefixed to every payload.
pub const HEADER_SIZE: usize = mem::size_of::<BlockHeader>();

// Headers are written at 8-aligned addresses and payloads start right after
// them, so the header size must keep payloads aligned too.
const_assert!(HEADER_SIZE % ALIGNMENT == 0);
const_assert!(mem::align_of::<BlockHeader>() <= ALIGNMENT);

/// A copyable handle to a block header somewhere in mapped memory.
///
/// Invariants, shared with [`BlockDirectory`]:
///
/// - the wrapped pointer refers to a live, initialized header inside a
///   region the directory owns;
/// - `prev` and `next` mirror each other exactly;
/// - the stored payload pointer equals the address just past the header.
///
/// Handles stay valid for the life of the allocator because blocks never
/// move and regions are never unmapped.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct BlockRef {
    header: NonNull<BlockHeader>,
}

impl BlockRef {
    /// Write a fresh, in-use header at the start of `region` and return a
    /// handle to it.
    ///
    /// # Safety
    ///
    /// `region` must be writable, at least `HEADER_SIZE + size` bytes,
    /// aligned to [`ALIGNMENT`], and untracked by any other code. Linking
    /// into the directory is the caller's responsibility.
    unsafe fn init(region: NonNull<u8>, size: usize, prev: Option<BlockRef>) -> BlockRef {
        let payload = NonNull::new_unchecked(region.as_ptr().add(HEADER_SIZE));
        let header = BlockHeader {
            size,
            prev: prev.map(|block| block.header),
            next: None,
            payload,
            free: false,
        };
        let ptr = region.cast::<BlockHeader>();
        std::ptr::write(ptr.as_ptr(), header);
        BlockRef { header: ptr }
    }

    fn view(&self) -> &BlockHeader {
        unsafe { self.header.as_ref() }
    }

    unsafe fn header_mut(&mut self) -> &mut BlockHeader {
        self.header.as_mut()
    }

    /// Payload byte count (always a multiple of [`ALIGNMENT`], except for
    /// blocks grown by in-place absorption, which also gain a header's
    /// worth of bytes).
    pub fn size(&self) -> usize {
        self.view().size
    }

    pub fn is_free(&self) -> bool {
        self.view().free
    }

    /// Canonical start-of-payload address handed to callers.
    pub fn payload(&self) -> NonNull<u8> {
        self.view().payload
    }

    /// First byte past the payload; where a physically adjacent successor's
    /// header would sit.
    pub fn payload_end(&self) -> *const u8 {
        unsafe { self.view().payload.as_ptr().add(self.view().size) as *const u8 }
    }

    pub fn next(&self) -> Option<BlockRef> {
        self.view().next.map(|header| BlockRef { header })
    }

    pub fn prev(&self) -> Option<BlockRef> {
        self.view().prev.map(|header| BlockRef { header })
    }

    /// Address of the header itself, for ordering and adjacency checks.
    pub fn header_addr(&self) -> *const u8 {
        self.header.as_ptr() as *const u8
    }

    /// Whether `next` starts exactly where this block's payload ends.
    /// Merging and in-place growth are only legal across such a seam;
    /// list neighbors from separately mapped regions may not touch.
    pub fn is_adjacent_to(&self, next: &BlockRef) -> bool {
        self.payload_end() == next.header_addr()
    }

    pub(crate) fn set_free(&mut self, free: bool) {
        unsafe { self.header_mut().free = free }
    }

    fn set_size(&mut self, size: usize) {
        unsafe { self.header_mut().size = size }
    }

    fn set_next(&mut self, next: Option<BlockRef>) {
        unsafe { self.header_mut().next = next.map(|block| block.header) }
    }

    fn set_prev(&mut self, prev: Option<BlockRef>) {
        unsafe { self.header_mut().prev = prev.map(|block| block.header) }
    }
}

impl fmt::Debug for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Block({:p}, {}, {})",
            self.header_addr(),
            self.size(),
            if self.is_free() { "free" } else { "used" },
        )
    }
}

/// The directory of every block in every region ever obtained, in creation
/// order (which is address order within a region, and for contiguous
/// regions overall).
///
/// Blocks are created when the heap extends, split when a request is
/// smaller than its match, merged when adjacent blocks are both free, and
/// never destroyed: freed blocks are recycled, not returned to the OS.
pub struct BlockDirectory {
    head: Option<BlockRef>,
}

// A BlockDirectory is sendable: as long as the whole chain moves between
// threads together, the raw links stay consistent. It is not Sync; there is
// no interior locking anywhere in this design.
unsafe impl Send for BlockDirectory {}

impl Default for BlockDirectory {
    fn default() -> Self {
        BlockDirectory { head: None }
    }
}

impl BlockDirectory {
    /// The heap root: the first block of the first region, updated if a
    /// merge ever produces a new first block.
    pub fn head(&self) -> Option<BlockRef> {
        self.head
    }

    /// Adopt a fresh region as a new in-use block linked after `after`
    /// (the current tail), or as the heap root when the directory is empty.
    ///
    /// # Safety
    ///
    /// `region` must be writable, at least `HEADER_SIZE + size` bytes,
    /// aligned to [`ALIGNMENT`], owned by nothing else, and must outlive
    /// the directory.
    pub(crate) unsafe fn append_raw(
        &mut self,
        region: NonNull<u8>,
        size: usize,
        after: Option<BlockRef>,
    ) -> BlockRef {
        debug_assert!(after.map_or(true, |block| block.next().is_none()));
        let block = BlockRef::init(region, size, after);
        match after {
            Some(mut tail) => tail.set_next(Some(block)),
            None => {
                debug_assert!(self.head.is_none());
                self.head = Some(block);
            }
        }
        block
    }

    /// Carve the tail of `block` into a new free block, leaving `block`
    /// shrunk to `size` payload bytes.
    ///
    /// No-op (returns `false`) when the remainder could not host a header
    /// plus [`MIN_SPLIT_PAYLOAD`] bytes; an unusable fragment is worse than
    /// a little internal slack.
    pub(crate) fn split(&mut self, mut block: BlockRef, size: usize) -> bool {
        debug_assert_eq!(size % ALIGNMENT, 0);
        if block.size() < size + HEADER_SIZE + MIN_SPLIT_PAYLOAD {
            return false;
        }

        let remainder = block.size() - size - HEADER_SIZE;
        let region = unsafe { NonNull::new_unchecked(block.payload().as_ptr().add(size)) };
        let mut rest = unsafe { BlockRef::init(region, remainder, Some(block)) };
        rest.set_free(true);
        rest.set_next(block.next());
        if let Some(mut successor) = block.next() {
            successor.set_prev(Some(rest));
        }
        block.set_next(Some(rest));
        block.set_size(size);

        trace!(
            "split {:p}: kept {} bytes, carved free remainder of {}",
            block.header_addr(),
            size,
            remainder,
        );
        true
    }

    /// Merge a freed block with its physically adjacent free neighbors.
    ///
    /// Walks backward first so the survivor is always the lowest-addressed
    /// member of the free run, then absorbs forward, adding each neighbor's
    /// header and payload into the survivor and splicing the neighbor out.
    /// Re-roots the heap if the survivor has no predecessor. Returns the
    /// survivor.
    pub(crate) fn coalesce(&mut self, block: BlockRef) -> BlockRef {
        let mut current = block;
        while let Some(prev) = current.prev() {
            if !prev.is_free() || !prev.is_adjacent_to(&current) {
                break;
            }
            current = prev;
        }

        while let Some(mut next) = current.next() {
            if !next.is_free() || !current.is_adjacent_to(&next) {
                break;
            }
            trace!("coalesce: {:?} absorbs {:?}", current, next);
            current.set_size(current.size() + HEADER_SIZE + next.size());
            current.set_next(next.next());
            if let Some(mut successor) = next.next() {
                successor.set_prev(Some(current));
            }
        }

        if current.prev().is_none() {
            self.head = Some(current);
        }
        current
    }

    /// Splice a physically adjacent free successor into `block` so it can
    /// grow in place to at least `needed` bytes. Returns whether the
    /// absorption happened.
    pub(crate) fn try_absorb_next(&mut self, mut block: BlockRef, needed: usize) -> bool {
        let next = match block.next() {
            Some(next) => next,
            None => return false,
        };
        if !next.is_free() || !block.is_adjacent_to(&next) {
            return false;
        }
        let combined = block.size() + HEADER_SIZE + next.size();
        if combined < needed {
            return false;
        }

        block.set_size(combined);
        block.set_next(next.next());
        if let Some(mut successor) = next.next() {
            successor.set_prev(Some(block));
        }
        trace!("absorb: {:p} grew to {} bytes in place", block.header_addr(), combined);
        true
    }

    /// The pointer-validity oracle: find the block whose stored payload
    /// address equals `ptr` exactly. A linear walk over every block; the
    /// cost is an accepted consequence of keeping the design simple.
    pub fn find_payload(&self, ptr: NonNull<u8>) -> Option<BlockRef> {
        self.iter().find(|block| block.payload() == ptr)
    }

    pub fn iter(&self) -> BlockIter<'_> {
        BlockIter {
            next: self.head,
            _directory: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// One walk summing used and free bytes and block counts.
    pub fn usage(&self) -> HeapUsage {
        let mut usage = HeapUsage::default();
        for block in self.iter() {
            if block.is_free() {
                usage.free_bytes += block.size();
                usage.free_blocks += 1;
            } else {
                usage.used_bytes += block.size();
                usage.used_blocks += 1;
            }
        }
        usage
    }

    /// Check structural invariants without touching anything.
    pub fn verify(&self) -> Validity {
        let mut validity = Validity::default();
        let mut previous: Option<BlockRef> = None;

        for block in self.iter() {
            if let Some(prev) = previous {
                match block.prev() {
                    Some(back) if back == prev => {}
                    _ => validity.broken_links += 1,
                }
                if prev.header_addr() >= block.header_addr() {
                    validity.out_of_orders += 1;
                } else if prev.payload_end() > block.header_addr() {
                    validity.overlaps += 1;
                }
                if prev.is_free() && block.is_free() && prev.is_adjacent_to(&block) {
                    validity.adjacent_frees += 1;
                }
            } else if block.prev().is_some() {
                validity.broken_links += 1;
            }
            previous = Some(block);
        }

        validity
    }

    /// Diagnostic view of one block's header, by payload address.
    pub fn check_block(&self, ptr: NonNull<u8>) -> Option<BlockCheck> {
        let block = self.find_payload(ptr)?;
        let prev = block.prev();
        let next = block.next();
        Some(BlockCheck {
            size: block.size(),
            free: block.is_free(),
            header: block.header_addr(),
            payload_start: block.payload().as_ptr() as *const u8,
            payload_end: block.payload_end(),
            prev: prev.map(|b| b.header_addr()),
            next: next.map(|b| b.header_addr()),
            prev_mergeable: prev
                .map_or(false, |p| block.is_free() && p.is_free() && p.is_adjacent_to(&block)),
            next_mergeable: next
                .map_or(false, |n| block.is_free() && n.is_free() && block.is_adjacent_to(&n)),
        })
    }
}

impl<'dir> IntoIterator for &'dir BlockDirectory {
    type Item = BlockRef;
    type IntoIter = BlockIter<'dir>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl fmt::Display for BlockDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockDirectory(")?;
        let mut start = true;
        for block in self {
            if !start {
                write!(f, ", ")?;
            } else {
                start = false;
            }
            write!(f, "{:?}", block)?;
        }
        write!(f, ")")
    }
}

pub struct BlockIter<'dir> {
    next: Option<BlockRef>,
    _directory: PhantomData<&'dir BlockDirectory>,
}

impl<'dir> Iterator for BlockIter<'dir> {
    type Item = BlockRef;

    fn next(&mut self) -> Option<BlockRef> {
        let block = self.next.take()?;
        self.next = block.next();
        Some(block)
    }
}

/// Used/free accounting produced by one directory walk.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct HeapUsage {
    pub used_bytes: usize,
    pub free_bytes: usize,
    pub used_blocks: usize,
    pub free_blocks: usize,
}

impl fmt::Display for HeapUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Total used memory: {} bytes", self.used_bytes)?;
        write!(f, "Total free memory: {} bytes", self.free_bytes)
    }
}

/// A count of every invalid state found in a directory walk.
#[derive(Debug, Default)]
pub struct Validity {
    /// Blocks whose payload runs past the next block's header. This
    /// indicates corruption.
    ///
    /// If there are also out of order blocks, this might undercount.
    pub overlaps: usize,

    /// Physically adjacent free pairs that were not merged. Not corrupt,
    /// but coalescing should never leave these behind.
    pub adjacent_frees: usize,

    /// Blocks that do not have an address less than their successor.
    /// Expected only when separately mapped regions land out of order.
    pub out_of_orders: usize,

    /// `prev`/`next` pairs that do not mirror each other.
    pub broken_links: usize,
}

impl Validity {
    /// A simple check that all cases are 0.
    pub fn is_valid(&self) -> bool {
        self.overlaps == 0
            && self.adjacent_frees == 0
            && self.out_of_orders == 0
            && self.broken_links == 0
    }
}

impl From<Validity> for bool {
    fn from(validity: Validity) -> bool {
        validity.is_valid()
    }
}

/// Snapshot of one block's header fields, for diagnostic dumps.
#[derive(Debug)]
pub struct BlockCheck {
    pub size: usize,
    pub free: bool,
    pub header: *const u8,
    pub payload_start: *const u8,
    pub payload_end: *const u8,
    pub prev: Option<*const u8>,
    pub next: Option<*const u8>,
    pub prev_mergeable: bool,
    pub next_mergeable: bool,
}

impl fmt::Display for BlockCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Block check")?;
        writeln!(f, "Size: {}", self.size)?;
        writeln!(f, "Free: {}", self.free)?;
        match self.prev {
            Some(prev) => writeln!(f, "Prev block: {:p}", prev)?,
            None => writeln!(f, "Prev block: none")?,
        }
        match self.next {
            Some(next) => writeln!(f, "Next block: {:p}", next)?,
            None => writeln!(f, "Next block: none")?,
        }
        writeln!(f, "Beginning data address: {:p}", self.payload_start)?;
        write!(f, "Last data address: {:p}", self.payload_end)?;
        if self.prev_mergeable {
            write!(f, "\nPrev block ready to merge")?;
        }
        if self.next_mergeable {
            write!(f, "\nNext block ready to merge")?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    /// A hand-built heap: contiguous blocks carved out of one owned,
    /// aligned buffer, for exercising directory and policy walks directly.
    pub(crate) struct TestHeap {
        _buf: Box<[u64]>,
        pub directory: BlockDirectory,
        pub blocks: Vec<BlockRef>,
    }

    impl TestHeap {
        /// Build one block per `(payload_size, free)` spec, in order.
        /// Sizes must be multiples of [`ALIGNMENT`].
        pub fn with_blocks(specs: &[(usize, bool)]) -> TestHeap {
            let total_bytes: usize = specs.iter().map(|&(size, _)| HEADER_SIZE + size).sum();
            let mut buf = vec![0u64; total_bytes / ALIGNMENT + 1].into_boxed_slice();
            let base = buf.as_mut_ptr() as *mut u8;

            let mut directory = BlockDirectory::default();
            let mut blocks = Vec::new();
            let mut tail: Option<BlockRef> = None;
            let mut offset = 0;
            for &(size, free) in specs {
                assert_eq!(size % ALIGNMENT, 0, "test block sizes must be aligned");
                let region = NonNull::new(unsafe { base.add(offset) }).unwrap();
                let mut block = unsafe { directory.append_raw(region, size, tail) };
                block.set_free(free);
                blocks.push(block);
                tail = Some(block);
                offset += HEADER_SIZE + size;
            }

            TestHeap {
                _buf: buf,
                directory,
                blocks,
            }
        }
    }
}
