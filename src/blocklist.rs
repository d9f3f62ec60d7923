//! The block directory: an address-ordered, doubly linked list of live block
//! headers, kept in-band inside the arena, and first-fit placement over the
//! gaps between them.
//!
//! Foreign spans the arena had to take in are covered by fence blocks: list
//! members that are never handed out or freed, whose header sits just above
//! the span they cover.

use core::fmt;
use core::ops::Range;
use core::ptr::NonNull;

use static_assertions::const_assert;

use crate::arena::{Arena, HeapGrower};
use crate::error::AllocError;

/// The header for our live blocks.
///
/// The header sits directly in front of the payload handed out to the caller.
/// It holds the extent of the block (including the header), links to the
/// previous and next live blocks in address order, and a tag that marks the
/// header as live.
///
/// We use C representation and align to 16 bytes, so a header at an aligned
/// address is always followed by an aligned payload.
#[repr(C, align(16))]
pub struct BlockHeader {
    extent: usize,
    next: Option<Block>,
    prev: Option<Block>,
    tag: usize,
}

/// All payloads are aligned to 16 bytes.
pub const ALIGNMENT: usize = 16;

/// Space taken by a header in front of every payload.
pub const HEADER_SIZE: usize = core::mem::size_of::<BlockHeader>();
const_assert!(HEADER_SIZE % ALIGNMENT == 0);
const_assert!(core::mem::align_of::<BlockHeader>() == ALIGNMENT);

// Mixed with the header address, so a stale copy of a header moved elsewhere
// does not look live.
const LIVE_TAG: usize = 0x6761_7061_6c6c_6f63u64 as usize;
const FENCE_TAG: usize = 0x6661_7265_6967_6e21u64 as usize;

/// Where a new block was carved out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// In the gap between the arena base and the first live block.
    BeforeHead,
    /// In the gap between two live blocks.
    Between,
    /// After the last live block, without growing the arena.
    Tail,
    /// After the last live block, once the arena had been grown.
    Grown,
}

/// A `Block` is a handle to the header of a live allocation.
///
/// Blocks are linked both ways, so unlike an owning list node they are plain
/// copyable handles; the [`BlockList`](struct.BlockList.html) is responsible
/// for keeping the links consistent.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Block {
    header: NonNull<BlockHeader>,
}

// Blocks are only reachable through the BlockList that owns the arena memory,
// so they can move between threads with it.
unsafe impl Send for Block {}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Block({:?}, {})", self.header, self.extent())
    }
}

impl Block {
    /// Write a fresh, live header at `at`.
    ///
    /// # Safety
    ///
    /// `at` must be aligned and point to at least `extent` bytes of arena
    /// memory that no live block covers.
    unsafe fn write(
        at: NonNull<u8>,
        extent: usize,
        prev: Option<Block>,
        next: Option<Block>,
    ) -> Block {
        let header: NonNull<BlockHeader> = at.cast();
        header.as_ptr().write(BlockHeader {
            extent,
            next,
            prev,
            tag: LIVE_TAG ^ (at.as_ptr() as usize),
        });
        Block { header }
    }

    /// Write a fence header at `at`, covering `[from, at + HEADER_SIZE)`.
    ///
    /// # Safety
    ///
    /// `at` must be aligned, `from <= at`, and `HEADER_SIZE` bytes at `at`
    /// must be arena memory that no live block covers.
    unsafe fn write_fence(at: NonNull<u8>, from: *const u8, prev: Option<Block>) -> Block {
        let header: NonNull<BlockHeader> = at.cast();
        header.as_ptr().write(BlockHeader {
            extent: at.as_ptr() as usize + HEADER_SIZE - from as usize,
            next: None,
            prev,
            tag: FENCE_TAG ^ (at.as_ptr() as usize),
        });
        Block { header }
    }

    /// The block whose payload starts at `payload`.
    ///
    /// # Safety
    ///
    /// `payload - HEADER_SIZE` must be readable; this does not check that a
    /// live header is actually there (see `BlockList::verify`).
    pub unsafe fn from_payload(payload: NonNull<u8>) -> Block {
        let header = payload.as_ptr().sub(HEADER_SIZE) as *mut BlockHeader;
        Block {
            header: NonNull::new_unchecked(header),
        }
    }

    /// The pointer handed out to the caller.
    pub fn payload(&self) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked((self.header.as_ptr() as *mut u8).add(HEADER_SIZE)) }
    }

    /// The first byte of the block. For a live block this is the header; a
    /// fence starts at the bottom of the foreign span below its header.
    pub fn start(&self) -> *mut u8 {
        if self.is_fence() {
            unsafe { self.end().sub(self.extent()) }
        } else {
            self.header_addr()
        }
    }

    /// One past the last byte of the block.
    pub fn end(&self) -> *mut u8 {
        if self.is_fence() {
            unsafe { self.header_addr().add(HEADER_SIZE) }
        } else {
            unsafe { self.header_addr().add(self.extent()) }
        }
    }

    fn header_addr(&self) -> *mut u8 {
        self.header.as_ptr() as *mut u8
    }

    /// Get the pointer range covered by this block.
    pub fn as_range(&self) -> Range<*const u8> {
        self.start() as *const u8..self.end() as *const u8
    }

    /// The size of the block, header included, in bytes.
    pub fn extent(&self) -> usize {
        self.header_view().extent
    }

    /// Bytes the caller may use.
    pub fn usable(&self) -> usize {
        self.extent() - HEADER_SIZE
    }

    pub fn next(&self) -> Option<Block> {
        self.header_view().next
    }

    pub fn prev(&self) -> Option<Block> {
        self.header_view().prev
    }

    fn is_live(&self) -> bool {
        self.header_view().tag == LIVE_TAG ^ (self.header_addr() as usize)
    }

    /// Whether this block fences off foreign memory rather than holding an
    /// allocation.
    pub fn is_fence(&self) -> bool {
        self.header_view().tag == FENCE_TAG ^ (self.header_addr() as usize)
    }

    /// An immutable view of the header
    fn header_view(&self) -> &BlockHeader {
        unsafe { self.header.as_ref() }
    }

    /// Get a mutable view of the header.
    ///
    /// # Safety
    ///
    /// Changing the links or extent of a live block can corrupt the list.
    unsafe fn header_mut(&mut self) -> &mut BlockHeader {
        self.header.as_mut()
    }

    unsafe fn set_next(&mut self, next: Option<Block>) {
        self.header_mut().next = next;
    }

    unsafe fn set_prev(&mut self, prev: Option<Block>) {
        self.header_mut().prev = prev;
    }
}

// Bytes between the end of one region and the start of the next.
fn gap(from: *const u8, to: *const u8) -> usize {
    (to as usize).saturating_sub(from as usize)
}

/// A `BlockList` is the address-ordered, doubly linked list of live blocks.
///
/// There is no record of free memory. Free space is whatever lies between live
/// blocks (or before the first, or after the last), so space released by
/// freeing a block merges with its neighbouring gaps without further work.
///
/// Invariants:
///
/// - `head` is the lowest-address block, or `None` if the list is empty.
/// - Fences are never unlinked.
/// - Each block's `next` has a higher address, and `block.end() <= next.start()`.
/// - `block.next.prev == block`, and only `head` has no `prev`.
/// - Every block lies within the arena it was carved from.
#[derive(Default)]
pub struct BlockList {
    head: Option<Block>,
}

pub struct BlockIter {
    next: Option<Block>,
}

impl Iterator for BlockIter {
    type Item = Block;

    fn next(&mut self) -> Option<Self::Item> {
        let next = self.next.take()?;
        self.next = next.next();
        Some(next)
    }
}

impl<'list> IntoIterator for &'list BlockList {
    type Item = Block;
    type IntoIter = BlockIter;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl fmt::Display for BlockList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockList(")?;
        let mut start = true;
        for block in self {
            if !start {
                write!(f, ", ")?;
            } else {
                start = false;
            }
            write!(f, "Block({:?}, {})", block.header, block.extent())?;
        }

        write!(f, ")")
    }
}

/// Validity contains a representation of all invalid states found in a
/// BlockList.
#[derive(Default, Debug)]
pub struct Validity {
    /// Number of blocks overlapping the block before them.
    ///
    /// This likely indicates corruption.
    pub overlaps: usize,
    /// Number of blocks that do not have an address greater than their prev.
    pub out_of_orders: usize,
    /// Number of blocks whose `prev` does not point back at the block before
    /// them, plus a head with a `prev`.
    pub broken_links: usize,
    /// Number of blocks without a live tag.
    pub bad_tags: usize,
    /// Number of blocks extending outside the arena.
    pub out_of_bounds: usize,
}

impl Validity {
    /// Returns a boolean - a simple check if all cases are 0
    pub fn is_valid(&self) -> bool {
        self.overlaps == 0
            && self.out_of_orders == 0
            && self.broken_links == 0
            && self.bad_tags == 0
            && self.out_of_bounds == 0
    }
}

impl From<Validity> for bool {
    fn from(v: Validity) -> bool {
        v.is_valid()
    }
}

#[derive(Default, Debug)]
pub struct Stats {
    /// Live blocks.
    pub length: usize,
    /// Bytes covered by blocks, headers and fenced-off foreign memory
    /// included.
    pub used: usize,
    /// Fences covering foreign memory.
    pub fences: usize,
    /// Bytes claimed from the OS.
    pub capacity: usize,
    /// Bytes in gaps.
    pub free: usize,
    /// The largest single gap.
    pub largest_gap: usize,
}

impl BlockList {
    pub const fn new() -> Self {
        BlockList { head: None }
    }

    pub const fn header_size() -> usize {
        HEADER_SIZE
    }

    pub fn head(&self) -> Option<Block> {
        self.head
    }

    pub fn iter(&self) -> BlockIter {
        BlockIter { next: self.head }
    }

    pub fn last(&self) -> Option<Block> {
        self.iter().last()
    }

    /// Number of live allocations; fences are not counted.
    pub fn len(&self) -> usize {
        self.iter().filter(|b| !b.is_fence()).count()
    }

    /// Whether no allocation is live.
    pub fn is_empty(&self) -> bool {
        self.iter().all(|b| b.is_fence())
    }

    /// Find room for a block of `size` bytes, growing the arena if no gap is
    /// large enough, and link a new block there.
    ///
    /// Gaps are tried in address order: before the head, between each pair of
    /// blocks, then after the last block. The first that fits wins. Growth
    /// that took in foreign memory fences it off first and tries again.
    ///
    /// # Safety
    ///
    /// `size` must be a multiple of `ALIGNMENT` and at least `HEADER_SIZE`, and
    /// every block in the list must have been carved out of `arena`.
    pub unsafe fn find_or_create<G: HeapGrower>(
        &mut self,
        size: usize,
        arena: &mut Arena<G>,
    ) -> Result<(Block, Placement), AllocError> {
        if let Some(region) = arena.bounds() {
            if let Some(found) = self.place(size, &region) {
                return Ok(found);
            }
        }

        loop {
            let growth = arena.grow(size)?;
            if let Some(foreign) = growth.foreign {
                self.fence_off(foreign);
            }
            let region = arena.bounds().ok_or(AllocError::OutOfMemory)?;
            let last = self.last();
            if let Some(block) = self.place_after(last, size, &region) {
                return Ok((block, Placement::Grown));
            }
        }
    }

    // Cover `foreign` with a fence whose header starts the new memory right
    // above it.
    unsafe fn fence_off(&mut self, foreign: Range<NonNull<u8>>) -> Block {
        let padding = foreign.end.as_ptr().align_offset(ALIGNMENT);
        let at = NonNull::new_unchecked(foreign.end.as_ptr().add(padding));
        let last = self.last();
        let fence = Block::write_fence(at, foreign.start.as_ptr(), last);
        match last {
            None => self.head = Some(fence),
            Some(mut prev) => prev.set_next(Some(fence)),
        }
        debug!(
            "Fenced off {} foreign bytes at {:?}",
            fence.extent() - HEADER_SIZE - padding,
            foreign.start
        );
        fence
    }

    // First-fit search of the existing arena.
    unsafe fn place(
        &mut self,
        size: usize,
        region: &Range<NonNull<u8>>,
    ) -> Option<(Block, Placement)> {
        let mut head = match self.head {
            None => {
                return self
                    .place_after(None, size, region)
                    .map(|block| (block, Placement::BeforeHead))
            }
            Some(h) => h,
        };

        if gap(region.start.as_ptr(), head.start()) >= size {
            let block = Block::write(region.start, size, None, Some(head));
            head.set_prev(Some(block));
            self.head = Some(block);
            return Some((block, Placement::BeforeHead));
        }

        let mut current = head;
        while let Some(mut next) = current.next() {
            if gap(current.end(), next.start()) >= size {
                let at = NonNull::new_unchecked(current.end());
                let block = Block::write(at, size, Some(current), Some(next));
                current.set_next(Some(block));
                next.set_prev(Some(block));
                return Some((block, Placement::Between));
            }
            current = next;
        }

        self.place_after(Some(current), size, region)
            .map(|block| (block, Placement::Tail))
    }

    // Append after `last`, the final block in the list, or at the arena base
    // if the list is empty.
    unsafe fn place_after(
        &mut self,
        last: Option<Block>,
        size: usize,
        region: &Range<NonNull<u8>>,
    ) -> Option<Block> {
        let start = match last {
            None => region.start,
            Some(b) => NonNull::new_unchecked(b.end()),
        };
        if gap(start.as_ptr(), region.end.as_ptr()) < size {
            return None;
        }

        let block = Block::write(start, size, last, None);
        match last {
            None => self.head = Some(block),
            Some(mut prev) => prev.set_next(Some(block)),
        }
        Some(block)
    }

    /// Remove a block from the list. Its memory becomes part of the
    /// surrounding gap.
    ///
    /// # Safety
    ///
    /// `block` must be a live member of this list.
    pub unsafe fn unlink(&mut self, mut block: Block) {
        let prev = block.prev();
        let next = block.next();

        match prev {
            None => self.head = next,
            Some(mut p) => p.set_next(next),
        }
        if let Some(mut n) = next {
            n.set_prev(prev);
        }

        let header = block.header_mut();
        header.tag = 0;
        header.next = None;
        header.prev = None;
    }

    /// Check that `block` looks like a live member of this list carved out of
    /// `arena`: inside the arena, tagged live, and linked to by its
    /// neighbours.
    ///
    /// This catches double frees and most foreign pointers. It cannot tell a
    /// stale pointer apart from a new block that happens to start at the same
    /// address.
    pub fn verify<G>(&self, block: Block, arena: &Arena<G>) -> Result<(), AllocError> {
        let start = block.header_addr();
        if start as usize % ALIGNMENT != 0 || !arena.contains(start, HEADER_SIZE) {
            return Err(AllocError::InvalidFree);
        }
        if !block.is_live() || !arena.contains(start, block.extent()) {
            return Err(AllocError::InvalidFree);
        }

        // Neighbours are only dereferenced once they are known to be inside
        // the arena.
        let linked = |other: Block| {
            let header = other.header_addr();
            (header as usize) % ALIGNMENT == 0 && arena.contains(header, HEADER_SIZE)
        };
        match block.prev() {
            None if self.head != Some(block) => return Err(AllocError::InvalidFree),
            Some(p) if !linked(p) || p.next() != Some(block) => {
                return Err(AllocError::InvalidFree)
            }
            _ => {}
        }
        match block.next() {
            Some(n) if !linked(n) || n.prev() != Some(block) => Err(AllocError::InvalidFree),
            _ => Ok(()),
        }
    }

    /// Walk the list, checking the invariants and measuring the gaps.
    pub fn stats<G>(&self, arena: &Arena<G>) -> (Validity, Stats) {
        let mut validity: Validity = Default::default();
        let mut stats = Stats {
            capacity: arena.capacity(),
            ..Default::default()
        };

        let (base, end) = match arena.bounds() {
            None => {
                if self.head.is_some() {
                    validity.out_of_bounds += 1;
                }
                return (validity, stats);
            }
            Some(r) => (r.start.as_ptr() as *const u8, r.end.as_ptr() as *const u8),
        };

        let mut previous: Option<Block> = None;
        let mut cursor = base;
        for block in self.iter() {
            let range = block.as_range();
            if range.start < base || range.end > end {
                validity.out_of_bounds += 1;
            }
            if !block.is_live() && !block.is_fence() {
                validity.bad_tags += 1;
            }
            if block.prev() != previous {
                validity.broken_links += 1;
            }
            if let Some(p) = previous {
                if range.start <= p.start() as *const u8 {
                    validity.out_of_orders += 1;
                } else if range.start < p.end() as *const u8 {
                    validity.overlaps += 1;
                }
            }

            let before = gap(cursor, range.start);
            stats.free += before;
            stats.largest_gap = stats.largest_gap.max(before);
            if range.end > cursor {
                cursor = range.end;
            }

            if block.is_fence() {
                stats.fences += 1;
            } else {
                stats.length += 1;
            }
            stats.used += block.extent();
            previous = Some(block);
        }

        let after = gap(cursor, end);
        stats.free += after;
        stats.largest_gap = stats.largest_gap.max(after);

        (validity, stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::arena::ToyHeap;
    use test_env_log::test;

    fn assert_valid<G>(blocks: &BlockList, arena: &Arena<G>) -> Stats {
        let (validity, stats) = blocks.stats(arena);
        log::info!("{} {:?} {:?}", blocks, validity, stats);
        assert!(validity.is_valid());
        assert_eq!(stats.used + stats.free, stats.capacity);
        stats
    }

    fn offset<G>(arena: &Arena<G>, block: Block) -> usize {
        block.start() as usize - arena.base().unwrap().as_ptr() as usize
    }

    #[test]
    fn header_layout() {
        assert_eq!(HEADER_SIZE % ALIGNMENT, 0);
        assert_eq!(BlockList::header_size(), HEADER_SIZE);
    }

    #[test]
    fn first_block_grows_the_arena() {
        let mut arena = Arena::new(ToyHeap::default());
        let mut blocks = BlockList::new();
        assert!(blocks.is_empty());

        let (block, placement) = unsafe { blocks.find_or_create(64, &mut arena).unwrap() };
        assert_eq!(placement, Placement::Grown);
        assert_eq!(offset(&arena, block), 0);
        assert_eq!(block.extent(), 64);
        assert_eq!(block.usable(), 64 - HEADER_SIZE);
        assert_eq!(block.payload().as_ptr() as usize % ALIGNMENT, 0);
        assert_eq!(blocks.head(), Some(block));
        assert_eq!(blocks.len(), 1);
        assert_valid(&blocks, &arena);
    }

    #[test]
    fn blocks_are_placed_in_address_order() {
        let mut arena = Arena::new(ToyHeap::default());
        let mut blocks = BlockList::new();

        let (a, _) = unsafe { blocks.find_or_create(64, &mut arena).unwrap() };
        let (b, placement) = unsafe { blocks.find_or_create(96, &mut arena).unwrap() };
        // The first growth rounded up to a page, leaving room behind `a`.
        assert!(placement == Placement::Tail || placement == Placement::Grown);
        assert_eq!(b.start(), a.end());
        let (c, _) = unsafe { blocks.find_or_create(32, &mut arena).unwrap() };
        assert_eq!(c.start(), b.end());

        let order: [Block; 3] = [a, b, c];
        for (found, expected) in blocks.iter().zip(order.iter()) {
            assert_eq!(found, *expected);
        }
        assert_eq!(a.next(), Some(b));
        assert_eq!(c.prev(), Some(b));
        assert_eq!(blocks.last(), Some(c));
        assert_valid(&blocks, &arena);
    }

    #[test]
    fn freed_head_is_reused_before_head() {
        let mut arena = Arena::new(ToyHeap::default());
        let mut blocks = BlockList::new();

        let (a, _) = unsafe { blocks.find_or_create(128, &mut arena).unwrap() };
        let (b, _) = unsafe { blocks.find_or_create(64, &mut arena).unwrap() };
        unsafe { blocks.unlink(a) };
        assert_eq!(blocks.head(), Some(b));
        assert_eq!(b.prev(), None);
        assert_valid(&blocks, &arena);

        let capacity = arena.capacity();
        let (c, placement) = unsafe { blocks.find_or_create(64, &mut arena).unwrap() };
        assert_eq!(placement, Placement::BeforeHead);
        assert_eq!(c.start(), a.start());
        assert_eq!(blocks.head(), Some(c));
        assert_eq!(b.prev(), Some(c));
        assert_eq!(arena.capacity(), capacity);
        assert_valid(&blocks, &arena);
    }

    #[test]
    fn freed_middle_is_reused_between() {
        let mut arena = Arena::new(ToyHeap::default());
        let mut blocks = BlockList::new();

        let (a, _) = unsafe { blocks.find_or_create(64, &mut arena).unwrap() };
        let (b, _) = unsafe { blocks.find_or_create(96, &mut arena).unwrap() };
        let (c, _) = unsafe { blocks.find_or_create(64, &mut arena).unwrap() };
        unsafe { blocks.unlink(b) };
        assert_eq!(a.next(), Some(c));
        assert_eq!(c.prev(), Some(a));

        // Too big for the hole, goes to the tail.
        let (d, placement) = unsafe { blocks.find_or_create(112, &mut arena).unwrap() };
        assert_ne!(placement, Placement::Between);
        assert!(d.start() >= c.end());

        let (e, placement) = unsafe { blocks.find_or_create(48, &mut arena).unwrap() };
        assert_eq!(placement, Placement::Between);
        assert_eq!(e.start(), a.end());
        assert_eq!(e.prev(), Some(a));
        assert_eq!(e.next(), Some(c));

        // The rest of the hole is still usable.
        let (f, placement) = unsafe { blocks.find_or_create(48, &mut arena).unwrap() };
        assert_eq!(placement, Placement::Between);
        assert_eq!(f.start(), e.end());
        assert_eq!(f.end(), c.start());
        assert_valid(&blocks, &arena);
    }

    #[test]
    fn adjacent_frees_form_one_gap() {
        let mut arena = Arena::new(ToyHeap::default());
        let mut blocks = BlockList::new();

        let (a, _) = unsafe { blocks.find_or_create(64, &mut arena).unwrap() };
        let (b, _) = unsafe { blocks.find_or_create(64, &mut arena).unwrap() };
        let (c, _) = unsafe { blocks.find_or_create(64, &mut arena).unwrap() };
        let (_d, _) = unsafe { blocks.find_or_create(64, &mut arena).unwrap() };
        unsafe {
            blocks.unlink(b);
            blocks.unlink(c);
        }
        let stats = assert_valid(&blocks, &arena);
        assert!(stats.largest_gap >= 128);

        let (e, placement) = unsafe { blocks.find_or_create(128, &mut arena).unwrap() };
        assert_eq!(placement, Placement::Between);
        assert_eq!(e.start(), a.end());
    }

    #[test]
    fn emptied_list_starts_over_at_base() {
        let mut arena = Arena::new(ToyHeap::default());
        let mut blocks = BlockList::new();

        let (a, _) = unsafe { blocks.find_or_create(64, &mut arena).unwrap() };
        let (b, _) = unsafe { blocks.find_or_create(64, &mut arena).unwrap() };
        unsafe {
            blocks.unlink(b);
            blocks.unlink(a);
        }
        assert!(blocks.is_empty());
        let stats = assert_valid(&blocks, &arena);
        assert_eq!(stats.free, arena.capacity());

        let (c, placement) = unsafe { blocks.find_or_create(64, &mut arena).unwrap() };
        assert_eq!(placement, Placement::BeforeHead);
        assert_eq!(offset(&arena, c), 0);
    }

    #[test]
    fn verify_rejects_unlinked_blocks() {
        let mut arena = Arena::new(ToyHeap::default());
        let mut blocks = BlockList::new();

        let (a, _) = unsafe { blocks.find_or_create(64, &mut arena).unwrap() };
        let (b, _) = unsafe { blocks.find_or_create(64, &mut arena).unwrap() };
        assert_eq!(blocks.verify(a, &arena), Ok(()));
        assert_eq!(blocks.verify(b, &arena), Ok(()));

        unsafe { blocks.unlink(a) };
        assert_eq!(blocks.verify(a, &arena), Err(AllocError::InvalidFree));
        assert_eq!(blocks.verify(b, &arena), Ok(()));

        // A payload pointer in the middle of `b`
        let inside = unsafe { Block::from_payload(NonNull::new_unchecked(b.end().sub(16))) };
        assert_eq!(blocks.verify(inside, &arena), Err(AllocError::InvalidFree));
    }

    #[test]
    fn exhausted_arena_reports_out_of_memory() {
        let mut arena = Arena::new(ToyHeap::default());
        let mut blocks = BlockList::new();

        let (a, _) = unsafe { blocks.find_or_create(1024, &mut arena).unwrap() };
        let result = unsafe { blocks.find_or_create(512 * 1024, &mut arena) };
        assert_eq!(result.err(), Some(AllocError::OutOfMemory));
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks.head(), Some(a));
        assert_valid(&blocks, &arena);
    }

    // Every other growth lands past a span someone else claimed in between,
    // filled with 0xEE.
    struct SharedBreak {
        used: usize,
        growths: usize,
        foreign: Vec<Range<usize>>,
        heap: [u8; 16 * 1024],
    }

    impl SharedBreak {
        const FOREIGN: usize = 80;

        fn new() -> Self {
            SharedBreak {
                used: 0,
                growths: 0,
                foreign: Vec::new(),
                heap: [0; 16 * 1024],
            }
        }

        fn foreign_intact(&self) -> bool {
            self.foreign
                .iter()
                .all(|span| self.heap[span.clone()].iter().all(|&b| b == 0xEE))
        }
    }

    impl HeapGrower for SharedBreak {
        type Err = ();

        unsafe fn grow_heap(&mut self, size: usize) -> Result<(*mut u8, usize), ()> {
            let size = crate::arena::page_rounded(size, 64).ok_or(())?;
            let skip = if self.growths % 2 == 1 { Self::FOREIGN } else { 0 };
            if self.used + skip + size > self.heap.len() {
                return Err(());
            }
            if skip > 0 {
                for b in &mut self.heap[self.used..self.used + skip] {
                    *b = 0xEE;
                }
                self.foreign.push(self.used..self.used + skip);
            }
            self.used += skip;
            let ptr = self.heap.as_mut_ptr().add(self.used);
            self.used += size;
            self.growths += 1;
            Ok((ptr, size))
        }
    }

    #[test]
    fn foreign_growth_is_fenced_off() {
        let mut arena = Arena::new(SharedBreak::new());
        let mut blocks = BlockList::new();

        let (a, _) = unsafe { blocks.find_or_create(64, &mut arena).unwrap() };
        let first_end = arena.bounds().unwrap().end.as_ptr();
        // Does not fit in the first region; the next growth skips a span.
        let (b, placement) = unsafe { blocks.find_or_create(96, &mut arena).unwrap() };
        assert_eq!(placement, Placement::Grown);
        assert!(b.start() as usize >= first_end as usize + SharedBreak::FOREIGN);
        assert!(arena.grower().foreign_intact());

        let fence = b.prev().unwrap();
        assert!(fence.is_fence());
        assert_eq!(fence.start(), first_end);
        assert_eq!(fence.end(), b.start());
        assert_eq!(fence.prev(), Some(a));

        let stats = assert_valid(&blocks, &arena);
        assert_eq!(stats.fences, 1);
        assert_eq!(stats.length, 2);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks.verify(fence, &arena), Err(AllocError::InvalidFree));

        // The tail of the first region is still usable
        let (c, placement) = unsafe { blocks.find_or_create(32, &mut arena).unwrap() };
        assert_eq!(placement, Placement::Between);
        assert_eq!(c.start(), a.end());
        assert!(c.end() <= first_end);

        unsafe {
            blocks.unlink(a);
            blocks.unlink(b);
            blocks.unlink(c);
        }
        assert!(blocks.is_empty());
        assert_eq!(blocks.head(), Some(fence));
        assert_valid(&blocks, &arena);
    }

    #[test]
    fn allocation_keeps_working_across_foreign_growths() {
        let mut arena = Arena::new(SharedBreak::new());
        let mut blocks = BlockList::new();
        let mut live = 0;

        for i in 0..60 {
            let size = 32 + (i % 5) * 48;
            let (block, _) = unsafe { blocks.find_or_create(size, &mut arena).unwrap() };
            unsafe { core::ptr::write_bytes(block.payload().as_ptr(), 0x11, block.usable()) };
            live += 1;
            if i % 3 == 0 {
                unsafe { blocks.unlink(block) };
                live -= 1;
            }
            assert_valid(&blocks, &arena);
        }

        let stats = assert_valid(&blocks, &arena);
        assert!(stats.fences > 1);
        assert_eq!(stats.fences, arena.grower().foreign.len());
        assert_eq!(stats.length, live);
        assert!(arena.grower().foreign_intact());
    }
}
