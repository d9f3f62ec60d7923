//! The arena: one contiguous region of memory, grown from the OS a page at a
//! time and never given back.
//!
//! ## [`HeapGrower`](trait.HeapGrower.html)
//!
//! `HeapGrower` abstracts over the call that claims more memory. Successive
//! calls hand back memory at increasing addresses, as `sbrk` does. Usually a
//! region starts where the previous one ended; when something else moved the
//! break in between (another allocator sharing it, say), the
//! [`Arena`](struct.Arena.html) takes the foreign span in as well and reports
//! it in the [`Growth`](struct.Growth.html), so the block list can fence it
//! off.
//!
//! ## Growers
//!
//! - `LibcHeapGrower` (feature `use_libc`) calls `libc::sbrk`.
//! - `SyscallHeapGrower` (without `use_libc`) makes the `brk` system call
//!   directly.
//! - `ToyHeap` is a static array that pretends to be a heap; mainly useful for
//!   testing.

use core::ops::Range;
use core::ptr::NonNull;

#[cfg(feature = "use_libc")]
use errno::Errno;

use crate::blocklist::{ALIGNMENT, HEADER_SIZE};
use crate::error::AllocError;
#[cfg(all(
    not(feature = "use_libc"),
    target_os = "linux",
    any(target_arch = "x86_64", target_arch = "aarch64")
))]
use crate::unix::{self, BrkError};

/// The number of bytes to claim from the OS for a request of `size` bytes: one
/// page for anything up to a page, otherwise `size` rounded up to a whole
/// number of pages.
pub fn page_rounded(size: usize, page_size: usize) -> Option<usize> {
    if size <= page_size {
        return Some(page_size);
    }
    Some(size.checked_add(page_size - 1)? / page_size * page_size)
}

pub trait HeapGrower {
    type Err: core::fmt::Debug;

    /// Grow the heap by at least size. Returns a pointer and the size of the
    /// memory available at that pointer.
    ///
    /// # Safety
    ///
    /// For this to function properly with the other types in this crate, the
    /// returned memory must be available and untracked by any other rust code,
    /// and must lie above the memory returned by the previous call.
    unsafe fn grow_heap(&mut self, size: usize) -> Result<(*mut u8, usize), Self::Err>;
}

/// LibcHeapGrower moves the program break with `sbrk`.
#[cfg(feature = "use_libc")]
#[derive(Default)]
pub struct LibcHeapGrower {
    // Just for tracking, not really needed
    pub pages: usize,
    pub growths: usize,
}

#[cfg(feature = "use_libc")]
impl HeapGrower for LibcHeapGrower {
    type Err = Errno;

    unsafe fn grow_heap(&mut self, size: usize) -> Result<(*mut u8, usize), Self::Err> {
        let pagesize = sysconf::page::pagesize();
        let to_allocate = match page_rounded(size, pagesize) {
            Some(n) if n <= isize::MAX as usize => n,
            _ => return Err(Errno(libc::ENOMEM)),
        };

        let ptr = libc::sbrk(to_allocate as libc::intptr_t);
        if ptr as isize == -1 {
            return Err(errno::errno());
        }

        self.pages += to_allocate / pagesize;
        self.growths += 1;

        Ok((ptr as *mut u8, to_allocate))
    }
}

/// SyscallHeapGrower moves the program break with the raw `brk` system call.
#[cfg(all(
    not(feature = "use_libc"),
    target_os = "linux",
    any(target_arch = "x86_64", target_arch = "aarch64")
))]
#[derive(Default)]
pub struct SyscallHeapGrower {
    // Just for tracking, not really needed
    pub pages: usize,
    pub growths: usize,
}

#[cfg(all(
    not(feature = "use_libc"),
    target_os = "linux",
    any(target_arch = "x86_64", target_arch = "aarch64")
))]
impl HeapGrower for SyscallHeapGrower {
    type Err = BrkError;

    unsafe fn grow_heap(&mut self, size: usize) -> Result<(*mut u8, usize), BrkError> {
        // Page size is 4 kb "on most architectures"
        let pagesize = 4096;
        let to_allocate = page_rounded(size, pagesize).ok_or(BrkError::Overflow)?;

        let ptr = unix::sbrk(to_allocate)?;

        self.pages += to_allocate / pagesize;
        self.growths += 1;

        Ok((ptr, to_allocate))
    }
}

pub struct ToyHeap {
    pub page_size: usize,
    pub size: usize,
    pub heap: [u8; 256 * 1024],
}

impl Default for ToyHeap {
    fn default() -> Self {
        ToyHeap {
            page_size: 64,
            size: 0,
            heap: [0; 256 * 1024],
        }
    }
}

#[derive(Debug)]
pub struct ToyHeapOverflowError();

impl HeapGrower for ToyHeap {
    type Err = ToyHeapOverflowError;

    unsafe fn grow_heap(&mut self, size: usize) -> Result<(*mut u8, usize), Self::Err> {
        let allocating = page_rounded(size, self.page_size).ok_or(ToyHeapOverflowError())?;
        if allocating > self.heap.len() - self.size {
            return Err(ToyHeapOverflowError());
        }

        let ptr = self.heap.as_mut_ptr().add(self.size);
        self.size += allocating;
        Ok((ptr, allocating))
    }
}

/// What a successful [`Arena::grow`](struct.Arena.html#method.grow) added.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Growth {
    /// Bytes handed over by the grower.
    pub added: usize,
    /// Memory between the old end of the arena and the new region, claimed
    /// by someone else. It now counts towards the arena's capacity but must
    /// never be handed out.
    pub foreign: Option<Range<NonNull<u8>>>,
}

/// The region all blocks are carved out of.
///
/// `base` is fixed by the first growth and is always 16-byte aligned;
/// `capacity` only ever increases. The region may contain foreign spans (see
/// [`Growth`](struct.Growth.html)).
pub struct Arena<G> {
    grower: G,
    base: Option<NonNull<u8>>,
    capacity: usize,
}

// The arena owns the memory behind `base` outright, so moving it to another
// thread along with the grower is fine.
unsafe impl<G: Send> Send for Arena<G> {}

impl<G> Arena<G> {
    pub const fn new(grower: G) -> Self {
        Arena {
            grower,
            base: None,
            capacity: 0,
        }
    }

    pub fn grower(&self) -> &G {
        &self.grower
    }

    /// The first usable byte, or `None` before the first growth.
    pub fn base(&self) -> Option<NonNull<u8>> {
        self.base
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The claimed region as a pointer range.
    pub fn bounds(&self) -> Option<Range<NonNull<u8>>> {
        let base = self.base?;
        // Safe: base + capacity is the end of memory we were handed.
        let end = unsafe { NonNull::new_unchecked(base.as_ptr().add(self.capacity)) };
        Some(base..end)
    }

    /// Whether `[start, start + len)` lies inside the arena.
    pub fn contains(&self, start: *const u8, len: usize) -> bool {
        let base = match self.base {
            None => return false,
            Some(b) => b.as_ptr() as usize,
        };
        let start = start as usize;
        match start.checked_add(len) {
            Some(end) => start >= base && end <= base + self.capacity,
            None => false,
        }
    }
}

impl<G: HeapGrower> Arena<G> {
    /// Grow the arena by at least `extra` bytes.
    ///
    /// If the new region does not start at the end of the arena, the span in
    /// between is taken in as well and returned as `Growth::foreign`. The new
    /// region then always has room for an aligned header at its start.
    ///
    /// # Safety
    ///
    /// The grower must uphold the `HeapGrower` contract.
    pub unsafe fn grow(&mut self, extra: usize) -> Result<Growth, AllocError> {
        // The first region may need its start rounded up to the alignment.
        let request = match self.base {
            None => extra.checked_add(ALIGNMENT).ok_or(AllocError::OutOfMemory)?,
            Some(_) => extra,
        };

        let (ptr, size) = self.grower.grow_heap(request).map_err(|_err| {
            debug!("Growing the arena by {} bytes failed: {:?}", request, _err);
            AllocError::OutOfMemory
        })?;
        let ptr = NonNull::new(ptr).ok_or(AllocError::OutOfMemory)?;
        if size < request {
            debug!("Grower returned {} bytes, {} were requested", size, request);
            return Err(AllocError::OutOfMemory);
        }

        let (added, foreign) = match self.base {
            None => {
                let padding = ptr.as_ptr().align_offset(ALIGNMENT);
                if padding >= size {
                    return Err(AllocError::OutOfMemory);
                }
                self.base = Some(NonNull::new_unchecked(ptr.as_ptr().add(padding)));
                (size - padding, None)
            }
            Some(base) => {
                let end = base.as_ptr() as usize + self.capacity;
                let start = ptr.as_ptr() as usize;
                if start < end {
                    // The break went backwards over our own memory.
                    debug!("Arena growth landed at {:?}, below {:#x}", ptr, end);
                    return Err(AllocError::OutOfMemory);
                }
                if start == end {
                    (size, None)
                } else if ptr.as_ptr().align_offset(ALIGNMENT) + HEADER_SIZE > size {
                    // No room for the header that fences off the span.
                    debug!("Arena growth at {:?} too small to take in", ptr);
                    return Err(AllocError::OutOfMemory);
                } else {
                    debug!(
                        "Arena growth landed at {:?}, taking in {} foreign bytes from {:#x}",
                        ptr,
                        start - end,
                        end
                    );
                    self.capacity += start - end;
                    let foreign = NonNull::new_unchecked(end as *mut u8)..ptr;
                    (size, Some(foreign))
                }
            }
        };

        self.capacity += added;
        debug!(
            "Grew arena by {} bytes to {} (base {:?})",
            added, self.capacity, self.base
        );
        Ok(Growth { added, foreign })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_env_log::test;

    // Hands out memory from an array, skipping a few bytes between growths so
    // the regions are never contiguous.
    struct GappyHeap {
        used: usize,
        heap: [u8; 4096],
    }

    impl HeapGrower for GappyHeap {
        type Err = ();

        unsafe fn grow_heap(&mut self, size: usize) -> Result<(*mut u8, usize), ()> {
            if self.used + size + 16 > self.heap.len() {
                return Err(());
            }
            let ptr = self.heap.as_mut_ptr().add(self.used);
            self.used += size + 16;
            Ok((ptr, size))
        }
    }

    #[test]
    fn page_rounding() {
        assert_eq!(page_rounded(0, 4096), Some(4096));
        assert_eq!(page_rounded(1, 4096), Some(4096));
        assert_eq!(page_rounded(4096, 4096), Some(4096));
        assert_eq!(page_rounded(4097, 4096), Some(8192));
        assert_eq!(page_rounded(10_000, 1000), Some(10_000));
        assert_eq!(page_rounded(10_001, 1000), Some(11_000));
        assert_eq!(page_rounded(usize::MAX, 4096), None);
    }

    #[test]
    fn first_growth_establishes_aligned_base() {
        let mut arena = Arena::new(ToyHeap::default());
        assert!(arena.base().is_none());
        assert!(arena.bounds().is_none());

        let added = unsafe { arena.grow(100).unwrap().added };
        assert!(added >= 100);
        assert_eq!(arena.capacity(), added);

        let base = arena.base().unwrap();
        assert_eq!(base.as_ptr() as usize % ALIGNMENT, 0);
        let bounds = arena.bounds().unwrap();
        assert_eq!(bounds.end.as_ptr() as usize - bounds.start.as_ptr() as usize, added);
        assert!(arena.contains(base.as_ptr(), added));
        assert!(!arena.contains(base.as_ptr(), added + 1));
    }

    #[test]
    fn growth_is_contiguous_and_page_rounded() {
        let mut arena = Arena::new(ToyHeap::default());
        unsafe { arena.grow(10).unwrap() };
        let base = arena.base().unwrap();
        let first = arena.capacity();

        let growth = unsafe { arena.grow(65).unwrap() };
        assert_eq!(growth.foreign, None);
        let added = growth.added;
        // ToyHeap pages are 64 bytes
        assert_eq!(added, 128);
        assert_eq!(arena.capacity(), first + 128);
        assert_eq!(arena.base(), Some(base));
        assert_eq!(arena.grower().size % 64, 0);
    }

    #[test]
    fn exhaustion_leaves_arena_untouched() {
        let mut arena = Arena::new(ToyHeap::default());
        unsafe { arena.grow(64).unwrap() };
        let capacity = arena.capacity();

        let result = unsafe { arena.grow(1024 * 1024) };
        assert_eq!(result, Err(AllocError::OutOfMemory));
        assert_eq!(arena.capacity(), capacity);
    }

    #[test]
    fn discontiguous_growth_takes_in_foreign_span() {
        let mut arena = Arena::new(GappyHeap {
            used: 0,
            heap: [0; 4096],
        });
        unsafe { arena.grow(64).unwrap() };
        let capacity = arena.capacity();
        let end = arena.bounds().unwrap().end;

        let growth = unsafe { arena.grow(64).unwrap() };
        assert_eq!(growth.added, 64);
        let foreign = growth.foreign.unwrap();
        assert_eq!(foreign.start, end);
        assert_eq!(foreign.end.as_ptr() as usize - end.as_ptr() as usize, 16);
        assert_eq!(arena.capacity(), capacity + 16 + 64);
        assert_eq!(arena.bounds().unwrap().end.as_ptr(), unsafe {
            foreign.end.as_ptr().add(64)
        });
    }
}
