//! Allocator types, both generic and Unix-specific.
//!
//! ## Basic Types
//!
//! ### [`RawAlloc`](struct.RawAlloc.html)
//!
//! A `RawAlloc` is a single-threaded arena and block directory, providing
//! `malloc`-style operations: [`allocate`](struct.RawAlloc.html#method.allocate),
//! [`free`](struct.RawAlloc.html#method.free),
//! [`zero_allocate`](struct.RawAlloc.html#method.zero_allocate),
//! [`resize`](struct.RawAlloc.html#method.resize) and
//! [`usable_size`](struct.RawAlloc.html#method.usable_size). Because it is not
//! thread-safe, it cannot be used as a global allocator on its own.
//!
//! ### [`GenericAllocator`](struct.GenericAllocator.html)
//!
//! A `GenericAllocator` wraps a lazily created `RawAlloc` in a spin lock,
//! making it thread-safe and implementing
//! [`core::alloc::GlobalAlloc`](https://doc.rust-lang.org/core/alloc/trait.GlobalAlloc.html).
//!
//! ### [`UnixAllocator`](struct.UnixAllocator.html)
//!
//! A `UnixAllocator` is a `GenericAllocator` that grows its arena by moving the
//! program break, ready to be used as the `#[global_allocator]`.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, null_mut, NonNull};

use spin::{Mutex, MutexGuard, Once};

use crate::arena::{Arena, HeapGrower};
#[cfg(feature = "use_libc")]
use crate::arena::LibcHeapGrower;
#[cfg(all(
    not(feature = "use_libc"),
    target_os = "linux",
    any(target_arch = "x86_64", target_arch = "aarch64")
))]
use crate::arena::SyscallHeapGrower;
use crate::blocklist::{Block, BlockList, Stats, Validity, ALIGNMENT, HEADER_SIZE};
use crate::config::Config;
use crate::error::AllocError;

/// A raw allocator: an arena, the list of live blocks carved out of it, and
/// the operations on top.
///
/// Note: It never returns memory to the OS; that is not implemented.
pub struct RawAlloc<G> {
    pub arena: Arena<G>,
    pub blocks: BlockList,
    config: Config,
}

impl<G: HeapGrower + Default> Default for RawAlloc<G> {
    fn default() -> Self {
        RawAlloc::new(G::default())
    }
}

impl<G> RawAlloc<G> {
    /// Create a new `RawAlloc`
    pub const fn new(grower: G) -> Self {
        RawAlloc::with_config(grower, Config::DEFAULT)
    }

    pub const fn with_config(grower: G, config: Config) -> Self {
        RawAlloc {
            arena: Arena::new(grower),
            blocks: BlockList::new(),
            config,
        }
    }

    pub fn config(&self) -> Config {
        self.config
    }

    /// Get statistics on this allocator, and verify validity of the BlockList
    pub fn stats(&self) -> (Validity, Stats) {
        self.blocks.stats(&self.arena)
    }

    /// The extent of the block that an allocation of `size` bytes takes up,
    /// header included.
    pub fn block_size(&self, size: usize) -> Option<usize> {
        self.config.rounding.block_size(size)
    }

    // The live block that `ptr` is the payload of.
    fn owning_block(&self, ptr: NonNull<u8>) -> Result<Block, AllocError> {
        let addr = ptr.as_ptr() as usize;
        if !self.config.verify_frees {
            return Ok(unsafe { Block::from_payload(ptr) });
        }
        if addr % ALIGNMENT != 0 || !self.arena.contains(ptr.as_ptr(), 0) {
            return Err(AllocError::InvalidFree);
        }
        let base = self.arena.base().ok_or(AllocError::InvalidFree)?;
        if addr < base.as_ptr() as usize + HEADER_SIZE {
            return Err(AllocError::InvalidFree);
        }

        let block = unsafe { Block::from_payload(ptr) };
        self.blocks.verify(block, &self.arena)?;
        Ok(block)
    }

    /// Size of the memory available at `ptr`: 0 for null, or for anything
    /// that is not a live allocation.
    pub fn usable_size(&self, ptr: *const u8) -> usize {
        match NonNull::new(ptr as *mut u8) {
            None => 0,
            Some(p) => self.owning_block(p).map(|b| b.usable()).unwrap_or(0),
        }
    }

    /// Free the allocation at `ptr`, reporting pointers that are not live
    /// allocations. Freeing null is a no-op.
    ///
    /// # Safety
    ///
    /// The memory at `ptr` must not be used after this call.
    pub unsafe fn try_free(&mut self, ptr: *mut u8) -> Result<(), AllocError> {
        let ptr = match NonNull::new(ptr) {
            None => return Ok(()),
            Some(p) => p,
        };
        let block = match self.owning_block(ptr) {
            Ok(b) => b,
            Err(err) => {
                debug!("Refusing to free {:?}: {}", ptr, err);
                return Err(err);
            }
        };

        trace!("Freeing {:?} ({} bytes)", ptr, block.extent());
        self.blocks.unlink(block);
        Ok(())
    }

    /// Free the allocation at `ptr`. Freeing null is a no-op.
    ///
    /// # Safety
    ///
    /// The memory at `ptr` must not be used after this call.
    ///
    /// # Panics
    ///
    /// Panics if `ptr` is not a live allocation, e.g. on a double free.
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        if let Err(err) = self.try_free(ptr) {
            invalid_pointer(ptr, err)
        }
    }
}

impl<G: HeapGrower> RawAlloc<G> {
    /// Allocate at least `size` bytes, aligned to 16.
    ///
    /// # Safety
    ///
    /// The arena's grower must uphold the `HeapGrower` contract.
    pub unsafe fn try_allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let needed = self.block_size(size).ok_or(AllocError::OutOfMemory)?;
        let (block, placement) = self.blocks.find_or_create(needed, &mut self.arena)?;
        trace!(
            "Allocated {} bytes ({} needed) at {:?}: {:?}",
            size,
            needed,
            block.payload(),
            placement
        );
        Ok(block.payload())
    }

    /// Allocate at least `size` bytes, aligned to 16. Returns null when the
    /// arena cannot grow.
    ///
    /// # Safety
    ///
    /// The arena's grower must uphold the `HeapGrower` contract.
    pub unsafe fn allocate(&mut self, size: usize) -> *mut u8 {
        self.try_allocate(size)
            .map(NonNull::as_ptr)
            .unwrap_or(null_mut())
    }

    /// Allocate `count * size` zeroed bytes.
    ///
    /// # Safety
    ///
    /// The arena's grower must uphold the `HeapGrower` contract.
    pub unsafe fn try_zero_allocate(
        &mut self,
        count: usize,
        size: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        if count == 0 || size == 0 {
            return Err(AllocError::ZeroSized);
        }
        if count > usize::MAX / size {
            return Err(AllocError::IntegerOverflow);
        }

        let total = count * size;
        let ptr = self.try_allocate(total)?;
        ptr::write_bytes(ptr.as_ptr(), 0, total);
        Ok(ptr)
    }

    /// Allocate `count * size` zeroed bytes. Returns null if either is zero,
    /// if the product overflows, or when the arena cannot grow.
    ///
    /// # Safety
    ///
    /// The arena's grower must uphold the `HeapGrower` contract.
    pub unsafe fn zero_allocate(&mut self, count: usize, size: usize) -> *mut u8 {
        self.try_zero_allocate(count, size)
            .map(NonNull::as_ptr)
            .unwrap_or(null_mut())
    }

    /// Make the allocation at `ptr` hold at least `new_size` bytes.
    ///
    /// Blocks are never shrunk or grown in place: if the block is already big
    /// enough `ptr` is returned as is, otherwise the contents are moved to a
    /// new block. On failure the original allocation is left alone.
    ///
    /// # Safety
    ///
    /// On success, the memory at `ptr` must no longer be used unless the same
    /// pointer was returned.
    pub unsafe fn try_resize(
        &mut self,
        ptr: NonNull<u8>,
        new_size: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        let old = self.owning_block(ptr)?;
        let usable = old.usable();
        if usable >= new_size {
            return Ok(ptr);
        }

        // The old block stays live until the copy is done, so the new one
        // cannot overlap it.
        let new_ptr = self.try_allocate(new_size)?;
        ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), usable.min(new_size));
        self.blocks.unlink(old);
        trace!("Moved {:?} to {:?} for {} bytes", ptr, new_ptr, new_size);
        Ok(new_ptr)
    }

    /// `realloc`: resize the allocation at `ptr` to `new_size` bytes.
    ///
    /// A null `ptr` allocates, and a zero `new_size` frees and returns null.
    /// Returns null, leaving `ptr` untouched, when the arena cannot grow.
    ///
    /// # Safety
    ///
    /// On success, the memory at `ptr` must no longer be used unless the same
    /// pointer was returned.
    ///
    /// # Panics
    ///
    /// Panics if `ptr` is not null and not a live allocation.
    pub unsafe fn resize(&mut self, ptr: *mut u8, new_size: usize) -> *mut u8 {
        if new_size == 0 {
            self.free(ptr);
            return null_mut();
        }
        let old = match NonNull::new(ptr) {
            None => return self.allocate(new_size),
            Some(p) => p,
        };

        match self.try_resize(old, new_size) {
            Ok(p) => p.as_ptr(),
            Err(AllocError::InvalidFree) => invalid_pointer(ptr, AllocError::InvalidFree),
            Err(_) => null_mut(),
        }
    }
}

#[cold]
fn invalid_pointer(ptr: *mut u8, err: AllocError) -> ! {
    panic!("{:?} cannot be freed or resized: {}", ptr, err)
}

// Unwinding out of a global allocator is not allowed, and the allocator may be
// needed to report a panic; panicking inside an `extern "C"` function aborts
// instead.
#[cold]
pub(crate) extern "C" fn abort_invalid_pointer(ptr: *mut u8) -> ! {
    panic!("{:?} is not a live allocation", ptr)
}

/// A thread-safe allocator, using a spin lock around a RawAlloc.
///
/// Thread-safety is required for an allocator to be used as a global allocator,
/// so that was easy to add with a spin lock. The `RawAlloc` is created on first
/// use, so a `GenericAllocator` can live in a `static`.
pub struct GenericAllocator<G> {
    config: Config,
    raw: Once<Mutex<RawAlloc<G>>>,
}

impl<G: HeapGrower + Default> Default for GenericAllocator<G> {
    fn default() -> Self {
        Self::new()
    }
}

impl<G> GenericAllocator<G> {
    pub const fn new() -> Self {
        GenericAllocator::with_config(Config::DEFAULT)
    }

    pub const fn with_config(config: Config) -> Self {
        GenericAllocator {
            config,
            raw: Once::new(),
        }
    }
}

impl<G: HeapGrower + Default> GenericAllocator<G> {
    /// Get a reference to the underlying RawAlloc.
    ///
    /// All other users of this allocator block while the guard is held,
    /// including any allocation made by the current thread.
    pub fn get_raw(&self) -> MutexGuard<RawAlloc<G>> {
        let config = self.config;
        self.raw
            .call_once(|| Mutex::new(RawAlloc::with_config(G::default(), config)))
            .lock()
    }

    pub fn stats(&self) -> (Validity, Stats) {
        self.get_raw().stats()
    }

    /// See [`RawAlloc::allocate`](struct.RawAlloc.html#method.allocate).
    ///
    /// # Safety
    ///
    /// The grower must uphold the `HeapGrower` contract.
    pub unsafe fn allocate(&self, size: usize) -> *mut u8 {
        self.get_raw().allocate(size)
    }

    /// See [`RawAlloc::free`](struct.RawAlloc.html#method.free).
    ///
    /// # Safety
    ///
    /// The memory at `ptr` must not be used after this call.
    pub unsafe fn free(&self, ptr: *mut u8) {
        // Release the lock before panicking.
        let result = self.get_raw().try_free(ptr);
        if let Err(err) = result {
            invalid_pointer(ptr, err)
        }
    }

    /// See [`RawAlloc::zero_allocate`](struct.RawAlloc.html#method.zero_allocate).
    ///
    /// # Safety
    ///
    /// The grower must uphold the `HeapGrower` contract.
    pub unsafe fn zero_allocate(&self, count: usize, size: usize) -> *mut u8 {
        self.get_raw().zero_allocate(count, size)
    }

    /// See [`RawAlloc::resize`](struct.RawAlloc.html#method.resize).
    ///
    /// # Safety
    ///
    /// On success, the memory at `ptr` must no longer be used unless the same
    /// pointer was returned.
    pub unsafe fn resize(&self, ptr: *mut u8, new_size: usize) -> *mut u8 {
        if new_size == 0 {
            self.free(ptr);
            return null_mut();
        }
        let old = match NonNull::new(ptr) {
            None => return self.allocate(new_size),
            Some(p) => p,
        };

        let result = self.get_raw().try_resize(old, new_size);
        match result {
            Ok(p) => p.as_ptr(),
            Err(AllocError::InvalidFree) => invalid_pointer(ptr, AllocError::InvalidFree),
            Err(_) => null_mut(),
        }
    }

    pub fn usable_size(&self, ptr: *const u8) -> usize {
        self.get_raw().usable_size(ptr)
    }
}

unsafe impl<G: HeapGrower + Default + Send> GlobalAlloc for GenericAllocator<G> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return null_mut();
        }
        self.get_raw().allocate(layout.size())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        let result = self.get_raw().try_free(ptr);
        if result.is_err() {
            abort_invalid_pointer(ptr)
        }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return null_mut();
        }
        self.get_raw().zero_allocate(1, layout.size())
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return null_mut();
        }
        let old = match NonNull::new(ptr) {
            None => {
                let layout = Layout::from_size_align_unchecked(new_size, layout.align());
                return self.alloc(layout);
            }
            Some(p) => p,
        };

        let result = self.get_raw().try_resize(old, new_size);
        match result {
            Ok(p) => p.as_ptr(),
            Err(AllocError::InvalidFree) => abort_invalid_pointer(ptr),
            Err(_) => null_mut(),
        }
    }
}

/// The grower behind `UnixAllocator`.
#[cfg(feature = "use_libc")]
pub type UnixHeapGrower = LibcHeapGrower;
/// The grower behind `UnixAllocator`.
#[cfg(all(
    not(feature = "use_libc"),
    target_os = "linux",
    any(target_arch = "x86_64", target_arch = "aarch64")
))]
pub type UnixHeapGrower = SyscallHeapGrower;

/// The allocator to use as `#[global_allocator]`: a `GenericAllocator` whose
/// arena grows by moving the program break.
#[cfg(any(
    feature = "use_libc",
    all(
        target_os = "linux",
        any(target_arch = "x86_64", target_arch = "aarch64")
    )
))]
#[derive(Default)]
pub struct UnixAllocator {
    alloc: GenericAllocator<UnixHeapGrower>,
}

#[cfg(any(
    feature = "use_libc",
    all(
        target_os = "linux",
        any(target_arch = "x86_64", target_arch = "aarch64")
    )
))]
impl UnixAllocator {
    pub const fn new() -> Self {
        UnixAllocator {
            alloc: GenericAllocator::new(),
        }
    }

    pub const fn with_config(config: Config) -> Self {
        UnixAllocator {
            alloc: GenericAllocator::with_config(config),
        }
    }

    pub fn stats(&self) -> (Validity, Stats) {
        self.alloc.stats()
    }

    /// The underlying allocator, for the `malloc`-style operations.
    pub fn inner(&self) -> &GenericAllocator<UnixHeapGrower> {
        &self.alloc
    }
}

#[cfg(any(
    feature = "use_libc",
    all(
        target_os = "linux",
        any(target_arch = "x86_64", target_arch = "aarch64")
    )
))]
unsafe impl GlobalAlloc for UnixAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.alloc.alloc(layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        self.alloc.dealloc(ptr, layout)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        self.alloc.alloc_zeroed(layout)
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        self.alloc.realloc(ptr, layout, new_size)
    }
}
