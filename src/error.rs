use core::fmt;

/// Errors reported by the allocator.
///
/// The null-returning operations on [`RawAlloc`](../allocators/struct.RawAlloc.html)
/// collapse all of these to a null pointer, except `InvalidFree`, which is a
/// programming error in the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// The arena could not be grown far enough, or the rounded size of the
    /// request does not fit in a `usize`.
    OutOfMemory,
    /// `count * size` overflowed in a zeroed allocation.
    IntegerOverflow,
    /// A zeroed allocation was requested with a zero count or element size.
    ZeroSized,
    /// The pointer is not the payload of a live block: it was never
    /// allocated here, or it has already been freed.
    InvalidFree,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::OutOfMemory => write!(f, "out of memory"),
            AllocError::IntegerOverflow => write!(f, "allocation size overflowed"),
            AllocError::ZeroSized => write!(f, "zero-sized allocation"),
            AllocError::InvalidFree => write!(f, "pointer is not a live allocation"),
        }
    }
}
