//! Runtime configuration for [`RawAlloc`](../allocators/struct.RawAlloc.html).
//!
//! Compile-time choices (which heap grower to use, whether to log) are cargo
//! features; see the crate documentation.

use crate::blocklist::{ALIGNMENT, HEADER_SIZE};

/// How a requested size is turned into a block extent.
///
/// Both policies reserve two header's worth of space ahead of the payload, so
/// every block can hand out at least `HEADER_SIZE` more bytes than were asked
/// for. They differ only on sizes that are already a multiple of the
/// alignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rounding {
    /// Round the payload up to the next multiple of 16; aligned sizes are kept
    /// as they are.
    Aligned,
    /// Always pad by `16 - size % 16`, which adds a full alignment unit to
    /// sizes that are already aligned. Keeps usable sizes identical to
    /// allocators that always pad.
    Padded,
}

impl Rounding {
    /// The extent of a block holding `size` bytes, or `None` if it does not
    /// fit in a `usize`.
    pub fn block_size(self, size: usize) -> Option<usize> {
        let payload = match self {
            Rounding::Aligned => size.checked_add(ALIGNMENT - 1)? & !(ALIGNMENT - 1),
            Rounding::Padded => size.checked_add(ALIGNMENT - size % ALIGNMENT)?,
        };
        payload.checked_add(2 * HEADER_SIZE)
    }
}

impl Default for Rounding {
    fn default() -> Self {
        Rounding::Aligned
    }
}

/// Allocator settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    pub rounding: Rounding,
    /// Check block tags and links before freeing, resizing or measuring a
    /// pointer. Turning this off trusts every pointer handed back.
    pub verify_frees: bool,
}

impl Config {
    pub const DEFAULT: Config = Config {
        rounding: Rounding::Aligned,
        verify_frees: true,
    };

    pub const fn new() -> Self {
        Config::DEFAULT
    }

    pub const fn with_rounding(self, rounding: Rounding) -> Self {
        Config { rounding, ..self }
    }

    pub const fn with_verify_frees(self, verify_frees: bool) -> Self {
        Config {
            verify_frees,
            ..self
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::DEFAULT
    }
}
