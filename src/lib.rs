#![cfg_attr(not(test), no_std)]

//! A first-fit memory allocator over a single `sbrk`-grown arena.
//!
//! Every live allocation is a block: a small header followed by the payload
//! handed to the caller. Headers are linked in address order, and that list is
//! the only bookkeeping there is; free memory is whatever lies between two
//! live blocks, before the first one, or after the last. Allocating scans those
//! gaps from the lowest address and takes the first one that fits, growing the
//! arena a page at a time when none does. Memory is never returned to the OS.
//!
//! ```text
//!  base                                                     base + capacity
//!   |  gap  | hdr | payload | hdr | payload |   gap   | hdr | payload | gap |
//!           '---- block ----'---- block ----'         '---- block ----'
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use gapalloc::UnixAllocator;
//!
//! #[global_allocator]
//! static ALLOCATOR: UnixAllocator = UnixAllocator::new();
//!
//! fn main() {
//!     let v: Vec<u32> = vec![1, 2, 3];
//!     println!("{:?}", v);
//! }
//! ```
//!
//! For `malloc`-style use (`allocate`, `free`, `zero_allocate`, `resize`,
//! `usable_size`) see [`RawAlloc`](allocators/struct.RawAlloc.html) and
//! [`GenericAllocator`](allocators/struct.GenericAllocator.html).
//!
//! ## Features
//!
//! - `use_libc` (default): grow the arena with `libc::sbrk`. Without it, the
//!   `brk` system call is made directly (Linux on x86_64 and aarch64 only).
//! - `logging`: report arena growth and placement through `log`. Only use this
//!   with a logger that does not allocate when this is the global allocator.
//! - `c_api`: export `malloc`, `free`, `calloc`, `realloc` and
//!   `malloc_usable_size` with C linkage (see [`capi`](capi/index.html)). The
//!   `gapalloc-malloc` crate in this workspace builds them into a shared and a
//!   static library.

#[macro_use]
mod macros;

pub mod allocators;
pub mod arena;
pub mod blocklist;
#[cfg(all(
    feature = "c_api",
    any(
        feature = "use_libc",
        all(
            target_os = "linux",
            any(target_arch = "x86_64", target_arch = "aarch64")
        )
    )
))]
pub mod capi;
pub mod config;
pub mod error;
#[cfg(all(
    not(feature = "use_libc"),
    target_os = "linux",
    any(target_arch = "x86_64", target_arch = "aarch64")
))]
pub mod unix;

pub use allocators::{GenericAllocator, RawAlloc};
#[cfg(any(
    feature = "use_libc",
    all(
        target_os = "linux",
        any(target_arch = "x86_64", target_arch = "aarch64")
    )
))]
pub use allocators::UnixAllocator;
pub use arena::{Growth, HeapGrower, ToyHeap};
pub use config::{Config, Rounding};
pub use error::AllocError;
