//! Builds gapalloc's C allocator interface into `libgapalloc_malloc.so` and
//! `libgapalloc_malloc.a`.
//!
//! ```sh
//! LD_PRELOAD=target/release/libgapalloc_malloc.so ls
//! ```
//!
//! This crate links `std`, which brings the panic handler the `no_std`
//! allocator crate leaves out; a panic raised by an invalid free aborts.

pub use gapalloc::capi::{calloc, free, malloc, malloc_usable_size, realloc};
