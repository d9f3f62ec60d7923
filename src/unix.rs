//! Moving the program break without libc.
//!
//! Linux exposes `brk(2)` as a raw system call with slightly different
//! semantics from the libc wrapper: it always returns the (possibly unchanged)
//! break, and never sets errno. `sbrk` is built on top of that.
//!
//! Note that glibc caches the break it last saw. Do not mix this with a libc
//! that also calls `sbrk`; use the `use_libc` feature in that case.

use core::arch::asm;
use core::fmt;
use core::ptr::null_mut;

//============================================================
// System call code
#[cfg(target_arch = "x86_64")]
const SYS_BRK: usize = 12;
#[cfg(target_arch = "aarch64")]
const SYS_BRK: usize = 214;

/// Errors from moving the program break.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrkError {
    /// `current + increment` does not fit in the address space.
    Overflow,
    /// The kernel left the break below the requested address.
    Refused { current: usize, requested: usize },
}

impl fmt::Display for BrkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrkError::Overflow => write!(f, "program break would overflow"),
            BrkError::Refused { current, requested } => write!(
                f,
                "kernel refused to move the break from {:#x} to {:#x}",
                current, requested
            ),
        }
    }
}

/// Set the program break to `addr`, returning the new break. A null `addr`
/// only queries it.
///
/// # Safety
///
/// Lowering the break unmaps memory that may still be in use.
#[cfg(target_arch = "x86_64")]
pub unsafe fn brk(addr: *mut u8) -> *mut u8 {
    let mut in_out: usize = SYS_BRK;

    asm!(
        "syscall",
        inlateout("rax") in_out,
        in("rdi") addr as usize,
        lateout("rcx") _,
        lateout("r11") _,
        options(nostack),
    );

    in_out as *mut u8
}

/// Set the program break to `addr`, returning the new break. A null `addr`
/// only queries it.
///
/// # Safety
///
/// Lowering the break unmaps memory that may still be in use.
#[cfg(target_arch = "aarch64")]
pub unsafe fn brk(addr: *mut u8) -> *mut u8 {
    let mut in_out: usize = addr as usize;

    asm!(
        "svc 0",
        inlateout("x0") in_out,
        in("x8") SYS_BRK,
        options(nostack),
    );

    in_out as *mut u8
}

/// Move the break up by `increment` bytes, returning the old break: the start
/// of the newly claimed memory.
///
/// # Safety
///
/// The returned memory is uninitialized and owned by the caller; nothing else
/// may move the break down past it.
pub unsafe fn sbrk(increment: usize) -> Result<*mut u8, BrkError> {
    let current = brk(null_mut());
    if increment == 0 {
        return Ok(current);
    }

    let requested = (current as usize)
        .checked_add(increment)
        .ok_or(BrkError::Overflow)?;
    let new_break = brk(requested as *mut u8);
    if (new_break as usize) < requested {
        return Err(BrkError::Refused {
            current: current as usize,
            requested,
        });
    }

    Ok(current)
}
