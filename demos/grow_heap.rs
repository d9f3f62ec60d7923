//! This is a very minimal example to show using the HeapGrower functions.

use gapalloc::HeapGrower;
#[cfg(feature = "use_libc")]
use gapalloc::arena::LibcHeapGrower;
#[cfg(not(feature = "use_libc"))]
use gapalloc::arena::SyscallHeapGrower;

fn main() {
    #[cfg(feature = "use_libc")]
    {
        // LibcHeapGrower uses libc to call sbrk
        println!("Using libc");
        let mut lhg = LibcHeapGrower::default();
        let (p, sz) = unsafe { lhg.grow_heap(8).unwrap() };
        println!("Returned: ({:p}={}, {})", p, p as i64, sz);
        let (q, sz) = unsafe { lhg.grow_heap(10_000).unwrap() };
        println!("Returned: ({:p}={}, {})", q, q as i64, sz);
    }

    #[cfg(not(feature = "use_libc"))]
    {
        // SyscallHeapGrower uses inline assembly to make a direct brk syscall.
        println!("Using brk syscalls");
        let mut shg = SyscallHeapGrower::default();
        let (p, sz) = unsafe { shg.grow_heap(8).unwrap() };
        println!("Returned: ({:p}={}, {})", p, p as i64, sz);
        let (q, sz) = unsafe { shg.grow_heap(10_000).unwrap() };
        println!("Returned: ({:p}={}, {})", q, q as i64, sz);
    }
}
