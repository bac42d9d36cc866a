//! Tasks allocate from and return regions to the kernel heap.
use kestrel_kernel::{Hunk, System, HEAP_ALIGN};

use crate::SeqTracker;

kestrel_port_std::use_port!(unsafe struct SystemTraits);
kestrel_kernel::build!(SystemTraits {
    tasks: 2,
    heap: 1024,
    idle_stack: 256,
});

type Sys = System<SystemTraits>;

static SEQ: SeqTracker = SeqTracker::new();

static STACK_A: Hunk<[u8; 256]> = Hunk::new();
static STACK_B: Hunk<[u8; 256]> = Hunk::new();

fn init() {
    Sys::create_task("a", &STACK_A, 1, task_a, 0);
    Sys::create_task("b", &STACK_B, 2, task_b, 0);
}

fn task_a(_: usize) {
    SEQ.expect_and_replace(0, 1);

    let p1 = Sys::alloc(100);
    let p2 = Sys::alloc(1);
    assert_eq!(p1.as_ptr() as usize % HEAP_ALIGN, 0);
    assert_eq!(p2.as_ptr() as usize % HEAP_ALIGN, 0);
    assert_ne!(p1, p2);

    unsafe {
        p1.as_ptr().write_bytes(0xaa, 100);
        p2.as_ptr().write(0x55);
    }

    let stats = Sys::heap_stats();
    assert_eq!(stats.blocks, 3);
    assert_eq!(stats.free_blocks, 1);
    assert_eq!(stats.used_bytes, 104 + 8);

    // Writing to `p1` didn't clobber `p2` or the block headers
    unsafe {
        assert_eq!(*p2.as_ptr(), 0x55);
        Sys::free(p1);
    }

    let stats = Sys::heap_stats();
    assert_eq!(stats.used_bytes, 8);
    assert_eq!(stats.free_blocks, 2);

    // The freed block is reused for a request that fits
    let p3 = Sys::alloc(64);
    assert_eq!(p3, p1);

    unsafe {
        Sys::free(p3);
        Sys::free(p2);
    }

    SEQ.expect_and_replace(1, 2);
}

fn task_b(_: usize) {
    SEQ.expect_and_replace(2, 3);

    // Everything `a` freed is coalesced on the next walk
    let p = Sys::alloc(512);
    let stats = Sys::heap_stats();
    assert_eq!(stats.used_bytes, 512);
    assert_eq!(stats.adjacent_free_pairs, 0);
    unsafe { Sys::free(p) };
}

#[test]
fn heap_alloc() {
    kestrel_port_std::boot::<SystemTraits>(init);
    kestrel_port_std::wait_until_idle::<SystemTraits>();
    assert_eq!(SEQ.get(), 3);
    kestrel_port_std::shutdown::<SystemTraits>();
}
