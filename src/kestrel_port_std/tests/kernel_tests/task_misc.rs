//! Task identity, creation from a running task, returning from the entry
//! point, and `suspend`.
use kestrel_kernel::{Hunk, System, TaskId};

use crate::SeqTracker;

kestrel_port_std::use_port!(unsafe struct SystemTraits);
kestrel_kernel::build!(SystemTraits {
    tasks: 3,
    heap: 256,
    idle_stack: 256,
});

type Sys = System<SystemTraits>;

static SEQ: SeqTracker = SeqTracker::new();

static STACK_A: Hunk<[u8; 256]> = Hunk::new();
static STACK_B: Hunk<[u8; 256]> = Hunk::new();
static STACK_C: Hunk<[u8; 256]> = Hunk::new();

fn init() {
    assert_eq!(Sys::create_task("a", &STACK_A, 2, task_a, 10).index(), 1);
    assert_eq!(Sys::create_task("b", &STACK_B, 3, task_b, 20).index(), 2);
}

fn task_a(param: usize) {
    SEQ.expect_and_replace(0, 1);
    assert_eq!(param, 10);
    assert_eq!(Sys::current_task().index(), 1);
    assert_eq!(Sys::current_context(), 10);

    // `c` outranks us, so it runs to completion right away
    let c = Sys::create_task("c", &STACK_C, 1, task_c, 30);
    assert_eq!(c.index(), 3);

    SEQ.expect_and_replace(2, 3);

    // Let the lower-priority `b` run. We're resumed once nothing else is
    // ready.
    Sys::suspend();

    SEQ.expect_and_replace(4, 5);
    assert_eq!(Sys::current_task().index(), 1);
}

fn task_b(param: usize) {
    SEQ.expect_and_replace(3, 4);
    assert_eq!(param, 20);
    assert_eq!(Sys::current_task().index(), 2);
    assert_ne!(Sys::current_task(), TaskId::IDLE);
}

fn task_c(_: usize) {
    SEQ.expect_and_replace(1, 2);
    assert_eq!(Sys::current_task().index(), 3);
    assert_eq!(Sys::current_context(), 30);
}

#[test]
fn task_misc() {
    kestrel_port_std::boot::<SystemTraits>(init);
    kestrel_port_std::wait_until_idle::<SystemTraits>();
    assert_eq!(SEQ.get(), 5);
    kestrel_port_std::shutdown::<SystemTraits>();
}
