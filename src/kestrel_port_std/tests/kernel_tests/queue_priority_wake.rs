//! Two tasks wait for the same empty queue. Adding one message wakes only
//! the higher-priority one.
use kestrel_kernel::{Hunk, Queue, System, WaitFlags, WAIT_FOREVER};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::SeqTracker;

kestrel_port_std::use_port!(unsafe struct SystemTraits);
kestrel_kernel::build!(SystemTraits {
    tasks: 3,
    heap: 1024,
    idle_stack: 256,
});

type Sys = System<SystemTraits>;

static QUEUE: Queue<SystemTraits> = Queue::new();
static SEQ: SeqTracker = SeqTracker::new();
static B_WOKE: AtomicBool = AtomicBool::new(false);

static STACK_A: Hunk<[u8; 256]> = Hunk::new();
static STACK_B: Hunk<[u8; 256]> = Hunk::new();
static STACK_C: Hunk<[u8; 256]> = Hunk::new();

fn init() {
    QUEUE.create(2, 8);
    Sys::create_task("a", &STACK_A, 1, task_a, 0);
    Sys::create_task("b", &STACK_B, 2, task_b, 0);
    Sys::create_task("c", &STACK_C, 3, task_c, 0);
}

fn task_a(_: usize) {
    SEQ.expect_and_replace(0, 1);

    let mut buf = [0u8; 8];
    let len = QUEUE.remove(WaitFlags::NONE, WAIT_FOREVER, &mut buf).unwrap();
    assert_eq!(&buf[..len], b"hello");

    SEQ.expect_and_replace(3, 4);
}

fn task_b(_: usize) {
    SEQ.expect_and_replace(1, 2);

    let mut buf = [0u8; 8];
    let _ = QUEUE.remove(WaitFlags::NONE, WAIT_FOREVER, &mut buf);

    B_WOKE.store(true, Ordering::Relaxed);
}

fn task_c(_: usize) {
    SEQ.expect_and_replace(2, 3);

    // `a` preempts us here
    QUEUE.add(WaitFlags::NONE, WAIT_FOREVER, b"hello").unwrap();

    SEQ.expect_and_replace(4, 5);
    assert!(QUEUE.is_empty());
}

#[test]
fn queue_priority_wake() {
    kestrel_port_std::boot::<SystemTraits>(init);
    kestrel_port_std::wait_until_idle::<SystemTraits>();

    assert_eq!(SEQ.get(), 5);
    assert!(!B_WOKE.load(Ordering::Relaxed));

    kestrel_port_std::shutdown::<SystemTraits>();
}
