//! AND and OR multi-waits over events and a queue.
use kestrel_kernel::{
    Combinator, Event, Hunk, MultiWait, Queue, QueueCondition, System, WaitFlags, WAIT_FOREVER,
};

use crate::SeqTracker;

kestrel_port_std::use_port!(unsafe struct SystemTraits);
kestrel_kernel::build!(SystemTraits {
    tasks: 2,
    heap: 512,
    idle_stack: 256,
});

type Sys = System<SystemTraits>;

static E1: Event<SystemTraits> = Event::new();
static E2: Event<SystemTraits> = Event::new();
static QUEUE: Queue<SystemTraits> = Queue::new();
static BOTH: MultiWait<SystemTraits> = MultiWait::new();
static EITHER: MultiWait<SystemTraits> = MultiWait::new();
static SEQ: SeqTracker = SeqTracker::new();

static STACK_A: Hunk<[u8; 256]> = Hunk::new();
static STACK_B: Hunk<[u8; 256]> = Hunk::new();

fn init() {
    QUEUE.create(2, 4);

    BOTH.create(2);
    BOTH.add_event(&E1, 0b1, WaitFlags::CLEAR);
    BOTH.add_event(&E2, 0b1, WaitFlags::CLEAR);

    EITHER.create(2);
    EITHER.add_event(&E1, 0b10, WaitFlags::NONE);
    EITHER.add_queue(&QUEUE, QueueCondition::NotEmpty);

    Sys::create_task("a", &STACK_A, 1, task_a, 0);
    Sys::create_task("b", &STACK_B, 2, task_b, 0);
}

fn task_a(_: usize) {
    SEQ.expect_and_replace(0, 1);

    let ready = BOTH.wait(Combinator::And, WAIT_FOREVER).unwrap();
    assert_eq!(ready.bits(), 0b11);
    assert_eq!(E1.get(), 0);
    assert_eq!(E2.get(), 0);

    SEQ.expect_and_replace(3, 4);

    let ready = EITHER.wait(Combinator::Or, WAIT_FOREVER).unwrap();
    assert!(!ready.contains(0));
    assert!(ready.contains(1));
    assert_eq!(ready.iter().collect::<Vec<_>>(), [1]);

    // The queue sub-wait only observes the queue
    assert_eq!(QUEUE.len(), 1);
    let mut buf = [0u8; 4];
    assert_eq!(QUEUE.remove(WaitFlags::NOWAIT, WAIT_FOREVER, &mut buf), Ok(1));

    SEQ.expect_and_replace(5, 6);
}

fn task_b(_: usize) {
    SEQ.expect_and_replace(1, 2);

    // Half of an AND doesn't wake `a`
    E1.raise(0b1);
    SEQ.expect_and_replace(2, 3);
    E2.raise(0b1);

    SEQ.expect_and_replace(4, 5);
    QUEUE.add(WaitFlags::NONE, WAIT_FOREVER, b"x").unwrap();

    SEQ.expect_and_replace(6, 7);
}

#[test]
fn multiwait_compose() {
    kestrel_port_std::boot::<SystemTraits>(init);
    kestrel_port_std::wait_until_idle::<SystemTraits>();
    assert_eq!(SEQ.get(), 7);
    kestrel_port_std::shutdown::<SystemTraits>();
}
