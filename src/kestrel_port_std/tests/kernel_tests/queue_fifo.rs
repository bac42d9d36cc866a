//! A producer fills a queue beyond its capacity. Messages come out in order,
//! and `add` blocks exactly when the ring is full.
use kestrel_kernel::{Hunk, Queue, QueueError, System, WaitFlags, WAIT_FOREVER};

use crate::SeqTracker;

kestrel_port_std::use_port!(unsafe struct SystemTraits);
kestrel_kernel::build!(SystemTraits {
    tasks: 2,
    heap: 1024,
    idle_stack: 256,
});

type Sys = System<SystemTraits>;

const MESSAGES: [&[u8]; 5] = [b"m0", b"msg1", b"", b"message3", b"m4"];

static QUEUE: Queue<SystemTraits> = Queue::new();
static SEQ: SeqTracker = SeqTracker::new();

static STACK_P: Hunk<[u8; 256]> = Hunk::new();
static STACK_C: Hunk<[u8; 256]> = Hunk::new();

fn init() {
    QUEUE.create(3, 8);
    Sys::create_task("producer", &STACK_P, 1, producer, 0);
    Sys::create_task("consumer", &STACK_C, 2, consumer, 0);
}

fn producer(_: usize) {
    SEQ.expect_and_replace(0, 1);

    for msg in &MESSAGES[..3] {
        QUEUE.add(WaitFlags::NOWAIT, WAIT_FOREVER, msg).unwrap();
    }
    assert!(QUEUE.is_full());
    assert_eq!(QUEUE.len(), 3);
    assert_eq!(
        QUEUE.add(WaitFlags::NOWAIT, WAIT_FOREVER, MESSAGES[3]),
        Err(QueueError::WouldBlock)
    );

    SEQ.expect_and_replace(1, 2);
    QUEUE.add(WaitFlags::NONE, WAIT_FOREVER, MESSAGES[3]).unwrap();

    SEQ.expect_and_replace(3, 4);
    QUEUE.add(WaitFlags::NONE, WAIT_FOREVER, MESSAGES[4]).unwrap();

    SEQ.expect_and_replace(5, 6);
}

fn consumer(_: usize) {
    let mut buf = [0u8; 8];

    SEQ.expect_and_replace(2, 3);
    // The producer preempts us as soon as a slot is freed
    let len = QUEUE.remove(WaitFlags::NONE, WAIT_FOREVER, &mut buf).unwrap();
    assert_eq!(&buf[..len], MESSAGES[0]);

    SEQ.expect_and_replace(4, 5);
    let len = QUEUE.remove(WaitFlags::NONE, WAIT_FOREVER, &mut buf).unwrap();
    assert_eq!(&buf[..len], MESSAGES[1]);

    SEQ.expect_and_replace(6, 7);
    for msg in &MESSAGES[2..] {
        let len = QUEUE.remove(WaitFlags::NONE, WAIT_FOREVER, &mut buf).unwrap();
        assert_eq!(&buf[..len], *msg);
    }
    assert_eq!(
        QUEUE.remove(WaitFlags::NOWAIT, WAIT_FOREVER, &mut buf),
        Err(QueueError::WouldBlock)
    );

    // A short buffer receives a truncated copy
    QUEUE.add(WaitFlags::NONE, WAIT_FOREVER, b"abcdef").unwrap();
    let mut short = [0u8; 3];
    assert_eq!(
        QUEUE.remove(WaitFlags::NONE, WAIT_FOREVER, &mut short),
        Ok(3)
    );
    assert_eq!(&short, b"abc");

    // `flush` discards everything
    QUEUE.add(WaitFlags::NONE, WAIT_FOREVER, b"x").unwrap();
    QUEUE.add(WaitFlags::NONE, WAIT_FOREVER, b"y").unwrap();
    QUEUE.flush();
    assert!(QUEUE.is_empty());
    assert_eq!(
        QUEUE.remove(WaitFlags::NOWAIT, WAIT_FOREVER, &mut buf),
        Err(QueueError::WouldBlock)
    );

    SEQ.expect_and_replace(7, 8);
}

#[test]
fn queue_fifo() {
    kestrel_port_std::boot::<SystemTraits>(init);
    kestrel_port_std::wait_until_idle::<SystemTraits>();
    assert_eq!(SEQ.get(), 8);
    kestrel_port_std::shutdown::<SystemTraits>();
}
