//! Timed waits expire after the requested number of ticks (or one more).
use kestrel_kernel::{
    Event, Hunk, LockMutexError, Mutex, Queue, QueueError, System, Ticks, WaitEventError,
    WaitFlags, EXPIRED, WAIT_FOREVER,
};

use crate::SeqTracker;

kestrel_port_std::use_port!(unsafe struct SystemTraits);
kestrel_kernel::build!(SystemTraits {
    tasks: 1,
    heap: 512,
    idle_stack: 256,
    tick_period_us: 500,
});

type Sys = System<SystemTraits>;

static E: Event<SystemTraits> = Event::new();
static M: Mutex<SystemTraits> = Mutex::new();
static QUEUE: Queue<SystemTraits> = Queue::new();
static SEQ: SeqTracker = SeqTracker::new();

static STACK: Hunk<[u8; 256]> = Hunk::new();

fn init() {
    QUEUE.create(1, 4);
    Sys::create_task("a", &STACK, 1, task_body, 0);
}

/// Run `f` and assert that it took `n` or `n + 1` ticks.
#[track_caller]
fn expect_elapsed(n: Ticks, f: impl FnOnce()) {
    let start = kestrel_port_std::tick_count::<SystemTraits>();
    f();
    let elapsed = kestrel_port_std::tick_count::<SystemTraits>() - start;
    log::debug!("elapsed = {} (expected {})", elapsed, n);
    assert!(elapsed >= n as u64 && elapsed <= n as u64 + 1);
}

fn task_body(_: usize) {
    SEQ.expect_and_replace(0, 1);

    // 0.5ms per tick
    assert_eq!(Sys::ms_to_ticks(2), 4);
    assert_eq!(Sys::us_to_ticks(1), 1);

    expect_elapsed(5, || {
        assert_eq!(
            E.wait(0b1, WaitFlags::NONE, 5),
            Err(WaitEventError::Timeout)
        );
    });

    expect_elapsed(4, || Sys::sleep(Sys::ms_to_ticks(2)));

    expect_elapsed(2, || {
        let mut buf = [0u8; 4];
        assert_eq!(
            QUEUE.remove(WaitFlags::NONE, 2, &mut buf),
            Err(QueueError::Timeout)
        );
    });

    // There's no ownership, so this blocks
    M.lock(0b1, WaitFlags::NONE, WAIT_FOREVER).unwrap();
    expect_elapsed(3, || {
        assert_eq!(
            M.lock(0b1, WaitFlags::NONE, 3),
            Err(LockMutexError::Timeout)
        );
    });

    // An already-expired timeout fails without blocking
    expect_elapsed(0, || {
        assert_eq!(
            E.wait(0b1, WaitFlags::NONE, EXPIRED),
            Err(WaitEventError::Timeout)
        );
    });

    // `sleep(0)` returns immediately
    expect_elapsed(0, || Sys::sleep(0));

    SEQ.expect_and_replace(1, 2);
}

#[test]
fn timeouts() {
    kestrel_port_std::boot::<SystemTraits>(init);
    kestrel_port_std::advance_ticks::<SystemTraits>(20);
    assert_eq!(SEQ.get(), 2);
    kestrel_port_std::shutdown::<SystemTraits>();
}
