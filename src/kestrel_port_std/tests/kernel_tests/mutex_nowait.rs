//! `NOWAIT` on a locked bit fails immediately without a reschedule.
//!
//! `a` and `b` have the same priority, so any reschedule requested by `a`
//! would let `b` run.
use kestrel_kernel::{Hunk, LockMutexError, Mutex, System, WaitFlags, WAIT_FOREVER};

use crate::SeqTracker;

kestrel_port_std::use_port!(unsafe struct SystemTraits);
kestrel_kernel::build!(SystemTraits {
    tasks: 2,
    heap: 256,
    idle_stack: 256,
});

type Sys = System<SystemTraits>;

static M: Mutex<SystemTraits> = Mutex::new();
static SEQ: SeqTracker = SeqTracker::new();

static STACK_A: Hunk<[u8; 256]> = Hunk::new();
static STACK_B: Hunk<[u8; 256]> = Hunk::new();

fn init() {
    Sys::create_task("a", &STACK_A, 1, task_a, 0);
    Sys::create_task("b", &STACK_B, 1, task_b, 0);
}

fn task_a(_: usize) {
    SEQ.expect_and_replace(0, 1);

    M.lock(0b100, WaitFlags::NONE, WAIT_FOREVER).unwrap();
    assert_eq!(
        M.lock(0b100, WaitFlags::NOWAIT, 0),
        Err(LockMutexError::WouldBlock)
    );
    assert!(M.is_locked(0b100));
    assert!(!M.is_locked(0b011));

    SEQ.expect_and_replace(1, 2);

    // This one does reschedule
    M.unlock(0b100);

    SEQ.expect_and_replace(3, 4);
}

fn task_b(_: usize) {
    SEQ.expect_and_replace(2, 3);
    assert!(!M.is_locked(!0));
}

#[test]
fn mutex_nowait() {
    kestrel_port_std::boot::<SystemTraits>(init);
    kestrel_port_std::wait_until_idle::<SystemTraits>();
    assert_eq!(SEQ.get(), 4);
    kestrel_port_std::shutdown::<SystemTraits>();
}
