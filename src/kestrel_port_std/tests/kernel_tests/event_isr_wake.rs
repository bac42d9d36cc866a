//! Event bits are level-triggered, and an interrupt handler can wake a
//! waiter with `raise_ns` followed by `request_reschedule`.
use kestrel_kernel::{Event, Hunk, System, WaitEventError, WaitFlags, WAIT_FOREVER};

use crate::SeqTracker;

kestrel_port_std::use_port!(unsafe struct SystemTraits);
kestrel_kernel::build!(SystemTraits {
    tasks: 2,
    heap: 256,
    idle_stack: 256,
});

type Sys = System<SystemTraits>;

const INT_LINE: usize = 3;

static E: Event<SystemTraits> = Event::new();
static SEQ: SeqTracker = SeqTracker::new();

static STACK_A: Hunk<[u8; 256]> = Hunk::new();
static STACK_B: Hunk<[u8; 256]> = Hunk::new();

fn init() {
    Sys::create_task("a", &STACK_A, 1, task_a, 0);
    Sys::create_task("b", &STACK_B, 2, task_b, 0);
}

fn task_a(_: usize) {
    SEQ.expect_and_replace(0, 1);

    // Raise before wait: no blocking, so `b` doesn't get to run
    E.raise(0b1);
    assert_eq!(E.wait(0b1, WaitFlags::NONE, WAIT_FOREVER), Ok(0b1));
    assert_eq!(E.wait(0b1, WaitFlags::CLEAR, WAIT_FOREVER), Ok(0b1));
    assert_eq!(E.get(), 0);
    assert_eq!(
        E.wait(0b1, WaitFlags::NOWAIT, WAIT_FOREVER),
        Err(WaitEventError::WouldBlock)
    );

    SEQ.expect_and_replace(1, 2);

    // Woken up by `isr`
    assert_eq!(E.wait(0b110, WaitFlags::CLEAR, WAIT_FOREVER), Ok(0b100));
    assert_eq!(E.get(), 0b1000);

    SEQ.expect_and_replace(3, 4);
}

fn task_b(_: usize) {
    SEQ.expect_and_replace(2, 3);

    // Bits outside `a`'s mask don't wake it up
    E.raise(0b1000);
}

fn isr() {
    E.raise_ns(0b100);
    Sys::request_reschedule();
}

#[test]
fn event_isr_wake() {
    kestrel_port_std::set_interrupt_handler::<SystemTraits>(INT_LINE, isr).unwrap();
    kestrel_port_std::boot::<SystemTraits>(init);
    kestrel_port_std::wait_until_idle::<SystemTraits>();
    assert_eq!(SEQ.get(), 3);

    kestrel_port_std::pend_interrupt_line::<SystemTraits>(INT_LINE).unwrap();
    kestrel_port_std::wait_until_idle::<SystemTraits>();
    assert_eq!(SEQ.get(), 4);

    kestrel_port_std::shutdown::<SystemTraits>();
}
