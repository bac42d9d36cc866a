//! Two busy tasks of equal priority share the CPU through time slicing.
//!
//! Neither task ever blocks or requests a reschedule before both have made
//! progress, so the test completes only if the tick handler rotates them.
use kestrel_kernel::{Event, Hunk, System};
use std::{
    sync::atomic::{AtomicUsize, Ordering},
    thread,
    time::Duration,
};

kestrel_port_std::use_port!(unsafe struct SystemTraits);
kestrel_kernel::build!(SystemTraits {
    tasks: 2,
    heap: 256,
    idle_stack: 256,
    time_slice: 2,
});

type Sys = System<SystemTraits>;

const ROUNDS: usize = 100;

static E: Event<SystemTraits> = Event::new();
static COUNTS: [AtomicUsize; 2] = [AtomicUsize::new(0), AtomicUsize::new(0)];
static DONE: AtomicUsize = AtomicUsize::new(0);

static STACKS: [Hunk<[u8; 256]>; 2] = [Hunk::new(), Hunk::new()];

fn init() {
    for (i, stack) in STACKS.iter().enumerate() {
        Sys::create_task("spinner", stack, 1, spinner, i);
    }
}

fn spinner(i: usize) {
    assert_eq!(Sys::current_context(), i);
    let (me, other) = (&COUNTS[i], &COUNTS[1 - i]);

    while me.load(Ordering::Relaxed) < ROUNDS || other.load(Ordering::Relaxed) < ROUNDS {
        me.fetch_add(1, Ordering::Relaxed);

        // A kernel call gives the port a chance to take the tick
        let _ = E.get();
    }

    log::debug!("spinner {} done after {} rounds", i, me.load(Ordering::Relaxed));
    DONE.fetch_add(1, Ordering::Relaxed);
}

#[test]
fn round_robin() {
    kestrel_port_std::boot::<SystemTraits>(init);

    for _ in 0..10_000 {
        if DONE.load(Ordering::Relaxed) == 2 {
            break;
        }
        kestrel_port_std::pend_interrupt_line::<SystemTraits>(
            kestrel_port_std::INTERRUPT_LINE_TIMER,
        )
        .unwrap();
        thread::sleep(Duration::from_millis(1));
    }

    assert_eq!(DONE.load(Ordering::Relaxed), 2);
    kestrel_port_std::wait_until_idle::<SystemTraits>();
    assert!(COUNTS.iter().all(|c| c.load(Ordering::Relaxed) >= ROUNDS));
    assert!(kestrel_port_std::tick_count::<SystemTraits>() > 0);

    kestrel_port_std::shutdown::<SystemTraits>();
}
