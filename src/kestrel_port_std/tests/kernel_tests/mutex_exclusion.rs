//! Three tasks contend for one mutex bit, yielding while they hold it.
//! No two of them are ever inside the critical section at once.
use kestrel_kernel::{Hunk, Mutex, System, WaitFlags, WAIT_FOREVER};
use std::sync::atomic::{AtomicUsize, Ordering};

kestrel_port_std::use_port!(unsafe struct SystemTraits);
kestrel_kernel::build!(SystemTraits {
    tasks: 3,
    heap: 256,
    idle_stack: 256,
});

type Sys = System<SystemTraits>;

const ROUNDS: usize = 20;
const BIT: u32 = 1 << 7;

static M: Mutex<SystemTraits> = Mutex::new();
static INSIDE: AtomicUsize = AtomicUsize::new(0);
static ENTRIES: AtomicUsize = AtomicUsize::new(0);
static CONTENDED: AtomicUsize = AtomicUsize::new(0);

static STACKS: [Hunk<[u8; 256]>; 3] = [Hunk::new(), Hunk::new(), Hunk::new()];

fn init() {
    for (i, stack) in STACKS.iter().enumerate() {
        Sys::create_task("worker", stack, 1, worker, i);
    }
}

fn worker(_: usize) {
    for _ in 0..ROUNDS {
        if M.is_locked(BIT) {
            CONTENDED.fetch_add(1, Ordering::Relaxed);
        }
        M.lock(BIT, WaitFlags::NONE, WAIT_FOREVER).unwrap();

        assert_eq!(INSIDE.fetch_add(1, Ordering::Relaxed), 0);
        ENTRIES.fetch_add(1, Ordering::Relaxed);

        // Let the others pile up on the bit
        Sys::request_reschedule();

        assert_eq!(INSIDE.fetch_sub(1, Ordering::Relaxed), 1);
        M.unlock(BIT);
    }
}

#[test]
fn mutex_exclusion() {
    kestrel_port_std::boot::<SystemTraits>(init);
    kestrel_port_std::wait_until_idle::<SystemTraits>();

    assert_eq!(ENTRIES.load(Ordering::Relaxed), 3 * ROUNDS);
    assert_eq!(INSIDE.load(Ordering::Relaxed), 0);
    assert!(CONTENDED.load(Ordering::Relaxed) > 0);

    kestrel_port_std::shutdown::<SystemTraits>();
}
