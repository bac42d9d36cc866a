//! A port for testing the kernel's bookkeeping without actually switching
//! contexts. The dispatcher is driven by hand with [`dispatch`], and
//! reschedule requests are merely counted.
//!
//! Every kernel built with [`mock_kernel!`] has its own state, and the CPU
//! Lock flag is thread-local, so tests running in parallel don't interfere
//! with each other as long as each uses its own kernel.
use std::cell::Cell;

use crate::{
    klock, sched,
    task::{runqueue, TaskId},
    timeout::Ticks,
    wait::LockKind,
    Hunk, KernelTraits,
};

thread_local! {
    static CPU_LOCK: Cell<bool> = Cell::new(false);
    static RESCHEDULES: Cell<usize> = Cell::new(0);
}

/// Define a kernel trait type `$Name` using the mock port.
macro_rules! mock_kernel {
    ($Name:ident $(, time_slice: $time_slice:expr)?) => {
        #[allow(dead_code)]
        struct $Name;

        unsafe impl crate::PortThreading for $Name {
            type PortTaskState = ();
            const PORT_TASK_STATE_INIT: () = ();
            const STACK_MIN_SIZE: usize = 64;

            unsafe fn dispatch_first_task() -> ! {
                unimplemented!("the mock port doesn't switch contexts")
            }

            unsafe fn yield_cpu() {
                crate::test_port::yield_cpu();
            }

            unsafe fn enter_cpu_lock() {
                crate::test_port::enter_cpu_lock();
            }

            unsafe fn leave_cpu_lock() {
                crate::test_port::leave_cpu_lock();
            }

            unsafe fn initialize_task_state(
                _task: &'static crate::TaskCb<Self>,
                _attr: &crate::TaskAttr,
            ) {
            }

            fn is_cpu_lock_active() -> bool {
                crate::test_port::is_cpu_lock_active()
            }

            fn is_task_context() -> bool {
                true
            }

            fn wait_for_interrupt() {}
        }

        build!($Name {
            tasks: 4,
            heap: 4096,
            idle_stack: 256
            $(, time_slice: $time_slice)?
        });
    };
}

pub(crate) fn yield_cpu() {
    RESCHEDULES.with(|x| x.set(x.get() + 1));
}

pub(crate) fn enter_cpu_lock() {
    CPU_LOCK.with(|x| {
        assert!(!x.get(), "CPU Lock is already active");
        x.set(true);
    });
}

pub(crate) fn leave_cpu_lock() {
    CPU_LOCK.with(|x| {
        // A fatal error may unwind through a guard
        if !std::thread::panicking() {
            assert!(x.get(), "CPU Lock is not active");
        }
        x.set(false);
    });
}

pub(crate) fn is_cpu_lock_active() -> bool {
    CPU_LOCK.with(Cell::get)
}

/// Get the number of reschedule requests made since [`start`].
pub(crate) fn reschedule_count() -> usize {
    RESCHEDULES.with(Cell::get)
}

/// Allocate a task stack.
pub(crate) fn stack() -> &'static Hunk<[u8]> {
    Box::leak(Box::new(Hunk::<[u8; 256]>::new()))
}

/// Mark the kernel as started, so that reschedule requests reach the port,
/// and reset the reschedule counter.
pub(crate) fn start<Traits: KernelTraits>() {
    let mut lock = klock::lock_cpu::<Traits>();
    Traits::state().started.replace(&mut lock, true);
    drop(lock);
    RESCHEDULES.with(|x| x.set(0));
}

/// Run the scheduler as the port's dispatcher would.
pub(crate) fn dispatch<Traits: KernelTraits>() -> TaskId {
    let mut lock = klock::lock_cpu::<Traits>();
    sched::choose_running_task(&mut lock)
}

pub(crate) fn set_lock<Traits: KernelTraits>(task: TaskId, kind: LockKind<Traits>) {
    let mut lock = klock::lock_cpu::<Traits>();
    Traits::state().task_cb(task).lock.replace(&mut lock, kind);
}

pub(crate) fn lock_kind<Traits: KernelTraits>(task: TaskId) -> LockKind<Traits> {
    let lock = klock::lock_cpu::<Traits>();
    Traits::state().task_cb(task).lock.read(&lock).clone()
}

pub(crate) fn set_timeout<Traits: KernelTraits>(task: TaskId, timeout: Ticks) {
    let mut lock = klock::lock_cpu::<Traits>();
    Traits::state().task_cb(task).timeout.replace(&mut lock, timeout);
}

pub(crate) fn timeout_of<Traits: KernelTraits>(task: TaskId) -> Ticks {
    let lock = klock::lock_cpu::<Traits>();
    Traits::state().task_cb(task).timeout.get(&lock)
}

/// Get the contents of the scheduler queue from head to tail.
pub(crate) fn run_queue<Traits: KernelTraits>() -> Vec<TaskId> {
    let mut lock = klock::lock_cpu::<Traits>();
    runqueue::with_run_queue(&mut lock, |head, links| head.iter(&*links).collect())
}
