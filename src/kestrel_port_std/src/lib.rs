#![doc = include_str!("./lib.md")]
#![deny(unsafe_op_in_unsafe_fn)]
use kestrel_kernel::{KernelTraits, PortThreading, PortToKernel, System, TaskAttr, TaskCb};
use spin::Mutex as SpinMutex;
use std::{
    cell::Cell,
    panic::{catch_unwind, resume_unwind, AssertUnwindSafe},
    sync::{Condvar, Mutex, MutexGuard, PoisonError},
    thread::{self, JoinHandle},
    time::Duration,
};

mod sched;

pub use self::sched::{BadIntLineError, InterruptHandler, InterruptNum, NUM_INTERRUPT_LINES};
use self::sched::{Owner, SchedState};

/// Used by `use_port!`
#[doc(hidden)]
pub extern crate kestrel_kernel;

/// The (software) interrupt line used for timer interrupts. It has the lowest
/// priority among all lines.
pub const INTERRUPT_LINE_TIMER: InterruptNum = NUM_INTERRUPT_LINES - 1;

/// Implemented on a kernel trait type by [`use_port!`].
///
/// # Safety
///
/// Only meant to be implemented by [`use_port!`].
#[doc(hidden)]
pub unsafe trait PortInstance:
    KernelTraits + PortThreading<PortTaskState = TaskState> + PortToKernel
{
    fn port_state() -> &'static State;
}

/// The internal state of the port.
///
/// The simulated processor is a baton passed between host threads. Each task
/// is backed by its own thread, and only the thread identified by
/// `SchedState::owner` may execute. Interrupt handlers run on the owner
/// thread whenever it passes through a preemption point (the end of a CPU
/// Lock section, or the idle task's `wait_for_interrupt`).
///
/// # Safety
///
/// For the safety information of this type's methods, see the documentation of
/// the corresponding trait methods of `PortThreading`.
#[doc(hidden)]
pub struct State {
    sched: Mutex<SchedState>,
    cond: Condvar,
}

#[derive(Debug)]
pub struct TaskState {
    /// The task's state in the task state machine.
    ///
    /// This field is only accessed with CPU Lock active or by the dispatcher,
    /// so `SpinMutex` is sufficient.
    tsm: SpinMutex<Tsm>,
}

impl TaskState {
    pub const fn new() -> Self {
        Self {
            tsm: SpinMutex::new(Tsm::Uninit),
        }
    }
}

impl Default for TaskState {
    fn default() -> Self {
        Self::new()
    }
}

/// Task state machine
#[derive(Debug, Clone, Copy)]
enum Tsm {
    /// `initialize_task_state` hasn't been called yet.
    Uninit,
    /// The task's initial context is ready, but no thread backs it yet.
    Dormant { entry_point: fn(usize), entry_param: usize },
    /// A thread has been spawned for the task.
    Running,
}

/// The role of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ThreadRole {
    Unknown,
    Boot,
    /// The thread is running an interrupt handler.
    Interrupt,
    /// The backing thread for a task.
    Task,
}

thread_local! {
    /// The current thread's role. It's automatically assigned after the
    /// creation of a thread managed by the port.
    static THREAD_ROLE: Cell<ThreadRole> = Cell::new(ThreadRole::Unknown);

    /// The execution context the current thread backs.
    static THREAD_OWNER: Cell<Owner> = Cell::new(Owner::None);
}

/// The unwinding payload used to terminate a port-managed thread.
struct ThreadExit;

fn exit_thread() -> ! {
    resume_unwind(Box::new(ThreadExit))
}

type SchedGuard<'a> = MutexGuard<'a, SchedState>;

#[allow(clippy::missing_safety_doc)]
impl State {
    #[allow(clippy::new_without_default)]
    pub const fn new() -> Self {
        Self {
            sched: Mutex::new(SchedState::new()),
            cond: Condvar::new(),
        }
    }

    fn lock_sched(&self) -> SchedGuard<'_> {
        // A panicking task never leaves `SchedState` half-updated
        self.sched.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(&self, guard: SchedGuard<'a>) -> SchedGuard<'a> {
        self.cond.wait(guard).unwrap_or_else(PoisonError::into_inner)
    }

    /// Block the calling (external) thread until `cond` holds or the system
    /// shuts down. A panic in a port-managed thread is propagated to the
    /// caller.
    fn wait_until<'a>(
        &self,
        mut guard: SchedGuard<'a>,
        cond: impl Fn(&SchedState) -> bool,
    ) -> SchedGuard<'a> {
        loop {
            if let Some(payload) = guard.panic.take() {
                drop(guard);
                resume_unwind(payload);
            }
            if guard.shutdown || cond(&guard) {
                return guard;
            }
            guard = self.wait(guard);
        }
    }

    /// Block until the current thread owns the processor.
    fn wait_for_cpu<'a>(&self, mut guard: SchedGuard<'a>, me: Owner) -> SchedGuard<'a> {
        while guard.owner != me && !guard.shutdown {
            guard = self.wait(guard);
        }
        if guard.shutdown {
            drop(guard);
            exit_thread();
        }
        guard
    }

    /// Run the body of a port-managed thread, recording its panic (if any)
    /// and shutting the system down in that case.
    fn run_port_thread(&self, f: impl FnOnce()) {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(f)) {
            if payload.is::<ThreadExit>() {
                return;
            }
            log::trace!("a port-managed thread panicked, shutting down");
            let mut guard = self.lock_sched();
            guard.panic.get_or_insert(payload);
            guard.shutdown = true;
            self.cond.notify_all();
        }
    }

    /// Spawn the boot thread, which runs `init` and then dispatches the first
    /// task.
    fn boot<Traits: PortInstance>(&'static self, init: fn()) {
        let mut guard = self.lock_sched();
        assert!(!guard.booted, "the system has already been booted");
        guard.booted = true;
        guard.owner = Owner::Boot;
        guard
            .update_line(INTERRUPT_LINE_TIMER, |line| {
                line.handler = Some(Self::timer_handler::<Traits>)
            })
            .unwrap();

        let thread = thread::spawn(move || {
            THREAD_ROLE.with(|role| role.set(ThreadRole::Boot));
            THREAD_OWNER.with(|owner| owner.set(Owner::Boot));

            self.run_port_thread(|| {
                // Safety: We are a port, so it's okay to call this
                unsafe { System::<Traits>::boot(init) }
            });
        });
        log::trace!("startup thread = {:?}", thread.thread().id());
        guard.threads.push(thread);
    }

    pub unsafe fn dispatch_first_task<Traits: PortInstance>(&'static self) -> ! {
        log::trace!("dispatch_first_task");
        assert_eq!(expect_worker_thread(), ThreadRole::Boot);

        let mut guard = self.lock_sched();
        assert!(guard.cpu_lock);
        guard.started = true;
        guard.dispatch_pended = false;
        drop(guard);

        // Safety: CPU Lock active
        let task = unsafe { Traits::choose_running_task() };

        let mut guard = self.lock_sched();
        guard.cpu_lock = false;

        // The boot context is discarded. It's never chosen again, so this
        // only returns on shutdown.
        drop(self.switch_to::<Traits>(guard, task));
        exit_thread();
    }

    /// Take pended interrupts and the pended dispatch request. Interrupt
    /// handlers run on the current thread.
    fn check_preemption<'a, Traits: PortInstance>(
        &'static self,
        mut guard: SchedGuard<'a>,
    ) -> SchedGuard<'a> {
        loop {
            if guard.shutdown {
                drop(guard);
                exit_thread();
            }

            if !guard.started || guard.cpu_lock || guard.in_interrupt {
                return guard;
            }

            if let Some(handler) = guard.take_pended_line() {
                guard.in_interrupt = true;
                drop(guard);

                let role = THREAD_ROLE.with(|role| role.replace(ThreadRole::Interrupt));
                handler();
                THREAD_ROLE.with(|r| r.set(role));

                guard = self.lock_sched();
                guard.in_interrupt = false;
                self.cond.notify_all();
                continue;
            }

            if guard.dispatch_pended {
                guard.dispatch_pended = false;
                guard = self.dispatch::<Traits>(guard);
                continue;
            }

            return guard;
        }
    }

    /// The dispatch handler. Returns when the current thread regains the
    /// processor.
    fn dispatch<'a, Traits: PortInstance>(&'static self, mut guard: SchedGuard<'a>) -> SchedGuard<'a> {
        guard.cpu_lock = true;
        drop(guard);

        // Safety: CPU Lock active
        let task = unsafe { Traits::choose_running_task() };

        let mut guard = self.lock_sched();
        guard.cpu_lock = false;
        self.switch_to::<Traits>(guard, task)
    }

    /// Hand the processor over to `task`, spawning its backing thread if it
    /// hasn't started yet, and wait until the current thread regains it.
    fn switch_to<'a, Traits: PortInstance>(
        &'static self,
        mut guard: SchedGuard<'a>,
        task: &'static TaskCb<Traits>,
    ) -> SchedGuard<'a> {
        let next = Owner::Task(task as *const _ as usize);
        let me = THREAD_OWNER.with(Cell::get);
        if next == me {
            return guard;
        }

        log::trace!("switching from {:?} to {:?}", me, next);
        guard.owner = next;

        let mut tsm = task.port_task_state.tsm.lock();
        match *tsm {
            Tsm::Dormant {
                entry_point,
                entry_param,
            } => {
                *tsm = Tsm::Running;
                let thread = self.spawn_task_thread::<Traits>(next, entry_point, entry_param);
                log::trace!("spawned thread {:?} for the task {:p}", thread.thread().id(), task);
                guard.threads.push(thread);
            }
            Tsm::Running => {}
            Tsm::Uninit => unreachable!(),
        }
        drop(tsm);

        self.cond.notify_all();
        self.wait_for_cpu(guard, me)
    }

    fn spawn_task_thread<Traits: PortInstance>(
        &'static self,
        me: Owner,
        entry_point: fn(usize),
        entry_param: usize,
    ) -> JoinHandle<()> {
        thread::spawn(move || {
            THREAD_ROLE.with(|role| role.set(ThreadRole::Task));
            THREAD_OWNER.with(|owner| owner.set(me));

            self.run_port_thread(|| {
                let guard = self.wait_for_cpu(self.lock_sched(), me);
                debug_assert!(!guard.cpu_lock);
                drop(guard);

                log::debug!("task {:?} is now running", me);
                entry_point(entry_param);

                System::<Traits>::exit_task();
            });
        })
    }

    pub unsafe fn yield_cpu<Traits: PortInstance>(&'static self) {
        log::trace!("yield_cpu");
        expect_worker_thread();

        let mut guard = self.lock_sched();
        guard.dispatch_pended = true;

        // Without CPU Lock, the pended dispatch is taken right away
        drop(self.check_preemption::<Traits>(guard));
    }

    pub unsafe fn enter_cpu_lock<Traits: PortInstance>(&self) {
        log::trace!("enter_cpu_lock");
        expect_worker_thread();

        let mut guard = self.lock_sched();
        assert!(!guard.cpu_lock);
        guard.cpu_lock = true;
    }

    pub unsafe fn leave_cpu_lock<Traits: PortInstance>(&'static self) {
        log::trace!("leave_cpu_lock");
        expect_worker_thread();

        let mut guard = self.lock_sched();
        if thread::panicking() {
            // Unwinding through a `CpuLockGuard`. Don't take interrupts on
            // the way out.
            guard.cpu_lock = false;
            return;
        }

        assert!(guard.cpu_lock);
        guard.cpu_lock = false;
        drop(self.check_preemption::<Traits>(guard));
    }

    pub unsafe fn initialize_task_state<Traits: PortInstance>(
        &self,
        task: &'static TaskCb<Traits>,
        attr: &TaskAttr,
    ) {
        log::trace!("initialize_task_state {:p}", task);
        expect_worker_thread();

        let mut tsm = task.port_task_state.tsm.lock();
        match *tsm {
            Tsm::Uninit | Tsm::Dormant { .. } => {
                *tsm = Tsm::Dormant {
                    entry_point: attr.entry_point,
                    entry_param: attr.entry_param,
                };
            }
            Tsm::Running => {
                panic!("a task can't be reinitialized while its thread is alive");
            }
        }
    }

    pub fn is_cpu_lock_active<Traits: PortInstance>(&self) -> bool {
        expect_worker_thread();
        self.lock_sched().cpu_lock
    }

    pub fn is_task_context<Traits: PortInstance>(&self) -> bool {
        THREAD_ROLE.with(|role| match role.get() {
            ThreadRole::Interrupt | ThreadRole::Boot => false,
            ThreadRole::Task => true,
            ThreadRole::Unknown => {
                panic!("`is_task_context` was called from an unknown thread")
            }
        })
    }

    /// The body of the idle task's loop. Sleeps until an interrupt line or a
    /// dispatch request is pended, and then takes it.
    pub fn wait_for_interrupt<Traits: PortInstance>(&'static self) {
        expect_worker_thread();

        let mut guard = self.lock_sched();
        if !guard.has_pending_work() {
            log::trace!("idle");
            guard.idle_waiting = true;
            self.cond.notify_all();
            while !guard.has_pending_work() && !guard.shutdown {
                guard = self.wait(guard);
            }
            guard.idle_waiting = false;
        }

        if guard.shutdown {
            drop(guard);
            exit_thread();
        }

        drop(self.check_preemption::<Traits>(guard));
    }

    fn timer_handler<Traits: PortInstance>() {
        assert_eq!(expect_worker_thread(), ThreadRole::Interrupt);
        log::trace!("timer_handler");

        Traits::port_state().lock_sched().tick_count += 1;

        // Safety: CPU Lock inactive, an interrupt context
        unsafe { <Traits as PortToKernel>::timer_tick() };
    }

    /// Pend `num` from outside and wake up the idle task if it's sleeping.
    fn pend_line(&self, num: InterruptNum) -> Result<(), BadIntLineError> {
        let mut guard = self.lock_sched();
        guard.update_line(num, |line| line.pended = true)?;
        self.cond.notify_all();
        Ok(())
    }
}

/// Assert that the current thread is a port-managed thread.
fn expect_worker_thread() -> ThreadRole {
    let role = THREAD_ROLE.with(|r| r.get());
    assert_ne!(
        role,
        ThreadRole::Unknown,
        "kernel services can only be used by tasks, interrupt handlers, and `init`"
    );
    role
}

fn expect_external_thread() {
    assert_eq!(
        THREAD_ROLE.with(|r| r.get()),
        ThreadRole::Unknown,
        "this function cannot be called from a port-managed thread"
    );
}

/// Boot the system in the background.
///
/// `init` runs on the boot thread and is where tasks and kernel objects are
/// created. The timer interrupt is not driven automatically. Use
/// [`advance_ticks`] or [`pend_interrupt_line`] with [`INTERRUPT_LINE_TIMER`]
/// to advance the kernel's time, or [`run`] to drive it with a host timer.
pub fn boot<Traits: PortInstance>(init: fn()) {
    let _ = env_logger::try_init();
    expect_external_thread();
    Traits::port_state().boot::<Traits>(init);
}

/// Boot the system, driving the timer interrupt every
/// [`KernelCfg::TICK_PERIOD_US`](kestrel_kernel::KernelCfg::TICK_PERIOD_US)
/// microseconds of host time, and return when [`shutdown`] is called.
///
/// A panic in a task or an interrupt handler is propagated to the caller.
pub fn run<Traits: PortInstance>(init: fn()) {
    boot::<Traits>(init);

    let state = Traits::port_state();
    let period = Duration::from_micros(Traits::TICK_PERIOD_US.into());
    let ticker = thread::spawn(move || loop {
        thread::sleep(period);
        let mut guard = state.lock_sched();
        if guard.shutdown {
            break;
        }
        guard.lines[INTERRUPT_LINE_TIMER].pended = true;
        state.cond.notify_all();
    });

    let result = catch_unwind(AssertUnwindSafe(|| {
        drop(state.wait_until(state.lock_sched(), |_| false));
    }));

    shutdown::<Traits>();
    ticker.join().unwrap();

    if let Err(payload) = result {
        resume_unwind(payload);
    }
}

/// Initiate shutdown. All port-managed threads exit at their next
/// opportunity.
///
/// When called from an external thread, this function returns after they
/// have exited. When called from a task, the calling thread exits, too.
///
/// Note: There is no safe way to restart the simulated system without
/// restarting an entire process.
pub fn shutdown<Traits: PortInstance>() {
    log::trace!("shutdown");
    let state = Traits::port_state();
    let mut guard = state.lock_sched();
    guard.shutdown = true;
    state.cond.notify_all();

    if THREAD_ROLE.with(|r| r.get()) != ThreadRole::Unknown {
        drop(guard);
        exit_thread();
    }

    let threads = std::mem::take(&mut guard.threads);
    drop(guard);
    for thread in threads {
        let _ = thread.join();
    }
}

/// Pend an interrupt line from an external thread. The handler runs the
/// next time the running task passes through a preemption point, or right
/// away if the processor is idle.
///
/// It's illegal to call this method from a thread managed by the port (i.e.,
/// you can't call it from a task or an interrupt handler).
pub fn pend_interrupt_line<Traits: PortInstance>(num: InterruptNum) -> Result<(), BadIntLineError> {
    log::trace!("external-pend_interrupt_line({})", num);
    expect_external_thread();
    Traits::port_state().pend_line(num)
}

/// Register an interrupt handler for `num`. Pending `num` has no effect until
/// a handler is registered.
pub fn set_interrupt_handler<Traits: PortInstance>(
    num: InterruptNum,
    handler: InterruptHandler,
) -> Result<(), BadIntLineError> {
    log::trace!("set_interrupt_handler({})", num);
    let state = Traits::port_state();
    let mut guard = state.lock_sched();
    guard.update_line(num, |line| line.handler = Some(handler))?;
    state.cond.notify_all();
    Ok(())
}

/// Block the calling (external) thread until the processor is idle, i.e.,
/// every task is blocked and no interrupt is pending.
///
/// A panic in a task or an interrupt handler is propagated to the caller.
pub fn wait_until_idle<Traits: PortInstance>() {
    expect_external_thread();
    let state = Traits::port_state();
    drop(state.wait_until(state.lock_sched(), SchedState::is_quiescent));
}

/// Deliver `count` timer interrupts, one at a time, letting the system
/// settle down before each one and after the last one.
///
/// This requires every task to block eventually. Use [`pend_interrupt_line`]
/// instead if some tasks keep running.
pub fn advance_ticks<Traits: PortInstance>(count: u32) {
    log::trace!("advance_ticks({})", count);
    expect_external_thread();
    let state = Traits::port_state();

    for _ in 0..count {
        wait_until_idle::<Traits>();

        let guard = state.lock_sched();
        let target = guard.tick_count + 1;
        drop(guard);

        state.pend_line(INTERRUPT_LINE_TIMER).unwrap();
        drop(state.wait_until(state.lock_sched(), |st| st.tick_count >= target));
    }

    wait_until_idle::<Traits>();
}

/// Get the number of timer interrupts taken so far.
pub fn tick_count<Traits: PortInstance>() -> u64 {
    Traits::port_state().lock_sched().tick_count
}

#[macro_export]
macro_rules! use_port {
    (unsafe $vis:vis struct $SystemTraits:ident) => {
        $vis struct $SystemTraits;

        mod port_std_impl {
            use super::$SystemTraits;
            use $crate::kestrel_kernel::{PortThreading, TaskAttr, TaskCb};
            use $crate::{PortInstance, State, TaskState};

            pub(super) static PORT_STATE: State = State::new();

            unsafe impl PortInstance for $SystemTraits {
                #[inline]
                fn port_state() -> &'static State {
                    &PORT_STATE
                }
            }

            // Assume `$SystemTraits: KernelTraits`
            unsafe impl PortThreading for $SystemTraits {
                type PortTaskState = TaskState;
                #[allow(clippy::declare_interior_mutable_const)]
                const PORT_TASK_STATE_INIT: Self::PortTaskState = TaskState::new();

                unsafe fn dispatch_first_task() -> ! {
                    unsafe { PORT_STATE.dispatch_first_task::<Self>() }
                }

                unsafe fn yield_cpu() {
                    unsafe { PORT_STATE.yield_cpu::<Self>() }
                }

                unsafe fn enter_cpu_lock() {
                    unsafe { PORT_STATE.enter_cpu_lock::<Self>() }
                }

                unsafe fn leave_cpu_lock() {
                    unsafe { PORT_STATE.leave_cpu_lock::<Self>() }
                }

                unsafe fn initialize_task_state(task: &'static TaskCb<Self>, attr: &TaskAttr) {
                    unsafe { PORT_STATE.initialize_task_state::<Self>(task, attr) }
                }

                fn is_cpu_lock_active() -> bool {
                    PORT_STATE.is_cpu_lock_active::<Self>()
                }

                fn is_task_context() -> bool {
                    PORT_STATE.is_task_context::<Self>()
                }

                fn wait_for_interrupt() {
                    PORT_STATE.wait_for_interrupt::<Self>()
                }
            }
        }
    };
}
